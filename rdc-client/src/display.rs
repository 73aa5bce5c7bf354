//! Software framebuffer presenter.
//!
//! Keeps the remote desktop as one pixel value per cell at the session
//! colour depth and renders the common drawing operations into it.
//! Operations that need a real graphics backend (polygon fills,
//! ellipses, tri-blt) are counted and skipped.

use std::io::Write;
use std::path::Path;

use rdc_core::bitmap::Bitmap;
use rdc_core::presenter::{Brush, Pen, PlacedGlyph};
use rdc_core::{Colour, DrawOp, Palette, Point, PointerUpdate, Presenter, Rect};
use tracing::{debug, trace};

// ── Raster operations ────────────────────────────────────────────

/// Apply a ROP2 code (0 to 15) to a source and destination pixel.
pub fn rop2(code: u8, src: u32, dst: u32) -> u32 {
    match code & 0x0f {
        0 => 0,
        1 => !(src | dst),
        2 => !src & dst,
        3 => !src,
        4 => src & !dst,
        5 => !dst,
        6 => src ^ dst,
        7 => !(src & dst),
        8 => src & dst,
        9 => !(src ^ dst),
        10 => dst,
        11 => !src | dst,
        12 => src,
        13 => src | !dst,
        14 => src | dst,
        _ => u32::MAX,
    }
}

// ── Framebuffer ──────────────────────────────────────────────────

/// Counters of what the framebuffer has drawn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrawStats {
    pub drawn: u64,
    pub skipped: u64,
    pub updates: u64,
    pub bells: u64,
}

/// A software screen the session draws into.
#[derive(Debug)]
pub struct Framebuffer {
    width: usize,
    height: usize,
    depth: u8,
    pixels: Vec<u32>,
    clip: Option<Rect>,
    palette: Palette,
    pointer: Point,
    pointer_visible: bool,
    stats: DrawStats,
}

impl Framebuffer {
    pub fn new(width: u16, height: u16, depth: u8) -> Self {
        Self {
            width: usize::from(width),
            height: usize::from(height),
            depth,
            pixels: vec![0; usize::from(width) * usize::from(height)],
            clip: None,
            palette: Palette::new(),
            pointer: Point::default(),
            pointer_visible: true,
            stats: DrawStats::default(),
        }
    }

    pub fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn stats(&self) -> &DrawStats {
        &self.stats
    }

    pub fn pointer(&self) -> Option<Point> {
        self.pointer_visible.then_some(self.pointer)
    }

    /// Raw pixel value at `(x, y)`.
    pub fn pixel(&self, x: usize, y: usize) -> Option<u32> {
        (x < self.width && y < self.height).then(|| self.pixels[y * self.width + x])
    }

    fn mask(&self) -> u32 {
        match self.depth {
            8 => 0xff,
            15 => 0x7fff,
            16 => 0xffff,
            24 => 0x00ff_ffff,
            _ => u32::MAX,
        }
    }

    /// Whether `(x, y)` is on screen and inside the clip rectangle.
    fn visible(&self, x: i32, y: i32) -> bool {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return false;
        }
        match self.clip {
            Some(c) => {
                x >= i32::from(c.x)
                    && y >= i32::from(c.y)
                    && x < i32::from(c.x) + i32::from(c.cx)
                    && y < i32::from(c.y) + i32::from(c.cy)
            }
            None => true,
        }
    }

    fn plot(&mut self, x: i32, y: i32, rop: u8, src: u32) {
        if self.visible(x, y) {
            let i = y as usize * self.width + x as usize;
            self.pixels[i] = rop2(rop, src, self.pixels[i]) & self.mask();
        }
    }

    fn fill(&mut self, rect: Rect, rop: u8, colour: u32) {
        for y in rect_rows(rect) {
            for x in rect_cols(rect) {
                self.plot(x, y, rop, colour);
            }
        }
    }

    fn blit(&mut self, rop: u8, dest: Rect, bitmap: &Bitmap, src: Point) {
        let (x, y) = (i32::from(dest.x), i32::from(dest.y));
        for dy in 0..i32::from(dest.cy) {
            for dx in 0..i32::from(dest.cx) {
                let (sx, sy) = (i32::from(src.x) + dx, i32::from(src.y) + dy);
                let (Ok(sx), Ok(sy)) = (u16::try_from(sx), u16::try_from(sy)) else {
                    continue;
                };
                if let Some(value) = bitmap.pixel(sx, sy) {
                    self.plot(x + dx, y + dy, rop, value);
                }
            }
        }
    }

    fn pattern(&mut self, rect: Rect, rop: u8, brush: &Brush, bg: u32, fg: u32) {
        if brush.style == 0 {
            self.fill(rect, rop, fg);
            return;
        }
        for y in rect_rows(rect) {
            for x in rect_cols(rect) {
                let px = (x + i32::from(brush.x_origin)).rem_euclid(8) as u32;
                let py = (y + i32::from(brush.y_origin)).rem_euclid(8) as usize;
                let set = brush.pattern[py] & (0x80 >> px) != 0;
                self.plot(x, y, rop, if set { bg } else { fg });
            }
        }
    }

    fn line(&mut self, rop: u8, start: Point, end: Point, pen: &Pen) {
        let (mut x, mut y) = (i32::from(start.x), i32::from(start.y));
        let (x1, y1) = (i32::from(end.x), i32::from(end.y));
        let dx = (x1 - x).abs();
        let dy = -(y1 - y).abs();
        let sx = if x < x1 { 1 } else { -1 };
        let sy = if y < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        loop {
            self.plot(x, y, rop, pen.colour);
            if x == x1 && y == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    fn screen_copy(&mut self, rop: u8, rect: Rect, src: Point) {
        let (w, h) = (i32::from(rect.cx).max(0), i32::from(rect.cy).max(0));
        let mut copied = Vec::with_capacity((w * h) as usize);
        for dy in 0..h {
            for dx in 0..w {
                let (sx, sy) = (i32::from(src.x) + dx, i32::from(src.y) + dy);
                let value = (sx >= 0 && sy >= 0)
                    .then(|| self.pixel(sx as usize, sy as usize))
                    .flatten();
                copied.push(value);
            }
        }
        for dy in 0..h {
            for dx in 0..w {
                if let Some(value) = copied[(dy * w + dx) as usize] {
                    self.plot(i32::from(rect.x) + dx, i32::from(rect.y) + dy, rop, value);
                }
            }
        }
    }

    fn text(&mut self, mix_mode: u8, bounding: Rect, glyphs: &[PlacedGlyph], bg: u32, fg: u32) {
        if bounding.cx > 0 && bounding.cy > 0 {
            self.fill(bounding, 12, fg);
        }
        for placed in glyphs {
            let g = &placed.glyph;
            for gy in 0..g.height {
                for gx in 0..g.width {
                    let (x, y) = (
                        i32::from(placed.x) + i32::from(gx),
                        i32::from(placed.y) + i32::from(gy),
                    );
                    if g.is_set(gx, gy) {
                        self.plot(x, y, 12, bg);
                    } else if mix_mode != 0 {
                        self.plot(x, y, 12, fg);
                    }
                }
            }
        }
    }

    /// Convert a pixel value to RGB at the framebuffer's depth.
    pub fn to_rgb(&self, value: u32) -> Colour {
        let expand5 = |v: u32| ((v << 3) | (v >> 2)) as u8;
        match self.depth {
            8 => self
                .palette
                .get(value as usize)
                .copied()
                .unwrap_or_default(),
            15 => Colour {
                red: expand5((value >> 10) & 0x1f),
                green: expand5((value >> 5) & 0x1f),
                blue: expand5(value & 0x1f),
            },
            16 => Colour {
                red: expand5((value >> 11) & 0x1f),
                green: (((value >> 5) & 0x3f) << 2 | ((value >> 9) & 0x03)) as u8,
                blue: expand5(value & 0x1f),
            },
            _ => Colour {
                red: (value >> 16) as u8,
                green: (value >> 8) as u8,
                blue: value as u8,
            },
        }
    }

    /// Write the screen as a binary PPM image.
    pub fn write_ppm(&self, out: &mut impl Write) -> std::io::Result<()> {
        write!(out, "P6\n{} {}\n255\n", self.width, self.height)?;
        let mut row = Vec::with_capacity(self.width * 3);
        for line in self.pixels.chunks(self.width.max(1)) {
            row.clear();
            for &value in line {
                let c = self.to_rgb(value);
                row.extend_from_slice(&[c.red, c.green, c.blue]);
            }
            out.write_all(&row)?;
        }
        Ok(())
    }

    pub fn save_ppm(&self, path: &Path) -> std::io::Result<()> {
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        self.write_ppm(&mut file)?;
        file.flush()
    }
}

fn rect_rows(r: Rect) -> std::ops::Range<i32> {
    i32::from(r.y)..i32::from(r.y) + i32::from(r.cy).max(0)
}

fn rect_cols(r: Rect) -> std::ops::Range<i32> {
    i32::from(r.x)..i32::from(r.x) + i32::from(r.cx).max(0)
}

// ── Presenter ────────────────────────────────────────────────────

impl Presenter for Framebuffer {
    fn draw(&mut self, op: DrawOp) {
        match op {
            DrawOp::DestBlt { rop, rect } => self.fill(rect, rop, 0),
            DrawOp::PatBlt {
                rop,
                rect,
                brush,
                bg,
                fg,
            } => self.pattern(rect, rop, &brush, bg, fg),
            DrawOp::ScreenBlt { rop, rect, src } => self.screen_copy(rop, rect, src),
            DrawOp::Line {
                rop,
                start,
                end,
                pen,
            } => self.line(rop, start, end, &pen),
            DrawOp::Rect { rect, colour } => self.fill(rect, 12, colour),
            DrawOp::MemBlt {
                rop,
                rect,
                bitmap,
                src,
            } => self.blit(rop, rect, &bitmap, src),
            DrawOp::Polyline { rop, points, pen } => {
                for pair in points.windows(2) {
                    self.line(rop, pair[0], pair[1], &pen);
                }
            }
            DrawOp::Text {
                mix_mode,
                bounding,
                glyphs,
                bg,
                fg,
                ..
            } => self.text(mix_mode, bounding, &glyphs, bg, fg),
            DrawOp::Bitmap { x, y, bitmap } => {
                let dest = Rect::new(x, y, bitmap.width as i16, bitmap.height as i16);
                self.blit(12, dest, &bitmap, Point::default());
            }
            other => {
                trace!(?other, "draw operation not rendered");
                self.stats.skipped += 1;
                return;
            }
        }
        self.stats.drawn += 1;
    }

    fn set_clip(&mut self, clip: Option<Rect>) {
        self.clip = clip;
    }

    fn update_pointer(&mut self, pointer: PointerUpdate) {
        match pointer {
            PointerUpdate::Hidden => self.pointer_visible = false,
            PointerUpdate::Default | PointerUpdate::Shape(_) => self.pointer_visible = true,
            PointerUpdate::Position(p) => self.pointer = p,
        }
    }

    fn update_palette(&mut self, palette: &Palette) {
        self.palette = palette.clone();
    }

    fn bell(&mut self) {
        self.stats.bells += 1;
    }

    fn resize(&mut self, width: u16, height: u16) {
        if (usize::from(width), usize::from(height)) != self.size() {
            debug!(width, height, "framebuffer resized");
            *self = Self::new(width, height, self.depth);
        }
    }

    fn end_update(&mut self) {
        self.stats.updates += 1;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn screen() -> Framebuffer {
        Framebuffer::new(16, 8, 16)
    }

    #[test]
    fn rop2_table_edges() {
        assert_eq!(rop2(0, 0x1234, 0xffff), 0);
        assert_eq!(rop2(12, 0x1234, 0xffff), 0x1234);
        assert_eq!(rop2(10, 0x1234, 0xffff), 0xffff);
        assert_eq!(rop2(6, 0x00ff, 0x0f0f), 0x0ff0);
        assert_eq!(rop2(15, 0, 0), u32::MAX);
    }

    #[test]
    fn rect_fill_respects_clip_and_edges() {
        let mut fb = screen();
        fb.set_clip(Some(Rect::new(0, 0, 4, 4)));
        fb.draw(DrawOp::Rect {
            rect: Rect::new(2, 2, 10, 10),
            colour: 0xf800,
        });
        assert_eq!(fb.pixel(3, 3), Some(0xf800));
        assert_eq!(fb.pixel(4, 3), Some(0));
        fb.set_clip(None);
        fb.draw(DrawOp::Rect {
            rect: Rect::new(14, 6, 10, 10),
            colour: 1,
        });
        assert_eq!(fb.pixel(15, 7), Some(1));
        assert_eq!(fb.stats().drawn, 2);
    }

    #[test]
    fn memblt_copies_from_the_source_offset() {
        let mut fb = screen();
        let data: Vec<u8> = (0..16u8).flat_map(|v| [v, 0]).collect();
        let bitmap = Arc::new(Bitmap::new(4, 4, 2, data).unwrap());
        fb.draw(DrawOp::MemBlt {
            rop: 12,
            rect: Rect::new(5, 1, 2, 2),
            bitmap,
            src: Point { x: 1, y: 2 },
        });
        assert_eq!(fb.pixel(5, 1), Some(9));
        assert_eq!(fb.pixel(6, 2), Some(14));
        assert_eq!(fb.pixel(7, 1), Some(0));
    }

    #[test]
    fn overlapping_screen_blt_reads_before_writing() {
        let mut fb = screen();
        for x in 0..4 {
            fb.plot(x, 0, 12, x as u32 + 1);
        }
        fb.draw(DrawOp::ScreenBlt {
            rop: 12,
            rect: Rect::new(1, 0, 4, 1),
            src: Point { x: 0, y: 0 },
        });
        let row: Vec<_> = (0..5).map(|x| fb.pixel(x, 0).unwrap()).collect();
        assert_eq!(row, vec![1, 1, 2, 3, 4]);
    }

    #[test]
    fn diagonal_line_hits_both_ends() {
        let mut fb = screen();
        fb.draw(DrawOp::Line {
            rop: 12,
            start: Point { x: 0, y: 0 },
            end: Point { x: 5, y: 5 },
            pen: Pen {
                colour: 7,
                ..Default::default()
            },
        });
        assert_eq!(fb.pixel(0, 0), Some(7));
        assert_eq!(fb.pixel(3, 3), Some(7));
        assert_eq!(fb.pixel(5, 5), Some(7));
        assert_eq!(fb.pixel(5, 4), Some(0));
    }

    #[test]
    fn unsupported_ops_are_counted() {
        let mut fb = screen();
        fb.draw(DrawOp::DesktopSave {
            offset: 0,
            rect: Rect::new(0, 0, 1, 1),
            restore: false,
        });
        assert_eq!(fb.stats().skipped, 1);
        assert_eq!(fb.stats().drawn, 0);
    }

    #[test]
    fn ppm_uses_the_palette_at_8_bits() {
        let mut fb = Framebuffer::new(2, 1, 8);
        fb.update_palette(&vec![
            Colour::default(),
            Colour {
                red: 10,
                green: 20,
                blue: 30,
            },
        ]);
        fb.draw(DrawOp::Rect {
            rect: Rect::new(1, 0, 1, 1),
            colour: 1,
        });
        let mut out = Vec::new();
        fb.write_ppm(&mut out).unwrap();
        assert!(out.starts_with(b"P6\n2 1\n255\n"));
        assert_eq!(&out[out.len() - 6..], &[0, 0, 0, 10, 20, 30]);
    }

    #[test]
    fn rgb565_expands_to_full_range() {
        let fb = screen();
        assert_eq!(
            fb.to_rgb(0xffff),
            Colour {
                red: 255,
                green: 255,
                blue: 255
            }
        );
        assert_eq!(fb.to_rgb(0xf800).red, 255);
        assert_eq!(fb.to_rgb(0xf800).green, 0);
    }

    #[test]
    fn resize_replaces_the_buffer() {
        let mut fb = screen();
        fb.resize(32, 4);
        assert_eq!(fb.size(), (32, 4));
        assert_eq!(fb.pixel(31, 3), Some(0));
    }
}
