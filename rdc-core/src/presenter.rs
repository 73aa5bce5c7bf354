//! The presentation collaborator.
//!
//! The session calls a [`Presenter`] synchronously from inside order
//! decoding; an implementation that blocks stalls the receive loop.

use std::sync::Arc;

use crate::bitmap::{Bitmap, Cursor, Glyph, Palette};
use crate::cache::BrushData;

// ── Geometry ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point {
    pub x: i16,
    pub y: i16,
}

/// A rectangle given by origin and extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i16,
    pub y: i16,
    pub cx: i16,
    pub cy: i16,
}

impl Rect {
    pub fn new(x: i16, y: i16, cx: i16, cy: i16) -> Self {
        Self { x, y, cx, cy }
    }

    /// From inclusive edges, as the wire sends bounds.
    pub fn from_edges(left: i16, top: i16, right: i16, bottom: i16) -> Self {
        Self {
            x: left,
            y: top,
            cx: right.wrapping_sub(left).wrapping_add(1),
            cy: bottom.wrapping_sub(top).wrapping_add(1),
        }
    }
}

// ── Drawing state ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pen {
    pub style: u8,
    pub width: u8,
    pub colour: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Brush {
    pub x_origin: u8,
    pub y_origin: u8,
    pub style: u8,
    pub pattern: [u8; 8],
    /// Resolved cached pattern when `style` selects the brush cache.
    pub cached: Option<Arc<BrushData>>,
}

/// One glyph of a text run, positioned in screen coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedGlyph {
    pub x: i16,
    pub y: i16,
    pub glyph: Arc<Glyph>,
}

// ── DrawOp ───────────────────────────────────────────────────────

/// A decoded drawing operation. Raster operations are ROP2 codes
/// (0 to 15) already reduced from the wire's ROP3 or 1-based values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrawOp {
    DestBlt {
        rop: u8,
        rect: Rect,
    },
    PatBlt {
        rop: u8,
        rect: Rect,
        brush: Brush,
        bg: u32,
        fg: u32,
    },
    ScreenBlt {
        rop: u8,
        rect: Rect,
        src: Point,
    },
    Line {
        rop: u8,
        start: Point,
        end: Point,
        pen: Pen,
    },
    Rect {
        rect: Rect,
        colour: u32,
    },
    DesktopSave {
        offset: u32,
        rect: Rect,
        restore: bool,
    },
    MemBlt {
        rop: u8,
        rect: Rect,
        bitmap: Arc<Bitmap>,
        src: Point,
    },
    /// Carries the wire ROP3 unreduced.
    TriBlt {
        rop3: u8,
        rect: Rect,
        bitmap: Arc<Bitmap>,
        src: Point,
        brush: Brush,
        bg: u32,
        fg: u32,
    },
    /// Closed polygon with absolute vertices.
    Polygon {
        rop: u8,
        fill_mode: u8,
        points: Vec<Point>,
        brush: Option<Brush>,
        bg: u32,
        fg: u32,
    },
    Polyline {
        rop: u8,
        points: Vec<Point>,
        pen: Pen,
    },
    Ellipse {
        rop: u8,
        fill_mode: u8,
        rect: Rect,
        brush: Option<Brush>,
        bg: u32,
        fg: u32,
    },
    Text {
        mix_mode: u8,
        clip: Rect,
        /// Opaque background box; zero-sized when absent.
        bounding: Rect,
        glyphs: Vec<PlacedGlyph>,
        bg: u32,
        fg: u32,
    },
    /// Uncompressed or decoded screen update.
    Bitmap {
        x: i16,
        y: i16,
        bitmap: Arc<Bitmap>,
    },
}

/// A pointer change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerUpdate {
    Hidden,
    Default,
    Position(Point),
    Shape(Arc<Cursor>),
}

// ── Presenter ────────────────────────────────────────────────────

/// Consumer of decoded display state.
pub trait Presenter: Send {
    fn draw(&mut self, op: DrawOp);

    /// Restrict subsequent draws to `clip`, or lift the restriction.
    fn set_clip(&mut self, clip: Option<Rect>);

    fn update_pointer(&mut self, pointer: PointerUpdate);

    fn update_palette(&mut self, palette: &Palette);

    fn bell(&mut self) {}

    /// The desktop size negotiated at activation.
    fn resize(&mut self, _width: u16, _height: u16) {}

    /// Bracket a batch of draws belonging to one update.
    fn begin_update(&mut self) {}
    fn end_update(&mut self) {}
}

/// Records every call; used by tests and headless runs.
#[derive(Debug, Default)]
pub struct RecordingPresenter {
    pub ops: Vec<DrawOp>,
    pub clips: Vec<Option<Rect>>,
    pub pointers: Vec<PointerUpdate>,
    pub palettes: Vec<Palette>,
    pub bells: usize,
    pub size: Option<(u16, u16)>,
}

impl Presenter for RecordingPresenter {
    fn draw(&mut self, op: DrawOp) {
        self.ops.push(op);
    }

    fn set_clip(&mut self, clip: Option<Rect>) {
        self.clips.push(clip);
    }

    fn update_pointer(&mut self, pointer: PointerUpdate) {
        self.pointers.push(pointer);
    }

    fn update_palette(&mut self, palette: &Palette) {
        self.palettes.push(palette.clone());
    }

    fn bell(&mut self) {
        self.bells += 1;
    }

    fn resize(&mut self, width: u16, height: u16) {
        self.size = Some((width, height));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_from_inclusive_edges() {
        assert_eq!(Rect::from_edges(10, 20, 19, 20), Rect::new(10, 20, 10, 1));
    }
}
