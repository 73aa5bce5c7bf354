//! Field parsers for the primary drawing orders.
//!
//! Each parser applies one present-field mask against the stored
//! record of its type. Bit assignments follow the wire layout.

use super::state::*;
use crate::error::Result;
use crate::presenter::Point;
use crate::stream::ReadStream;

impl DestBltOrder {
    pub fn parse(&mut self, s: &mut ReadStream<'_>, present: u32, delta: bool) -> Result<()> {
        if present & 0x01 != 0 {
            read_coord(s, &mut self.x, delta)?;
        }
        if present & 0x02 != 0 {
            read_coord(s, &mut self.y, delta)?;
        }
        if present & 0x04 != 0 {
            read_coord(s, &mut self.cx, delta)?;
        }
        if present & 0x08 != 0 {
            read_coord(s, &mut self.cy, delta)?;
        }
        if present & 0x10 != 0 {
            self.opcode = s.u8()?;
        }
        Ok(())
    }
}

impl PatBltOrder {
    pub fn parse(&mut self, s: &mut ReadStream<'_>, present: u32, delta: bool) -> Result<()> {
        if present & 0x01 != 0 {
            read_coord(s, &mut self.x, delta)?;
        }
        if present & 0x02 != 0 {
            read_coord(s, &mut self.y, delta)?;
        }
        if present & 0x04 != 0 {
            read_coord(s, &mut self.cx, delta)?;
        }
        if present & 0x08 != 0 {
            read_coord(s, &mut self.cy, delta)?;
        }
        if present & 0x10 != 0 {
            self.opcode = s.u8()?;
        }
        if present & 0x20 != 0 {
            self.bg = read_colour(s)?;
        }
        if present & 0x40 != 0 {
            self.fg = read_colour(s)?;
        }
        read_brush(s, &mut self.brush, present >> 7)
    }
}

impl ScreenBltOrder {
    pub fn parse(&mut self, s: &mut ReadStream<'_>, present: u32, delta: bool) -> Result<()> {
        if present & 0x01 != 0 {
            read_coord(s, &mut self.x, delta)?;
        }
        if present & 0x02 != 0 {
            read_coord(s, &mut self.y, delta)?;
        }
        if present & 0x04 != 0 {
            read_coord(s, &mut self.cx, delta)?;
        }
        if present & 0x08 != 0 {
            read_coord(s, &mut self.cy, delta)?;
        }
        if present & 0x10 != 0 {
            self.opcode = s.u8()?;
        }
        if present & 0x20 != 0 {
            read_coord(s, &mut self.src_x, delta)?;
        }
        if present & 0x40 != 0 {
            read_coord(s, &mut self.src_y, delta)?;
        }
        Ok(())
    }
}

impl LineOrder {
    pub fn parse(&mut self, s: &mut ReadStream<'_>, present: u32, delta: bool) -> Result<()> {
        if present & 0x01 != 0 {
            self.mix_mode = s.u16_le()?;
        }
        if present & 0x02 != 0 {
            read_coord(s, &mut self.start_x, delta)?;
        }
        if present & 0x04 != 0 {
            read_coord(s, &mut self.start_y, delta)?;
        }
        if present & 0x08 != 0 {
            read_coord(s, &mut self.end_x, delta)?;
        }
        if present & 0x10 != 0 {
            read_coord(s, &mut self.end_y, delta)?;
        }
        if present & 0x20 != 0 {
            self.bg = read_colour(s)?;
        }
        if present & 0x40 != 0 {
            self.opcode = s.u8()?;
        }
        read_pen(s, &mut self.pen, present >> 7)
    }
}

impl RectOrder {
    /// Colour channels arrive one byte at a time and patch the stored
    /// colour in place.
    pub fn parse(&mut self, s: &mut ReadStream<'_>, present: u32, delta: bool) -> Result<()> {
        if present & 0x01 != 0 {
            read_coord(s, &mut self.x, delta)?;
        }
        if present & 0x02 != 0 {
            read_coord(s, &mut self.y, delta)?;
        }
        if present & 0x04 != 0 {
            read_coord(s, &mut self.cx, delta)?;
        }
        if present & 0x08 != 0 {
            read_coord(s, &mut self.cy, delta)?;
        }
        for (bit, shift) in [(0x10, 0), (0x20, 8), (0x40, 16)] {
            if present & bit != 0 {
                let v = u32::from(s.u8()?);
                self.colour = (self.colour & !(0xff << shift)) | (v << shift);
            }
        }
        Ok(())
    }
}

impl DeskSaveOrder {
    pub fn parse(&mut self, s: &mut ReadStream<'_>, present: u32, delta: bool) -> Result<()> {
        if present & 0x01 != 0 {
            self.offset = s.u32_le()?;
        }
        if present & 0x02 != 0 {
            read_coord(s, &mut self.left, delta)?;
        }
        if present & 0x04 != 0 {
            read_coord(s, &mut self.top, delta)?;
        }
        if present & 0x08 != 0 {
            read_coord(s, &mut self.right, delta)?;
        }
        if present & 0x10 != 0 {
            read_coord(s, &mut self.bottom, delta)?;
        }
        if present & 0x20 != 0 {
            self.action = s.u8()?;
        }
        Ok(())
    }
}

impl MemBltOrder {
    pub fn parse(&mut self, s: &mut ReadStream<'_>, present: u32, delta: bool) -> Result<()> {
        if present & 0x0001 != 0 {
            self.cache_id = s.u8()?;
            self.colour_table = s.u8()?;
        }
        if present & 0x0002 != 0 {
            read_coord(s, &mut self.x, delta)?;
        }
        if present & 0x0004 != 0 {
            read_coord(s, &mut self.y, delta)?;
        }
        if present & 0x0008 != 0 {
            read_coord(s, &mut self.cx, delta)?;
        }
        if present & 0x0010 != 0 {
            read_coord(s, &mut self.cy, delta)?;
        }
        if present & 0x0020 != 0 {
            self.opcode = s.u8()?;
        }
        if present & 0x0040 != 0 {
            read_coord(s, &mut self.src_x, delta)?;
        }
        if present & 0x0080 != 0 {
            read_coord(s, &mut self.src_y, delta)?;
        }
        if present & 0x0100 != 0 {
            self.cache_idx = s.u16_le()?;
        }
        Ok(())
    }
}

impl TriBltOrder {
    pub fn parse(&mut self, s: &mut ReadStream<'_>, present: u32, delta: bool) -> Result<()> {
        if present & 0x000001 != 0 {
            self.cache_id = s.u8()?;
            self.colour_table = s.u8()?;
        }
        if present & 0x000002 != 0 {
            read_coord(s, &mut self.x, delta)?;
        }
        if present & 0x000004 != 0 {
            read_coord(s, &mut self.y, delta)?;
        }
        if present & 0x000008 != 0 {
            read_coord(s, &mut self.cx, delta)?;
        }
        if present & 0x000010 != 0 {
            read_coord(s, &mut self.cy, delta)?;
        }
        if present & 0x000020 != 0 {
            self.opcode = s.u8()?;
        }
        if present & 0x000040 != 0 {
            read_coord(s, &mut self.src_x, delta)?;
        }
        if present & 0x000080 != 0 {
            read_coord(s, &mut self.src_y, delta)?;
        }
        if present & 0x000100 != 0 {
            self.bg = read_colour(s)?;
        }
        if present & 0x000200 != 0 {
            self.fg = read_colour(s)?;
        }
        read_brush(s, &mut self.brush, present >> 10)?;
        if present & 0x008000 != 0 {
            self.cache_idx = s.u16_le()?;
        }
        if present & 0x010000 != 0 {
            self.unknown = s.u16_le()?;
        }
        Ok(())
    }
}

impl PolyOrder {
    /// Polygon with a solid fill colour.
    pub fn parse_polygon(&mut self, s: &mut ReadStream<'_>, present: u32, delta: bool) -> Result<()> {
        if present & 0x01 != 0 {
            read_coord(s, &mut self.x, delta)?;
        }
        if present & 0x02 != 0 {
            read_coord(s, &mut self.y, delta)?;
        }
        if present & 0x04 != 0 {
            self.opcode = s.u8()?;
        }
        if present & 0x08 != 0 {
            self.fill_mode = s.u8()?;
        }
        if present & 0x10 != 0 {
            self.fg = read_colour(s)?;
        }
        if present & 0x20 != 0 {
            self.npoints = s.u8()?;
        }
        if present & 0x40 != 0 {
            self.data = read_data(s)?;
        }
        Ok(())
    }

    /// Polygon filled with a brush.
    pub fn parse_polygon2(&mut self, s: &mut ReadStream<'_>, present: u32, delta: bool) -> Result<()> {
        if present & 0x0001 != 0 {
            read_coord(s, &mut self.x, delta)?;
        }
        if present & 0x0002 != 0 {
            read_coord(s, &mut self.y, delta)?;
        }
        if present & 0x0004 != 0 {
            self.opcode = s.u8()?;
        }
        if present & 0x0008 != 0 {
            self.fill_mode = s.u8()?;
        }
        if present & 0x0010 != 0 {
            self.bg = read_colour(s)?;
        }
        if present & 0x0020 != 0 {
            self.fg = read_colour(s)?;
        }
        read_brush(s, &mut self.brush, present >> 6)?;
        if present & 0x0800 != 0 {
            self.npoints = s.u8()?;
        }
        if present & 0x1000 != 0 {
            self.data = read_data(s)?;
        }
        Ok(())
    }

    /// `npoints` counts line segments here.
    pub fn parse_polyline(&mut self, s: &mut ReadStream<'_>, present: u32, delta: bool) -> Result<()> {
        if present & 0x01 != 0 {
            read_coord(s, &mut self.x, delta)?;
        }
        if present & 0x02 != 0 {
            read_coord(s, &mut self.y, delta)?;
        }
        if present & 0x04 != 0 {
            self.opcode = s.u8()?;
        }
        if present & 0x10 != 0 {
            self.fg = read_colour(s)?;
        }
        if present & 0x20 != 0 {
            self.npoints = s.u8()?;
        }
        if present & 0x40 != 0 {
            self.data = read_data(s)?;
        }
        Ok(())
    }

    /// Absolute vertices: the origin followed by `npoints` decoded
    /// deltas. `None` when the packed data runs short.
    pub fn points(&self) -> Option<Vec<Point>> {
        let count = usize::from(self.npoints);
        let mut points = Vec::with_capacity(count + 1);
        let mut current = Point { x: self.x, y: self.y };
        points.push(current);

        let mut flags_at = 0usize;
        let mut cursor = count.saturating_sub(1) / 4 + 1;
        let mut flags = 0u8;
        for next in 1..=count {
            if (next - 1) % 4 == 0 {
                flags = *self.data.get(flags_at)?;
                flags_at += 1;
            }
            if flags & 0x80 == 0 {
                current.x = current.x.wrapping_add(parse_delta(&self.data, &mut cursor)?);
            }
            if flags & 0x40 == 0 {
                current.y = current.y.wrapping_add(parse_delta(&self.data, &mut cursor)?);
            }
            flags <<= 2;
            points.push(current);
        }
        Some(points)
    }
}

/// One packed vertex delta: 7-bit signed, or 15-bit signed when the
/// high bit is set.
fn parse_delta(data: &[u8], cursor: &mut usize) -> Option<i16> {
    let first = *data.get(*cursor)?;
    *cursor += 1;
    let mut value = if first & 0x40 != 0 {
        i16::from(first) | !0x3f
    } else {
        i16::from(first & 0x3f)
    };
    if first & 0x80 != 0 {
        let low = *data.get(*cursor)?;
        *cursor += 1;
        value = (value << 8) | i16::from(low);
    }
    Some(value)
}

impl EllipseOrder {
    pub fn parse_ellipse(&mut self, s: &mut ReadStream<'_>, present: u32, delta: bool) -> Result<()> {
        self.parse_edges(s, present, delta)?;
        if present & 0x10 != 0 {
            self.opcode = s.u8()?;
        }
        if present & 0x20 != 0 {
            self.fill_mode = s.u8()?;
        }
        if present & 0x40 != 0 {
            self.fg = read_colour(s)?;
        }
        Ok(())
    }

    pub fn parse_ellipse2(&mut self, s: &mut ReadStream<'_>, present: u32, delta: bool) -> Result<()> {
        self.parse_edges(s, present, delta)?;
        if present & 0x0010 != 0 {
            self.opcode = s.u8()?;
        }
        if present & 0x0020 != 0 {
            self.fill_mode = s.u8()?;
        }
        read_brush(s, &mut self.brush, present >> 6)?;
        if present & 0x0400 != 0 {
            self.bg = read_colour(s)?;
        }
        if present & 0x0800 != 0 {
            self.fg = read_colour(s)?;
        }
        Ok(())
    }

    fn parse_edges(&mut self, s: &mut ReadStream<'_>, present: u32, delta: bool) -> Result<()> {
        if present & 0x01 != 0 {
            read_coord(s, &mut self.left, delta)?;
        }
        if present & 0x02 != 0 {
            read_coord(s, &mut self.top, delta)?;
        }
        if present & 0x04 != 0 {
            read_coord(s, &mut self.right, delta)?;
        }
        if present & 0x08 != 0 {
            read_coord(s, &mut self.bottom, delta)?;
        }
        Ok(())
    }
}

impl Text2Order {
    /// Clip and box edges are always absolute.
    pub fn parse(&mut self, s: &mut ReadStream<'_>, present: u32, _delta: bool) -> Result<()> {
        if present & 0x000001 != 0 {
            self.font = s.u8()?;
        }
        if present & 0x000002 != 0 {
            self.flags = s.u8()?;
        }
        if present & 0x000004 != 0 {
            self.opcode = s.u8()?;
        }
        if present & 0x000008 != 0 {
            self.mix_mode = s.u8()?;
        }
        if present & 0x000010 != 0 {
            self.fg = read_colour(s)?;
        }
        if present & 0x000020 != 0 {
            self.bg = read_colour(s)?;
        }
        let edges = [
            &mut self.clip_left,
            &mut self.clip_top,
            &mut self.clip_right,
            &mut self.clip_bottom,
            &mut self.box_left,
            &mut self.box_top,
            &mut self.box_right,
            &mut self.box_bottom,
        ];
        for (i, edge) in edges.into_iter().enumerate() {
            if present & (0x40 << i) != 0 {
                *edge = s.i16_le()?;
            }
        }
        read_brush(s, &mut self.brush, present >> 14)?;
        if present & 0x080000 != 0 {
            self.x = s.i16_le()?;
        }
        if present & 0x100000 != 0 {
            self.y = s.i16_le()?;
        }
        if present & 0x200000 != 0 {
            self.text = read_data(s)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_polyline_deltas() {
        let order = PolyOrder {
            x: 100,
            y: 50,
            npoints: 2,
            // flags: point 1 both present, point 2 y omitted
            data: vec![0b0001_0000, 0x05, 0x7f, 0x81, 0x00],
            ..Default::default()
        };
        let pts = order.points().unwrap();
        assert_eq!(
            pts,
            vec![
                Point { x: 100, y: 50 },
                Point { x: 105, y: 49 },
                Point { x: 361, y: 49 },
            ]
        );
    }

    #[test]
    fn truncated_vertex_data_is_not_drawn() {
        let order = PolyOrder {
            npoints: 3,
            data: vec![0x00, 0x01],
            ..Default::default()
        };
        assert!(order.points().is_none());
    }

    #[test]
    fn rect_colour_patches_single_channels() {
        let mut r = RectOrder {
            colour: 0x112233,
            ..Default::default()
        };
        r.parse(&mut ReadStream::new(&[0xaa]), 0x20, false).unwrap();
        assert_eq!(r.colour, 0x11aa33);
    }

    #[test]
    fn delta_coordinates_accumulate() {
        let mut d = DestBltOrder {
            x: 10,
            y: 10,
            ..Default::default()
        };
        d.parse(&mut ReadStream::new(&[0xfe, 0x03]), 0x03, true).unwrap();
        assert_eq!((d.x, d.y), (8, 13));
    }
}
