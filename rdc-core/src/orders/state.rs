//! Last-decoded value of every primary order type.
//!
//! Each primary order on the wire is a sparse diff against the record
//! of its type held here. The whole state is reset on every entry to
//! the active phase.

use crate::error::Result;
use crate::presenter::{Pen, Rect};
use crate::stream::ReadStream;

// ── Order type tags ──────────────────────────────────────────────

pub const DESTBLT: u8 = 0;
pub const PATBLT: u8 = 1;
pub const SCREENBLT: u8 = 2;
pub const LINE: u8 = 9;
pub const RECT: u8 = 10;
pub const DESKSAVE: u8 = 11;
pub const MEMBLT: u8 = 13;
pub const TRIBLT: u8 = 14;
pub const POLYGON: u8 = 20;
pub const POLYGON2: u8 = 21;
pub const POLYLINE: u8 = 22;
pub const ELLIPSE: u8 = 25;
pub const ELLIPSE2: u8 = 26;
pub const TEXT2: u8 = 27;

/// Bytes of present-field mask carried by `order_type`.
pub fn present_bytes(order_type: u8) -> usize {
    match order_type {
        TRIBLT | TEXT2 => 3,
        PATBLT | MEMBLT | LINE | POLYGON2 | ELLIPSE2 => 2,
        _ => 1,
    }
}

// ── Field records ────────────────────────────────────────────────

/// Inclusive clip edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bounds {
    pub left: i16,
    pub top: i16,
    pub right: i16,
    pub bottom: i16,
}

impl Bounds {
    pub fn rect(&self) -> Rect {
        Rect::from_edges(self.left, self.top, self.right, self.bottom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrushFields {
    pub x_origin: u8,
    pub y_origin: u8,
    pub style: u8,
    pub pattern: [u8; 8],
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DestBltOrder {
    pub x: i16,
    pub y: i16,
    pub cx: i16,
    pub cy: i16,
    pub opcode: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatBltOrder {
    pub x: i16,
    pub y: i16,
    pub cx: i16,
    pub cy: i16,
    pub opcode: u8,
    pub bg: u32,
    pub fg: u32,
    pub brush: BrushFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScreenBltOrder {
    pub x: i16,
    pub y: i16,
    pub cx: i16,
    pub cy: i16,
    pub opcode: u8,
    pub src_x: i16,
    pub src_y: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LineOrder {
    pub mix_mode: u16,
    pub start_x: i16,
    pub start_y: i16,
    pub end_x: i16,
    pub end_y: i16,
    pub bg: u32,
    pub opcode: u8,
    pub pen: Pen,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RectOrder {
    pub x: i16,
    pub y: i16,
    pub cx: i16,
    pub cy: i16,
    pub colour: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeskSaveOrder {
    pub offset: u32,
    pub left: i16,
    pub top: i16,
    pub right: i16,
    pub bottom: i16,
    pub action: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemBltOrder {
    pub colour_table: u8,
    pub cache_id: u8,
    pub x: i16,
    pub y: i16,
    pub cx: i16,
    pub cy: i16,
    pub opcode: u8,
    pub src_x: i16,
    pub src_y: i16,
    pub cache_idx: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TriBltOrder {
    pub colour_table: u8,
    pub cache_id: u8,
    pub x: i16,
    pub y: i16,
    pub cx: i16,
    pub cy: i16,
    pub opcode: u8,
    pub src_x: i16,
    pub src_y: i16,
    pub bg: u32,
    pub fg: u32,
    pub brush: BrushFields,
    pub cache_idx: u16,
    pub unknown: u16,
}

/// Shared by polygon, polygon2 and polyline: an origin plus packed
/// relative vertices.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolyOrder {
    pub x: i16,
    pub y: i16,
    pub opcode: u8,
    pub fill_mode: u8,
    pub bg: u32,
    pub fg: u32,
    pub brush: BrushFields,
    pub npoints: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EllipseOrder {
    pub left: i16,
    pub top: i16,
    pub right: i16,
    pub bottom: i16,
    pub opcode: u8,
    pub fill_mode: u8,
    pub bg: u32,
    pub fg: u32,
    pub brush: BrushFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Text2Order {
    pub font: u8,
    pub flags: u8,
    pub opcode: u8,
    pub mix_mode: u8,
    pub fg: u32,
    pub bg: u32,
    pub clip_left: i16,
    pub clip_top: i16,
    pub clip_right: i16,
    pub clip_bottom: i16,
    pub box_left: i16,
    pub box_top: i16,
    pub box_right: i16,
    pub box_bottom: i16,
    pub brush: BrushFields,
    pub x: i16,
    pub y: i16,
    pub text: Vec<u8>,
}

// ── OrderState ───────────────────────────────────────────────────

/// One record per primary order type plus the shared bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderState {
    /// Type of the previous primary order, reused when the control byte
    /// omits one.
    pub order_type: u8,
    pub bounds: Bounds,
    pub destblt: DestBltOrder,
    pub patblt: PatBltOrder,
    pub screenblt: ScreenBltOrder,
    pub line: LineOrder,
    pub rect: RectOrder,
    pub desksave: DeskSaveOrder,
    pub memblt: MemBltOrder,
    pub triblt: TriBltOrder,
    pub polygon: PolyOrder,
    pub polygon2: PolyOrder,
    pub polyline: PolyOrder,
    pub ellipse: EllipseOrder,
    pub ellipse2: EllipseOrder,
    pub text2: Text2Order,
}

impl Default for OrderState {
    fn default() -> Self {
        Self {
            order_type: PATBLT,
            bounds: Bounds::default(),
            destblt: DestBltOrder::default(),
            patblt: PatBltOrder::default(),
            screenblt: ScreenBltOrder::default(),
            line: LineOrder::default(),
            rect: RectOrder::default(),
            desksave: DeskSaveOrder::default(),
            memblt: MemBltOrder::default(),
            triblt: TriBltOrder::default(),
            polygon: PolyOrder::default(),
            polygon2: PolyOrder::default(),
            polyline: PolyOrder::default(),
            ellipse: EllipseOrder::default(),
            ellipse2: EllipseOrder::default(),
            text2: Text2Order::default(),
        }
    }
}

impl OrderState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ── Field readers ────────────────────────────────────────────────

/// Present-field mask, shortened by the SMALL and TINY control flags.
pub fn read_present(s: &mut ReadStream<'_>, size: usize, small: bool, tiny: bool) -> Result<u32> {
    let mut size = size;
    if small {
        size = size.saturating_sub(1);
    }
    if tiny {
        size = size.saturating_sub(2);
    }
    let mut present = 0u32;
    for i in 0..size {
        present |= u32::from(s.u8()?) << (i * 8);
    }
    Ok(present)
}

/// An absolute 16-bit coordinate or a signed 8-bit delta.
pub fn read_coord(s: &mut ReadStream<'_>, coord: &mut i16, delta: bool) -> Result<()> {
    if delta {
        *coord = coord.wrapping_add(i16::from(s.i8()?));
    } else {
        *coord = s.i16_le()?;
    }
    Ok(())
}

/// Three colour bytes, little-endian.
pub fn read_colour(s: &mut ReadStream<'_>) -> Result<u32> {
    let [a, b, c] = s.array::<3>()?;
    Ok(u32::from(a) | u32::from(b) << 8 | u32::from(c) << 16)
}

/// Bounds with per-edge absolute or delta encoding.
pub fn read_bounds(s: &mut ReadStream<'_>, bounds: &mut Bounds) -> Result<()> {
    let present = s.u8()?;
    let edges = [
        &mut bounds.left,
        &mut bounds.top,
        &mut bounds.right,
        &mut bounds.bottom,
    ];
    for (i, edge) in edges.into_iter().enumerate() {
        if present & (1 << i) != 0 {
            read_coord(s, edge, false)?;
        } else if present & (0x10 << i) != 0 {
            read_coord(s, edge, true)?;
        }
    }
    Ok(())
}

pub fn read_pen(s: &mut ReadStream<'_>, pen: &mut Pen, present: u32) -> Result<()> {
    if present & 0x01 != 0 {
        pen.style = s.u8()?;
    }
    if present & 0x02 != 0 {
        pen.width = s.u8()?;
    }
    if present & 0x04 != 0 {
        pen.colour = read_colour(s)?;
    }
    Ok(())
}

pub fn read_brush(s: &mut ReadStream<'_>, brush: &mut BrushFields, present: u32) -> Result<()> {
    if present & 0x01 != 0 {
        brush.x_origin = s.u8()?;
    }
    if present & 0x02 != 0 {
        brush.y_origin = s.u8()?;
    }
    if present & 0x04 != 0 {
        brush.style = s.u8()?;
    }
    if present & 0x08 != 0 {
        brush.pattern[0] = s.u8()?;
    }
    if present & 0x10 != 0 {
        brush.pattern[1..].copy_from_slice(s.take(7)?);
    }
    Ok(())
}

/// A length-prefixed variable field.
pub fn read_data(s: &mut ReadStream<'_>) -> Result<Vec<u8>> {
    let len = s.u8()?;
    Ok(s.take(usize::from(len))?.to_vec())
}
