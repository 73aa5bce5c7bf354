//! Drawing-order decoder.
//!
//! Orders arrive in batches inside update PDUs. Primary orders are
//! delta-encoded against [`OrderState`] and turned into [`DrawOp`]s;
//! secondary orders populate the caches. The decoder owns its state and
//! is reset on every activation.

pub mod primary;
pub mod secondary;
pub mod state;
pub mod text;

use tracing::{debug, warn};

pub use state::OrderState;

use crate::cache::CacheSet;
use crate::config::OrderPolicy;
use crate::error::{RdcError, Result};
use crate::flags::OrderControl;
use crate::presenter::{Brush, DrawOp, Pen, Point, Presenter, Rect};
use crate::stream::ReadStream;
use state::*;

/// Brush style selecting a cached pattern.
const BRUSH_CACHED: u8 = 0x80;
const BRUSH_PATTERN: u8 = 3;

fn rop2_s(rop3: u8) -> u8 {
    rop3 & 0x0f
}

fn rop2_p(rop3: u8) -> u8 {
    (rop3 & 0x03) | ((rop3 & 0x30) >> 2)
}

/// 1-based wire ROP2 to 0-based, rejecting values outside 1..=16.
fn rop2_checked(opcode: u8) -> Option<u8> {
    (1..=16).contains(&opcode).then(|| opcode - 1)
}

fn is_primary(order_type: u8) -> bool {
    matches!(
        order_type,
        DESTBLT
            | PATBLT
            | SCREENBLT
            | LINE
            | RECT
            | DESKSAVE
            | MEMBLT
            | TRIBLT
            | POLYGON
            | POLYGON2
            | POLYLINE
            | ELLIPSE
            | ELLIPSE2
            | TEXT2
    )
}

// ── OrderDecoder ─────────────────────────────────────────────────

#[derive(Debug)]
pub struct OrderDecoder {
    state: OrderState,
    policy: OrderPolicy,
    compression_header: bool,
}

impl OrderDecoder {
    /// `compression_header` says whether rev1 compressed cache bitmaps
    /// carry their 8-byte compression header.
    pub fn new(policy: OrderPolicy, compression_header: bool) -> Self {
        Self {
            state: OrderState::default(),
            policy,
            compression_header,
        }
    }

    pub fn state(&self) -> &OrderState {
        &self.state
    }

    pub fn policy(&self) -> &OrderPolicy {
        &self.policy
    }

    pub fn reset(&mut self) {
        self.state.reset();
    }

    /// Decode `count` orders from `s`.
    pub fn process(
        &mut self,
        s: &mut ReadStream<'_>,
        count: u16,
        caches: &mut CacheSet,
        presenter: &mut dyn Presenter,
    ) -> Result<()> {
        for processed in 0..count {
            let control = OrderControl::from_bits_truncate(s.u8()?);
            if !control.contains(OrderControl::STANDARD) {
                if let OrderPolicy::Lenient { .. } = self.policy {
                    warn!(processed, count, "order without standard flag, dropping batch");
                    return Ok(());
                }
                return Err(RdcError::malformed("order without standard flag"));
            }

            if control.contains(OrderControl::SECONDARY) {
                self.secondary(s, caches, presenter)?;
                continue;
            }

            if control.contains(OrderControl::CHANGE) {
                self.state.order_type = s.u8()?;
            }
            let order_type = self.state.order_type;

            if !is_primary(order_type) {
                match self.policy.skip_length(order_type) {
                    Some(len) => {
                        debug!(order_type, len, "skipping unknown primary order");
                        s.skip(len)?;
                        continue;
                    }
                    None => {
                        return Err(RdcError::UnknownVariant {
                            type_name: "primary order",
                            value: u32::from(order_type),
                        });
                    }
                }
            }

            let present = read_present(
                s,
                present_bytes(order_type),
                control.contains(OrderControl::SMALL),
                control.contains(OrderControl::TINY),
            )?;

            let bounded = control.contains(OrderControl::BOUNDS);
            if bounded {
                if !control.contains(OrderControl::LASTBOUNDS) {
                    read_bounds(s, &mut self.state.bounds)?;
                }
                presenter.set_clip(Some(self.state.bounds.rect()));
            }

            let delta = control.contains(OrderControl::DELTA);
            self.primary(order_type, s, present, delta, caches, presenter)?;

            if bounded {
                presenter.set_clip(None);
            }
        }
        Ok(())
    }

    fn secondary(
        &mut self,
        s: &mut ReadStream<'_>,
        caches: &mut CacheSet,
        presenter: &mut dyn Presenter,
    ) -> Result<()> {
        let length = s.i16_le()?;
        let flags = s.u16_le()?;
        let order_type = s.u8()?;
        let body_len = usize::try_from(i32::from(length) + 7)
            .map_err(|_| RdcError::malformed("secondary order length"))?;
        let mut body = s.sub(body_len)?;
        secondary::process(
            &mut body,
            order_type,
            flags,
            caches,
            presenter,
            self.compression_header,
        )
    }

    fn primary(
        &mut self,
        order_type: u8,
        s: &mut ReadStream<'_>,
        present: u32,
        delta: bool,
        caches: &mut CacheSet,
        presenter: &mut dyn Presenter,
    ) -> Result<()> {
        let st = &mut self.state;
        match order_type {
            DESTBLT => {
                let o = &mut st.destblt;
                o.parse(s, present, delta)?;
                presenter.draw(DrawOp::DestBlt {
                    rop: rop2_s(o.opcode),
                    rect: Rect::new(o.x, o.y, o.cx, o.cy),
                });
            }
            PATBLT => {
                let o = &mut st.patblt;
                o.parse(s, present, delta)?;
                if let Some(brush) = setup_brush(&o.brush, caches) {
                    presenter.draw(DrawOp::PatBlt {
                        rop: rop2_p(o.opcode),
                        rect: Rect::new(o.x, o.y, o.cx, o.cy),
                        brush,
                        bg: o.bg,
                        fg: o.fg,
                    });
                }
            }
            SCREENBLT => {
                let o = &mut st.screenblt;
                o.parse(s, present, delta)?;
                presenter.draw(DrawOp::ScreenBlt {
                    rop: rop2_s(o.opcode),
                    rect: Rect::new(o.x, o.y, o.cx, o.cy),
                    src: Point {
                        x: o.src_x,
                        y: o.src_y,
                    },
                });
            }
            LINE => {
                let o = &mut st.line;
                o.parse(s, present, delta)?;
                match rop2_checked(o.opcode) {
                    Some(rop) => presenter.draw(DrawOp::Line {
                        rop,
                        start: Point {
                            x: o.start_x,
                            y: o.start_y,
                        },
                        end: Point {
                            x: o.end_x,
                            y: o.end_y,
                        },
                        pen: o.pen,
                    }),
                    None => warn!(opcode = o.opcode, "line with invalid rop"),
                }
            }
            RECT => {
                let o = &mut st.rect;
                o.parse(s, present, delta)?;
                presenter.draw(DrawOp::Rect {
                    rect: Rect::new(o.x, o.y, o.cx, o.cy),
                    colour: o.colour,
                });
            }
            DESKSAVE => {
                let o = &mut st.desksave;
                o.parse(s, present, delta)?;
                presenter.draw(DrawOp::DesktopSave {
                    offset: o.offset,
                    rect: Rect::from_edges(o.left, o.top, o.right, o.bottom),
                    restore: o.action != 0,
                });
            }
            MEMBLT => {
                let o = &mut st.memblt;
                o.parse(s, present, delta)?;
                match caches.get_bitmap(o.cache_id, o.cache_idx) {
                    Some(bitmap) => presenter.draw(DrawOp::MemBlt {
                        rop: rop2_s(o.opcode),
                        rect: Rect::new(o.x, o.y, o.cx, o.cy),
                        bitmap,
                        src: Point {
                            x: o.src_x,
                            y: o.src_y,
                        },
                    }),
                    None => debug!(cache_id = o.cache_id, idx = o.cache_idx, "memblt cache miss"),
                }
            }
            TRIBLT => {
                let o = &mut st.triblt;
                o.parse(s, present, delta)?;
                let bitmap = caches.get_bitmap(o.cache_id, o.cache_idx);
                let brush = setup_brush(&o.brush, caches);
                match (bitmap, brush) {
                    (Some(bitmap), Some(brush)) => presenter.draw(DrawOp::TriBlt {
                        rop3: o.opcode,
                        rect: Rect::new(o.x, o.y, o.cx, o.cy),
                        bitmap,
                        src: Point {
                            x: o.src_x,
                            y: o.src_y,
                        },
                        brush,
                        bg: o.bg,
                        fg: o.fg,
                    }),
                    _ => debug!(cache_id = o.cache_id, idx = o.cache_idx, "triblt cache miss"),
                }
            }
            POLYGON | POLYGON2 => {
                let brushed = order_type == POLYGON2;
                let o = if brushed {
                    &mut st.polygon2
                } else {
                    &mut st.polygon
                };
                if brushed {
                    o.parse_polygon2(s, present, delta)?;
                } else {
                    o.parse_polygon(s, present, delta)?;
                }
                let brush = if brushed {
                    match setup_brush(&o.brush, caches) {
                        Some(b) => Some(b),
                        None => return Ok(()),
                    }
                } else {
                    None
                };
                match (rop2_checked(o.opcode), o.points()) {
                    (Some(rop), Some(points)) => presenter.draw(DrawOp::Polygon {
                        rop,
                        fill_mode: o.fill_mode,
                        points,
                        brush,
                        bg: o.bg,
                        fg: o.fg,
                    }),
                    _ => warn!(opcode = o.opcode, "polygon dropped"),
                }
            }
            POLYLINE => {
                let o = &mut st.polyline;
                o.parse_polyline(s, present, delta)?;
                match (rop2_checked(o.opcode), o.points()) {
                    (Some(rop), Some(points)) => presenter.draw(DrawOp::Polyline {
                        rop,
                        points,
                        pen: Pen {
                            style: 0,
                            width: 1,
                            colour: o.fg,
                        },
                    }),
                    _ => warn!(opcode = o.opcode, "polyline dropped"),
                }
            }
            ELLIPSE | ELLIPSE2 => {
                let brushed = order_type == ELLIPSE2;
                let o = if brushed {
                    &mut st.ellipse2
                } else {
                    &mut st.ellipse
                };
                let brush = if brushed {
                    o.parse_ellipse2(s, present, delta)?;
                    match setup_brush(&o.brush, caches) {
                        Some(b) => Some(b),
                        None => return Ok(()),
                    }
                } else {
                    o.parse_ellipse(s, present, delta)?;
                    None
                };
                match rop2_checked(o.opcode) {
                    Some(rop) => presenter.draw(DrawOp::Ellipse {
                        rop,
                        fill_mode: o.fill_mode,
                        rect: Rect::new(
                            o.left,
                            o.top,
                            o.right.wrapping_sub(o.left),
                            o.bottom.wrapping_sub(o.top),
                        ),
                        brush,
                        bg: o.bg,
                        fg: o.fg,
                    }),
                    None => warn!(opcode = o.opcode, "ellipse with invalid rop"),
                }
            }
            TEXT2 => {
                let o = &mut st.text2;
                o.parse(s, present, delta)?;
                let glyphs = text::expand(caches, o.font, o.flags, o.x, o.y, &o.text);
                presenter.draw(DrawOp::Text {
                    mix_mode: o.mix_mode,
                    clip: Rect::new(
                        o.clip_left,
                        o.clip_top,
                        o.clip_right.wrapping_sub(o.clip_left),
                        o.clip_bottom.wrapping_sub(o.clip_top),
                    ),
                    bounding: Rect::new(
                        o.box_left,
                        o.box_top,
                        o.box_right.wrapping_sub(o.box_left),
                        o.box_bottom.wrapping_sub(o.box_top),
                    ),
                    glyphs,
                    bg: o.bg,
                    fg: o.fg,
                });
            }
            other => {
                return Err(RdcError::UnknownVariant {
                    type_name: "primary order",
                    value: u32::from(other),
                });
            }
        }
        Ok(())
    }
}

/// Resolve a brush that may point into the brush cache. `None` on a
/// cache miss.
fn setup_brush(fields: &BrushFields, caches: &CacheSet) -> Option<Brush> {
    let mut brush = Brush {
        x_origin: fields.x_origin,
        y_origin: fields.y_origin,
        style: fields.style,
        pattern: fields.pattern,
        cached: None,
    };
    if fields.style & BRUSH_CACHED != 0 {
        let colour_code = fields.style & 0x0f;
        match caches.brushes.get(colour_code, fields.pattern[0]) {
            Some(data) => {
                brush.cached = Some(data);
                brush.style = BRUSH_PATTERN;
            }
            None => {
                debug!(idx = fields.pattern[0], "brush cache miss");
                return None;
            }
        }
    }
    Some(brush)
}

// ── Tests ────────────────────────────────────────────────────────
