//! Server-to-client display traffic: share data PDUs, slow-path updates,
//! pointer messages and fast-path output.

use std::borrow::Cow;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::rdp::{
    DATA_BELL, DATA_CONTROL, DATA_DISCONNECT, DATA_LOGON, DATA_POINTER, DATA_SYNCHRONISE,
    DATA_UPDATE, DataHeader,
};
use crate::bitmap::{Bitmap, Colour, Cursor, Palette};
use crate::cache::CacheSet;
use crate::config::OrderPolicy;
use crate::error::{RdcError, Result};
use crate::flags::CompressionFlags;
use crate::mppc::{Expanded, Mppc};
use crate::orders::OrderDecoder;
use crate::presenter::{DrawOp, Point, PointerUpdate, Presenter};
use crate::stream::ReadStream;

const UPDATE_ORDERS: u16 = 0;
const UPDATE_BITMAP: u16 = 1;
const UPDATE_PALETTE: u16 = 2;
const UPDATE_SYNCHRONIZE: u16 = 3;

const POINTER_SYSTEM: u16 = 1;
const POINTER_MOVE: u16 = 3;
const POINTER_COLOUR: u16 = 6;
const POINTER_CACHED: u16 = 7;
const POINTER_NEW: u16 = 8;

const SYSTEM_POINTER_HIDDEN: u32 = 0;

const FP_ORDERS: u8 = 0;
const FP_BITMAP: u8 = 1;
const FP_PALETTE: u8 = 2;
const FP_SYNCHRONIZE: u8 = 3;
const FP_POINTER_HIDDEN: u8 = 5;
const FP_POINTER_DEFAULT: u8 = 6;
const FP_POINTER_POSITION: u8 = 8;
const FP_POINTER_COLOUR: u8 = 9;
const FP_POINTER_CACHED: u8 = 10;
const FP_POINTER_NEW: u8 = 11;

const FP_FRAGMENT_SINGLE: u8 = 0;
const FP_FRAGMENT_LAST: u8 = 1;
const FP_FRAGMENT_FIRST: u8 = 2;
const FP_COMPRESSION_USED: u8 = 0x80;

/// Bitmap rectangles flagged this way carry no compression header.
const NO_BITMAP_COMPRESSION_HDR: u16 = 0x400;
const BITMAP_COMPRESSION: u16 = 1;

const MAX_PALETTE_ENTRIES: usize = 256;
/// Colour pointers without an explicit depth are 24 bpp.
const DEFAULT_POINTER_BPP: u16 = 24;
/// Reassembly limit for fragmented fast-path updates.
const MAX_FRAGMENTED_UPDATE: usize = 0x40000;

/// Session-level events surfaced by a share data PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerNotice {
    LoggedOn,
    /// Set-error-info from the server; zero means a clean disconnect.
    Disconnect { reason: u32 },
}

/// Decoder for everything the server draws.
///
/// Holds the bulk decompressor and the order decoder, both of which
/// carry state across PDUs.
#[derive(Debug)]
pub struct UpdateDecoder {
    mppc: Mppc,
    orders: OrderDecoder,
    fragment: Option<Vec<u8>>,
}

impl UpdateDecoder {
    pub fn new(policy: OrderPolicy, compression_header: bool) -> Self {
        Self {
            mppc: Mppc::new(),
            orders: OrderDecoder::new(policy, compression_header),
            fragment: None,
        }
    }

    pub fn orders(&self) -> &OrderDecoder {
        &self.orders
    }

    /// Forget order state and partial fast-path updates. Called on
    /// deactivation; the compression history survives it.
    pub fn reset(&mut self) {
        self.orders.reset();
        self.fragment = None;
    }

    /// Handle one share data PDU body (share control header stripped).
    pub fn process_data(
        &mut self,
        body: &[u8],
        caches: &mut CacheSet,
        presenter: &mut dyn Presenter,
    ) -> Result<Option<ServerNotice>> {
        let mut s = ReadStream::new(body);
        let header = DataHeader::parse(&mut s)?;

        let payload = if header.compression.contains(CompressionFlags::COMPRESSED) {
            let data = s.take(header.compressed_len.min(s.remaining()))?;
            let run = self.mppc.expand(data, header.compression)?;
            self.mppc.output(run)
        } else {
            Cow::Borrowed(s.rest())
        };
        let mut s = ReadStream::new(&payload);

        match header.data_type {
            DATA_UPDATE => {
                presenter.begin_update();
                let result = process_update(&mut self.orders, &mut s, caches, presenter);
                presenter.end_update();
                result?;
            }
            DATA_POINTER => process_pointer(&mut s, caches, presenter)?,
            DATA_BELL => presenter.bell(),
            DATA_LOGON => {
                debug!("server reports logon");
                return Ok(Some(ServerNotice::LoggedOn));
            }
            DATA_DISCONNECT => {
                let reason = s.u32_le()?;
                return Ok(Some(ServerNotice::Disconnect { reason }));
            }
            DATA_CONTROL | DATA_SYNCHRONISE => {
                trace!(data_type = header.data_type, "finalisation echo");
            }
            other => warn!(data_type = other, "ignoring unknown data PDU"),
        }
        Ok(None)
    }

    /// Handle a decrypted fast-path output payload.
    pub fn process_fast_path(
        &mut self,
        payload: &[u8],
        caches: &mut CacheSet,
        presenter: &mut dyn Presenter,
    ) -> Result<()> {
        presenter.begin_update();
        let result = self.fast_path_updates(payload, caches, presenter);
        presenter.end_update();
        result
    }

    fn fast_path_updates(
        &mut self,
        payload: &[u8],
        caches: &mut CacheSet,
        presenter: &mut dyn Presenter,
    ) -> Result<()> {
        let mut s = ReadStream::new(payload);
        while !s.is_empty() {
            let header = s.u8()?;
            let code = header & 0x0f;
            let fragmentation = (header >> 4) & 0x03;
            let compression = if header & FP_COMPRESSION_USED != 0 {
                CompressionFlags::from_bits_retain(s.u8()?)
            } else {
                CompressionFlags::empty()
            };
            let size = usize::from(s.u16_le()?);
            let data = s.take(size)?;

            let run = self.mppc.expand(data, compression)?;
            let data = match run {
                Expanded::Raw => Cow::Borrowed(data),
                run => self.mppc.output(run),
            };

            match fragmentation {
                FP_FRAGMENT_SINGLE => {
                    fast_path_update(&mut self.orders, code, &data, caches, presenter)?;
                }
                FP_FRAGMENT_FIRST => self.fragment = Some(data.into_owned()),
                _ => {
                    let mut buf = self
                        .fragment
                        .take()
                        .ok_or_else(|| RdcError::malformed("fast-path fragment without first"))?;
                    buf.extend_from_slice(&data);
                    if buf.len() > MAX_FRAGMENTED_UPDATE {
                        return Err(RdcError::malformed("fragmented fast-path update too large"));
                    }
                    if fragmentation == FP_FRAGMENT_LAST {
                        fast_path_update(&mut self.orders, code, &buf, caches, presenter)?;
                    } else {
                        self.fragment = Some(buf);
                    }
                }
            }
        }
        Ok(())
    }
}

// ── Update dispatch ──────────────────────────────────────────────

fn process_update(
    orders: &mut OrderDecoder,
    s: &mut ReadStream<'_>,
    caches: &mut CacheSet,
    presenter: &mut dyn Presenter,
) -> Result<()> {
    match s.u16_le()? {
        UPDATE_ORDERS => {
            s.skip(2)?;
            let count = s.u16_le()?;
            s.skip(2)?;
            orders.process(s, count, caches, presenter)
        }
        UPDATE_BITMAP => process_bitmaps(s, presenter),
        UPDATE_PALETTE => process_palette(s, presenter),
        UPDATE_SYNCHRONIZE => Ok(()),
        other => {
            warn!(update_type = other, "ignoring unknown update");
            Ok(())
        }
    }
}

fn fast_path_update(
    orders: &mut OrderDecoder,
    code: u8,
    data: &[u8],
    caches: &mut CacheSet,
    presenter: &mut dyn Presenter,
) -> Result<()> {
    let mut s = ReadStream::new(data);
    match code {
        FP_ORDERS => {
            let count = s.u16_le()?;
            orders.process(&mut s, count, caches, presenter)?;
        }
        FP_BITMAP => {
            s.skip(2)?;
            process_bitmaps(&mut s, presenter)?;
        }
        FP_PALETTE => {
            s.skip(2)?;
            process_palette(&mut s, presenter)?;
        }
        FP_SYNCHRONIZE => {}
        FP_POINTER_HIDDEN => presenter.update_pointer(PointerUpdate::Hidden),
        FP_POINTER_DEFAULT => presenter.update_pointer(PointerUpdate::Default),
        FP_POINTER_POSITION => pointer_position(&mut s, presenter)?,
        FP_POINTER_COLOUR => colour_pointer(&mut s, DEFAULT_POINTER_BPP, caches, presenter)?,
        FP_POINTER_CACHED => cached_pointer(&mut s, caches, presenter)?,
        FP_POINTER_NEW => {
            let bpp = s.u16_le()?;
            colour_pointer(&mut s, bpp, caches, presenter)?;
        }
        other => debug!(code = other, "ignoring fast-path update"),
    }
    Ok(())
}

// ── Bitmaps and palettes ─────────────────────────────────────────

fn process_bitmaps(s: &mut ReadStream<'_>, presenter: &mut dyn Presenter) -> Result<()> {
    let count = s.u16_le()?;
    for _ in 0..count {
        let left = s.u16_le()?;
        let top = s.u16_le()?;
        let right = s.u16_le()?;
        let bottom = s.u16_le()?;
        let width = s.u16_le()?;
        let height = s.u16_le()?;
        let bpp = s.u16_le()?.div_ceil(8);
        let compress = s.u16_le()?;
        let mut size = usize::from(s.u16_le()?);

        let bpp = u8::try_from(bpp).map_err(|_| RdcError::malformed("bitmap depth"))?;
        let bitmap = if compress & BITMAP_COMPRESSION == 0 {
            let data = s.take(Bitmap::byte_len(width, height, bpp))?;
            Bitmap::from_bottom_up(width, height, bpp, data)?
        } else {
            if compress & NO_BITMAP_COMPRESSION_HDR == 0 {
                s.skip(2)?;
                size = usize::from(s.u16_le()?);
                s.skip(4)?;
            }
            Bitmap::from_compressed(width, height, bpp, s.take(size)?)?
        };

        let cx = right.wrapping_sub(left).wrapping_add(1);
        let cy = bottom.wrapping_sub(top).wrapping_add(1);
        presenter.draw(DrawOp::Bitmap {
            x: left as i16,
            y: top as i16,
            bitmap: Arc::new(crop(bitmap, cx, cy)),
        });
    }
    Ok(())
}

/// Drop the padding columns and rows outside the destination rectangle.
fn crop(bitmap: Bitmap, cx: u16, cy: u16) -> Bitmap {
    if cx >= bitmap.width && cy >= bitmap.height {
        return bitmap;
    }
    let width = cx.min(bitmap.width);
    let height = cy.min(bitmap.height);
    let row_len = usize::from(width) * usize::from(bitmap.bpp);
    let mut data = Vec::with_capacity(row_len * usize::from(height));
    for y in 0..height {
        data.extend_from_slice(&bitmap.row(y)[..row_len]);
    }
    Bitmap {
        width,
        height,
        bpp: bitmap.bpp,
        data,
    }
}

fn process_palette(s: &mut ReadStream<'_>, presenter: &mut dyn Presenter) -> Result<()> {
    s.skip(2)?;
    let count = usize::from(s.u16_le()?);
    s.skip(2)?;
    if count > MAX_PALETTE_ENTRIES {
        return Err(RdcError::malformed("palette size"));
    }
    let mut palette = Palette::with_capacity(count);
    for _ in 0..count {
        let [red, green, blue] = s.array::<3>()?;
        palette.push(Colour { red, green, blue });
    }
    presenter.update_palette(&palette);
    Ok(())
}

// ── Pointers ─────────────────────────────────────────────────────

fn process_pointer(
    s: &mut ReadStream<'_>,
    caches: &mut CacheSet,
    presenter: &mut dyn Presenter,
) -> Result<()> {
    let message = s.u16_le()?;
    s.skip(2)?;
    match message {
        POINTER_MOVE => pointer_position(s, presenter),
        POINTER_COLOUR => colour_pointer(s, DEFAULT_POINTER_BPP, caches, presenter),
        POINTER_CACHED => cached_pointer(s, caches, presenter),
        POINTER_NEW => {
            let bpp = s.u16_le()?;
            colour_pointer(s, bpp, caches, presenter)
        }
        POINTER_SYSTEM => {
            let update = if s.u32_le()? == SYSTEM_POINTER_HIDDEN {
                PointerUpdate::Hidden
            } else {
                PointerUpdate::Default
            };
            presenter.update_pointer(update);
            Ok(())
        }
        other => {
            warn!(message = other, "ignoring unknown pointer message");
            Ok(())
        }
    }
}

fn pointer_position(s: &mut ReadStream<'_>, presenter: &mut dyn Presenter) -> Result<()> {
    let x = s.u16_le()? as i16;
    let y = s.u16_le()? as i16;
    presenter.update_pointer(PointerUpdate::Position(Point { x, y }));
    Ok(())
}

fn colour_pointer(
    s: &mut ReadStream<'_>,
    xor_bpp: u16,
    caches: &mut CacheSet,
    presenter: &mut dyn Presenter,
) -> Result<()> {
    let idx = usize::from(s.u16_le()?);
    let hotspot_x = s.u16_le()?;
    let hotspot_y = s.u16_le()?;
    let width = s.u16_le()?;
    let height = s.u16_le()?;
    let mask_len = usize::from(s.u16_le()?);
    let data_len = usize::from(s.u16_le()?);
    let xor_mask = s.take(data_len)?.to_vec();
    let and_mask = s.take(mask_len)?.to_vec();

    let cursor = Arc::new(Cursor {
        hotspot_x,
        hotspot_y,
        width,
        height,
        and_mask,
        xor_mask,
        xor_bpp,
    });
    caches.cursors.put(idx, Arc::clone(&cursor))?;
    presenter.update_pointer(PointerUpdate::Shape(cursor));
    Ok(())
}

fn cached_pointer(
    s: &mut ReadStream<'_>,
    caches: &mut CacheSet,
    presenter: &mut dyn Presenter,
) -> Result<()> {
    let idx = usize::from(s.u16_le()?);
    match caches.cursors.get(idx) {
        Some(cursor) => presenter.update_pointer(PointerUpdate::Shape(Arc::clone(cursor))),
        None => warn!(idx, "cached pointer not present"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presenter::RecordingPresenter;
    use crate::stream::Stream;

    fn decoder() -> UpdateDecoder {
        UpdateDecoder::new(OrderPolicy::Strict, true)
    }

    /// Share data header as seen after the share control header.
    fn data_pdu(data_type: u8, ctype: u8, payload: &[u8]) -> Vec<u8> {
        let mut s = Stream::with_capacity(64);
        s.put_u32_le(0x1_03ea);
        s.put_u8(0);
        s.put_u8(1);
        s.put_u16_le(payload.len() as u16 + 4);
        s.put_u8(data_type);
        s.put_u8(ctype);
        s.put_u16_le(payload.len() as u16 + 18);
        s.put_slice(payload);
        s.as_slice().to_vec()
    }

    const PALETTE_UPDATE: [u8; 11] = [2, 0, 0, 0, 1, 0, 0, 0, 0x10, 0x20, 0x30];

    #[test]
    fn palette_update_reaches_presenter() {
        let mut p = RecordingPresenter::default();
        let mut caches = CacheSet::default();
        let pdu = data_pdu(DATA_UPDATE, 0, &PALETTE_UPDATE);
        let notice = decoder().process_data(&pdu, &mut caches, &mut p).unwrap();
        assert!(notice.is_none());
        assert_eq!(
            p.palettes,
            vec![vec![Colour {
                red: 0x10,
                green: 0x20,
                blue: 0x30
            }]]
        );
    }

    #[test]
    fn compressed_data_pdu_is_expanded() {
        // every byte is below 0x80, so each encodes as a byte-aligned literal
        let ctype = (CompressionFlags::COMPRESSED | CompressionFlags::BIG).bits();
        let pdu = data_pdu(DATA_UPDATE, ctype, &PALETTE_UPDATE);
        let mut p = RecordingPresenter::default();
        decoder()
            .process_data(&pdu, &mut CacheSet::default(), &mut p)
            .unwrap();
        assert_eq!(p.palettes.len(), 1);
        assert_eq!(p.palettes[0][0].blue, 0x30);
    }

    #[test]
    fn disconnect_and_bell() {
        let mut p = RecordingPresenter::default();
        let mut caches = CacheSet::default();
        let mut d = decoder();
        let pdu = data_pdu(DATA_DISCONNECT, 0, &[0x0c, 0, 0, 0]);
        assert_eq!(
            d.process_data(&pdu, &mut caches, &mut p).unwrap(),
            Some(ServerNotice::Disconnect { reason: 12 })
        );
        d.process_data(&data_pdu(DATA_BELL, 0, &[]), &mut caches, &mut p)
            .unwrap();
        assert_eq!(p.bells, 1);
    }

    #[test]
    fn uncompressed_bitmap_is_flipped_and_cropped() {
        let mut s = Stream::with_capacity(64);
        s.put_u16_le(UPDATE_BITMAP);
        s.put_u16_le(1);
        for v in [10, 20, 12, 20, 4, 2, 8, 0, 8] {
            s.put_u16_le(v);
        }
        s.put_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let pdu = data_pdu(DATA_UPDATE, 0, s.as_slice());

        let mut p = RecordingPresenter::default();
        decoder()
            .process_data(&pdu, &mut CacheSet::default(), &mut p)
            .unwrap();
        let DrawOp::Bitmap { x, y, bitmap } = &p.ops[0] else {
            panic!("expected bitmap, got {:?}", p.ops[0]);
        };
        assert_eq!((*x, *y), (10, 20));
        assert_eq!((bitmap.width, bitmap.height), (3, 1));
        assert_eq!(bitmap.data, vec![5, 6, 7]);
    }

    #[test]
    fn absurd_bitmap_depth_is_malformed() {
        let mut s = Stream::with_capacity(64);
        s.put_u16_le(UPDATE_BITMAP);
        s.put_u16_le(1);
        for v in [0, 0, 0, 0, 1, 1, 0xffff, 0, 0] {
            s.put_u16_le(v);
        }
        let pdu = data_pdu(DATA_UPDATE, 0, s.as_slice());

        let mut p = RecordingPresenter::default();
        let err = decoder()
            .process_data(&pdu, &mut CacheSet::default(), &mut p)
            .unwrap_err();
        assert!(matches!(err, RdcError::Malformed { .. }));
        assert!(p.ops.is_empty());
    }

    #[test]
    fn colour_pointer_is_cached_and_recalled() {
        let mut s = Stream::with_capacity(64);
        s.put_u16_le(POINTER_COLOUR);
        s.put_u16_le(0);
        for v in [2, 1, 1, 1, 1, 1, 3] {
            s.put_u16_le(v);
        }
        s.put_slice(&[0xff, 0, 0]);
        s.put_u8(0x80);
        let mut p = RecordingPresenter::default();
        let mut caches = CacheSet::default();
        let mut d = decoder();
        d.process_data(&data_pdu(DATA_POINTER, 0, s.as_slice()), &mut caches, &mut p)
            .unwrap();

        let cached = [POINTER_CACHED as u8, 0, 0, 0, 2, 0];
        d.process_data(&data_pdu(DATA_POINTER, 0, &cached), &mut caches, &mut p)
            .unwrap();
        assert_eq!(p.pointers.len(), 2);
        assert_eq!(p.pointers[0], p.pointers[1]);
        let PointerUpdate::Shape(cursor) = &p.pointers[0] else {
            panic!("expected shape");
        };
        assert_eq!(cursor.xor_bpp, 24);
        assert_eq!(cursor.and_mask, vec![0x80]);
    }

    #[test]
    fn fast_path_fragments_are_joined() {
        let body = [0u8, 0, 0, 0, 1, 0, 0, 0, 1, 2, 3];
        let mut s = Stream::with_capacity(64);
        s.put_u8(FP_PALETTE | (FP_FRAGMENT_FIRST << 4));
        s.put_u16_le(5);
        s.put_slice(&body[..5]);
        s.put_u8(FP_PALETTE | (FP_FRAGMENT_LAST << 4));
        s.put_u16_le(6);
        s.put_slice(&body[5..]);
        s.put_u8(FP_POINTER_HIDDEN);
        s.put_u16_le(0);

        let mut p = RecordingPresenter::default();
        decoder()
            .process_fast_path(s.as_slice(), &mut CacheSet::default(), &mut p)
            .unwrap();
        assert_eq!(p.palettes.len(), 1);
        assert_eq!(p.pointers, vec![PointerUpdate::Hidden]);
    }

    #[test]
    fn compressed_fast_path_update_is_expanded() {
        let body = [0u8, 0, 0, 0, 1, 0, 0, 0, 1, 2, 3];
        let mut s = Stream::with_capacity(64);
        s.put_u8(FP_PALETTE | FP_COMPRESSION_USED);
        s.put_u8((CompressionFlags::COMPRESSED | CompressionFlags::BIG).bits());
        s.put_u16_le(body.len() as u16);
        s.put_slice(&body);

        let mut p = RecordingPresenter::default();
        decoder()
            .process_fast_path(s.as_slice(), &mut CacheSet::default(), &mut p)
            .unwrap();
        assert_eq!(p.palettes.len(), 1);
        assert_eq!(p.palettes[0][0].blue, 3);
    }

    #[test]
    fn orphan_fast_path_fragment_is_malformed() {
        let frame = [FP_SYNCHRONIZE | (FP_FRAGMENT_LAST << 4), 0, 0];
        let err = decoder()
            .process_fast_path(&frame, &mut CacheSet::default(), &mut RecordingPresenter::default())
            .unwrap_err();
        assert!(matches!(err, RdcError::Malformed { .. }));
    }
}
