//! Secondary orders: cache population, never drawn directly.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::bitmap::{Bitmap, Colour, Glyph};
use crate::cache::{BrushData, CacheSet, HashKey};
use crate::error::{RdcError, Result};
use crate::presenter::Presenter;
use crate::stream::ReadStream;

pub const RAW_BMPCACHE: u8 = 0;
pub const COLCACHE: u8 = 1;
pub const BMPCACHE: u8 = 2;
pub const FONTCACHE: u8 = 3;
pub const RAW_BMPCACHE2: u8 = 4;
pub const BMPCACHE2: u8 = 5;
pub const BRUSHCACHE: u8 = 7;

// bitmap cache rev2 flags
const ID_MASK: u16 = 0x0007;
const MODE_MASK: u16 = 0x0038;
const MODE_SHIFT: u16 = 3;
const SQUARE: u16 = 0x0080;
const PERSIST: u16 = 0x0100;
const BUFSIZE_MASK: u16 = 0x3fff;
const LONG_FORMAT: u8 = 0x80;

/// Parse one secondary order whose header has already been read.
pub fn process(
    s: &mut ReadStream<'_>,
    order_type: u8,
    flags: u16,
    caches: &mut CacheSet,
    presenter: &mut dyn Presenter,
    compression_header: bool,
) -> Result<()> {
    match order_type {
        RAW_BMPCACHE => raw_bmpcache(s, caches),
        COLCACHE => colcache(s, caches, presenter),
        BMPCACHE => bmpcache(s, caches, compression_header),
        FONTCACHE => fontcache(s, caches),
        RAW_BMPCACHE2 => bmpcache2(s, flags, false, caches),
        BMPCACHE2 => bmpcache2(s, flags, true, caches),
        BRUSHCACHE => brushcache(s, caches),
        other => {
            debug!(order_type = other, "secondary order skipped");
            Ok(())
        }
    }
}

fn raw_bmpcache(s: &mut ReadStream<'_>, caches: &mut CacheSet) -> Result<()> {
    let cache_id = s.u8()?;
    s.skip(1)?;
    let width = u16::from(s.u8()?);
    let height = u16::from(s.u8()?);
    let bpp = s.u8()?.div_ceil(8);
    let size = s.u16_le()?;
    let cache_idx = s.u16_le()?;
    let data = s.take(usize::from(size))?;

    let bitmap = Bitmap::from_bottom_up(width, height, bpp, data)?;
    trace!(cache_id, cache_idx, width, height, "raw bitmap cached");
    caches.put_bitmap(cache_id, cache_idx, Arc::new(bitmap))
}

/// Rev1 compressed bitmaps carry an 8-byte compression header unless
/// the peer was told to omit it.
fn bmpcache(s: &mut ReadStream<'_>, caches: &mut CacheSet, compression_header: bool) -> Result<()> {
    let cache_id = s.u8()?;
    s.skip(1)?;
    let width = u16::from(s.u8()?);
    let height = u16::from(s.u8()?);
    let bpp = s.u8()?.div_ceil(8);
    let mut size = s.u16_le()?;
    let cache_idx = s.u16_le()?;
    if compression_header {
        s.skip(2)?;
        size = s.u16_le()?;
        s.skip(4)?; // row size, final size
    }
    let data = s.take(usize::from(size))?;

    let bitmap = Bitmap::from_compressed(width, height, bpp, data)?;
    trace!(cache_id, cache_idx, width, height, "bitmap cached");
    caches.put_bitmap(cache_id, cache_idx, Arc::new(bitmap))
}

fn bmpcache2(
    s: &mut ReadStream<'_>,
    flags: u16,
    compressed: bool,
    caches: &mut CacheSet,
) -> Result<()> {
    let cache_id = (flags & ID_MASK) as u8;
    let mode = (flags & MODE_MASK) >> MODE_SHIFT;
    let bpp = match mode {
        3..=6 => (mode - 2) as u8,
        _ => return Err(RdcError::malformed("bitmap cache rev2 colour depth")),
    };

    let key: Option<HashKey> = if flags & PERSIST != 0 {
        Some(s.array::<8>()?)
    } else {
        None
    };
    let width = u16::from(s.u8()?);
    let height = if flags & SQUARE != 0 {
        width
    } else {
        u16::from(s.u8()?)
    };
    let size = s.u16_be()? & BUFSIZE_MASK;
    let mut cache_idx = u16::from(s.u8()?);
    if cache_idx & u16::from(LONG_FORMAT) != 0 {
        cache_idx = ((cache_idx ^ u16::from(LONG_FORMAT)) << 8) | u16::from(s.u8()?);
    }
    let data = s.take(usize::from(size))?;

    let bitmap = if compressed {
        Bitmap::from_compressed(width, height, bpp, data)?
    } else {
        Bitmap::from_bottom_up(width, height, bpp, data)?
    };
    trace!(cache_id, cache_idx, width, height, persist = key.is_some(), "bitmap cached");

    if let Some(key) = key {
        caches.save_persistent(cache_id, cache_idx, key, &bitmap);
    }
    caches.put_bitmap(cache_id, cache_idx, Arc::new(bitmap))
}

fn colcache(
    s: &mut ReadStream<'_>,
    caches: &mut CacheSet,
    presenter: &mut dyn Presenter,
) -> Result<()> {
    let cache_id = s.u8()?;
    let count = s.u16_le()?;
    let mut palette = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let [blue, green, red, _] = s.array::<4>()?;
        palette.push(Colour { red, green, blue });
    }
    presenter.update_palette(&palette);
    caches
        .colour_tables
        .put(usize::from(cache_id), Arc::new(palette))
}

fn fontcache(s: &mut ReadStream<'_>, caches: &mut CacheSet) -> Result<()> {
    let font = s.u8()?;
    let count = s.u8()?;
    for _ in 0..count {
        let character = s.u16_le()?;
        let offset = s.i16_le()?;
        let baseline = s.i16_le()?;
        let width = s.u16_le()?;
        let height = s.u16_le()?;
        let len = usize::from(height) * Glyph::stride(width);
        let padded = (len + 3) & !3;
        let data = s.take(padded)?;
        caches.glyphs.put(
            font,
            character,
            Glyph {
                offset,
                baseline,
                width,
                height,
                data: data[..len].to_vec(),
            },
        )?;
    }
    trace!(font, count, "glyphs cached");
    Ok(())
}

fn brushcache(s: &mut ReadStream<'_>, caches: &mut CacheSet) -> Result<()> {
    let idx = s.u8()?;
    let format = s.u8()?;
    let cx = s.u8()?;
    let cy = s.u8()?;
    s.skip(1)?; // style
    let len = usize::from(s.u8()?);

    let brush = match format {
        1 => {
            if cx != 8 || cy != 8 || len != 8 {
                return Err(RdcError::malformed("monochrome brush size"));
            }
            let mut data = s.take(8)?.to_vec();
            data.reverse();
            BrushData { bpp: 1, data }
        }
        3..=6 => {
            let bytes = usize::from(format - 2);
            let raw_len = 8 * 8 * bytes;
            let input = s.take(len)?;
            let data = if len == raw_len {
                let mut out = vec![0u8; raw_len];
                for (row, chunk) in input.chunks_exact(8 * bytes).enumerate() {
                    let dst = (7 - row) * 8 * bytes;
                    out[dst..dst + 8 * bytes].copy_from_slice(chunk);
                }
                out
            } else {
                expand_compressed_brush(input, bytes)?
            };
            BrushData {
                bpp: (bytes * 8) as u8,
                data,
            }
        }
        _ => return Err(RdcError::malformed("brush format")),
    };
    caches.brushes.put(idx, brush)
}

/// 2-bit palette indices, bottom-up, followed by a four-entry palette.
fn expand_compressed_brush(input: &[u8], bytes: usize) -> Result<Vec<u8>> {
    if input.len() < 16 + 4 * bytes {
        return Err(RdcError::malformed("compressed brush"));
    }
    let (indices, palette) = input.split_at(16);
    let mut out = vec![0u8; 8 * 8 * bytes];
    for y in 0..8 {
        let row = &indices[(7 - y) * 2..(7 - y) * 2 + 2];
        for x in 0..8 {
            let shift = 6 - 2 * (x % 4);
            let entry = usize::from((row[x / 4] >> shift) & 3);
            let dst = (y * 8 + x) * bytes;
            out[dst..dst + bytes].copy_from_slice(&palette[entry * bytes..(entry + 1) * bytes]);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presenter::RecordingPresenter;

    #[test]
    fn font_glyphs_drop_row_padding() {
        let mut c = CacheSet::default();
        let mut p = RecordingPresenter::default();
        // one 3x2 glyph: 2 data bytes padded to 4
        let body = [
            4, 1, b'x', 0, 1, 0, 0xf8, 0xff, 3, 0, 2, 0, 0xe0, 0xa0, 0, 0,
        ];
        process(&mut ReadStream::new(&body), FONTCACHE, 0, &mut c, &mut p, false).unwrap();
        let g = c.glyphs.get(4, u16::from(b'x')).unwrap();
        assert_eq!(g.data, vec![0xe0, 0xa0]);
        assert_eq!((g.offset, g.baseline), (1, -8));
    }

    #[test]
    fn colour_cache_updates_the_palette() {
        let mut c = CacheSet::default();
        let mut p = RecordingPresenter::default();
        let body = [0, 2, 0, 0x10, 0x20, 0x30, 0, 0xff, 0, 0, 0];
        process(&mut ReadStream::new(&body), COLCACHE, 0, &mut c, &mut p, false).unwrap();
        assert_eq!(
            p.palettes[0],
            vec![
                Colour { red: 0x30, green: 0x20, blue: 0x10 },
                Colour { red: 0, green: 0, blue: 0xff },
            ]
        );
        assert_eq!(c.colour_tables.get(0).unwrap().len(), 2);
    }

    #[test]
    fn rev2_long_index_and_square_flag() {
        let mut c = CacheSet::default();
        let mut p = RecordingPresenter::default();
        // id 1, 1 byte per pixel, square 2x2, index 0x123
        let flags = 1 | (3 << MODE_SHIFT) | SQUARE;
        let body = [2, 0x00, 0x04, 0x81, 0x23, 1, 2, 3, 4];
        process(&mut ReadStream::new(&body), RAW_BMPCACHE2, flags, &mut c, &mut p, false).unwrap();
        let bmp = c.get_bitmap(1, 0x123).unwrap();
        assert_eq!(bmp.data, vec![3, 4, 1, 2]);
    }

    #[test]
    fn compressed_brush_expands_through_palette() {
        let mut input = vec![0u8; 16];
        input[14] = 0b1110_0100; // top row, first four pixels: 3 2 1 0
        input.extend_from_slice(&[10, 20, 30, 40]);
        let out = expand_compressed_brush(&input, 1).unwrap();
        assert_eq!(&out[..4], &[40, 30, 20, 10]);
        assert_eq!(out[8], 10);
    }
}
