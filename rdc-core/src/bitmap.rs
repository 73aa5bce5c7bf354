//! Bitmap pixel buffers and the interleaved RLE bitmap codec.
//!
//! Pixels are stored top-down, tightly packed, little-endian, at the
//! session's bytes-per-pixel. On the wire bitmaps travel bottom-up;
//! [`decompress`] and [`Bitmap::from_bottom_up`] both undo that.

use crate::error::{RdcError, Result};

// ── Bitmap ───────────────────────────────────────────────────────

/// A decoded bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub width: u16,
    pub height: u16,
    /// Bytes per pixel: 1, 2, 3 or 4.
    pub bpp: u8,
    /// `width * height * bpp` bytes, first row on top.
    pub data: Vec<u8>,
}

impl Bitmap {
    /// Wrap top-down pixel data, checking its size.
    pub fn new(width: u16, height: u16, bpp: u8, data: Vec<u8>) -> Result<Self> {
        if data.len() < Self::byte_len(width, height, bpp) {
            return Err(RdcError::malformed("bitmap data shorter than its size"));
        }
        let mut data = data;
        data.truncate(Self::byte_len(width, height, bpp));
        Ok(Self {
            width,
            height,
            bpp,
            data,
        })
    }

    /// Wrap bottom-up wire data, flipping it to top-down.
    pub fn from_bottom_up(width: u16, height: u16, bpp: u8, data: &[u8]) -> Result<Self> {
        let stride = usize::from(width) * usize::from(bpp);
        let needed = stride * usize::from(height);
        if data.len() < needed {
            return Err(RdcError::malformed("bitmap data shorter than its size"));
        }
        let mut out = Vec::with_capacity(needed);
        for row in data[..needed].chunks_exact(stride.max(1)).rev() {
            out.extend_from_slice(row);
        }
        out.truncate(needed);
        Ok(Self {
            width,
            height,
            bpp,
            data: out,
        })
    }

    /// Decode an RLE-compressed wire bitmap.
    pub fn from_compressed(width: u16, height: u16, bpp: u8, input: &[u8]) -> Result<Self> {
        let data = decompress(width, height, bpp, input)?;
        Ok(Self {
            width,
            height,
            bpp,
            data,
        })
    }

    pub fn byte_len(width: u16, height: u16, bpp: u8) -> usize {
        usize::from(width) * usize::from(height) * usize::from(bpp)
    }

    /// One row of pixel bytes.
    pub fn row(&self, y: u16) -> &[u8] {
        let stride = usize::from(self.width) * usize::from(self.bpp);
        let start = usize::from(y) * stride;
        &self.data[start..start + stride]
    }

    /// Pixel value at `(x, y)`, or `None` outside the bitmap.
    pub fn pixel(&self, x: u16, y: u16) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = usize::from(self.bpp);
        let offset = (usize::from(y) * usize::from(self.width) + usize::from(x)) * bpp;
        Some(read_pixel(&self.data[offset..offset + bpp]))
    }
}

// ── Glyph / Cursor / Palette ─────────────────────────────────────

/// A monochrome glyph: rows of `(width + 7) / 8` bytes, MSB first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Glyph {
    /// Horizontal offset of the glyph origin.
    pub offset: i16,
    pub baseline: i16,
    pub width: u16,
    pub height: u16,
    pub data: Vec<u8>,
}

impl Glyph {
    pub fn stride(width: u16) -> usize {
        usize::from(width).div_ceil(8)
    }

    /// Whether the glyph pixel at `(x, y)` is set.
    pub fn is_set(&self, x: u16, y: u16) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        let byte = usize::from(y) * Self::stride(self.width) + usize::from(x / 8);
        self.data
            .get(byte)
            .is_some_and(|b| b & (0x80 >> (x % 8)) != 0)
    }
}

/// A pointer shape with its hotspot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub hotspot_x: u16,
    pub hotspot_y: u16,
    pub width: u16,
    pub height: u16,
    /// 1 bpp AND mask, bottom-up as sent.
    pub and_mask: Vec<u8>,
    /// XOR mask at the pointer's colour depth, bottom-up as sent.
    pub xor_mask: Vec<u8>,
    /// Bits per pixel of `xor_mask`.
    pub xor_bpp: u16,
}

/// One palette entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Colour {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

/// An 8-bit colour map.
pub type Palette = Vec<Colour>;

fn read_pixel(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .rev()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
}

// ── RLE decoder ──────────────────────────────────────────────────

struct Output {
    data: Vec<u8>,
    width: usize,
    bpp: usize,
}

impl Output {
    fn get(&self, row: usize, x: usize) -> u32 {
        let at = (row * self.width + x) * self.bpp;
        read_pixel(&self.data[at..at + self.bpp])
    }

    fn set(&mut self, row: usize, x: usize, v: u32) {
        let at = (row * self.width + x) * self.bpp;
        for i in 0..self.bpp {
            self.data[at + i] = (v >> (8 * i)) as u8;
        }
    }
}

struct Input<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Input<'_> {
    fn u8(&mut self) -> Result<u8> {
        let v = *self
            .data
            .get(self.pos)
            .ok_or(RdcError::malformed("truncated compressed bitmap"))?;
        self.pos += 1;
        Ok(v)
    }

    fn pixel(&mut self, bpp: usize) -> Result<u32> {
        let mut v = 0u32;
        for i in 0..bpp {
            v |= u32::from(self.u8()?) << (8 * i);
        }
        Ok(v)
    }

    fn done(&self) -> bool {
        self.pos >= self.data.len()
    }
}

/// Decompress interleaved RLE `input` into top-down pixels.
pub fn decompress(width: u16, height: u16, bpp: u8, input: &[u8]) -> Result<Vec<u8>> {
    if !(1..=4).contains(&bpp) {
        return Err(RdcError::UnknownVariant {
            type_name: "bitmap bytes per pixel",
            value: u32::from(bpp),
        });
    }
    let width = usize::from(width);
    let bpp = usize::from(bpp);
    let mut remaining_rows = usize::from(height);
    let white = if bpp == 4 { 0x00ff_ffff } else { (1u32 << (8 * bpp as u32)) - 1 };

    let mut out = Output {
        data: vec![0; width * remaining_rows * bpp],
        width,
        bpp,
    };
    let mut input = Input { data: input, pos: 0 };

    let mut prev: Option<usize> = None;
    let mut line = 0usize;
    let mut has_line = false;
    let mut x = width;
    let mut last_opcode: i32 = -1;
    let mut insert_mix = false;
    let mut bicolour = false;
    let mut colour1 = 0u32;
    let mut colour2 = 0u32;
    let mut mix = white;
    let mut mask = 0u8;

    while !input.done() {
        let mut fom_mask = 0u8;
        let code = input.u8()?;
        let mut opcode = i32::from(code >> 4);
        let mut count: usize;
        let offset: usize;

        match opcode {
            0xc..=0xe => {
                opcode -= 6;
                count = usize::from(code & 0xf);
                offset = 16;
            }
            0xf => {
                opcode = i32::from(code & 0xf);
                if opcode < 9 {
                    count = usize::from(input.u8()?);
                    count |= usize::from(input.u8()?) << 8;
                } else {
                    count = if opcode < 0xb { 8 } else { 1 };
                }
                offset = 0;
            }
            _ => {
                opcode >>= 1;
                count = usize::from(code & 0x1f);
                offset = 32;
            }
        }

        if offset != 0 {
            let fill_or_mix = opcode == 2 || opcode == 7;
            if count == 0 {
                count = if fill_or_mix {
                    usize::from(input.u8()?) + 1
                } else {
                    usize::from(input.u8()?) + offset
                };
            } else if fill_or_mix {
                count <<= 3;
            }
        }

        match opcode {
            0 => {
                if last_opcode == opcode && !(x == width && prev.is_none()) {
                    insert_mix = true;
                }
            }
            8 => {
                colour1 = input.pixel(bpp)?;
                colour2 = input.pixel(bpp)?;
            }
            3 => colour2 = input.pixel(bpp)?,
            6 | 7 => {
                mix = input.pixel(bpp)?;
                opcode -= 5;
            }
            9 => {
                opcode = 2;
                fom_mask = 3;
            }
            0xa => {
                opcode = 2;
                fom_mask = 5;
            }
            _ => {}
        }
        last_opcode = opcode;
        let mut mix_mask = 0u8;

        while count > 0 {
            if x >= width {
                if remaining_rows == 0 {
                    return Err(RdcError::malformed("compressed bitmap overruns its height"));
                }
                x = 0;
                remaining_rows -= 1;
                prev = has_line.then_some(line);
                line = remaining_rows;
                has_line = true;
            }

            match opcode {
                0 => {
                    if insert_mix {
                        let v = match prev {
                            Some(p) => out.get(p, x) ^ mix,
                            None => mix,
                        };
                        out.set(line, x, v);
                        insert_mix = false;
                        count -= 1;
                        x += 1;
                    }
                    while count > 0 && x < width {
                        let v = prev.map_or(0, |p| out.get(p, x));
                        out.set(line, x, v);
                        count -= 1;
                        x += 1;
                    }
                }
                1 => {
                    while count > 0 && x < width {
                        let v = prev.map_or(mix, |p| out.get(p, x) ^ mix);
                        out.set(line, x, v);
                        count -= 1;
                        x += 1;
                    }
                }
                2 => {
                    while count > 0 && x < width {
                        mix_mask <<= 1;
                        if mix_mask == 0 {
                            mask = if fom_mask != 0 { fom_mask } else { input.u8()? };
                            mix_mask = 1;
                        }
                        let base = prev.map_or(0, |p| out.get(p, x));
                        let v = if mask & mix_mask != 0 { base ^ mix } else { base };
                        out.set(line, x, v);
                        count -= 1;
                        x += 1;
                    }
                }
                3 => {
                    while count > 0 && x < width {
                        out.set(line, x, colour2);
                        count -= 1;
                        x += 1;
                    }
                }
                4 => {
                    while count > 0 && x < width {
                        let v = input.pixel(bpp)?;
                        out.set(line, x, v);
                        count -= 1;
                        x += 1;
                    }
                }
                8 => {
                    while count > 0 && x < width {
                        if bicolour {
                            out.set(line, x, colour2);
                            bicolour = false;
                        } else {
                            out.set(line, x, colour1);
                            bicolour = true;
                            count += 1;
                        }
                        count -= 1;
                        x += 1;
                    }
                }
                0xd => {
                    while count > 0 && x < width {
                        out.set(line, x, white);
                        count -= 1;
                        x += 1;
                    }
                }
                0xe => {
                    while count > 0 && x < width {
                        out.set(line, x, 0);
                        count -= 1;
                        x += 1;
                    }
                }
                other => {
                    return Err(RdcError::UnknownVariant {
                        type_name: "bitmap opcode",
                        value: other as u32,
                    });
                }
            }
        }
    }

    Ok(out.data)
}

// ── Tests ────────────────────────────────────────────────────────
