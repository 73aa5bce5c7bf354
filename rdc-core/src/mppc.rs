//! MPPC bulk decompression.
//!
//! One history buffer lives for the whole connection. Each compressed
//! PDU is a bit stream of literals and (offset, length) back-references
//! into that history; decoded bytes are written into the history at the
//! current offset and read back in place by the caller.
//!
//! Two dictionary sizes exist: 8 KiB (RDP 4) and 64 KiB (RDP 5, flagged
//! `BIG`). Writes wrap modulo the dictionary size, so a run that
//! crosses the end continues at offset 0 and leaves everything it did
//! not overwrite intact.

use std::borrow::Cow;

use crate::error::{RdcError, Result};
use crate::flags::CompressionFlags;

pub const SMALL_DICT_SIZE: usize = 8192;
pub const BIG_DICT_SIZE: usize = 65536;

/// Compression type nibble of the flags byte.
pub const TYPE_MASK: u8 = 0x0f;

/// Where the last expansion put its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expanded {
    /// Payload was not compressed; use the input as is.
    Raw,
    /// `len` bytes starting at `offset` in the history, modulo the
    /// dictionary size.
    Run { offset: usize, len: usize },
}

// ── BitReader ────────────────────────────────────────────────────

struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() * 8 - self.bit
    }

    fn bit(&mut self) -> Result<u32> {
        let byte = *self
            .data
            .get(self.bit / 8)
            .ok_or(RdcError::malformed("truncated compressed data"))?;
        let v = (byte >> (7 - self.bit % 8)) & 1;
        self.bit += 1;
        Ok(u32::from(v))
    }

    fn bits(&mut self, n: usize) -> Result<u32> {
        if self.remaining() < n {
            return Err(RdcError::malformed("truncated compressed data"));
        }
        let mut v = 0;
        for _ in 0..n {
            v = (v << 1) | self.bit()?;
        }
        Ok(v)
    }

    /// True when only zero padding (less than a byte) is left.
    fn at_padding(&self) -> bool {
        let rem = self.remaining();
        if rem == 0 {
            return true;
        }
        if rem >= 8 {
            return false;
        }
        let last = self.data[self.data.len() - 1];
        last & ((1u8 << rem) - 1) == 0
    }
}

// ── Mppc ─────────────────────────────────────────────────────────

/// Decompressor state for one connection.
pub struct Mppc {
    history: Vec<u8>,
    offset: usize,
    dict_size: usize,
}

impl std::fmt::Debug for Mppc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mppc")
            .field("offset", &self.offset)
            .field("dict_size", &self.dict_size)
            .finish()
    }
}

impl Default for Mppc {
    fn default() -> Self {
        Self::new()
    }
}

impl Mppc {
    pub fn new() -> Self {
        Self {
            history: vec![0; BIG_DICT_SIZE],
            offset: 0,
            dict_size: BIG_DICT_SIZE,
        }
    }

    /// Current write offset into the history.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The active dictionary.
    pub fn history(&self) -> &[u8] {
        &self.history[..self.dict_size]
    }

    /// Decode `data` into the history.
    ///
    /// The returned run stays valid until the next call.
    pub fn expand(&mut self, data: &[u8], flags: CompressionFlags) -> Result<Expanded> {
        if !flags.contains(CompressionFlags::COMPRESSED) {
            return Ok(Expanded::Raw);
        }

        let big = flags.contains(CompressionFlags::BIG);
        let dict_size = if big { BIG_DICT_SIZE } else { SMALL_DICT_SIZE };
        if dict_size != self.dict_size {
            self.dict_size = dict_size;
            self.offset %= dict_size;
        }

        if flags.contains(CompressionFlags::RESET) {
            self.offset = 0;
        }
        if flags.contains(CompressionFlags::FLUSH) {
            self.history.fill(0);
            self.offset = 0;
        }

        let start = self.offset;
        let mask = dict_size - 1;
        let mut written = 0usize;
        let mut r = BitReader::new(data);

        while !r.at_padding() {
            // literal 0xxxxxxx or 10xxxxxxx
            if r.bit()? == 0 {
                let lit = r.bits(7)? as u8;
                self.push(start + written, lit, dict_size, &mut written)?;
                continue;
            }
            if r.bit()? == 0 {
                let lit = r.bits(7)? as u8 | 0x80;
                self.push(start + written, lit, dict_size, &mut written)?;
                continue;
            }

            let match_off = if big {
                Self::big_offset(&mut r)?
            } else {
                Self::small_offset(&mut r)?
            };
            let match_len = Self::length(&mut r, big)?;

            if match_off == 0 || match_off >= dict_size {
                return Err(RdcError::malformed("compressed back-reference offset"));
            }
            if written + match_len > dict_size {
                return Err(RdcError::malformed("compressed run exceeds dictionary"));
            }

            let dest = start + written;
            let mut src = dest.wrapping_sub(match_off) & mask;
            for i in 0..match_len {
                self.history[(dest + i) & mask] = self.history[src];
                src = (src + 1) & mask;
            }
            written += match_len;
        }

        self.offset = (start + written) % dict_size;
        Ok(Expanded::Run {
            offset: start,
            len: written,
        })
    }

    /// The bytes of `run`, borrowed when contiguous.
    pub fn output(&self, run: Expanded) -> Cow<'_, [u8]> {
        match run {
            Expanded::Raw => Cow::Borrowed(&[]),
            Expanded::Run { offset, len } => {
                let end = offset + len;
                if end <= self.dict_size {
                    Cow::Borrowed(&self.history[offset..end])
                } else {
                    let mut v = Vec::with_capacity(len);
                    v.extend_from_slice(&self.history[offset..self.dict_size]);
                    v.extend_from_slice(&self.history[..end - self.dict_size]);
                    Cow::Owned(v)
                }
            }
        }
    }

    fn push(&mut self, pos: usize, byte: u8, dict_size: usize, written: &mut usize) -> Result<()> {
        if *written >= dict_size {
            return Err(RdcError::malformed("compressed run exceeds dictionary"));
        }
        self.history[pos % dict_size] = byte;
        *written += 1;
        Ok(())
    }

    /// 64 KiB offsets: 11111+6, 11110+8, 1110+11, 110+16 bits. The
    /// leading `11` has already been consumed.
    fn big_offset(r: &mut BitReader<'_>) -> Result<usize> {
        if r.bit()? == 0 {
            return Ok(r.bits(16)? as usize + 2368);
        }
        if r.bit()? == 0 {
            return Ok(r.bits(11)? as usize + 320);
        }
        if r.bit()? == 0 {
            return Ok(r.bits(8)? as usize + 64);
        }
        Ok(r.bits(6)? as usize)
    }

    /// 8 KiB offsets: 1111+6, 1110+8, 110+13 bits.
    fn small_offset(r: &mut BitReader<'_>) -> Result<usize> {
        if r.bit()? == 0 {
            return Ok(r.bits(13)? as usize + 320);
        }
        if r.bit()? == 0 {
            return Ok(r.bits(8)? as usize + 64);
        }
        Ok(r.bits(6)? as usize)
    }

    /// `0` is 3; otherwise n ones, a zero, then n+1 bits added to
    /// 2^(n+1).
    fn length(r: &mut BitReader<'_>, big: bool) -> Result<usize> {
        let max_ones = if big { 15 } else { 12 };
        let mut ones = 0;
        while r.bit()? == 1 {
            ones += 1;
            if ones >= max_ones {
                return Err(RdcError::malformed("compressed match length"));
            }
        }
        if ones == 0 {
            return Ok(3);
        }
        let n = ones + 1;
        Ok((1usize << n) | r.bits(n)? as usize)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn compressed() -> CompressionFlags {
        CompressionFlags::COMPRESSED
    }

    /// MSB-first bit packer for building test inputs.
    struct Bits {
        out: Vec<u8>,
        n: usize,
    }

    impl Bits {
        fn new() -> Self {
            Self { out: Vec::new(), n: 0 }
        }

        fn put(&mut self, value: u32, width: usize) -> &mut Self {
            for i in (0..width).rev() {
                if self.n % 8 == 0 {
                    self.out.push(0);
                }
                let bit = ((value >> i) & 1) as u8;
                let last = self.out.len() - 1;
                self.out[last] |= bit << (7 - self.n % 8);
                self.n += 1;
            }
            self
        }

        fn literal(&mut self, b: u8) -> &mut Self {
            if b < 0x80 {
                self.put(u32::from(b), 8)
            } else {
                self.put(0b10, 2).put(u32::from(b & 0x7f), 7)
            }
        }
    }

    #[test]
    fn uncompressed_payload_is_raw() {
        let mut m = Mppc::new();
        assert_eq!(m.expand(b"abc", CompressionFlags::empty()).unwrap(), Expanded::Raw);
        assert_eq!(m.offset(), 0);
    }

    #[test]
    fn empty_input_is_idempotent() {
        let mut m = Mppc::new();
        let mut b = Bits::new();
        b.literal(b'q').literal(0xf3);
        m.expand(&b.out, compressed()).unwrap();

        let before = m.history().to_vec();
        let offset = m.offset();
        let run = m.expand(&[], compressed()).unwrap();
        assert_eq!(run, Expanded::Run { offset, len: 0 });
        assert_eq!(m.offset(), offset);
        assert_eq!(m.history(), &before[..]);
    }

    #[test]
    fn literals_and_back_reference() {
        let mut m = Mppc::new();
        let mut b = Bits::new();
        b.literal(b'a').literal(b'b').literal(0xc3);
        // offset 3 (1111 + 6 bits), length 3 (0)
        b.put(0b1111, 4).put(3, 6).put(0, 1);
        let run = m.expand(&b.out, compressed()).unwrap();
        assert_eq!(&m.output(run)[..], &[b'a', b'b', 0xc3, b'a', b'b', 0xc3]);
    }

    #[test]
    fn overlapping_copy_repeats_pattern() {
        let mut m = Mppc::new();
        let mut b = Bits::new();
        b.literal(b'x');
        // offset 1, length 4..7 form: 10 + 2 bits -> 4 + 2 = 6
        b.put(0b1111, 4).put(1, 6).put(0b10, 2).put(0b10, 2);
        let run = m.expand(&b.out, compressed()).unwrap();
        assert_eq!(&m.output(run)[..], b"xxxxxxx");
    }

    #[test]
    fn big_dictionary_long_offset() {
        let mut m = Mppc::new();
        let mut b = Bits::new();
        for i in 0..400u32 {
            b.literal((i % 0x70) as u8);
        }
        // offset 400: 1110 + 11 bits (400 - 320), length 3
        b.put(0b1110, 4).put(80, 11).put(0, 1);
        let flags = compressed() | CompressionFlags::BIG;
        let run = m.expand(&b.out, flags).unwrap();
        let out = m.output(run);
        assert_eq!(out.len(), 403);
        assert_eq!(&out[400..], &out[..3]);
    }

    #[test]
    fn wrap_at_dictionary_size_preserves_unconsumed_bytes() {
        let mut m = Mppc::new();
        let mut b = Bits::new();
        for i in 0..SMALL_DICT_SIZE - 2 {
            b.literal((i % 100) as u8);
        }
        m.expand(&b.out, compressed()).unwrap();
        assert_eq!(m.offset(), SMALL_DICT_SIZE - 2);
        let before = m.history().to_vec();

        let mut b = Bits::new();
        for c in b"wxyz" {
            b.literal(*c);
        }
        let run = m.expand(&b.out, compressed()).unwrap();
        assert_eq!(
            run,
            Expanded::Run {
                offset: SMALL_DICT_SIZE - 2,
                len: 4
            }
        );
        assert_eq!(&m.output(run)[..], b"wxyz");
        assert_eq!(m.offset(), 2);
        assert_eq!(&m.history()[..2], b"yz");
        assert_eq!(&m.history()[2..SMALL_DICT_SIZE - 2], &before[2..SMALL_DICT_SIZE - 2]);
    }

    #[test]
    fn flush_clears_history() {
        let mut m = Mppc::new();
        let mut b = Bits::new();
        b.literal(b'z');
        m.expand(&b.out, compressed()).unwrap();

        let run = m
            .expand(&[], compressed() | CompressionFlags::FLUSH)
            .unwrap();
        assert_eq!(run, Expanded::Run { offset: 0, len: 0 });
        assert!(m.history().iter().all(|&b| b == 0));
    }

    #[test]
    fn malformed_tokens_are_errors() {
        let mut m = Mppc::new();

        // zero offset
        let mut b = Bits::new();
        b.literal(b'a').put(0b1111, 4).put(0, 6).put(0, 1);
        assert!(m.expand(&b.out, compressed()).is_err());

        // truncated offset
        assert!(m.expand(&[0xf0], compressed()).is_err());

        // trailing non-zero garbage shorter than a literal
        let mut b = Bits::new();
        b.literal(0xc3).put(1, 1);
        assert!(m.expand(&b.out, compressed()).is_err());
    }
}
