//! Cursor-addressed byte buffers used by every protocol layer.
//!
//! Outbound data is built in a [`Stream`]: each layer's `init` reserves
//! room for its own header and records where it lives, the payload is
//! appended by the caller, then each layer's `send` fills its header in
//! place on the way out. A stream has exactly one owner at a time and is
//! handed from layer to layer by value.
//!
//! Inbound data is parsed with a [`ReadStream`], a borrowed cursor whose
//! every read is bounds-checked and fails with [`RdcError::Malformed`].

use bytes::{Buf, BufMut, Bytes};

use crate::error::{RdcError, Result};

// ── Layer ────────────────────────────────────────────────────────

/// Protocol layers that reserve header space in an outbound [`Stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Iso = 0,
    Mcs = 1,
    Sec = 2,
    Rdp = 3,
    Channel = 4,
}

const LAYER_COUNT: usize = 5;

// ── Stream ───────────────────────────────────────────────────────

/// A growable outbound buffer with per-layer header markers.
#[derive(Debug, Default)]
pub struct Stream {
    buf: Vec<u8>,
    headers: [Option<usize>; LAYER_COUNT],
}

impl Stream {
    /// Create an empty stream with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            headers: [None; LAYER_COUNT],
        }
    }

    /// Reserve `len` zeroed header bytes for `layer` at the current end.
    pub fn reserve_header(&mut self, layer: Layer, len: usize) {
        self.headers[layer as usize] = Some(self.buf.len());
        self.buf.put_bytes(0, len);
    }

    /// Offset of the header reserved by `layer`, if any.
    pub fn header_offset(&self, layer: Layer) -> Option<usize> {
        self.headers[layer as usize]
    }

    /// A writer over the reserved header of `layer`.
    ///
    /// Writes past the end of the buffer panic, so callers must only
    /// write as many bytes as they reserved.
    pub fn header_mut(&mut self, layer: Layer) -> Result<&mut [u8]> {
        let start = self.headers[layer as usize]
            .ok_or(RdcError::InvalidState("layer header was not reserved"))?;
        Ok(&mut self.buf[start..])
    }

    /// Total length of the stream.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes written after the header reserved by `layer` (header
    /// excluded).
    pub fn payload_after(&self, layer: Layer, header_len: usize) -> usize {
        match self.headers[layer as usize] {
            Some(start) => self.buf.len().saturating_sub(start + header_len),
            None => self.buf.len(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Freeze the stream for transmission.
    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buf)
    }

    // ── Writers ──────────────────────────────────────────────────

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16_le(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn put_u16_be(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_u32_le(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_u32_be(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_slice(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// Append `n` copies of `v`.
    pub fn put_fill(&mut self, v: u8, n: usize) {
        self.buf.put_bytes(v, n);
    }

    /// Append `s` as UTF-16LE followed by a two-byte terminator.
    pub fn put_unistr(&mut self, s: &str) {
        for unit in s.encode_utf16() {
            self.buf.put_u16_le(unit);
        }
        self.buf.put_u16_le(0);
    }

    /// Append `s` as UTF-16LE padded (or truncated) to exactly `len`
    /// bytes.
    pub fn put_unistr_fixed(&mut self, s: &str, len: usize) {
        let mut written = 0;
        for unit in s.encode_utf16() {
            if written + 2 > len.saturating_sub(2) {
                break;
            }
            self.buf.put_u16_le(unit);
            written += 2;
        }
        self.buf.put_bytes(0, len - written);
    }
}

/// Byte length of `s` when encoded as UTF-16LE, without terminator.
pub fn unistr_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

// ── ReadStream ───────────────────────────────────────────────────

/// Bounds-checked reader over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct ReadStream<'a> {
    data: &'a [u8],
    start_len: usize,
}

impl<'a> ReadStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            start_len: data.len(),
        }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.start_len - self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The unread tail, without consuming it.
    pub fn rest(&self) -> &'a [u8] {
        self.data
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.data
            .try_get_u8()
            .map_err(|_| RdcError::malformed("truncated u8"))
    }

    pub fn i8(&mut self) -> Result<i8> {
        self.data
            .try_get_i8()
            .map_err(|_| RdcError::malformed("truncated i8"))
    }

    pub fn u16_le(&mut self) -> Result<u16> {
        self.data
            .try_get_u16_le()
            .map_err(|_| RdcError::malformed("truncated u16"))
    }

    pub fn i16_le(&mut self) -> Result<i16> {
        self.data
            .try_get_i16_le()
            .map_err(|_| RdcError::malformed("truncated i16"))
    }

    pub fn u16_be(&mut self) -> Result<u16> {
        self.data
            .try_get_u16()
            .map_err(|_| RdcError::malformed("truncated u16"))
    }

    pub fn u32_le(&mut self) -> Result<u32> {
        self.data
            .try_get_u32_le()
            .map_err(|_| RdcError::malformed("truncated u32"))
    }

    pub fn u32_be(&mut self) -> Result<u32> {
        self.data
            .try_get_u32()
            .map_err(|_| RdcError::malformed("truncated u32"))
    }

    /// Borrow the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(RdcError::malformed("truncated field"));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    /// Read exactly `N` bytes into an array.
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    /// Split off a sub-reader over the next `n` bytes.
    pub fn sub(&mut self, n: usize) -> Result<ReadStream<'a>> {
        self.take(n).map(ReadStream::new)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_filled_in_place() {
        let mut s = Stream::with_capacity(32);
        s.reserve_header(Layer::Iso, 4);
        s.reserve_header(Layer::Mcs, 2);
        s.put_slice(b"abc");

        assert_eq!(s.payload_after(Layer::Mcs, 2), 3);
        assert_eq!(s.payload_after(Layer::Iso, 4), 5);

        let mut hdr = s.header_mut(Layer::Mcs).unwrap();
        hdr.put_u16(0xbeef);
        let mut hdr = s.header_mut(Layer::Iso).unwrap();
        hdr.put_u32(0x0300_0009);

        assert_eq!(s.as_slice(), &[3, 0, 0, 9, 0xbe, 0xef, b'a', b'b', b'c']);
    }

    #[test]
    fn unreserved_header_is_an_error() {
        let mut s = Stream::default();
        assert!(s.header_mut(Layer::Sec).is_err());
    }

    #[test]
    fn fixed_unistr_is_padded_and_terminated() {
        let mut s = Stream::default();
        s.put_unistr_fixed("ab", 8);
        assert_eq!(s.as_slice(), &[b'a', 0, b'b', 0, 0, 0, 0, 0]);

        let mut s = Stream::default();
        s.put_unistr_fixed("abcdefgh", 8);
        assert_eq!(s.len(), 8);
        assert_eq!(&s.as_slice()[6..], &[0, 0]);
    }

    #[test]
    fn reads_are_bounds_checked() {
        let data = [1u8, 2, 3];
        let mut r = ReadStream::new(&data);
        assert_eq!(r.u16_le().unwrap(), 0x0201);
        assert!(r.u16_le().is_err());
        assert_eq!(r.u8().unwrap(), 3);
        assert!(r.u8().is_err());
        assert!(r.take(1).is_err());
    }

    #[test]
    fn sub_reader_consumes_parent() {
        let data = [0xaa, 0xbb, 0xcc, 0xdd];
        let mut r = ReadStream::new(&data);
        let mut sub = r.sub(2).unwrap();
        assert_eq!(sub.u16_be().unwrap(), 0xaabb);
        assert_eq!(r.position(), 2);
        assert_eq!(r.rest(), &[0xcc, 0xdd]);
    }
}
