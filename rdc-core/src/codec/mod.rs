//! Frame codec for the RDP byte stream.
//!
//! Two framings share one TCP stream: TPKT (version 3, big-endian
//! 16-bit length including the 4-byte header) carrying X.224 TPDUs, and
//! fast-path frames whose first byte has its low two bits clear of 3
//! and whose length is a 1- or 2-byte PER length.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::RdcError;

/// TPKT protocol version.
pub const TPKT_VERSION: u8 = 3;

/// TPKT header length.
pub const TPKT_HEADER_LEN: usize = 4;

/// Largest frame accepted from the peer.
pub const MAX_FRAME_SIZE: usize = 0x8000;

/// Fast-path header bit: payload is encrypted and signed.
pub const FASTPATH_ENCRYPTED: u8 = 0x80;

// ── Frame ────────────────────────────────────────────────────────

/// A single frame read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// TPKT payload, starting at the X.224 header.
    X224(BytesMut),
    /// Fast-path payload with the first header byte.
    FastPath { header: u8, payload: BytesMut },
}

impl Frame {
    pub fn is_fast_path(&self) -> bool {
        matches!(self, Self::FastPath { .. })
    }
}

// ── TpktCodec ────────────────────────────────────────────────────

/// Splits the inbound byte stream into [`Frame`]s and passes outbound,
/// already-framed buffers through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct TpktCodec;

impl Decoder for TpktCodec {
    type Item = Frame;
    type Error = RdcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first = src[0];
        let (header_len, frame_len) = if first == TPKT_VERSION {
            if src.len() < TPKT_HEADER_LEN {
                return Ok(None);
            }
            (TPKT_HEADER_LEN, usize::from(u16::from_be_bytes([src[2], src[3]])))
        } else if first & 3 != 3 {
            let b1 = src[1];
            if b1 & 0x80 != 0 {
                if src.len() < 3 {
                    return Ok(None);
                }
                (3, (usize::from(b1 & 0x7f) << 8) | usize::from(src[2]))
            } else {
                (2, usize::from(b1))
            }
        } else {
            return Err(RdcError::UnknownVariant {
                type_name: "frame header",
                value: u32::from(first),
            });
        };

        if frame_len < header_len {
            return Err(RdcError::malformed("frame shorter than its header"));
        }
        if frame_len > MAX_FRAME_SIZE {
            return Err(RdcError::malformed("frame exceeds maximum size"));
        }
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        frame.advance(header_len);

        if first == TPKT_VERSION {
            Ok(Some(Frame::X224(frame)))
        } else {
            Ok(Some(Frame::FastPath {
                header: first,
                payload: frame,
            }))
        }
    }
}

impl Encoder<Bytes> for TpktCodec {
    type Error = RdcError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(RdcError::ProtocolViolation(format!(
                "outbound frame of {} bytes exceeds maximum",
                item.len()
            )));
        }
        dst.extend_from_slice(&item);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
