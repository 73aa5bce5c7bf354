//! T.125 MCS: BER connect PDUs and PER domain PDUs.

use bytes::{BufMut, Bytes};

use super::iso;
use crate::error::{RdcError, Result};
use crate::stream::{Layer, ReadStream, Stream};

/// Static channel every client joins after its user channel.
pub const GLOBAL_CHANNEL: u16 = 1003;
/// User ids are offsets from this base.
pub const USER_CHANNEL_BASE: u16 = 1001;

/// Send-data-request header length.
pub const SDRQ_HEADER_LEN: usize = 8;

const CONNECT_INITIAL: u16 = 0x7f65;
const CONNECT_RESPONSE: u16 = 0x7f66;

const TAG_BOOLEAN: u16 = 1;
const TAG_INTEGER: u16 = 2;
const TAG_OCTET_STRING: u16 = 4;
const TAG_RESULT: u16 = 10;
const TAG_DOMAIN_PARAMS: u16 = 0x30;

const EDRQ: u8 = 1;
const DPUM: u8 = 8;
const AURQ: u8 = 10;
const AUCF: u8 = 11;
const CJRQ: u8 = 14;
const CJCF: u8 = 15;
const SDRQ: u8 = 25;
const SDIN: u8 = 26;

// ── BER ──────────────────────────────────────────────────────────

fn ber_header(s: &mut Stream, tag: u16, len: usize) {
    if tag > 0xff {
        s.put_u16_be(tag);
    } else {
        s.put_u8(tag as u8);
    }
    if len >= 0x80 {
        s.put_u8(0x82);
        s.put_u16_be(len as u16);
    } else {
        s.put_u8(len as u8);
    }
}

fn ber_length_size(len: usize) -> usize {
    if len >= 0x80 { 3 } else { 1 }
}

fn ber_integer(s: &mut Stream, value: u16) {
    ber_header(s, TAG_INTEGER, 2);
    s.put_u16_be(value);
}

fn domain_params(s: &mut Stream, channels: u16, users: u16, tokens: u16, pdu_size: u16) {
    ber_header(s, TAG_DOMAIN_PARAMS, 32);
    ber_integer(s, channels);
    ber_integer(s, users);
    ber_integer(s, tokens);
    ber_integer(s, 1); // priorities
    ber_integer(s, 0); // min throughput
    ber_integer(s, 1); // max height
    ber_integer(s, pdu_size);
    ber_integer(s, 2); // protocol version
}

/// Read a BER header with the expected tag, returning the content
/// length.
pub fn ber_parse_header(s: &mut ReadStream<'_>, tag: u16) -> Result<usize> {
    let got = if tag > 0xff {
        s.u16_be()?
    } else {
        u16::from(s.u8()?)
    };
    if got != tag {
        return Err(RdcError::UnknownVariant {
            type_name: "ber tag",
            value: u32::from(got),
        });
    }
    let first = s.u8()?;
    if first & 0x80 == 0 {
        return Ok(usize::from(first));
    }
    let mut len = 0usize;
    for _ in 0..(first & 0x7f) {
        len = (len << 8) | usize::from(s.u8()?);
    }
    Ok(len)
}

// ── Connect ──────────────────────────────────────────────────────

/// Connect-Initial wrapping the GCC conference request `user_data`.
pub fn connect_initial(user_data: &[u8]) -> Result<Bytes> {
    let length = 9 + 3 * 34 + 1 + ber_length_size(user_data.len()) + user_data.len();
    let mut s = Stream::with_capacity(length + 12);
    iso::init(&mut s);
    ber_header(&mut s, CONNECT_INITIAL, length);
    ber_header(&mut s, TAG_OCTET_STRING, 1); // calling domain
    s.put_u8(1);
    ber_header(&mut s, TAG_OCTET_STRING, 1); // called domain
    s.put_u8(1);
    ber_header(&mut s, TAG_BOOLEAN, 1); // upward
    s.put_u8(0xff);
    domain_params(&mut s, 34, 2, 0, 0xffff);
    domain_params(&mut s, 1, 1, 1, 0x420);
    domain_params(&mut s, 0xffff, 0xfc17, 0xffff, 0xffff);
    ber_header(&mut s, TAG_OCTET_STRING, user_data.len());
    s.put_slice(user_data);
    iso::finish(&mut s)?;
    Ok(s.into_bytes())
}

/// Check a Connect-Response and return its GCC user data.
pub fn parse_connect_response(data: &[u8]) -> Result<&[u8]> {
    let mut s = ReadStream::new(data);
    ber_parse_header(&mut s, CONNECT_RESPONSE)?;
    ber_parse_header(&mut s, TAG_RESULT)?;
    let result = s.u8()?;
    if result != 0 {
        return Err(RdcError::Rejected(format!("mcs connect result {result}")));
    }
    let len = ber_parse_header(&mut s, TAG_INTEGER)?;
    s.skip(len)?; // connect id
    let len = ber_parse_header(&mut s, TAG_DOMAIN_PARAMS)?;
    s.skip(len)?;
    let len = ber_parse_header(&mut s, TAG_OCTET_STRING)?;
    s.take(len)
}

// ── Domain PDUs ──────────────────────────────────────────────────

fn domain_pdu(build: impl FnOnce(&mut Stream)) -> Result<Bytes> {
    let mut s = Stream::with_capacity(16);
    iso::init(&mut s);
    build(&mut s);
    iso::finish(&mut s)?;
    Ok(s.into_bytes())
}

pub fn erect_domain_request() -> Result<Bytes> {
    domain_pdu(|s| {
        s.put_u8(EDRQ << 2);
        s.put_u16_be(1); // height
        s.put_u16_be(1); // interval
    })
}

pub fn attach_user_request() -> Result<Bytes> {
    domain_pdu(|s| s.put_u8(AURQ << 2))
}

pub fn channel_join_request(user_id: u16, channel: u16) -> Result<Bytes> {
    domain_pdu(|s| {
        s.put_u8(CJRQ << 2);
        s.put_u16_be(user_id);
        s.put_u16_be(channel);
    })
}

pub fn disconnect_provider_ultimatum() -> Result<Bytes> {
    domain_pdu(|s| {
        s.put_u8(DPUM << 2);
        s.put_u8(0x80); // reason: user requested
    })
}

/// The user id from an Attach-User-Confirm.
pub fn parse_attach_user_confirm(data: &[u8]) -> Result<u16> {
    let mut s = ReadStream::new(data);
    let opcode = s.u8()?;
    if opcode >> 2 != AUCF {
        return Err(RdcError::UnknownVariant {
            type_name: "mcs pdu",
            value: u32::from(opcode >> 2),
        });
    }
    let result = s.u8()?;
    if result != 0 {
        return Err(RdcError::Rejected(format!("attach user result {result}")));
    }
    if opcode & 2 == 0 {
        return Err(RdcError::malformed("attach user confirm without user id"));
    }
    s.u16_be()
}

/// Check a Channel-Join-Confirm for `channel`.
pub fn parse_channel_join_confirm(data: &[u8], channel: u16) -> Result<()> {
    let mut s = ReadStream::new(data);
    let opcode = s.u8()?;
    if opcode >> 2 != CJCF {
        return Err(RdcError::UnknownVariant {
            type_name: "mcs pdu",
            value: u32::from(opcode >> 2),
        });
    }
    let result = s.u8()?;
    if result != 0 {
        return Err(RdcError::Rejected(format!(
            "join of channel {channel} refused with result {result}"
        )));
    }
    Ok(())
}

// ── Data ─────────────────────────────────────────────────────────

/// Reserve the ISO and send-data-request headers.
pub fn init(s: &mut Stream) {
    iso::init(s);
    s.reserve_header(Layer::Mcs, SDRQ_HEADER_LEN);
}

/// Fill the headers reserved by [`init`].
pub fn finish(s: &mut Stream, user_id: u16, channel: u16) -> Result<()> {
    let length = s.payload_after(Layer::Mcs, SDRQ_HEADER_LEN);
    let length = u16::try_from(length)
        .ok()
        .filter(|l| *l < 0x8000)
        .ok_or(RdcError::malformed("oversized mcs payload"))?;
    let mut h = s.header_mut(Layer::Mcs)?;
    h.put_u8(SDRQ << 2);
    h.put_u16(user_id);
    h.put_u16(channel);
    h.put_u8(0x70); // high priority, begin and end segmentation
    h.put_u16(length | 0x8000);
    iso::finish(s)
}

/// A received domain PDU.
#[derive(Debug, PartialEq, Eq)]
pub enum DomainPdu<'a> {
    Data { channel: u16, payload: &'a [u8] },
    Disconnect,
}

pub fn parse_domain_pdu(data: &[u8]) -> Result<DomainPdu<'_>> {
    let mut s = ReadStream::new(data);
    let opcode = s.u8()? >> 2;
    match opcode {
        SDIN => {
            s.skip(2)?; // initiator
            let channel = s.u16_be()?;
            s.skip(1)?; // priority and segmentation
            let len = s.u8()?;
            if len & 0x80 != 0 {
                s.skip(1)?;
            }
            Ok(DomainPdu::Data {
                channel,
                payload: s.rest(),
            })
        }
        DPUM => Ok(DomainPdu::Disconnect),
        other => Err(RdcError::UnknownVariant {
            type_name: "mcs pdu",
            value: u32::from(other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x224_payload(b: &Bytes) -> &[u8] {
        &b[iso::DATA_HEADER_LEN..]
    }

    #[test]
    fn connect_initial_embeds_user_data() {
        let pdu = connect_initial(&[0xde, 0xad]).unwrap();
        let body = x224_payload(&pdu);
        assert_eq!(&body[..2], &[0x7f, 0x65]);
        let mut s = ReadStream::new(body);
        let len = ber_parse_header(&mut s, CONNECT_INITIAL).unwrap();
        assert_eq!(len, s.remaining());
        assert_eq!(&body[body.len() - 2..], &[0xde, 0xad]);
    }

    #[test]
    fn connect_response_round() {
        let mut s = Stream::with_capacity(64);
        ber_header(&mut s, CONNECT_RESPONSE, 0x30);
        ber_header(&mut s, TAG_RESULT, 1);
        s.put_u8(0);
        ber_header(&mut s, TAG_INTEGER, 1);
        s.put_u8(0);
        domain_params(&mut s, 34, 3, 0, 0xfff8);
        ber_header(&mut s, TAG_OCTET_STRING, 3);
        s.put_slice(&[1, 2, 3]);
        assert_eq!(parse_connect_response(s.as_slice()).unwrap(), &[1, 2, 3]);

        let mut s = Stream::with_capacity(8);
        ber_header(&mut s, CONNECT_RESPONSE, 3);
        ber_header(&mut s, TAG_RESULT, 1);
        s.put_u8(2);
        assert!(matches!(
            parse_connect_response(s.as_slice()),
            Err(RdcError::Rejected(_))
        ));
    }

    #[test]
    fn long_ber_lengths() {
        let mut s = Stream::with_capacity(8);
        ber_header(&mut s, TAG_OCTET_STRING, 0x1234);
        assert_eq!(s.as_slice(), &[4, 0x82, 0x12, 0x34]);
        assert_eq!(
            ber_parse_header(&mut ReadStream::new(s.as_slice()), TAG_OCTET_STRING).unwrap(),
            0x1234
        );
    }

    #[test]
    fn attach_and_join_confirms() {
        assert_eq!(parse_attach_user_confirm(&[(AUCF << 2) | 2, 0, 0, 6]).unwrap(), 6);
        assert!(parse_attach_user_confirm(&[AUCF << 2, 1]).is_err());
        assert!(parse_channel_join_confirm(&[(CJCF << 2) | 2, 0, 0, 6, 3, 0xeb, 3, 0xeb], 1003).is_ok());
        assert!(matches!(
            parse_channel_join_confirm(&[(CJCF << 2) | 2, 14, 0, 6, 3, 0xec], 1004),
            Err(RdcError::Rejected(_))
        ));
    }

    #[test]
    fn send_data_round() {
        let mut s = Stream::with_capacity(32);
        init(&mut s);
        s.put_slice(b"hi");
        finish(&mut s, 6, 1003).unwrap();
        let body = &s.as_slice()[iso::DATA_HEADER_LEN..];
        assert_eq!(body, &[SDRQ << 2, 0, 6, 0x03, 0xeb, 0x70, 0x80, 2, b'h', b'i']);

        let sdin = [SDIN << 2, 0, 6, 0x03, 0xeb, 0x70, 2, b'h', b'i'];
        assert_eq!(
            parse_domain_pdu(&sdin).unwrap(),
            DomainPdu::Data {
                channel: 1003,
                payload: b"hi"
            }
        );
        assert_eq!(parse_domain_pdu(&[DPUM << 2, 0x80]).unwrap(), DomainPdu::Disconnect);
    }
}
