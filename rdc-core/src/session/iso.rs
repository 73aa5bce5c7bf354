//! X.224 (ISO 8073 class 0) over TPKT.

use bytes::{BufMut, Bytes};

use crate::codec::{TPKT_HEADER_LEN, TPKT_VERSION};
use crate::error::{RdcError, Result};
use crate::stream::{Layer, ReadStream, Stream};

const PDU_CR: u8 = 0xe0;
const PDU_CC: u8 = 0xd0;
const PDU_DR: u8 = 0x80;
const PDU_DT: u8 = 0xf0;
const EOT: u8 = 0x80;

/// TPKT header plus the data TPDU header.
pub const DATA_HEADER_LEN: usize = TPKT_HEADER_LEN + 3;

/// Connection request carrying the routing cookie.
pub fn connection_request(username: &str) -> Bytes {
    let cookie = format!("Cookie: mstshash={username}\r\n");
    let length = TPKT_HEADER_LEN + 7 + cookie.len();
    let mut s = Stream::with_capacity(length);
    s.put_u8(TPKT_VERSION);
    s.put_u8(0);
    s.put_u16_be(length as u16);
    s.put_u8((length - 5) as u8);
    s.put_u8(PDU_CR);
    s.put_u16_be(0); // dst ref
    s.put_u16_be(0); // src ref
    s.put_u8(0); // class
    s.put_slice(cookie.as_bytes());
    s.into_bytes()
}

pub fn disconnect_request() -> Bytes {
    let mut s = Stream::with_capacity(11);
    s.put_u8(TPKT_VERSION);
    s.put_u8(0);
    s.put_u16_be(11);
    s.put_u8(6);
    s.put_u8(PDU_DR);
    s.put_u16_be(0);
    s.put_u16_be(0);
    s.put_u8(0);
    s.into_bytes()
}

/// Reserve the TPKT and data TPDU headers.
pub fn init(s: &mut Stream) {
    s.reserve_header(Layer::Iso, DATA_HEADER_LEN);
}

/// Fill the headers reserved by [`init`].
pub fn finish(s: &mut Stream) -> Result<()> {
    let length = u16::try_from(s.len()).map_err(|_| RdcError::malformed("oversized TPDU"))?;
    let mut h = s.header_mut(Layer::Iso)?;
    h.put_u8(TPKT_VERSION);
    h.put_u8(0);
    h.put_u16(length);
    h.put_u8(2);
    h.put_u8(PDU_DT);
    h.put_u8(EOT);
    Ok(())
}

/// Check a connection confirm.
pub fn parse_connection_confirm(payload: &[u8]) -> Result<()> {
    let mut s = ReadStream::new(payload);
    s.u8()?; // length indicator
    match s.u8()? {
        PDU_CC => Ok(()),
        PDU_DR => Err(RdcError::Rejected("connection request refused".into())),
        code => Err(RdcError::UnknownVariant {
            type_name: "x224 tpdu",
            value: u32::from(code),
        }),
    }
}

/// What a received TPDU carried.
#[derive(Debug, PartialEq, Eq)]
pub enum Tpdu<'a> {
    Data(&'a [u8]),
    Disconnect,
}

/// Strip the X.224 header off a TPKT payload.
pub fn parse_tpdu(payload: &[u8]) -> Result<Tpdu<'_>> {
    let mut s = ReadStream::new(payload);
    s.u8()?;
    match s.u8()? {
        PDU_DT => {
            s.skip(1)?;
            Ok(Tpdu::Data(s.rest()))
        }
        PDU_DR => Ok(Tpdu::Disconnect),
        code => Err(RdcError::UnknownVariant {
            type_name: "x224 tpdu",
            value: u32::from(code),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_request_layout() {
        let cr = connection_request("bob");
        let cookie = b"Cookie: mstshash=bob\r\n";
        assert_eq!(cr.len(), 11 + cookie.len());
        assert_eq!(&cr[..4], &[3, 0, 0, cr.len() as u8]);
        assert_eq!(cr[4] as usize, cr.len() - 5);
        assert_eq!(cr[5], PDU_CR);
        assert_eq!(&cr[11..], cookie);
    }

    #[test]
    fn data_headers_cover_the_whole_stream() {
        let mut s = Stream::with_capacity(16);
        init(&mut s);
        s.put_slice(&[0xaa, 0xbb]);
        finish(&mut s).unwrap();
        assert_eq!(s.as_slice(), &[3, 0, 0, 9, 2, 0xf0, 0x80, 0xaa, 0xbb]);
    }

    #[test]
    fn tpdu_kinds() {
        assert_eq!(parse_tpdu(&[2, 0xf0, 0x80, 1]).unwrap(), Tpdu::Data(&[1]));
        assert_eq!(parse_tpdu(&[6, 0x80, 0, 0, 0, 0, 0]).unwrap(), Tpdu::Disconnect);
        assert!(parse_tpdu(&[2, 0x70]).is_err());
        assert!(parse_connection_confirm(&[6, 0xd0, 0, 0, 0, 0, 0]).is_ok());
        assert!(matches!(
            parse_connection_confirm(&[6, 0x80]),
            Err(RdcError::Rejected(_))
        ));
    }
}
