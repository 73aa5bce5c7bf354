//! T.124 conference create request/response and the user data blocks
//! they carry.

use tracing::warn;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::stream::{ReadStream, Stream};

use super::channels::ChannelRegistration;
use super::mcs::GLOBAL_CHANNEL;

const CS_CORE: u16 = 0xc001;
const CS_SECURITY: u16 = 0xc002;
const CS_NET: u16 = 0xc003;
const CS_CLUSTER: u16 = 0xc004;

const SC_CORE: u16 = 0x0c01;
const SC_SECURITY: u16 = 0x0c02;
const SC_NET: u16 = 0x0c03;

const CORE_LEN: u16 = 212;
const CLIENT_BUILD: u32 = 2600;
/// Bytes of UTF-16 client name, terminator excluded.
const HOSTNAME_BYTES: usize = 30;
/// Server core version of an RDP 4 server.
const RDP4_VERSION: u16 = 1;

/// Build the conference create request for `config` and `channels`.
pub fn client_data(config: &SessionConfig, channels: &[ChannelRegistration]) -> Vec<u8> {
    let mut length = 158 + 76 + 12 + 4;
    if !channels.is_empty() {
        length += channels.len() * 12 + 8;
    }

    let mut s = Stream::with_capacity(length + 32);
    s.put_u16_be(5);
    s.put_u16_be(0x14);
    s.put_u8(0x7c);
    s.put_u16_be(1);
    s.put_u16_be(length as u16 | 0x8000);
    s.put_u16_be(8);
    s.put_u16_be(16);
    s.put_u8(0);
    s.put_u16_le(0xc001);
    s.put_u8(0);
    s.put_slice(b"Duca"); // H.221 key
    s.put_u16_be((length - 14) as u16 | 0x8000);

    // core
    s.put_u16_le(CS_CORE);
    s.put_u16_le(CORE_LEN);
    s.put_u16_le(if config.rdp5 { 4 } else { 1 });
    s.put_u16_le(8);
    s.put_u16_le(config.wire_width());
    s.put_u16_le(config.height);
    s.put_u16_le(0xca01);
    s.put_u16_le(0xaa03);
    s.put_u32_le(config.keyboard_layout);
    s.put_u32_le(CLIENT_BUILD);
    s.put_unistr_fixed(&config.client_hostname, HOSTNAME_BYTES + 2);
    s.put_u32_le(config.keyboard_type);
    s.put_u32_le(config.keyboard_subtype);
    s.put_u32_le(config.keyboard_function_keys);
    s.put_fill(0, 64);
    s.put_u16_le(0xca01);
    s.put_u16_le(1);
    s.put_u32_le(0);
    s.put_u8(config.colour_depth);
    s.put_u16_le(0x0700);
    s.put_u8(0);
    s.put_u32_le(1);
    s.put_fill(0, 64);

    s.put_u16_le(CS_CLUSTER);
    s.put_u16_le(12);
    s.put_u32_le(if config.console_session { 0xb } else { 9 });
    s.put_u32_le(0);

    s.put_u16_le(CS_SECURITY);
    s.put_u16_le(12);
    s.put_u32_le(if config.encryption { 0x3 } else { 0 });
    s.put_u32_le(0);

    if !channels.is_empty() {
        s.put_u16_le(CS_NET);
        s.put_u16_le((channels.len() * 12 + 8) as u16);
        s.put_u32_le(channels.len() as u32);
        for ch in channels {
            let mut name = [0u8; 8];
            let bytes = ch.name.as_bytes();
            let n = bytes.len().min(7);
            name[..n].copy_from_slice(&bytes[..n]);
            s.put_slice(&name);
            s.put_u32_le(ch.options.bits());
        }
    }
    s.as_slice().to_vec()
}

/// What the server told us in its conference create response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerData {
    pub rdp_version: u16,
    /// Raw server security block, if encryption was negotiated.
    pub security: Option<Vec<u8>>,
    pub io_channel: u16,
    /// MCS ids assigned to the requested channels, in request order.
    pub channel_ids: Vec<u16>,
}

impl ServerData {
    pub fn is_rdp4(&self) -> bool {
        self.rdp_version == RDP4_VERSION
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut s = ReadStream::new(data);
        s.skip(21)?; // T.124 response header
        let len = s.u8()?;
        if len & 0x80 != 0 {
            s.u8()?;
        }

        let mut out = ServerData {
            io_channel: GLOBAL_CHANNEL,
            ..Default::default()
        };
        while s.remaining() >= 4 {
            let tag = s.u16_le()?;
            let len = usize::from(s.u16_le()?);
            if len <= 4 {
                break;
            }
            let mut block = s.sub((len - 4).min(s.remaining()))?;
            match tag {
                SC_CORE => out.rdp_version = block.u16_le()?,
                SC_SECURITY => out.security = Some(block.rest().to_vec()),
                SC_NET => {
                    out.io_channel = block.u16_le()?;
                    let count = block.u16_le()?;
                    for _ in 0..count {
                        out.channel_ids.push(block.u16_le()?);
                    }
                }
                other => warn!(tag = other, "ignoring unknown server data block"),
            }
        }
        Ok(out)
    }

    /// MCS id of the `index`-th requested channel.
    pub fn channel_id(&self, index: usize) -> u16 {
        self.channel_ids
            .get(index)
            .copied()
            .unwrap_or(GLOBAL_CHANNEL + 1 + index as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::ChannelOptions;

    #[test]
    fn core_block_has_declared_length() {
        let cfg = SessionConfig::default();
        let data = client_data(&cfg, &[]);
        // header 23 bytes, then core, cluster and security blocks
        assert_eq!(data.len(), 23 + 212 + 12 + 12);
        assert_eq!(&data[23..25], &CS_CORE.to_le_bytes());
    }

    #[test]
    fn channel_block_lists_names() {
        let cfg = SessionConfig::default();
        let regs = vec![ChannelRegistration::new(
            "cliprdr",
            ChannelOptions::INITIALIZED | ChannelOptions::ENCRYPT_RDP,
        )];
        let data = client_data(&cfg, &regs);
        let tail = &data[data.len() - 20..];
        assert_eq!(&tail[..4], &[0x03, 0xc0, 20, 0]);
        assert_eq!(&tail[8..15], b"cliprdr");
        assert_eq!(tail[15], 0);
    }

    #[test]
    fn server_blocks_are_parsed() {
        let mut s = Stream::with_capacity(64);
        s.put_fill(0, 21);
        s.put_u8(0x20);
        s.put_u16_le(SC_CORE);
        s.put_u16_le(8);
        s.put_u32_le(0x0008_0004);
        s.put_u16_le(SC_NET);
        s.put_u16_le(10);
        s.put_u16_le(1003);
        s.put_u16_le(1);
        s.put_u16_le(1004);
        let sd = ServerData::parse(s.as_slice()).unwrap();
        assert_eq!(sd.rdp_version, 4);
        assert!(!sd.is_rdp4());
        assert_eq!(sd.channel_ids, vec![1004]);
        assert_eq!(sd.channel_id(0), 1004);
        assert_eq!(sd.channel_id(1), 1005);
        assert!(sd.security.is_none());
    }
}
