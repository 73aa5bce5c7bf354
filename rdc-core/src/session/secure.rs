//! Standard RDP security: the server's crypt info, the client random
//! exchange and the per-PDU security header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, info};

use super::mcs;
use crate::crypto::rsa::{PADDING_SIZE, RsaPublicKey};
use crate::crypto::{KeyMaterial, RANDOM_SIZE, SIGNATURE_SIZE, SecurityContext};
use crate::error::{RdcError, Result};
use crate::flags::SecurityFlags;
use crate::stream::{Layer, ReadStream, Stream};

/// Flags only.
pub const HEADER_LEN: usize = 4;
/// Flags and MAC.
pub const HEADER_LEN_ENCRYPTED: usize = HEADER_LEN + SIGNATURE_SIZE;

const TAG_PUBKEY: u16 = 0x0006;
const TAG_KEYSIG: u16 = 0x0008;
const CERT_PROPRIETARY: u32 = 0x0000_0001;

// ── CryptInfo ────────────────────────────────────────────────────

/// Encryption parameters from the server security data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptInfo {
    /// 1 for 40-bit keys, 2 for 128-bit.
    pub key_size: u32,
    pub server_random: [u8; RANDOM_SIZE],
    pub public_key: RsaPublicKey,
}

impl CryptInfo {
    /// Parse the block; `None` when the server chose no encryption.
    pub fn parse(block: &[u8]) -> Result<Option<Self>> {
        let mut s = ReadStream::new(block);
        let key_size = s.u32_le()?;
        let crypt_level = s.u32_le()?;
        if crypt_level == 0 {
            return Ok(None);
        }
        let random_len = s.u32_le()? as usize;
        let rsa_info_len = s.u32_le()? as usize;
        if random_len != RANDOM_SIZE {
            return Err(RdcError::ProtocolViolation(format!(
                "server random of {random_len} bytes"
            )));
        }
        let server_random = s.array::<RANDOM_SIZE>()?;

        let mut cert = s.sub(rsa_info_len.min(s.remaining()))?;
        let flags = cert.u32_le()?;
        if flags & CERT_PROPRIETARY == 0 {
            return Err(RdcError::Unsupported("X.509 server certificates"));
        }
        cert.skip(8)?;

        let mut public_key = None;
        while cert.remaining() >= 4 {
            let tag = cert.u16_le()?;
            let len = usize::from(cert.u16_le()?);
            let mut body = cert.sub(len)?;
            match tag {
                TAG_PUBKEY => public_key = Some(RsaPublicKey::parse(&mut body)?),
                TAG_KEYSIG => {}
                other => debug!(tag = other, "skipping certificate field"),
            }
        }
        let public_key = public_key
            .ok_or_else(|| RdcError::ProtocolViolation("certificate without public key".into()))?;
        Ok(Some(Self {
            key_size,
            server_random,
            public_key,
        }))
    }
}

// ── SecureLayer ──────────────────────────────────────────────────

/// Security header framing plus the session's cipher state.
#[derive(Debug)]
pub struct SecureLayer {
    context: Option<SecurityContext>,
    licence_issued: bool,
}

impl Default for SecureLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureLayer {
    /// A layer without keys: headers carry flags only.
    pub fn new() -> Self {
        Self {
            context: None,
            licence_issued: false,
        }
    }

    pub fn with_keys(keys: KeyMaterial, rekey_threshold: u32) -> Result<Self> {
        Ok(Self {
            context: Some(SecurityContext::new(keys, rekey_threshold)?),
            licence_issued: false,
        })
    }

    /// Pick a client random, derive the session keys and return the
    /// random encrypted for the server.
    pub fn establish(
        &mut self,
        info: &CryptInfo,
        client_random: &[u8; RANDOM_SIZE],
        rekey_threshold: u32,
    ) -> Result<Vec<u8>> {
        let keys = KeyMaterial::derive(client_random, &info.server_random, info.key_size);
        info!(
            key_bits = if keys.key_len == 8 { 40 } else { 128 },
            modulus = info.public_key.modulus_size(),
            "session keys derived"
        );
        self.context = Some(SecurityContext::new(keys, rekey_threshold)?);
        Ok(info.public_key.encrypt(client_random))
    }

    pub fn is_encrypted(&self) -> bool {
        self.context.is_some()
    }

    pub fn licence_issued(&self) -> bool {
        self.licence_issued
    }

    pub fn set_licence_issued(&mut self) {
        self.licence_issued = true;
    }

    pub fn context(&self) -> Option<&SecurityContext> {
        self.context.as_ref()
    }

    /// Flags for ordinary outbound data.
    pub fn data_flags(&self) -> SecurityFlags {
        if self.is_encrypted() {
            SecurityFlags::ENCRYPT
        } else {
            SecurityFlags::empty()
        }
    }

    fn header_len(&self, flags: SecurityFlags) -> usize {
        if flags.contains(SecurityFlags::ENCRYPT) {
            HEADER_LEN_ENCRYPTED
        } else if self.licence_issued {
            0
        } else {
            HEADER_LEN
        }
    }

    /// A stream with ISO, MCS and security headers reserved.
    pub fn init(&self, flags: SecurityFlags, capacity: usize) -> Stream {
        let hdr = self.header_len(flags);
        let mut s = Stream::with_capacity(capacity + hdr + 32);
        mcs::init(&mut s);
        s.reserve_header(Layer::Sec, hdr);
        s
    }

    /// Sign and encrypt (if flagged) the payload of `s`, then frame it
    /// for `channel`.
    pub fn finish(
        &mut self,
        mut s: Stream,
        flags: SecurityFlags,
        user_id: u16,
        channel: u16,
    ) -> Result<Bytes> {
        let hdr = self.header_len(flags);
        let start = s
            .header_offset(Layer::Sec)
            .ok_or(RdcError::InvalidState("security header was not reserved"))?;
        if hdr > 0 {
            let buf = s.as_mut_slice();
            let (head, payload) = buf.split_at_mut(start + hdr);
            let mut h = &mut head[start..];
            h.put_u32_le(flags.bits());
            if flags.contains(SecurityFlags::ENCRYPT) {
                let ctx = self
                    .context
                    .as_mut()
                    .ok_or(RdcError::InvalidState("encrypting before key exchange"))?;
                h.put_slice(&ctx.sign(payload));
                ctx.encrypt(payload)?;
            }
        }
        mcs::finish(&mut s, user_id, channel)?;
        Ok(s.into_bytes())
    }

    /// The client random PDU.
    pub fn client_random_pdu(&mut self, encrypted_random: &[u8], user_id: u16) -> Result<Bytes> {
        let flags = SecurityFlags::CLIENT_RANDOM;
        let len = encrypted_random.len() + PADDING_SIZE;
        let mut s = self.init(flags, len + 4);
        s.put_u32_le(len as u32);
        s.put_slice(encrypted_random);
        s.put_fill(0, PADDING_SIZE);
        self.finish(s, flags, user_id, mcs::GLOBAL_CHANNEL)
    }

    /// Strip the security header off an inbound slow-path PDU,
    /// decrypting and verifying its payload in place.
    pub fn unwrap(&mut self, body: &mut BytesMut) -> Result<SecurityFlags> {
        if !self.is_encrypted() && self.licence_issued {
            return Ok(SecurityFlags::empty());
        }
        if body.len() < HEADER_LEN {
            return Err(RdcError::malformed("security header"));
        }
        let flags = SecurityFlags::from_bits_retain(body.get_u32_le());
        if flags.contains(SecurityFlags::ENCRYPT) {
            self.decrypt_signed(body)?;
        }
        Ok(flags)
    }

    /// Decrypt a MAC-prefixed payload in place, leaving the plaintext.
    pub fn decrypt_signed(&mut self, body: &mut BytesMut) -> Result<()> {
        if body.len() < SIGNATURE_SIZE {
            return Err(RdcError::malformed("security signature"));
        }
        let signature = body.split_to(SIGNATURE_SIZE);
        let ctx = self
            .context
            .as_mut()
            .ok_or_else(|| RdcError::ProtocolViolation("encrypted PDU before key exchange".into()))?;
        ctx.decrypt(body)?;
        ctx.verify(body, &signature)
    }
}
