//! Licence negotiation.
//!
//! The server opens with a licence request carrying its random. We
//! answer with a stored licence if the [`LicenceStore`] has one for this
//! client, otherwise with a new-licence request. A platform challenge is
//! answered with the decrypted token and our sealed hardware id, and an
//! issued licence is decrypted and handed back to the store.
//!
//! Client keys are derived from an all-zero client random and
//! pre-master secret, so nothing here needs the server's public key.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::crypto::{RANDOM_SIZE, SessionCipher, hash16, hash48, sign};
use crate::error::{RdcError, Result};
use crate::stream::{ReadStream, Stream};

const TAG_DEMAND: u8 = 0x01;
const TAG_AUTHREQ: u8 = 0x02;
const TAG_ISSUE: u8 = 0x03;
const TAG_REISSUE: u8 = 0x04;
const TAG_PRESENT: u8 = 0x12;
const TAG_REQUEST: u8 = 0x13;
const TAG_AUTHRESP: u8 = 0x15;
const TAG_RESULT: u8 = 0xff;

const TAG_USER: u16 = 0x000f;
const TAG_HOST: u16 = 0x0010;

const VERSION: u8 = 2;
const TOKEN_SIZE: usize = 10;
const HWID_SIZE: usize = 20;
const SIGNATURE_SIZE: usize = 16;
/// Modulus size of the (unused) encrypted pre-master secret.
const MODULUS_SIZE: usize = 64;
const PADDING_SIZE: usize = 8;
/// Bytes written by `put_randoms`.
const RANDOMS_LEN: usize = 8 + RANDOM_SIZE + 4 + MODULUS_SIZE + PADDING_SIZE;

const STATUS_VALID_CLIENT: u32 = 0x07;

// ── LicenceStore ─────────────────────────────────────────────────

/// Persistence for licences issued to this client.
pub trait LicenceStore: Send {
    /// The licence previously saved under `client`, if any.
    fn load(&self, client: &str) -> Option<Vec<u8>>;

    fn save(&mut self, client: &str, licence: &[u8]) -> Result<()>;
}

/// Licences kept for the life of the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryLicenceStore {
    licences: HashMap<String, Vec<u8>>,
}

impl LicenceStore for MemoryLicenceStore {
    fn load(&self, client: &str) -> Option<Vec<u8>> {
        self.licences.get(client).cloned()
    }

    fn save(&mut self, client: &str, licence: &[u8]) -> Result<()> {
        self.licences.insert(client.to_string(), licence.to_vec());
        Ok(())
    }
}

/// One `licence.<client>` file per client name under a directory.
#[derive(Debug, Clone)]
pub struct FileLicenceStore {
    dir: PathBuf,
}

impl FileLicenceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, client: &str) -> PathBuf {
        self.dir.join(format!("licence.{client}"))
    }
}

impl LicenceStore for FileLicenceStore {
    fn load(&self, client: &str) -> Option<Vec<u8>> {
        std::fs::read(self.path(client))
            .ok()
            .filter(|l| !l.is_empty())
    }

    fn save(&mut self, client: &str, licence: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(client);
        let tmp = path.with_extension("new");
        std::fs::write(&tmp, licence)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

// ── Negotiation ──────────────────────────────────────────────────

/// Client side of one licence exchange.
pub struct Licensing {
    username: String,
    hostname: String,
    sign_key: [u8; 16],
    licence_key: [u8; 16],
    complete: bool,
}

impl std::fmt::Debug for Licensing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Licensing")
            .field("hostname", &self.hostname)
            .field("complete", &self.complete)
            .finish_non_exhaustive()
    }
}

impl Licensing {
    pub fn new(username: &str, hostname: &str) -> Self {
        Self {
            username: username.to_string(),
            hostname: hostname.to_string(),
            sign_key: [0; 16],
            licence_key: [0; 16],
            complete: false,
        }
    }

    /// Whether the server has issued a licence or accepted ours.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Handle one licensing PDU; returns the reply to send, if any.
    pub fn process(&mut self, data: &[u8], store: &mut dyn LicenceStore) -> Result<Option<Vec<u8>>> {
        let mut s = ReadStream::new(data);
        let tag = s.u8()?;
        s.skip(3)?; // version, length
        match tag {
            TAG_DEMAND => self.demand(&mut s, store).map(Some),
            TAG_AUTHREQ => self.challenge(&mut s).map(Some),
            TAG_ISSUE | TAG_REISSUE => {
                self.issue(s.rest(), store)?;
                Ok(None)
            }
            TAG_RESULT => {
                let code = s.u32_le()?;
                if code == STATUS_VALID_CLIENT {
                    info!("licence accepted");
                } else {
                    warn!(code, "licensing ended with an error status");
                }
                self.complete = true;
                Ok(None)
            }
            other => {
                warn!(tag = other, "unknown licence PDU");
                Ok(None)
            }
        }
    }

    fn generate_keys(&mut self, server_random: &[u8; RANDOM_SIZE]) {
        let zeros = [0u8; 48];
        let client_random = [0u8; RANDOM_SIZE];
        let master = hash48(&zeros, &client_random, server_random, b'A');
        let key_block = hash48(&master, server_random, &client_random, b'A');
        self.sign_key.copy_from_slice(&key_block[..16]);
        self.licence_key = hash16(&key_block[16..32], &client_random, server_random);
    }

    fn hwid(&self) -> [u8; HWID_SIZE] {
        let mut hwid = [0u8; HWID_SIZE];
        hwid[..4].copy_from_slice(&2u32.to_le_bytes());
        let name = self.hostname.as_bytes();
        let n = name.len().min(HWID_SIZE - 4);
        hwid[4..4 + n].copy_from_slice(&name[..n]);
        hwid
    }

    fn rc4(&self, data: &mut [u8]) -> Result<()> {
        SessionCipher::new(&self.licence_key)?.apply(data);
        Ok(())
    }

    fn seal(&self, data: &[u8]) -> [u8; SIGNATURE_SIZE] {
        let mut out = [0u8; SIGNATURE_SIZE];
        sign(&self.sign_key, data, &mut out);
        out
    }

    fn demand(&mut self, s: &mut ReadStream<'_>, store: &mut dyn LicenceStore) -> Result<Vec<u8>> {
        let server_random = s.array::<RANDOM_SIZE>()?;
        self.generate_keys(&server_random);

        if let Some(licence) = store.load(&self.hostname) {
            debug!(len = licence.len(), "presenting stored licence");
            let mut hwid = self.hwid();
            let signature = self.seal(&hwid);
            self.rc4(&mut hwid)?;
            return present(&licence, &hwid, &signature);
        }
        debug!("requesting a new licence");
        request(&self.username, &self.hostname)
    }

    fn challenge(&mut self, s: &mut ReadStream<'_>) -> Result<Vec<u8>> {
        s.skip(6)?;
        let token_len = usize::from(s.u16_le()?);
        if token_len != TOKEN_SIZE {
            return Err(RdcError::ProtocolViolation(format!(
                "licence token of {token_len} bytes"
            )));
        }
        let token = s.array::<TOKEN_SIZE>()?;
        s.skip(SIGNATURE_SIZE)?;

        let mut plain = token;
        self.rc4(&mut plain)?;
        let hwid = self.hwid();
        let mut sealed = [0u8; TOKEN_SIZE + HWID_SIZE];
        sealed[..TOKEN_SIZE].copy_from_slice(&plain);
        sealed[TOKEN_SIZE..].copy_from_slice(&hwid);
        let signature = self.seal(&sealed);

        let mut crypt_hwid = hwid;
        self.rc4(&mut crypt_hwid)?;

        let mut s = Stream::with_capacity(64);
        header(&mut s, TAG_AUTHRESP, 58);
        s.put_u16_le(1);
        s.put_u16_le(TOKEN_SIZE as u16);
        s.put_slice(&token);
        s.put_u16_le(1);
        s.put_u16_le(HWID_SIZE as u16);
        s.put_slice(&crypt_hwid);
        s.put_slice(&signature);
        Ok(s.as_slice().to_vec())
    }

    fn issue(&mut self, data: &[u8], store: &mut dyn LicenceStore) -> Result<()> {
        let mut s = ReadStream::new(data);
        s.skip(2)?;
        let len = usize::from(s.u16_le()?);
        let mut body = s.take(len)?.to_vec();
        self.rc4(&mut body)?;

        let mut s = ReadStream::new(&body);
        if s.u16_le()? != 0 {
            warn!("could not decrypt issued licence");
            return Ok(());
        }
        s.skip(2)?;
        // the licence is the fourth length-prefixed string
        let mut len = 0;
        for _ in 0..4 {
            s.skip(len)?;
            len = s.u32_le()? as usize;
        }
        let licence = s.take(len)?;
        self.complete = true;
        info!(len, "licence issued");
        if let Err(e) = store.save(&self.hostname, licence) {
            warn!(error = %e, "could not store licence");
        }
        Ok(())
    }
}

fn header(s: &mut Stream, tag: u8, length: u16) {
    s.put_u8(tag);
    s.put_u8(VERSION);
    s.put_u16_le(length);
}

/// Client random, then the (null) encrypted pre-master secret.
fn put_randoms(s: &mut Stream, platform: u16) {
    s.put_u32_le(1);
    s.put_u16_le(0);
    s.put_u16_le(platform);
    s.put_fill(0, RANDOM_SIZE);
    s.put_u16_le(0);
    s.put_u16_le((MODULUS_SIZE + PADDING_SIZE) as u16);
    s.put_fill(0, MODULUS_SIZE + PADDING_SIZE);
}

fn present(licence: &[u8], hwid: &[u8], signature: &[u8]) -> Result<Vec<u8>> {
    let length = 4 + RANDOMS_LEN + 4 + licence.len() + 4 + HWID_SIZE + SIGNATURE_SIZE;
    let length = u16::try_from(length).map_err(|_| RdcError::malformed("stored licence size"))?;
    let mut s = Stream::with_capacity(usize::from(length));
    header(&mut s, TAG_PRESENT, length);
    put_randoms(&mut s, 0x0201);
    s.put_u16_le(1);
    s.put_u16_le(licence.len() as u16);
    s.put_slice(licence);
    s.put_u16_le(1);
    s.put_u16_le(HWID_SIZE as u16);
    s.put_slice(hwid);
    s.put_slice(signature);
    Ok(s.as_slice().to_vec())
}

fn request(username: &str, hostname: &str) -> Result<Vec<u8>> {
    let user_len = username.len() + 1;
    let host_len = hostname.len() + 1;
    let length = u16::try_from(4 + RANDOMS_LEN + 4 + user_len + 4 + host_len)
        .map_err(|_| RdcError::Config("user or host name too long".into()))?;
    let mut s = Stream::with_capacity(usize::from(length));
    header(&mut s, TAG_REQUEST, length);
    put_randoms(&mut s, 0xff01);
    s.put_u16_le(TAG_USER);
    s.put_u16_le(user_len as u16);
    s.put_slice(username.as_bytes());
    s.put_u8(0);
    s.put_u16_le(TAG_HOST);
    s.put_u16_le(host_len as u16);
    s.put_slice(hostname.as_bytes());
    s.put_u8(0);
    Ok(s.as_slice().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demand() -> Vec<u8> {
        let mut v = vec![TAG_DEMAND, VERSION, 0, 0];
        v.extend_from_slice(&[0x42; RANDOM_SIZE]);
        v
    }

    #[test]
    fn demand_without_licence_requests_one() {
        let mut lic = Licensing::new("bob", "desk");
        let mut store = MemoryLicenceStore::default();
        let reply = lic.process(&demand(), &mut store).unwrap().unwrap();
        assert_eq!(reply[0], TAG_REQUEST);
        let len = u16::from_le_bytes([reply[2], reply[3]]) as usize;
        assert_eq!(len, reply.len());
        assert!(reply.ends_with(b"desk\0"));
        assert!(!lic.is_complete());
    }

    #[test]
    fn demand_with_stored_licence_presents_it() {
        let mut lic = Licensing::new("bob", "desk");
        let mut store = MemoryLicenceStore::default();
        store.save("desk", b"LICENCE").unwrap();
        let reply = lic.process(&demand(), &mut store).unwrap().unwrap();
        assert_eq!(reply[0], TAG_PRESENT);
        let len = u16::from_le_bytes([reply[2], reply[3]]) as usize;
        assert_eq!(len, reply.len());
        assert!(reply.windows(7).any(|w| w == b"LICENCE"));
    }

    #[test]
    fn challenge_response_has_fixed_length() {
        let mut lic = Licensing::new("bob", "desk");
        let mut store = MemoryLicenceStore::default();
        lic.process(&demand(), &mut store).unwrap();

        let mut req = vec![TAG_AUTHREQ, VERSION, 0, 0];
        req.extend_from_slice(&[0; 6]);
        req.extend_from_slice(&(TOKEN_SIZE as u16).to_le_bytes());
        req.extend_from_slice(&[9; TOKEN_SIZE]);
        req.extend_from_slice(&[0; SIGNATURE_SIZE]);
        let reply = lic.process(&req, &mut store).unwrap().unwrap();
        assert_eq!(reply.len(), 58);
        assert_eq!(reply[0], TAG_AUTHRESP);
        assert_eq!(&reply[8..18], &[9; TOKEN_SIZE]);
    }

    #[test]
    fn issued_licence_is_decrypted_and_stored() {
        let mut lic = Licensing::new("bob", "desk");
        let mut store = MemoryLicenceStore::default();
        lic.process(&demand(), &mut store).unwrap();

        let mut body = vec![0, 0, 0, 0];
        for s in [&b"a"[..], b"bc", b"", b"LIC"] {
            body.extend_from_slice(&(s.len() as u32).to_le_bytes());
            body.extend_from_slice(s);
        }
        lic.rc4(&mut body).unwrap();
        let mut pdu = vec![TAG_ISSUE, VERSION, 0, 0, 0, 0];
        pdu.extend_from_slice(&(body.len() as u16).to_le_bytes());
        pdu.extend_from_slice(&body);

        assert!(lic.process(&pdu, &mut store).unwrap().is_none());
        assert!(lic.is_complete());
        assert_eq!(store.load("desk"), Some(b"LIC".to_vec()));
    }

    #[test]
    fn valid_client_result_completes() {
        let mut lic = Licensing::new("bob", "desk");
        let mut pdu = vec![TAG_RESULT, VERSION, 16, 0];
        pdu.extend_from_slice(&STATUS_VALID_CLIENT.to_le_bytes());
        pdu.extend_from_slice(&2u32.to_le_bytes());
        lic.process(&pdu, &mut MemoryLicenceStore::default()).unwrap();
        assert!(lic.is_complete());
    }

    #[test]
    fn file_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("rdc-licence-{}", std::process::id()));
        let mut store = FileLicenceStore::new(&dir);
        assert_eq!(store.load("desk"), None);
        store.save("desk", b"blob").unwrap();
        assert_eq!(store.load("desk"), Some(b"blob".to_vec()));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
