//! Standard RDP security primitives.
//!
//! Key derivation, MAC signatures and key updates are all built from
//! the same salted MD5-over-SHA1 construction. The stream cipher is
//! RC4 with either a 40-bit (salted 8-byte) or 128-bit key.

pub mod cipher;
pub mod context;
pub mod rsa;

use md5::{Digest, Md5};
use sha1::Sha1;

pub use cipher::SessionCipher;
pub use context::{KeyMaterial, SecurityContext};

/// Length of the client and server randoms.
pub const RANDOM_SIZE: usize = 32;

/// Length of the inbound/outbound MAC.
pub const SIGNATURE_SIZE: usize = 8;

const PAD_54: [u8; 40] = [54; 40];
const PAD_92: [u8; 48] = [92; 48];

/// Salt overwriting the first three bytes of a 40-bit key.
const SALT_40BIT: [u8; 3] = [0xd1, 0x26, 0x9e];

/// 48-byte derivation: three rounds of
/// `MD5(input ‖ SHA1(pad ‖ input ‖ salt1 ‖ salt2))` with pads `A`,
/// `BB`, `CCC` (or the same pattern starting at `salt`).
pub fn hash48(input: &[u8; 48], salt1: &[u8], salt2: &[u8], salt: u8) -> [u8; 48] {
    let mut out = [0u8; 48];
    for i in 0..3u8 {
        let pad = vec![salt + i; usize::from(i) + 1];

        let mut sha = Sha1::new();
        sha.update(&pad);
        sha.update(input);
        sha.update(salt1);
        sha.update(salt2);
        let shasig = sha.finalize();

        let mut md5 = Md5::new();
        md5.update(input);
        md5.update(shasig);
        let start = usize::from(i) * 16;
        out[start..start + 16].copy_from_slice(&md5.finalize());
    }
    out
}

/// 16-byte derivation: `MD5(input ‖ salt1 ‖ salt2)`.
pub fn hash16(input: &[u8], salt1: &[u8], salt2: &[u8]) -> [u8; 16] {
    let mut md5 = Md5::new();
    md5.update(input);
    md5.update(salt1);
    md5.update(salt2);
    md5.finalize().into()
}

/// Replace the first bytes of a 40-bit key with the fixed salt.
pub fn make_40bit(key: &mut [u8]) {
    key[..3].copy_from_slice(&SALT_40BIT);
}

/// MAC over `data` under `key`, truncated to `out.len()` bytes.
pub fn sign(key: &[u8], data: &[u8], out: &mut [u8]) {
    let len_header = (data.len() as u32).to_le_bytes();

    let mut sha = Sha1::new();
    sha.update(key);
    sha.update(PAD_54);
    sha.update(len_header);
    sha.update(data);
    let shasig = sha.finalize();

    let mut md5 = Md5::new();
    md5.update(key);
    md5.update(PAD_92);
    md5.update(shasig);
    let md5sig = md5.finalize();

    let n = out.len().min(md5sig.len());
    out[..n].copy_from_slice(&md5sig[..n]);
}

/// Re-derive `key` from itself and its update key.
///
/// Both slices must have the working key length (8 or 16).
pub fn update_key(key: &mut [u8], update: &[u8]) -> crate::error::Result<()> {
    let mut sha = Sha1::new();
    sha.update(update);
    sha.update(PAD_54);
    sha.update(&*key);
    let shasig = sha.finalize();

    let mut md5 = Md5::new();
    md5.update(update);
    md5.update(PAD_92);
    md5.update(shasig);
    let digest = md5.finalize();

    let len = key.len();
    key.copy_from_slice(&digest[..len]);
    let mut rc4 = SessionCipher::new(key)?;
    rc4.apply(key);

    if len == 8 {
        make_40bit(key);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash48_rounds_differ() {
        let input = [7u8; 48];
        let out = hash48(&input, &[1; 32], &[2; 32], b'A');
        assert_ne!(out[..16], out[16..32]);
        assert_ne!(out[16..32], out[32..]);
        assert_eq!(out, hash48(&input, &[1; 32], &[2; 32], b'A'));
        assert_ne!(out, hash48(&input, &[1; 32], &[2; 32], b'X'));
    }

    #[test]
    fn hash16_is_md5_of_concatenation() {
        let mut md5 = Md5::new();
        md5.update(b"abc");
        let expected: [u8; 16] = md5.finalize().into();
        assert_eq!(hash16(b"a", b"b", b"c"), expected);
    }

    #[test]
    fn signature_depends_on_key_and_data() {
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        sign(&[1; 16], b"payload", &mut a);
        sign(&[1; 16], b"payloae", &mut b);
        assert_ne!(a, b);
        sign(&[2; 16], b"payload", &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn updated_40bit_key_keeps_salt() {
        let mut key = [0x55u8; 8];
        make_40bit(&mut key);
        let update = key;
        update_key(&mut key, &update).unwrap();
        assert_eq!(&key[..3], &SALT_40BIT);
        assert_ne!(key, update);
    }
}
