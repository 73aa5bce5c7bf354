//! Per-session cipher state: keys, use counters and rotation.

use tracing::debug;

use super::{RANDOM_SIZE, SIGNATURE_SIZE, SessionCipher, hash16, hash48, make_40bit, sign, update_key};
use crate::error::{RdcError, Result};

/// Key sizes the server may select in its security data block.
pub const KEY_SIZE_40BIT: u32 = 1;
pub const KEY_SIZE_128BIT: u32 = 2;

// ── KeyMaterial ──────────────────────────────────────────────────

/// Keys derived from the exchanged randoms.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub sign: [u8; 16],
    pub encrypt: [u8; 16],
    pub decrypt: [u8; 16],
    /// Working key length: 8 or 16.
    pub key_len: usize,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_len", &self.key_len)
            .finish_non_exhaustive()
    }
}

impl KeyMaterial {
    /// Derive the client's session keys.
    pub fn derive(
        client_random: &[u8; RANDOM_SIZE],
        server_random: &[u8; RANDOM_SIZE],
        key_size: u32,
    ) -> Self {
        let mut pre_master = [0u8; 48];
        pre_master[..24].copy_from_slice(&client_random[..24]);
        pre_master[24..].copy_from_slice(&server_random[..24]);

        let master = hash48(&pre_master, client_random, server_random, b'A');
        let key_block = hash48(&master, client_random, server_random, b'X');

        let mut sign = [0u8; 16];
        sign.copy_from_slice(&key_block[..16]);
        let mut decrypt = hash16(&key_block[16..32], client_random, server_random);
        let mut encrypt = hash16(&key_block[32..48], client_random, server_random);

        let key_len = if key_size == KEY_SIZE_40BIT {
            make_40bit(&mut sign);
            make_40bit(&mut decrypt);
            make_40bit(&mut encrypt);
            8
        } else {
            16
        };

        Self {
            sign,
            encrypt,
            decrypt,
            key_len,
        }
    }

    /// The same keys seen from the other end of the connection.
    pub fn mirrored(&self) -> Self {
        Self {
            sign: self.sign,
            encrypt: self.decrypt,
            decrypt: self.encrypt,
            key_len: self.key_len,
        }
    }
}

// ── SecurityContext ──────────────────────────────────────────────

struct Direction {
    key: [u8; 16],
    update: [u8; 16],
    cipher: SessionCipher,
    uses: u32,
}

impl Direction {
    fn new(key: [u8; 16], key_len: usize) -> Result<Self> {
        Ok(Self {
            key,
            update: key,
            cipher: SessionCipher::new(&key[..key_len])?,
            uses: 0,
        })
    }

    fn apply(&mut self, data: &mut [u8], key_len: usize, threshold: u32, label: &str) -> Result<()> {
        if self.uses >= threshold {
            update_key(&mut self.key[..key_len], &self.update[..key_len])?;
            self.cipher = SessionCipher::new(&self.key[..key_len])?;
            self.uses = 0;
            debug!(direction = label, "rotated session key");
        }
        self.cipher.apply(data);
        self.uses += 1;
        Ok(())
    }
}

/// Symmetric cipher state for both directions of one session.
pub struct SecurityContext {
    sign_key: [u8; 16],
    key_len: usize,
    encrypt: Direction,
    decrypt: Direction,
    rekey_threshold: u32,
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("key_len", &self.key_len)
            .field("encrypt_uses", &self.encrypt.uses)
            .field("decrypt_uses", &self.decrypt.uses)
            .finish()
    }
}

impl SecurityContext {
    pub fn new(keys: KeyMaterial, rekey_threshold: u32) -> Result<Self> {
        if keys.key_len != 8 && keys.key_len != 16 {
            return Err(RdcError::malformed("session key length"));
        }
        Ok(Self {
            sign_key: keys.sign,
            key_len: keys.key_len,
            encrypt: Direction::new(keys.encrypt, keys.key_len)?,
            decrypt: Direction::new(keys.decrypt, keys.key_len)?,
            rekey_threshold,
        })
    }

    pub fn key_len(&self) -> usize {
        self.key_len
    }

    /// Encrypt outbound data in place, rotating the key when due.
    pub fn encrypt(&mut self, data: &mut [u8]) -> Result<()> {
        self.encrypt
            .apply(data, self.key_len, self.rekey_threshold, "encrypt")
    }

    /// Decrypt inbound data in place, rotating the key when due.
    pub fn decrypt(&mut self, data: &mut [u8]) -> Result<()> {
        self.decrypt
            .apply(data, self.key_len, self.rekey_threshold, "decrypt")
    }

    /// MAC of plaintext `data`.
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_SIZE] {
        let mut out = [0u8; SIGNATURE_SIZE];
        sign(&self.sign_key[..self.key_len], data, &mut out);
        out
    }

    /// Check the MAC of decrypted inbound `data`.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        if self.sign(data)[..] == *signature {
            Ok(())
        } else {
            Err(RdcError::SignatureMismatch)
        }
    }

    pub fn encrypt_uses(&self) -> u32 {
        self.encrypt.uses
    }

    pub fn decrypt_uses(&self) -> u32 {
        self.decrypt.uses
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(key_size: u32, threshold: u32) -> (SecurityContext, SecurityContext) {
        let keys = KeyMaterial::derive(&[0x11; 32], &[0x22; 32], key_size);
        let client = SecurityContext::new(keys.clone(), threshold).unwrap();
        let server = SecurityContext::new(keys.mirrored(), threshold).unwrap();
        (client, server)
    }

    #[test]
    fn forty_bit_keys_are_salted() {
        let keys = KeyMaterial::derive(&[1; 32], &[2; 32], KEY_SIZE_40BIT);
        assert_eq!(keys.key_len, 8);
        assert_eq!(&keys.encrypt[..3], &[0xd1, 0x26, 0x9e]);
        assert_eq!(&keys.sign[..3], &[0xd1, 0x26, 0x9e]);

        let keys = KeyMaterial::derive(&[1; 32], &[2; 32], KEY_SIZE_128BIT);
        assert_eq!(keys.key_len, 16);
        assert_ne!(keys.encrypt, keys.decrypt);
    }

    #[test]
    fn mirrored_contexts_interoperate_across_rotation() {
        for key_size in [KEY_SIZE_40BIT, KEY_SIZE_128BIT] {
            let (mut client, mut server) = pair(key_size, 4);
            for i in 0..10u8 {
                let plain = vec![i; 37];
                let mut wire = plain.clone();
                let sig = client.sign(&wire);
                client.encrypt(&mut wire).unwrap();
                assert_ne!(wire, plain);
                server.decrypt(&mut wire).unwrap();
                assert_eq!(wire, plain);
                server.verify(&wire, &sig).unwrap();
            }
            // 10 uses with a threshold of 4: rotated after uses 4 and 8
            assert_eq!(client.encrypt_uses(), 2);
            assert_eq!(server.decrypt_uses(), 2);
        }
    }

    #[test]
    fn rotation_changes_the_keystream() {
        let (mut rotating, _) = pair(KEY_SIZE_128BIT, 1);
        let (mut fixed, _) = pair(KEY_SIZE_128BIT, u32::MAX);

        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        rotating.encrypt(&mut a).unwrap();
        fixed.encrypt(&mut b).unwrap();
        assert_eq!(a, b);

        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        rotating.encrypt(&mut a).unwrap();
        fixed.encrypt(&mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_data_fails_verification() {
        let (client, server) = pair(KEY_SIZE_128BIT, 4096);
        let sig = client.sign(b"hello");
        assert!(matches!(
            server.verify(b"hellp", &sig),
            Err(RdcError::SignatureMismatch)
        ));
    }
}
