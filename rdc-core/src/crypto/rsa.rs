//! Raw RSA encryption of the client random under the server's
//! proprietary-certificate public key.
//!
//! All big numbers on the wire are little-endian.

use num_bigint::BigUint;

use crate::error::{RdcError, Result};
use crate::stream::ReadStream;

/// `RSA1` blob magic.
pub const RSA_MAGIC: u32 = 0x3141_5352;

/// Zero padding that follows every modulus-sized field.
pub const PADDING_SIZE: usize = 8;

pub const MIN_MODULUS_SIZE: usize = 64;
pub const MAX_MODULUS_SIZE: usize = 256;

/// Server public key from the `RSA1` blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    /// Little-endian public exponent.
    pub exponent: [u8; 4],
    /// Little-endian modulus, padding stripped.
    pub modulus: Vec<u8>,
}

impl RsaPublicKey {
    /// Parse an `RSA1` public key blob.
    pub fn parse(s: &mut ReadStream<'_>) -> Result<Self> {
        let magic = s.u32_le()?;
        if magic != RSA_MAGIC {
            return Err(RdcError::ProtocolViolation(format!(
                "bad RSA magic {magic:#x}"
            )));
        }
        let declared = s.u32_le()? as usize;
        let modulus_len = declared
            .checked_sub(PADDING_SIZE)
            .ok_or(RdcError::malformed("rsa modulus length"))?;
        if !(MIN_MODULUS_SIZE..=MAX_MODULUS_SIZE).contains(&modulus_len) {
            return Err(RdcError::malformed("rsa modulus length"));
        }
        // bit length and max data length
        s.skip(8)?;
        let exponent = s.array::<4>()?;
        let modulus = s.take(modulus_len)?.to_vec();
        s.skip(PADDING_SIZE)?;
        Ok(Self { exponent, modulus })
    }

    pub fn modulus_size(&self) -> usize {
        self.modulus.len()
    }

    /// `data^e mod n`, returned little-endian and zero-padded to the
    /// modulus size.
    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        let m = BigUint::from_bytes_le(data);
        let e = BigUint::from_bytes_le(&self.exponent);
        let n = BigUint::from_bytes_le(&self.modulus);
        let mut out = m.modpow(&e, &n).to_bytes_le();
        out.resize(self.modulus.len(), 0);
        out
    }
}
