//! RC4 keyed with either an 8-byte (40/56-bit) or 16-byte key.

use rc4::consts::{U8, U16};
use rc4::{KeyInit, Rc4, StreamCipher};

use crate::error::{RdcError, Result};

/// RC4 state for one direction of traffic.
pub enum SessionCipher {
    Short(Rc4<U8>),
    Long(Rc4<U16>),
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Short(_) => f.write_str("SessionCipher::Short"),
            Self::Long(_) => f.write_str("SessionCipher::Long"),
        }
    }
}

impl SessionCipher {
    /// Key a fresh cipher. Only 8- and 16-byte keys are valid.
    pub fn new(key: &[u8]) -> Result<Self> {
        let bad_key = |_| RdcError::malformed("rc4 key length");
        match key.len() {
            8 => Ok(Self::Short(Rc4::new_from_slice(key).map_err(bad_key)?)),
            16 => Ok(Self::Long(Rc4::new_from_slice(key).map_err(bad_key)?)),
            _ => Err(RdcError::malformed("rc4 key length")),
        }
    }

    /// Encrypt or decrypt `data` in place.
    pub fn apply(&mut self, data: &mut [u8]) {
        match self {
            Self::Short(c) => c.apply_keystream(data),
            Self::Long(c) => c.apply_keystream(data),
        }
    }
}
