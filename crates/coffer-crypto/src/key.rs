//! 256-bit symmetric keys
//!
//! Key bytes live in a `Zeroizing` buffer so they are scrubbed from
//! memory as soon as the key is dropped.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;
use zeroize::Zeroizing;

use crate::cipher::CipherError;

/// 256-bit key (32 bytes)
pub const KEY_SIZE: usize = 32;

/// A 32-byte symmetric key, zeroized on drop
#[derive(Clone)]
pub struct SymmetricKey(Zeroizing<[u8; KEY_SIZE]>);

impl SymmetricKey {
    /// Generate a cryptographically secure random key
    pub fn generate() -> Result<Self, CipherError> {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        SystemRandom::new()
            .fill(key.as_mut())
            .map_err(|_| CipherError::Rng)?;
        Ok(Self(key))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CipherError> {
        if bytes.len() != KEY_SIZE {
            return Err(CipherError::InvalidKeySize(bytes.len()));
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let bytes = Zeroizing::new(
            BASE64
                .decode(encoded.trim())
                .map_err(|_| CipherError::Malformed("key is not valid base64"))?,
        );
        Self::from_slice(&bytes)
    }

    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(BASE64.encode(self.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        ring::constant_time::verify_slices_are_equal(self.0.as_ref(), other.0.as_ref()).is_ok()
    }
}

impl Eq for SymmetricKey {}

// Never print key material, even in debug output
impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}
