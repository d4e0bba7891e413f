//! ChaCha20-Poly1305 envelopes
//!
//! Every call to [`encrypt`] draws a fresh 16-byte salt and 12-byte nonce,
//! stretches the caller's key with PBKDF2-HMAC-SHA256 over that salt, and
//! seals the payload with the derived sub-key. The envelope carries
//! everything except the key, base64-encoded, so it can be persisted as-is:
//!
//! ```json
//! { "data": "<b64>", "iv": "<b64>", "salt": "<b64>", "tag": "<b64>" }
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Nonce, Tag,
};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::key::{SymmetricKey, KEY_SIZE};

/// 96-bit nonce (12 bytes)
pub const NONCE_SIZE: usize = 12;
/// 128-bit KDF salt (16 bytes)
pub const SALT_SIZE: usize = 16;
/// Poly1305 tag (16 bytes)
pub const TAG_SIZE: usize = 16;

pub const DEFAULT_KDF_ITERATIONS: u32 = 10_000;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Integrity check failed - data may be corrupted or tampered")]
    Integrity,

    #[error("Malformed envelope: {0}")]
    Malformed(&'static str),

    #[error("Invalid key size: expected {KEY_SIZE}, got {0}")]
    InvalidKeySize(usize),

    #[error("Invalid KDF work factor: iterations must be non-zero")]
    InvalidWorkFactor,

    #[error("System random number generator failed")]
    Rng,
}

impl CipherError {
    /// True for failures that mean "this envelope does not open under this key"
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, CipherError::Integrity | CipherError::Malformed(_))
    }
}

/// PBKDF2 work factor used to derive per-envelope sub-keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    iterations: NonZeroU32,
}

impl KdfParams {
    pub fn new(iterations: u32) -> Result<Self, CipherError> {
        NonZeroU32::new(iterations)
            .map(|iterations| Self { iterations })
            .ok_or(CipherError::InvalidWorkFactor)
    }

    pub fn iterations(&self) -> u32 {
        self.iterations.get()
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: NonZeroU32::new(DEFAULT_KDF_ITERATIONS).unwrap_or(NonZeroU32::MIN),
        }
    }
}

/// Self-contained authenticated-encryption output
///
/// Fields stay base64 text until [`decrypt`] needs them, so one damaged
/// envelope never stops the collection holding it from parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub data: String,
    pub iv: String,
    pub salt: String,
    pub tag: String,
}

impl Envelope {
    fn decode_field<const N: usize>(encoded: &str, field: &'static str) -> Result<[u8; N], CipherError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|_| CipherError::Malformed(field))?;
        bytes.try_into().map_err(|_| CipherError::Malformed(field))
    }
}

fn random_bytes<const N: usize>(rng: &SystemRandom) -> Result<[u8; N], CipherError> {
    let mut bytes = [0u8; N];
    rng.fill(&mut bytes).map_err(|_| CipherError::Rng)?;
    Ok(bytes)
}

fn derive_subkey(key: &SymmetricKey, salt: &[u8], params: &KdfParams) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut derived = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        params.iterations,
        salt,
        key.as_bytes(),
        derived.as_mut(),
    );
    derived
}

/// Seal `plaintext` under `key`
pub fn encrypt(
    key: &SymmetricKey,
    plaintext: &[u8],
    params: &KdfParams,
) -> Result<Envelope, CipherError> {
    let rng = SystemRandom::new();
    let salt: [u8; SALT_SIZE] = random_bytes(&rng)?;
    let nonce: [u8; NONCE_SIZE] = random_bytes(&rng)?;

    let subkey = derive_subkey(key, &salt, params);
    let cipher = ChaCha20Poly1305::new_from_slice(subkey.as_ref())
        .map_err(|_| CipherError::InvalidKeySize(subkey.len()))?;

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
        .map_err(|_| CipherError::EncryptionFailed)?;

    Ok(Envelope {
        data: BASE64.encode(&buffer),
        iv: BASE64.encode(nonce),
        salt: BASE64.encode(salt),
        tag: BASE64.encode(tag),
    })
}

/// Open an envelope produced by [`encrypt`]
///
/// The tag is verified before any plaintext is produced; on failure nothing
/// but the error is returned.
pub fn decrypt(
    key: &SymmetricKey,
    envelope: &Envelope,
    params: &KdfParams,
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    let nonce: [u8; NONCE_SIZE] = Envelope::decode_field(&envelope.iv, "bad iv")?;
    let salt: [u8; SALT_SIZE] = Envelope::decode_field(&envelope.salt, "bad salt")?;
    let tag: [u8; TAG_SIZE] = Envelope::decode_field(&envelope.tag, "bad tag")?;
    let mut buffer = Zeroizing::new(
        BASE64
            .decode(&envelope.data)
            .map_err(|_| CipherError::Malformed("bad data"))?,
    );

    let subkey = derive_subkey(key, &salt, params);
    let cipher = ChaCha20Poly1305::new_from_slice(subkey.as_ref())
        .map_err(|_| CipherError::InvalidKeySize(subkey.len()))?;

    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&nonce),
            b"",
            &mut *buffer,
            Tag::from_slice(&tag),
        )
        .map_err(|_| CipherError::Integrity)?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Low work factor keeps the suite fast; the KDF path is identical.
    fn fast() -> KdfParams {
        KdfParams::new(10).unwrap()
    }

    fn decoded(field: &str) -> Vec<u8> {
        BASE64.decode(field).unwrap()
    }

    fn flip(field: &mut String, index: usize, mask: u8) {
        let mut bytes = decoded(field);
        bytes[index] ^= mask;
        *field = BASE64.encode(bytes);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = SymmetricKey::generate().unwrap();
        let plaintext = b"ANTHROPIC_API_KEY=sk-ant-super-secret-key";

        let envelope = encrypt(&key, plaintext, &fast()).unwrap();
        assert_ne!(decoded(&envelope.data).as_slice(), plaintext);
        assert_eq!(decoded(&envelope.iv).len(), NONCE_SIZE);
        assert_eq!(decoded(&envelope.salt).len(), SALT_SIZE);
        assert_eq!(decoded(&envelope.tag).len(), TAG_SIZE);

        let decrypted = decrypt(&key, &envelope, &fast()).unwrap();
        assert_eq!(decrypted.as_slice(), plaintext);
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let key = SymmetricKey::generate().unwrap();
        let envelope = encrypt(&key, b"", &fast()).unwrap();
        assert!(envelope.data.is_empty());
        assert!(decrypt(&key, &envelope, &fast()).unwrap().is_empty());
    }

    #[test]
    fn test_default_work_factor_roundtrip() {
        let key = SymmetricKey::generate().unwrap();
        let params = KdfParams::default();
        assert_eq!(params.iterations(), DEFAULT_KDF_ITERATIONS);

        let envelope = encrypt(&key, b"notes", &params).unwrap();
        assert_eq!(decrypt(&key, &envelope, &params).unwrap().as_slice(), b"notes");
    }

    #[test]
    fn test_salt_and_nonce_fresh_per_call() {
        let key = SymmetricKey::generate().unwrap();
        let a = encrypt(&key, b"same", &fast()).unwrap();
        let b = encrypt(&key, b"same", &fast()).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = SymmetricKey::generate().unwrap();
        let envelope = encrypt(&key, b"secret data", &fast()).unwrap();

        for i in 0..decoded(&envelope.data).len() {
            let mut tampered = envelope.clone();
            flip(&mut tampered.data, i, 0x01);
            assert!(matches!(
                decrypt(&key, &tampered, &fast()),
                Err(CipherError::Integrity)
            ));
        }
    }

    #[test]
    fn test_tampered_tag_fails() {
        let key = SymmetricKey::generate().unwrap();
        let envelope = encrypt(&key, b"secret data", &fast()).unwrap();

        for i in 0..TAG_SIZE {
            let mut tampered = envelope.clone();
            flip(&mut tampered.tag, i, 0x80);
            assert!(matches!(
                decrypt(&key, &tampered, &fast()),
                Err(CipherError::Integrity)
            ));
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let key_a = SymmetricKey::generate().unwrap();
        let key_b = SymmetricKey::generate().unwrap();

        let envelope = encrypt(&key_a, b"agent A only", &fast()).unwrap();
        let err = decrypt(&key_b, &envelope, &fast()).unwrap_err();
        assert!(err.is_integrity_failure());
    }

    #[test]
    fn test_wrong_work_factor_fails() {
        let key = SymmetricKey::generate().unwrap();
        let envelope = encrypt(&key, b"payload", &fast()).unwrap();
        assert!(decrypt(&key, &envelope, &KdfParams::new(11).unwrap()).is_err());
    }

    #[test]
    fn test_truncated_fields_are_malformed() {
        let key = SymmetricKey::generate().unwrap();
        let mut envelope = encrypt(&key, b"payload", &fast()).unwrap();
        let mut tag = decoded(&envelope.tag);
        tag.pop();
        envelope.tag = BASE64.encode(tag);
        assert!(matches!(
            decrypt(&key, &envelope, &fast()),
            Err(CipherError::Malformed(_))
        ));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        assert!(matches!(KdfParams::new(0), Err(CipherError::InvalidWorkFactor)));
    }

    #[test]
    fn test_json_uses_base64_fields() {
        let key = SymmetricKey::generate().unwrap();
        let envelope = encrypt(&key, b"json me", &fast()).unwrap();

        let json = serde_json::to_value(&envelope).unwrap();
        for field in ["data", "iv", "salt", "tag"] {
            assert!(json[field].is_string(), "missing {field}");
        }

        let parsed: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(decrypt(&key, &parsed, &fast()).unwrap().as_slice(), b"json me");
    }

    #[test]
    fn test_invalid_base64_parses_but_is_malformed() {
        let key = SymmetricKey::generate().unwrap();
        let mut envelope = encrypt(&key, b"payload", &fast()).unwrap();
        envelope.data = "!!not-base64!!".to_string();

        let json = serde_json::to_value(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_value(json).unwrap();
        let err = decrypt(&key, &parsed, &fast()).unwrap_err();
        assert!(matches!(err, CipherError::Malformed(_)));
        assert!(err.is_integrity_failure());
    }
}
