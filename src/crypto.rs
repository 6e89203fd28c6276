//! Symmetric sealing for session documents
//!
//! The secure session variant wraps its serialized document in a
//! [`CryptoBox`]. The shipped box is AES-256-GCM with a random 96-bit nonce;
//! its text form is base64url (no padding) of `nonce || ciphertext || tag`.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Seal/open contract for opaque text blobs
#[async_trait]
pub trait CryptoBox: Send + Sync + 'static {
    /// Encrypt and encode `plaintext` as transport-safe text
    async fn seal(&self, plaintext: &[u8]) -> Result<String>;

    /// Decode and decrypt text produced by [`seal`](Self::seal)
    async fn open(&self, sealed: &str) -> Result<Vec<u8>>;
}

/// AES-256-GCM box
pub struct AesGcmBox {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for AesGcmBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmBox").finish_non_exhaustive()
    }
}

impl AesGcmBox {
    /// Build from a raw 256-bit key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] if the key is rejected.
    pub fn from_key(key: &[u8; 32]) -> Result<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| Error::Crypto("invalid AES-256-GCM key".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Derive the key as SHA-256 of a configured secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the secret is empty.
    pub fn from_secret(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Config("session secret must not be empty".to_string()));
        }
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self::from_key(&key)
    }
}

#[async_trait]
impl CryptoBox for AesGcmBox {
    async fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| Error::Crypto("nonce generation failed".to_string()))?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| Error::Crypto("encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    async fn open(&self, sealed: &str) -> Result<Vec<u8>> {
        let bytes = URL_SAFE_NO_PAD
            .decode(sealed.trim())
            .map_err(|e| Error::Crypto(format!("sealed value is not base64url: {e}")))?;
        if bytes.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(Error::Crypto("sealed value too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| Error::Crypto("invalid nonce".to_string()))?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| Error::Crypto("decryption failed".to_string()))?;
        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seal_then_open_recovers_plaintext() {
        let sealer = AesGcmBox::from_secret("correct horse").unwrap();
        let sealed = sealer.seal(b"{\"id\":\"x\"}").await.unwrap();
        assert!(!sealed.contains('='));
        assert_eq!(sealer.open(&sealed).await.unwrap(), b"{\"id\":\"x\"}");
    }

    #[tokio::test]
    async fn nonces_differ_between_seals() {
        let sealer = AesGcmBox::from_key(&[7u8; 32]).unwrap();
        let a = sealer.seal(b"same").await.unwrap();
        let b = sealer.seal(b"same").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn wrong_key_and_tampering_fail() {
        let sealer = AesGcmBox::from_secret("one").unwrap();
        let other = AesGcmBox::from_secret("two").unwrap();
        let sealed = sealer.seal(b"payload").await.unwrap();
        assert!(matches!(other.open(&sealed).await, Err(Error::Crypto(_))));

        let mut raw = URL_SAFE_NO_PAD.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(raw);
        assert!(sealer.open(&tampered).await.is_err());
        assert!(sealer.open("short").await.is_err());
    }

    #[test]
    fn empty_secret_rejected() {
        assert!(matches!(AesGcmBox::from_secret(""), Err(Error::Config(_))));
    }
}
