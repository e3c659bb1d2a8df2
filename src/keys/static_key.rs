//! Static-key provider: wraps DEKs with a single long-lived AES-256 key
//! supplied at startup (e.g. from config or an environment variable).
//!
//! Wrapping is AES-256-GCM sealing of the DEK under the wrapping key with a
//! random 12-byte nonce prepended to the ciphertext — this reuses the same
//! AEAD primitive as the envelope codec rather than pulling in a dedicated
//! key-wrap crate, and gives the same authenticated-wrap property RFC 3394
//! key-wrap provides.

use super::{Dek, KeyProvider, KeyProviderError};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::instrument;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;

pub struct StaticKeyProvider {
    key: Zeroizing<[u8; 32]>,
    fingerprint: String,
}

impl StaticKeyProvider {
    /// `key` must be exactly 32 bytes (AES-256). The fingerprint is a SHA-256
    /// of the key material, hex-encoded and truncated to 16 characters —
    /// stable across restarts as long as the key doesn't change, and never
    /// reversible to the key itself.
    pub fn new(key: [u8; 32]) -> Self {
        let fingerprint = hex::encode(Sha256::digest(key))[..16].to_string();
        Self {
            key: Zeroizing::new(key),
            fingerprint,
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new_from_slice(self.key.as_slice()).expect("key is exactly 32 bytes")
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    #[instrument(skip(self, dek))]
    async fn wrap(&self, dek: &[u8]) -> Result<Vec<u8>, KeyProviderError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, dek)
            .map_err(|e| KeyProviderError::WrapFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    #[instrument(skip(self, wrapped))]
    async fn unwrap(&self, wrapped: &[u8], fingerprint: &str) -> Result<Dek, KeyProviderError> {
        if fingerprint != self.fingerprint {
            return Err(KeyProviderError::KeyUnavailable(fingerprint.to_string()));
        }
        if wrapped.len() < NONCE_LEN {
            return Err(KeyProviderError::UnwrapFailed(
                "wrapped key shorter than nonce".to_string(),
            ));
        }
        let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher()
            .decrypt(nonce, ciphertext)
            .map_err(|e| KeyProviderError::UnwrapFailed(e.to_string()))
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> StaticKeyProvider {
        StaticKeyProvider::new([0x42; 32])
    }

    #[tokio::test]
    async fn wrap_unwrap_roundtrip() {
        let p = provider();
        let dek = vec![7u8; 32];
        let wrapped = p.wrap(&dek).await.unwrap();
        assert_ne!(wrapped, dek);
        let unwrapped = p.unwrap(&wrapped, p.fingerprint()).await.unwrap();
        assert_eq!(unwrapped, dek);
    }

    #[tokio::test]
    async fn unwrap_rejects_unknown_fingerprint() {
        let p = provider();
        let dek = vec![7u8; 32];
        let wrapped = p.wrap(&dek).await.unwrap();
        let err = p.unwrap(&wrapped, "not-the-right-fp").await.unwrap_err();
        assert!(matches!(err, KeyProviderError::KeyUnavailable(_)));
    }

    #[tokio::test]
    async fn wrap_is_nondeterministic() {
        let p = provider();
        let dek = vec![7u8; 32];
        let a = p.wrap(&dek).await.unwrap();
        let b = p.wrap(&dek).await.unwrap();
        assert_ne!(a, b, "random nonce should vary per call");
    }

    #[test]
    fn fingerprint_stable_for_same_key() {
        let a = StaticKeyProvider::new([9u8; 32]);
        let b = StaticKeyProvider::new([9u8; 32]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
