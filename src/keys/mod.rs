//! Key Provider (§4.A): wraps/unwraps data-encryption keys and exposes a
//! stable fingerprint for the wrapping key. Three implementations —
//! static AES key-wrap, an opaque KMS RPC trait object, and an identity
//! `none` provider that disables the crypto path entirely.

mod kms;
mod none;
mod static_key;

pub use kms::{KmsClient, KmsKeyProvider};
pub use none::NoneKeyProvider;
pub use static_key::StaticKeyProvider;

use async_trait::async_trait;

/// A 256-bit data-encryption key. Zeroized on drop by callers that own one
/// (the DEK itself is a plain `Vec<u8>` here; ownership types that embed it,
/// like multipart sessions, derive `ZeroizeOnDrop`).
pub type Dek = Vec<u8>;

#[derive(Debug, thiserror::Error)]
pub enum KeyProviderError {
    #[error("key material unavailable for fingerprint {0}")]
    KeyUnavailable(String),
    #[error("key wrap operation failed: {0}")]
    WrapFailed(String),
    #[error("key unwrap operation failed: {0}")]
    UnwrapFailed(String),
    #[error("backing key-management service error: {0}")]
    Backend(String),
}

/// A provider of key-wrapping operations for DEKs. Implementations never see
/// plaintext object data — they only wrap/unwrap the (much smaller) DEK.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Wrap a plaintext DEK under this provider's key material.
    async fn wrap(&self, dek: &[u8]) -> Result<Vec<u8>, KeyProviderError>;

    /// Unwrap a previously wrapped DEK. `fingerprint` identifies which key
    /// version produced `wrapped`; an unrecognized fingerprint is
    /// `KeyUnavailable`.
    async fn unwrap(&self, wrapped: &[u8], fingerprint: &str) -> Result<Dek, KeyProviderError>;

    /// Stable fingerprint of the current wrapping key, recorded on every
    /// encrypted object so a later `unwrap` call knows which key to use.
    fn fingerprint(&self) -> &str;

    /// Whether this provider disables the crypto path entirely (the `none`
    /// provider). The orchestrator uses this to skip envelope metadata
    /// generation altogether rather than writing an all-empty envelope.
    fn is_identity(&self) -> bool {
        false
    }
}
