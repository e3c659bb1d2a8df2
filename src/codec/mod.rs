//! Stream Codec (§4.B): the low-level symmetric-crypto primitives. Two
//! families — one-shot AES-256-GCM ([`envelope`]) and streaming AES-256-CTR
//! with a chained HMAC-SHA256 integrity tag ([`streaming`]).

pub mod envelope;
pub mod streaming;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("integrity check failed")]
    IntegrityError,
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("invalid IV length: expected {expected} bytes, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },
    #[error("CTR block counter capacity exceeded")]
    CapacityExceeded,
    #[error("AEAD operation failed: {0}")]
    Aead(String),
}
