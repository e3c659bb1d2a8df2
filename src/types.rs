//! Core types shared across the proxy: object-key parsing/validation and the
//! envelope-encryption metadata schema stamped on stored objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Tool version identifier — uses crate name and version from Cargo.toml
pub const S3EP_TOOL: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Envelope-encryption metadata key names and the full `x-amz-meta-{prefix}{key}`
/// header names derived from them. The header names below assume the default
/// prefix (`s3ep-`); a non-default prefix is handled at the call site since it's
/// a runtime config value, not a compile-time constant.
///
/// The `H_*` constants exist so storage/handlers code never has to hand-assemble
/// `x-amz-meta-s3ep-*` and risk a typo diverging from the bare key.
pub mod meta_keys {
    pub const DEFAULT_PREFIX: &str = "s3ep-";

    pub const ENCRYPTED_DEK: &str = "encrypted-dek";
    pub const KEY_FINGERPRINT: &str = "key-fingerprint";
    pub const DEK_ALGORITHM: &str = "dek-algorithm";
    pub const IV: &str = "iv";
    pub const HMAC: &str = "hmac";
    pub const SEGMENT_SIZE: &str = "segment-size";
    pub const PLAINTEXT_LENGTH: &str = "plaintext-length";
    pub const PARTS_COUNT: &str = "parts-count";

    /// S3 response header prefix for user-defined metadata.
    pub const AMZ_META_PREFIX: &str = "x-amz-meta-";

    // Full x-amz-meta-s3ep-* header names under the default prefix, derived
    // from the bare keys to prevent desync.
    pub const H_ENCRYPTED_DEK: &str = concat!("x-amz-meta-", "s3ep-", "encrypted-dek");
    pub const H_KEY_FINGERPRINT: &str = concat!("x-amz-meta-", "s3ep-", "key-fingerprint");
    pub const H_DEK_ALGORITHM: &str = concat!("x-amz-meta-", "s3ep-", "dek-algorithm");
    pub const H_IV: &str = concat!("x-amz-meta-", "s3ep-", "iv");
    pub const H_HMAC: &str = concat!("x-amz-meta-", "s3ep-", "hmac");
    pub const H_SEGMENT_SIZE: &str = concat!("x-amz-meta-", "s3ep-", "segment-size");
    pub const H_PLAINTEXT_LENGTH: &str = concat!("x-amz-meta-", "s3ep-", "plaintext-length");
    pub const H_PARTS_COUNT: &str = concat!("x-amz-meta-", "s3ep-", "parts-count");

    /// The AES-GCM envelope force Content-Type sentinel (§4.D). Interpreted
    /// and stripped by the proxy, never forwarded to the backend.
    pub const FORCE_GCM_CONTENT_TYPE: &str = "application/x-s3ep-force-aes-gcm";
    /// The AES-256-CTR force Content-Type sentinel (§4.D).
    pub const FORCE_CTR_CONTENT_TYPE: &str = "application/x-s3ep-force-aes-ctr";
}

/// Errors that can occur when validating user-provided bucket/key inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValidationError(String);

impl fmt::Display for KeyValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for KeyValidationError {}

/// S3 object key parsed into components
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Bucket name
    pub bucket: String,
    /// Parent path (empty string for root)
    pub prefix: String,
    /// Object filename
    pub filename: String,
}

impl ObjectKey {
    /// Parse a full S3-style key into components
    pub fn parse(bucket: &str, key: &str) -> Self {
        let key = key.trim_start_matches('/');
        let (prefix, filename) = match key.rfind('/') {
            Some(idx) => (key[..idx].to_string(), key[idx + 1..].to_string()),
            None => (String::new(), key.to_string()),
        };
        Self {
            bucket: bucket.to_string(),
            prefix,
            filename,
        }
    }

    /// Get the full key (prefix + filename)
    pub fn full_key(&self) -> String {
        if self.prefix.is_empty() {
            self.filename.clone()
        } else {
            format!("{}/{}", self.prefix, self.filename)
        }
    }

    /// Validate this key for object operations (PUT/GET/HEAD/DELETE).
    pub fn validate_object(&self) -> Result<(), KeyValidationError> {
        validate_key_path(&self.prefix, true)?;
        validate_key_path(&self.filename, false)?;
        if self.filename.is_empty() {
            return Err(KeyValidationError(
                "Object key must not be empty".to_string(),
            ));
        }
        if self.filename == "." || self.filename == ".." {
            return Err(KeyValidationError("Invalid object filename".to_string()));
        }
        Ok(())
    }

    /// Validate a list/query prefix for traversal and encoding hazards.
    pub fn validate_prefix(prefix: &str) -> Result<(), KeyValidationError> {
        validate_key_path(prefix, true)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.full_key())
    }
}

fn validate_key_path(value: &str, allow_slashes: bool) -> Result<(), KeyValidationError> {
    if value.contains('\0') {
        return Err(KeyValidationError(
            "Key must not contain NUL bytes".to_string(),
        ));
    }
    if value.contains('\\') {
        return Err(KeyValidationError(
            "Key must not contain backslashes".to_string(),
        ));
    }
    if !allow_slashes && value.contains('/') {
        return Err(KeyValidationError("Key must not contain '/'".to_string()));
    }

    for segment in value.split('/') {
        if segment == ".." {
            return Err(KeyValidationError(
                "Key must not contain '..' path segments".to_string(),
            ));
        }
    }

    Ok(())
}

/// The on-the-wire algorithm tag stored in `dek-algorithm` metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DekAlgorithm {
    AesGcm,
    Aes256Ctr,
}

impl DekAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DekAlgorithm::AesGcm => "aes-gcm",
            DekAlgorithm::Aes256Ctr => "aes-256-ctr",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aes-gcm" => Some(DekAlgorithm::AesGcm),
            "aes-256-ctr" => Some(DekAlgorithm::Aes256Ctr),
            _ => None,
        }
    }
}

/// Envelope-encryption attributes attached to a stored object, parsed from /
/// serialized into the object's user-metadata map. Absence of this struct
/// (no `dek-algorithm` key) means the object is unencrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeMetadata {
    pub encrypted_dek: Vec<u8>,
    pub key_fingerprint: String,
    pub algorithm: DekAlgorithm,
    pub iv: Vec<u8>,
    /// Present iff `algorithm == Aes256Ctr`.
    pub hmac: Option<Vec<u8>>,
    /// Present iff `algorithm == Aes256Ctr`.
    pub segment_size: Option<u64>,
    /// Present iff `algorithm == AesGcm` (stored length differs from plaintext by the tag).
    pub plaintext_length: Option<u64>,
    /// Present iff this object was assembled from a multipart upload.
    pub parts_count: Option<u32>,
}

impl EnvelopeMetadata {
    /// Extract envelope metadata from a generic user-metadata map (bare keys,
    /// no `x-amz-meta-` / prefix applied — the storage layer strips those).
    /// Returns `Ok(None)` for an unencrypted object, and a validation error
    /// if `encrypted-dek` is present without `dek-algorithm` (fail closed,
    /// per the invariant in SPEC_FULL.md).
    pub fn from_metadata_map(
        map: &HashMap<String, String>,
        prefix: &str,
    ) -> Result<Option<Self>, EnvelopeParseError> {
        let get = |k: &str| map.get(&format!("{prefix}{k}")).cloned();

        let algorithm = match get(meta_keys::DEK_ALGORITHM) {
            Some(a) => a,
            None => {
                if get(meta_keys::ENCRYPTED_DEK).is_some() {
                    return Err(EnvelopeParseError::MissingAlgorithm);
                }
                return Ok(None);
            }
        };
        let algorithm = DekAlgorithm::parse(&algorithm)
            .ok_or_else(|| EnvelopeParseError::UnknownAlgorithm(algorithm.clone()))?;

        let encrypted_dek = get(meta_keys::ENCRYPTED_DEK)
            .ok_or(EnvelopeParseError::MissingField(meta_keys::ENCRYPTED_DEK))?;
        let encrypted_dek = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            encrypted_dek,
        )
        .map_err(|_| EnvelopeParseError::BadEncoding(meta_keys::ENCRYPTED_DEK))?;

        let key_fingerprint = get(meta_keys::KEY_FINGERPRINT)
            .ok_or(EnvelopeParseError::MissingField(meta_keys::KEY_FINGERPRINT))?;

        let iv = get(meta_keys::IV).ok_or(EnvelopeParseError::MissingField(meta_keys::IV))?;
        let iv = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, iv)
            .map_err(|_| EnvelopeParseError::BadEncoding(meta_keys::IV))?;

        let (hmac, segment_size) = if algorithm == DekAlgorithm::Aes256Ctr {
            let hmac = get(meta_keys::HMAC).ok_or(EnvelopeParseError::MissingField(meta_keys::HMAC))?;
            let hmac = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, hmac)
                .map_err(|_| EnvelopeParseError::BadEncoding(meta_keys::HMAC))?;
            let segment_size = get(meta_keys::SEGMENT_SIZE)
                .ok_or(EnvelopeParseError::MissingField(meta_keys::SEGMENT_SIZE))?
                .parse::<u64>()
                .map_err(|_| EnvelopeParseError::BadEncoding(meta_keys::SEGMENT_SIZE))?;
            (Some(hmac), Some(segment_size))
        } else {
            (None, None)
        };

        let plaintext_length = if algorithm == DekAlgorithm::AesGcm {
            Some(
                get(meta_keys::PLAINTEXT_LENGTH)
                    .ok_or(EnvelopeParseError::MissingField(meta_keys::PLAINTEXT_LENGTH))?
                    .parse::<u64>()
                    .map_err(|_| EnvelopeParseError::BadEncoding(meta_keys::PLAINTEXT_LENGTH))?,
            )
        } else {
            None
        };

        let parts_count = get(meta_keys::PARTS_COUNT)
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|_| EnvelopeParseError::BadEncoding(meta_keys::PARTS_COUNT))?;

        Ok(Some(Self {
            encrypted_dek,
            key_fingerprint,
            algorithm,
            iv,
            hmac,
            segment_size,
            plaintext_length,
            parts_count,
        }))
    }

    /// Serialize back into a bare-key metadata map (no prefix applied).
    pub fn to_metadata_map(&self) -> HashMap<String, String> {
        use base64::Engine;
        let b64 = base64::engine::general_purpose::STANDARD;
        let mut map = HashMap::new();
        map.insert(
            meta_keys::ENCRYPTED_DEK.to_string(),
            b64.encode(&self.encrypted_dek),
        );
        map.insert(
            meta_keys::KEY_FINGERPRINT.to_string(),
            self.key_fingerprint.clone(),
        );
        map.insert(
            meta_keys::DEK_ALGORITHM.to_string(),
            self.algorithm.as_str().to_string(),
        );
        map.insert(meta_keys::IV.to_string(), b64.encode(&self.iv));
        if let Some(hmac) = &self.hmac {
            map.insert(meta_keys::HMAC.to_string(), b64.encode(hmac));
        }
        if let Some(size) = self.segment_size {
            map.insert(meta_keys::SEGMENT_SIZE.to_string(), size.to_string());
        }
        if let Some(len) = self.plaintext_length {
            map.insert(meta_keys::PLAINTEXT_LENGTH.to_string(), len.to_string());
        }
        if let Some(count) = self.parts_count {
            map.insert(meta_keys::PARTS_COUNT.to_string(), count.to_string());
        }
        map
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EnvelopeParseError {
    #[error("encrypted-dek present without dek-algorithm")]
    MissingAlgorithm,
    #[error("unknown dek-algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("missing envelope metadata field: {0}")]
    MissingField(&'static str),
    #[error("malformed envelope metadata field: {0}")]
    BadEncoding(&'static str),
}

/// Object metadata as returned by the S3 Backend Adapter: whatever the
/// backend reports for an object, independent of whether it happens to
/// carry an encryption envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub content_type: Option<String>,
    pub etag: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub user_metadata: HashMap<String, String>,
}

impl ObjectMetadata {
    pub fn etag_quoted(&self) -> String {
        format!("\"{}\"", self.etag)
    }
}
