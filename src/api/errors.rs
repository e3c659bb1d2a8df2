//! S3 error types and XML responses (§7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// S3 API errors, extended with the envelope-encryption-specific codes
/// from §7: `InvalidPart`, `NotSupportedWithEncryption`, `KeyUnavailable`,
/// `IntegrityError`, `BackendError`, `Cancelled`, `Fatal`.
#[derive(Debug, Clone, Error)]
pub enum S3Error {
    #[error("NoSuchKey: The specified key does not exist.")]
    NoSuchKey(String),

    #[error("NoSuchBucket: The specified bucket does not exist.")]
    NoSuchBucket(String),

    #[error("NoSuchUpload: The specified upload does not exist.")]
    NoSuchUpload(String),

    #[error("BucketNotEmpty: The bucket you tried to delete is not empty.")]
    BucketNotEmpty(String),

    #[error("BucketAlreadyExists: The requested bucket name is not available.")]
    BucketAlreadyExists(String),

    #[error("EntityTooLarge: Your proposed upload exceeds the maximum allowed size.")]
    EntityTooLarge { size: u64, max: u64 },

    #[error("InternalError: We encountered an internal error. Please try again.")]
    InternalError(String),

    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    #[error("InvalidRequest: {0}")]
    InvalidRequest(String),

    #[error("MalformedXML: The XML you provided was not well-formed.")]
    MalformedXML,

    /// Complete-time part validation failure: unknown part, etag mismatch,
    /// non-ascending order, or a non-final part of the wrong size.
    #[error("InvalidPart: {0}")]
    InvalidPart(String),

    /// `CopyObject`/`UploadPartCopy` against an encryption-enabled proxy —
    /// a custom (non-AWS) error code, per §7.
    #[error("NotSupportedWithEncryption: server-side copy of encrypted objects is not supported.")]
    NotSupportedWithEncryption,

    /// The key fingerprint recorded on an object doesn't match any key the
    /// configured key provider currently holds.
    #[error("KeyUnavailable: the key used to encrypt this object is not available.")]
    KeyUnavailable(String),

    /// GCM tag or chained-HMAC mismatch.
    #[error("IntegrityError: ciphertext failed integrity verification.")]
    IntegrityError,

    /// Any backend call failure not mapped to a more specific code above.
    #[error("BackendError: {0}")]
    BackendError(String),

    /// Self-copy after `CompleteMultipartUpload` failed to stamp envelope
    /// metadata. Never reported as a 2xx — see §5/§7.
    #[error("InternalError: upload completed but metadata could not be applied: {0}")]
    Fatal(String),

    /// No credentials, or the request targets a resource the caller isn't
    /// authorized for.
    #[error("AccessDenied: Access Denied.")]
    AccessDenied,

    /// SigV4 signature verification failed.
    #[error("SignatureDoesNotMatch: The request signature we calculated does not match the signature you provided.")]
    SignatureDoesNotMatch,
}

impl S3Error {
    /// Get the S3 error code
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::NoSuchKey(_) => "NoSuchKey",
            S3Error::NoSuchBucket(_) => "NoSuchBucket",
            S3Error::NoSuchUpload(_) => "NoSuchUpload",
            S3Error::BucketNotEmpty(_) => "BucketNotEmpty",
            S3Error::BucketAlreadyExists(_) => "BucketAlreadyExists",
            S3Error::EntityTooLarge { .. } => "EntityTooLarge",
            S3Error::InternalError(_) => "InternalError",
            S3Error::InvalidArgument(_) => "InvalidArgument",
            S3Error::InvalidRequest(_) => "InvalidRequest",
            S3Error::MalformedXML => "MalformedXML",
            S3Error::InvalidPart(_) => "InvalidPart",
            S3Error::NotSupportedWithEncryption => "NotSupportedWithEncryption",
            S3Error::KeyUnavailable(_) => "KeyUnavailable",
            S3Error::IntegrityError => "IntegrityError",
            S3Error::BackendError(_) => "BackendError",
            S3Error::Fatal(_) => "InternalError",
            S3Error::AccessDenied => "AccessDenied",
            S3Error::SignatureDoesNotMatch => "SignatureDoesNotMatch",
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            S3Error::NoSuchKey(_) => StatusCode::NOT_FOUND,
            S3Error::NoSuchBucket(_) => StatusCode::NOT_FOUND,
            S3Error::NoSuchUpload(_) => StatusCode::NOT_FOUND,
            S3Error::BucketNotEmpty(_) => StatusCode::CONFLICT,
            S3Error::BucketAlreadyExists(_) => StatusCode::CONFLICT,
            S3Error::EntityTooLarge { .. } => StatusCode::BAD_REQUEST,
            S3Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            S3Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            S3Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            S3Error::MalformedXML => StatusCode::BAD_REQUEST,
            S3Error::InvalidPart(_) => StatusCode::BAD_REQUEST,
            S3Error::NotSupportedWithEncryption => StatusCode::UNPROCESSABLE_ENTITY,
            S3Error::KeyUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            S3Error::IntegrityError => StatusCode::FORBIDDEN,
            S3Error::BackendError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            S3Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            S3Error::AccessDenied => StatusCode::FORBIDDEN,
            S3Error::SignatureDoesNotMatch => StatusCode::FORBIDDEN,
        }
    }

    /// Generate XML error response
    pub fn to_xml(&self) -> String {
        let resource = match self {
            S3Error::NoSuchKey(key) => key.clone(),
            S3Error::NoSuchBucket(bucket) => bucket.clone(),
            S3Error::NoSuchUpload(upload_id) => upload_id.clone(),
            _ => String::new(),
        };

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Error>
    <Code>{}</Code>
    <Message>{}</Message>
    <Resource>{}</Resource>
    <RequestId>00000000-0000-0000-0000-000000000000</RequestId>
</Error>"#,
            self.code(),
            self,
            resource
        )
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.to_xml();

        if matches!(self, S3Error::KeyUnavailable(_) | S3Error::Fatal(_)) {
            tracing::error!(error = %self, "request failed");
        }

        (status, [("Content-Type", "application/xml")], body).into_response()
    }
}

impl From<crate::storage::StorageError> for S3Error {
    fn from(err: crate::storage::StorageError) -> Self {
        match err {
            crate::storage::StorageError::NotFound(key) => S3Error::NoSuchKey(key),
            crate::storage::StorageError::BucketNotFound(b) => S3Error::NoSuchBucket(b),
            crate::storage::StorageError::BucketNotEmpty(b) => S3Error::BucketNotEmpty(b),
            crate::storage::StorageError::UploadNotFound(id) => S3Error::NoSuchUpload(id),
            crate::storage::StorageError::PreconditionFailed(msg) => {
                S3Error::InvalidRequest(msg)
            }
            other => S3Error::BackendError(other.to_string()),
        }
    }
}

impl From<crate::multipart::MultipartError> for S3Error {
    fn from(err: crate::multipart::MultipartError) -> Self {
        use crate::multipart::MultipartError as E;
        match err {
            E::NoSuchUpload(id) => S3Error::NoSuchUpload(id),
            E::InvalidPartNumber => {
                S3Error::InvalidArgument("part number must be between 1 and 10000".to_string())
            }
            other => S3Error::InvalidPart(other.to_string()),
        }
    }
}

impl From<crate::orchestrator::OrchestratorError> for S3Error {
    fn from(err: crate::orchestrator::OrchestratorError) -> Self {
        use crate::orchestrator::OrchestratorError as E;
        match err {
            E::BadRequest(msg) => S3Error::InvalidRequest(msg),
            E::Storage(e) => e.into(),
            E::Multipart(crate::multipart::MultipartError::NoSuchUpload(id)) => {
                S3Error::NoSuchUpload(id)
            }
            E::Multipart(crate::multipart::MultipartError::InvalidPartNumber) => {
                S3Error::InvalidArgument("part number must be between 1 and 10000".to_string())
            }
            E::Multipart(other) => S3Error::InvalidPart(other.to_string()),
            E::KeyUnavailable(fp) => S3Error::KeyUnavailable(fp),
            E::Integrity => S3Error::IntegrityError,
            E::Fatal(msg) => S3Error::Fatal(msg),
            other => S3Error::InternalError(other.to_string()),
        }
    }
}
