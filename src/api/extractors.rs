//! Custom Axum extractors for S3 API validation
//!
//! Bucket names are taken from each request and passed straight through to
//! the backend (§4.G) — the proxy doesn't remap or restrict a bucket
//! namespace of its own. These extractors only reject shapes that would be
//! unsafe to forward (NUL bytes, backslashes, `..` segments), the same rule
//! [`crate::types::ObjectKey`] applies to object keys.

use super::errors::S3Error;
use super::handlers::AppState;
use crate::types::ObjectKey;
use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts, Path},
    http::request::Parts,
};
use std::sync::Arc;

fn validate_bucket_name(bucket: &str) -> Result<(), S3Error> {
    if bucket.is_empty() {
        return Err(S3Error::InvalidArgument("bucket name must not be empty".to_string()));
    }
    ObjectKey::validate_prefix(bucket)
        .map_err(|e| S3Error::InvalidArgument(format!("invalid bucket name: {e}")))
}

/// Validated bucket extractor: rejects only unsafe bucket-name shapes, not
/// an allow-list of bucket names.
#[derive(Debug, Clone)]
pub struct ValidatedBucket(pub String);

impl std::ops::Deref for ValidatedBucket {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for ValidatedBucket
where
    S: Send + Sync,
    Arc<AppState>: FromRef<S>,
{
    type Rejection = S3Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(bucket): Path<String> = Path::from_request_parts(parts, state)
            .await
            .map_err(|_| S3Error::InvalidArgument("Invalid bucket path".to_string()))?;

        validate_bucket_name(&bucket)?;

        Ok(ValidatedBucket(bucket))
    }
}

/// Validated bucket and key extractor: validates the bucket name shape and
/// normalizes the key by removing leading slashes.
#[derive(Debug, Clone)]
pub struct ValidatedPath {
    pub bucket: String,
    pub key: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for ValidatedPath
where
    S: Send + Sync,
    Arc<AppState>: FromRef<S>,
{
    type Rejection = S3Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path((bucket, key)): Path<(String, String)> = Path::from_request_parts(parts, state)
            .await
            .map_err(|_| S3Error::InvalidArgument("Invalid bucket/key path".to_string()))?;

        validate_bucket_name(&bucket)?;

        let key = key.trim_start_matches('/').to_string();

        Ok(ValidatedPath { bucket, key })
    }
}
