//! S3 Backend Adapter (§4.G): the interface to the real S3-compatible
//! object store sitting behind the proxy. Pure passthrough of bytes and
//! metadata — encryption/decryption happens strictly on the core side of
//! this trait, never here.
//!
//! Cancellation is structural: every method is a plain `async fn` and a
//! caller cancels an in-flight call the ordinary Tokio way, by dropping the
//! future (e.g. the client disconnects and the handler's task is aborted).
//! No operation here needs a cooperative cancellation checkpoint of its own.

use crate::types::ObjectMetadata;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("bucket not empty: {0}")]
    BucketNotEmpty(String),

    #[error("upload not found: {0}")]
    UploadNotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("S3 error: {0}")]
    S3(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Other(String),
}

pub type ByteStream = BoxStream<'static, Result<Bytes, StorageError>>;

#[derive(Debug, Clone, Default)]
pub struct PutObjectRequest {
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

#[derive(Debug, Clone)]
pub struct UploadPartResult {
    pub etag: String,
}

#[derive(Debug, Clone)]
pub struct GetObjectResult {
    pub body: ByteStream,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Abstract interface to an S3-compatible backend. Object-safe so it can be
/// used behind `Arc<dyn S3Backend>`.
#[async_trait]
pub trait S3Backend: Send + Sync {
    // === Object operations ===

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        request: PutObjectRequest,
    ) -> Result<ObjectMetadata, StorageError>;

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> Result<GetObjectResult, StorageError>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, StorageError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    async fn copy_object(
        &self,
        bucket: &str,
        source_key: &str,
        dest_key: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError>;

    async fn list_objects_v2(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: u32,
        continuation_token: Option<&str>,
    ) -> Result<(Vec<(String, ObjectMetadata)>, bool, Option<String>), StorageError>;

    // === Multipart operations ===

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        request: PutObjectRequest,
    ) -> Result<String, StorageError>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadPartResult, StorageError>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectMetadata, StorageError>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError>;

    // === Bucket passthroughs ===

    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError>;
    async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError>;
    async fn list_buckets(&self) -> Result<Vec<String>, StorageError>;
    async fn head_bucket(&self, bucket: &str) -> Result<bool, StorageError>;
}

/// Blanket forward so `Arc<dyn S3Backend>` can itself be used as an
/// `S3Backend` (mirrors the teacher's box-forwarding macro).
macro_rules! impl_s3_backend_for_arc {
    () => {
        #[async_trait]
        impl S3Backend for std::sync::Arc<dyn S3Backend> {
            async fn put_object(&self, bucket: &str, key: &str, body: ByteStream, request: PutObjectRequest) -> Result<ObjectMetadata, StorageError> {
                (**self).put_object(bucket, key, body, request).await
            }
            async fn get_object(&self, bucket: &str, key: &str, range: Option<(u64, u64)>) -> Result<GetObjectResult, StorageError> {
                (**self).get_object(bucket, key, range).await
            }
            async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, StorageError> {
                (**self).head_object(bucket, key).await
            }
            async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
                (**self).delete_object(bucket, key).await
            }
            async fn copy_object(&self, bucket: &str, source_key: &str, dest_key: &str, metadata: HashMap<String, String>) -> Result<(), StorageError> {
                (**self).copy_object(bucket, source_key, dest_key, metadata).await
            }
            async fn list_objects_v2(&self, bucket: &str, prefix: &str, max_keys: u32, continuation_token: Option<&str>) -> Result<(Vec<(String, ObjectMetadata)>, bool, Option<String>), StorageError> {
                (**self).list_objects_v2(bucket, prefix, max_keys, continuation_token).await
            }
            async fn create_multipart_upload(&self, bucket: &str, key: &str, request: PutObjectRequest) -> Result<String, StorageError> {
                (**self).create_multipart_upload(bucket, key, request).await
            }
            async fn upload_part(&self, bucket: &str, key: &str, upload_id: &str, part_number: i32, body: Bytes) -> Result<UploadPartResult, StorageError> {
                (**self).upload_part(bucket, key, upload_id, part_number, body).await
            }
            async fn complete_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str, parts: Vec<CompletedPart>) -> Result<ObjectMetadata, StorageError> {
                (**self).complete_multipart_upload(bucket, key, upload_id, parts).await
            }
            async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), StorageError> {
                (**self).abort_multipart_upload(bucket, key, upload_id).await
            }
            async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> { (**self).create_bucket(bucket).await }
            async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError> { (**self).delete_bucket(bucket).await }
            async fn list_buckets(&self) -> Result<Vec<String>, StorageError> { (**self).list_buckets().await }
            async fn head_bucket(&self, bucket: &str) -> Result<bool, StorageError> { (**self).head_bucket(bucket).await }
        }
    };
}

impl_s3_backend_for_arc!();
