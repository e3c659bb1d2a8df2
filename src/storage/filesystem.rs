//! Filesystem-backed [`S3Backend`] for local development and tests. Not
//! used in production (the real backend is always an S3-compatible
//! service), but gives the rest of the crate something to run integration
//! tests against without a MinIO container.
//!
//! Storage layout:
//! ```text
//! {root}/{bucket}/objects/{key}        # object bytes
//! {root}/{bucket}/objects/{key}.meta   # JSON sidecar: content-type, etag, user metadata
//! ```
//! Multipart upload state is held in memory only — acceptable for a
//! dev/test backend, since a process restart invalidates in-flight uploads
//! on a real backend too.

use super::traits::{
    ByteStream, CompletedPart, GetObjectResult, PutObjectRequest, S3Backend, StorageError,
    UploadPartResult,
};
use crate::types::ObjectMetadata;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::{debug, instrument};

/// ENOSPC raw error code on Linux and macOS.
const ENOSPC: i32 = 28;

fn io_to_storage_error(e: std::io::Error) -> StorageError {
    if e.raw_os_error() == Some(ENOSPC) {
        StorageError::Other("disk full".to_string())
    } else {
        StorageError::Io(e)
    }
}

async fn atomic_write(path: &Path, data: Vec<u8>) -> Result<(), StorageError> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::Other("path has no parent".to_string()))?
        .to_path_buf();
    fs::create_dir_all(&parent).await?;
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let mut tmp = NamedTempFile::new_in(&parent).map_err(io_to_storage_error)?;
        tmp.write_all(&data).map_err(io_to_storage_error)?;
        tmp.as_file().sync_all().map_err(io_to_storage_error)?;
        tmp.persist(&path)
            .map_err(|e| io_to_storage_error(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| StorageError::Other(format!("spawn_blocking join failed: {e}")))?
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaSidecar {
    content_type: Option<String>,
    etag: String,
    user_metadata: HashMap<String, String>,
}

struct PendingUpload {
    key: String,
    request: PutObjectRequest,
    parts: HashMap<i32, Bytes>,
}

pub struct FilesystemBackend {
    root: PathBuf,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    next_upload_id: Mutex<u64>,
}

impl FilesystemBackend {
    pub async fn new(root: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            uploads: Mutex::new(HashMap::new()),
            next_upload_id: Mutex::new(1),
        })
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.bucket_dir(bucket).join("objects").join(key)
    }

    fn meta_path(&self, bucket: &str, key: &str) -> PathBuf {
        let mut p = self.object_path(bucket, key).into_os_string();
        p.push(".meta");
        PathBuf::from(p)
    }

    async fn read_meta(&self, bucket: &str, key: &str) -> Result<MetaSidecar, StorageError> {
        let data = fs::read(self.meta_path(bucket, key))
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Io(e)
                }
            })?;
        serde_json::from_slice(&data)
            .map_err(|e| StorageError::Other(format!("corrupt metadata sidecar: {e}")))
    }

    async fn write_object(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: Option<String>,
        user_metadata: HashMap<String, String>,
    ) -> Result<ObjectMetadata, StorageError> {
        let etag = hex::encode(Md5::digest(&data));
        let size = data.len() as u64;

        atomic_write(&self.object_path(bucket, key), data).await?;

        let sidecar = MetaSidecar {
            content_type: content_type.clone(),
            etag: etag.clone(),
            user_metadata: user_metadata.clone(),
        };
        let json = serde_json::to_vec(&sidecar)
            .map_err(|e| StorageError::Other(format!("failed to serialize metadata: {e}")))?;
        atomic_write(&self.meta_path(bucket, key), json).await?;

        debug!("filesystem backend: wrote {bucket}/{key} ({size} bytes)");
        Ok(ObjectMetadata {
            content_type,
            etag,
            size,
            created_at: Utc::now(),
            user_metadata,
        })
    }
}

#[async_trait]
impl S3Backend for FilesystemBackend {
    #[instrument(skip(self, body, request))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        request: PutObjectRequest,
    ) -> Result<ObjectMetadata, StorageError> {
        let chunks: Vec<Bytes> = body.try_collect().await?;
        let data = chunks.concat();
        self.write_object(bucket, key, data, request.content_type, request.metadata)
            .await
    }

    #[instrument(skip(self))]
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> Result<GetObjectResult, StorageError> {
        let data = fs::read(self.object_path(bucket, key))
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Io(e)
                }
            })?;
        let sidecar = self.read_meta(bucket, key).await?;

        let slice = if let Some((start, end)) = range {
            let start = start as usize;
            let end = (end as usize + 1).min(data.len());
            data.get(start..end).unwrap_or_default().to_vec()
        } else {
            data
        };
        let content_length = Some(slice.len() as u64);

        Ok(GetObjectResult {
            body: stream::once(async move { Ok(Bytes::from(slice)) }).boxed(),
            content_length,
            content_type: sidecar.content_type,
            etag: Some(sidecar.etag),
            metadata: sidecar.user_metadata,
        })
    }

    #[instrument(skip(self))]
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, StorageError> {
        let meta = fs::metadata(self.object_path(bucket, key))
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Io(e)
                }
            })?;
        let sidecar = self.read_meta(bucket, key).await?;
        Ok(ObjectMetadata {
            content_type: sidecar.content_type,
            etag: sidecar.etag,
            size: meta.len(),
            created_at: Utc::now(),
            user_metadata: sidecar.user_metadata,
        })
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let _ = fs::remove_file(self.object_path(bucket, key)).await;
        let _ = fs::remove_file(self.meta_path(bucket, key)).await;
        Ok(())
    }

    #[instrument(skip(self, metadata))]
    async fn copy_object(
        &self,
        bucket: &str,
        source_key: &str,
        dest_key: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), StorageError> {
        let data = fs::read(self.object_path(bucket, source_key))
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StorageError::NotFound(source_key.to_string())
                } else {
                    StorageError::Io(e)
                }
            })?;
        let sidecar = self.read_meta(bucket, source_key).await?;
        self.write_object(bucket, dest_key, data, sidecar.content_type, metadata)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_objects_v2(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: u32,
        continuation_token: Option<&str>,
    ) -> Result<(Vec<(String, ObjectMetadata)>, bool, Option<String>), StorageError> {
        let dir = self.bucket_dir(bucket).join("objects");
        let mut keys = Vec::new();
        if let Ok(mut entries) = fs::read_dir(&dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !name.ends_with(".meta") && name.starts_with(prefix) {
                    keys.push(name);
                }
            }
        }
        keys.sort();
        if let Some(token) = continuation_token {
            keys.retain(|k| k.as_str() > token);
        }

        let is_truncated = (max_keys as usize) < keys.len();
        if is_truncated {
            keys.truncate(max_keys as usize);
        }
        let next_token = if is_truncated {
            keys.last().cloned()
        } else {
            None
        };

        let mut objects = Vec::with_capacity(keys.len());
        for key in &keys {
            let meta = self.head_object(bucket, key).await?;
            objects.push((key.clone(), meta));
        }

        Ok((objects, is_truncated, next_token))
    }

    #[instrument(skip(self, request))]
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        request: PutObjectRequest,
    ) -> Result<String, StorageError> {
        let id = {
            let mut counter = self.next_upload_id.lock();
            let id = *counter;
            *counter += 1;
            id
        };
        let upload_id = format!("{bucket}:{id}");
        self.uploads.lock().insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                request,
                parts: HashMap::new(),
            },
        );
        Ok(upload_id)
    }

    #[instrument(skip(self, body))]
    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadPartResult, StorageError> {
        let etag = hex::encode(Md5::digest(&body));
        let mut uploads = self.uploads.lock();
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::UploadNotFound(upload_id.to_string()))?;
        upload.parts.insert(part_number, body);
        Ok(UploadPartResult { etag })
    }

    #[instrument(skip(self, parts))]
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        _key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectMetadata, StorageError> {
        let upload = {
            let mut uploads = self.uploads.lock();
            uploads
                .remove(upload_id)
                .ok_or_else(|| StorageError::UploadNotFound(upload_id.to_string()))?
        };

        let mut data = Vec::new();
        for part in &parts {
            let chunk = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| StorageError::Other(format!("missing part {}", part.part_number)))?;
            data.extend_from_slice(chunk);
        }

        self.write_object(
            bucket,
            &upload.key,
            data,
            upload.request.content_type,
            upload.request.metadata,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.uploads.lock().remove(upload_id);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        fs::create_dir_all(self.bucket_dir(bucket).join("objects")).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let dir = self.bucket_dir(bucket).join("objects");
        let mut has_objects = false;
        if let Ok(mut entries) = fs::read_dir(&dir).await {
            has_objects = entries.next_entry().await.ok().flatten().is_some();
        }
        if has_objects {
            return Err(StorageError::BucketNotEmpty(bucket.to_string()));
        }
        let _ = fs::remove_dir_all(self.bucket_dir(bucket)).await;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_buckets(&self) -> Result<Vec<String>, StorageError> {
        let mut buckets = Vec::new();
        if let Ok(mut entries) = fs::read_dir(&self.root).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    buckets.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
        }
        Ok(buckets)
    }

    #[instrument(skip(self))]
    async fn head_bucket(&self, bucket: &str) -> Result<bool, StorageError> {
        Ok(fs::try_exists(self.bucket_dir(bucket)).await.unwrap_or(false))
    }
}
