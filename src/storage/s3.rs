//! S3-compatible backend implementation of [`S3Backend`] using the AWS SDK.

use super::traits::{
    ByteStream, CompletedPart, GetObjectResult, PutObjectRequest, S3Backend, StorageError,
    UploadPartResult,
};
use crate::config::BackendConfig;
use crate::types::ObjectMetadata;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream as SdkByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as SdkCompletedPart, MetadataDirective};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use tracing::{debug, instrument};

pub struct S3BackendClient {
    client: Client,
}

impl S3BackendClient {
    /// Create a new backend client from configuration.
    pub async fn new(config: &BackendConfig) -> Result<Self, StorageError> {
        let BackendConfig::S3 {
            endpoint,
            region,
            force_path_style,
            access_key_id,
            secret_access_key,
            ..
        } = config
        else {
            return Err(StorageError::Other(
                "S3BackendClient requires S3 configuration".to_string(),
            ));
        };

        let mut config_loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region.clone()));

        if let Some(ep) = endpoint {
            config_loader = config_loader.endpoint_url(ep);
        }

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials = Credentials::new(key_id, secret, None, None, "s3ep-config");
            config_loader = config_loader.credentials_provider(credentials);
        }

        let sdk_config = config_loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(*force_path_style)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
        })
    }

    fn to_metadata(
        content_type: Option<String>,
        etag: Option<String>,
        size: u64,
        last_modified: Option<DateTime<Utc>>,
        user_metadata: HashMap<String, String>,
    ) -> ObjectMetadata {
        ObjectMetadata {
            content_type,
            etag: etag.unwrap_or_default().trim_matches('"').to_string(),
            size,
            created_at: last_modified.unwrap_or_else(Utc::now),
            user_metadata,
        }
    }
}

#[async_trait]
impl S3Backend for S3BackendClient {
    #[instrument(skip(self, body, request))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        request: PutObjectRequest,
    ) -> Result<ObjectMetadata, StorageError> {
        let bytes: Vec<Bytes> = body
            .try_collect()
            .await
            .map_err(|e| StorageError::Other(format!("failed reading upload body: {e}")))?;
        let data: Vec<u8> = bytes.concat();
        let size = data.len() as u64;

        let mut put = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(SdkByteStream::from(data));

        if let Some(ct) = &request.content_type {
            put = put.content_type(ct);
        }
        for (k, v) in &request.metadata {
            put = put.metadata(k, v);
        }

        let output = put
            .send()
            .await
            .map_err(|e| StorageError::S3(format!("put_object failed: {e}")))?;

        debug!("PUT {}/{} ({} bytes)", bucket, key, size);
        Ok(Self::to_metadata(
            request.content_type,
            output.e_tag,
            size,
            Some(Utc::now()),
            request.metadata,
        ))
    }

    #[instrument(skip(self))]
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<(u64, u64)>,
    ) -> Result<GetObjectResult, StorageError> {
        let mut get = self.client.get_object().bucket(bucket).key(key);
        if let Some((start, end)) = range {
            get = get.range(format!("bytes={start}-{end}"));
        }

        let output = get.send().await.map_err(|e| map_get_error(key, e))?;

        let content_length = output.content_length.map(|l| l as u64);
        let content_type = output.content_type.clone();
        let etag = output.e_tag.clone();
        let metadata = output.metadata.clone().unwrap_or_default();

        let body = output
            .body
            .into_async_read();
        let stream = tokio_util::io::ReaderStream::new(body)
            .map_err(|e| StorageError::Io(e))
            .boxed();

        Ok(GetObjectResult {
            body: stream,
            content_length,
            content_type,
            etag,
            metadata,
        })
    }

    #[instrument(skip(self))]
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, StorageError> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_head_error(key, e))?;

        Ok(Self::to_metadata(
            output.content_type,
            output.e_tag,
            output.content_length.unwrap_or(0) as u64,
            output
                .last_modified
                .and_then(|t| DateTime::from_timestamp(t.secs(), 0)),
            output.metadata.unwrap_or_default(),
        ))
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::S3(format!("delete_object failed: {e}")))?;
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
        let source = format!("{bucket}/{source_key}");
        let mut copy = self
            .client
            .copy_object()
            .bucket(bucket)
            .key(dest_key)
            .copy_source(source)
            .metadata_directive(MetadataDirective::Replace);

        for (k, v) in &metadata {
            copy = copy.metadata(k, v);
        }

        copy.send()
            .await
            .map_err(|e| StorageError::S3(format!("copy_object failed: {e}")))?;
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
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .max_keys(max_keys as i32);

        if let Some(token) = continuation_token {
            request = request.continuation_token(token);
        }

        let output = request
            .send()
            .await
            .map_err(|e| StorageError::S3(format!("list_objects_v2 failed: {e}")))?;

        let objects = output
            .contents
            .unwrap_or_default()
            .into_iter()
            .filter_map(|obj| {
                let key = obj.key.clone()?;
                let meta = Self::to_metadata(
                    None,
                    obj.e_tag,
                    obj.size.unwrap_or(0) as u64,
                    obj.last_modified
                        .and_then(|t| DateTime::from_timestamp(t.secs(), 0)),
                    HashMap::new(),
                );
                Some((key, meta))
            })
            .collect();

        Ok((
            objects,
            output.is_truncated.unwrap_or(false),
            output.next_continuation_token,
        ))
    }

    #[instrument(skip(self, request))]
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        request: PutObjectRequest,
    ) -> Result<String, StorageError> {
        let mut create = self.client.create_multipart_upload().bucket(bucket).key(key);
        if let Some(ct) = &request.content_type {
            create = create.content_type(ct);
        }
        for (k, v) in &request.metadata {
            create = create.metadata(k, v);
        }

        let output = create
            .send()
            .await
            .map_err(|e| StorageError::S3(format!("create_multipart_upload failed: {e}")))?;

        output
            .upload_id
            .ok_or_else(|| StorageError::S3("backend returned no upload id".to_string()))
    }

    #[instrument(skip(self, body))]
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<UploadPartResult, StorageError> {
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(SdkByteStream::from(body))
            .send()
            .await
            .map_err(|e| StorageError::S3(format!("upload_part failed: {e}")))?;

        let etag = output
            .e_tag
            .ok_or_else(|| StorageError::S3("backend returned no etag for part".to_string()))?;
        Ok(UploadPartResult { etag })
    }

    #[instrument(skip(self, parts))]
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectMetadata, StorageError> {
        let sdk_parts: Vec<SdkCompletedPart> = parts
            .into_iter()
            .map(|p| {
                SdkCompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(p.etag)
                    .build()
            })
            .collect();

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(sdk_parts))
            .build();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| StorageError::S3(format!("complete_multipart_upload failed: {e}")))?;

        Ok(Self::to_metadata(None, output.e_tag, 0, Some(Utc::now()), HashMap::new()))
    }

    #[instrument(skip(self))]
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| StorageError::S3(format!("abort_multipart_upload failed: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        self.client
            .create_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| StorageError::S3(format!("create_bucket failed: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        self.client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| StorageError::S3(format!("delete_bucket failed: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_buckets(&self) -> Result<Vec<String>, StorageError> {
        let output = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| StorageError::S3(format!("list_buckets failed: {e}")))?;

        Ok(output
            .buckets
            .unwrap_or_default()
            .into_iter()
            .filter_map(|b| b.name)
            .collect())
    }

    #[instrument(skip(self))]
    async fn head_bucket(&self, bucket: &str) -> Result<bool, StorageError> {
        Ok(self
            .client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .is_ok())
    }
}

fn map_get_error(key: &str, err: SdkError<GetObjectError>) -> StorageError {
    if let SdkError::ServiceError(service_error) = &err {
        if matches!(service_error.err(), GetObjectError::NoSuchKey(_)) {
            return StorageError::NotFound(key.to_string());
        }
    }
    StorageError::S3(format!("get_object failed: {err}"))
}

fn map_head_error(key: &str, err: SdkError<HeadObjectError>) -> StorageError {
    if let SdkError::ServiceError(service_error) = &err {
        if matches!(service_error.err(), HeadObjectError::NotFound(_)) {
            return StorageError::NotFound(key.to_string());
        }
    }
    StorageError::S3(format!("head_object failed: {err}"))
}
