//! S3 API request handlers (§4.F): the only layer that talks HTTP. Every
//! operation here either dispatches into [`crate::orchestrator`] (crypto path
//! active) or falls straight through to [`crate::storage`] (identity key
//! provider, or an operation envelope encryption never touches, like bucket
//! CRUD).

use super::errors::S3Error;
use super::extractors::{ValidatedBucket, ValidatedPath};
use super::xml::{
    BucketInfo, CompleteMultipartUploadRequest, CompleteMultipartUploadResult, CopyObjectResult,
    DeleteError, DeleteRequest, DeleteResult, DeletedObject, InitiateMultipartUploadResult,
    ListBucketResult, ListBucketsResult, ListMultipartUploadsResult, ListPartsResult, PartInfo,
    S3Object,
};
use crate::codec::streaming::BaseIv;
use crate::keys::KeyProviderError;
use crate::metrics::Metrics;
use crate::multipart::MultipartSessionManager;
use crate::orchestrator::{strip_force_sentinel, AlgorithmChoice, CryptoOrchestrator};
use crate::storage::{CompletedPart, PutObjectRequest, S3Backend};
use crate::types::{meta_keys, DekAlgorithm, ObjectMetadata};
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::BytesMut;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info, instrument, warn};

/// Application state shared across handlers.
pub struct AppState {
    pub orchestrator: Arc<CryptoOrchestrator>,
    pub backend: Arc<dyn S3Backend>,
    pub metrics: Option<Arc<Metrics>>,
    /// Plaintext bytes per internally-chunked part when a direct (non-API)
    /// PUT is large enough to need `CtrMultipart` — must match the segment
    /// size the orchestrator was built with, since `Complete` validates every
    /// non-final part against it.
    pub segment_size: u64,
}

impl AppState {
    fn sessions(&self) -> &Arc<MultipartSessionManager> {
        self.orchestrator.sessions()
    }
}

fn record_crypto_op(state: &Arc<AppState>, algorithm: &'static str, direction: &'static str) {
    if let Some(m) = &state.metrics {
        m.crypto_operations_total
            .with_label_values(&[algorithm, direction])
            .inc();
    }
}

fn record_integrity_failure(state: &Arc<AppState>, algorithm: &'static str) {
    if let Some(m) = &state.metrics {
        m.crypto_integrity_failures_total
            .with_label_values(&[algorithm])
            .inc();
    }
}

/// Query parameters for bucket-level GET operations.
#[derive(Debug, Deserialize, Default)]
pub struct BucketGetQuery {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    #[serde(rename = "list-type")]
    pub list_type: Option<u8>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<u32>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
    pub location: Option<String>,
    pub versioning: Option<String>,
    pub uploads: Option<String>,
}

/// Query parameters for bucket-level POST operations.
#[derive(Debug, Deserialize, Default)]
pub struct BucketPostQuery {
    pub delete: Option<String>,
}

/// Query parameters for object-level operations (multipart upload).
#[derive(Debug, Deserialize, Default)]
pub struct ObjectQuery {
    pub uploads: Option<String>,
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    #[serde(rename = "partNumber")]
    pub part_number: Option<u32>,
}

fn hval(s: &str) -> HeaderValue {
    HeaderValue::from_bytes(s.as_bytes()).unwrap_or_else(|_| HeaderValue::from_static(""))
}

fn xml_response(body: String) -> Response {
    (StatusCode::OK, [("Content-Type", "application/xml")], body).into_response()
}

/// Extract `x-amz-meta-*` request headers into plain (unprefixed) keys. The
/// orchestrator itself rejects any key colliding with the envelope metadata
/// prefix — see `check_metadata_collisions` in `orchestrator.rs`.
fn extract_user_metadata(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let suffix = name.as_str().strip_prefix(meta_keys::AMZ_META_PREFIX)?;
            let v = value.to_str().ok()?;
            Some((suffix.to_string(), v.to_string()))
        })
        .collect()
}

/// Build response headers for an object: ETag, Content-Length, Content-Type,
/// Last-Modified, and custom `x-amz-meta-*` metadata. Envelope metadata must
/// already be stripped out of `user_metadata` by the caller.
fn build_response_headers(
    content_type: &Option<String>,
    content_length: Option<u64>,
    etag: &str,
    created_at: chrono::DateTime<Utc>,
    user_metadata: &HashMap<String, String>,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("ETag", hval(&format!("\"{etag}\"")));
    if let Some(len) = content_length {
        headers.insert("Content-Length", hval(&len.to_string()));
    }
    headers.insert(
        "Content-Type",
        hval(content_type.as_deref().unwrap_or("application/octet-stream")),
    );
    headers.insert(
        "Last-Modified",
        hval(&created_at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()),
    );
    for (key, value) in user_metadata {
        let header_name = format!("{}{}", meta_keys::AMZ_META_PREFIX, key);
        if let Ok(name) = axum::http::header::HeaderName::from_bytes(header_name.as_bytes()) {
            headers.insert(name, hval(value));
        }
    }
    headers
}

fn key_provider_err_to_s3(err: KeyProviderError) -> S3Error {
    match err {
        KeyProviderError::KeyUnavailable(fp) => S3Error::KeyUnavailable(fp),
        other => S3Error::InternalError(other.to_string()),
    }
}

/// Turn a raw request `Body` into a `ByteStream` that has already been
/// stripped of AWS-chunked or plain HTTP chunked framing (§4.C), ready for
/// the orchestrator.
async fn decode_body_stream(
    headers: &HeaderMap,
    body: Body,
) -> Result<crate::storage::ByteStream, S3Error> {
    let raw = body
        .into_data_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let reader = StreamReader::new(raw);
    let decoded = crate::normalizer::wrap_body(headers, reader)
        .await
        .map_err(|e| S3Error::InvalidRequest(e.to_string()))?;
    Ok(Box::pin(
        ReaderStream::new(decoded).map_err(crate::storage::StorageError::Io),
    ))
}

/// The declared plaintext length of the body, if knowable before decoding:
/// the `x-amz-decoded-content-length` header for SigV4-chunked payloads,
/// unknown for plain HTTP chunked transfer, and `Content-Length` otherwise.
fn declared_plaintext_length(headers: &HeaderMap) -> Option<u64> {
    if crate::normalizer::is_sigv4_chunked(headers) {
        crate::normalizer::get_decoded_content_length(headers)
    } else if crate::normalizer::is_http_chunked(headers) {
        None
    } else {
        headers
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

/// PUT object handler (internal): dispatches to the orchestrator's
/// one-shot GCM, one-shot CTR, or internally-chunked multipart-CTR path per
/// the §4.D selection table, or straight to the backend when the key
/// provider is the identity provider.
#[instrument(skip(state, headers, body))]
async fn put_object_inner(
    state: &Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    let declared_len = declared_plaintext_length(&headers);
    let raw_content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let (content_type, forced_algo) = strip_force_sentinel(raw_content_type);
    let user_metadata = extract_user_metadata(&headers);
    let body_stream = decode_body_stream(&headers, body).await?;

    info!("PUT {}/{}", bucket, key);

    let (metadata, algorithm_label) = if state.orchestrator.key_provider().is_identity() {
        let m = state
            .orchestrator
            .encrypt_single(bucket, key, content_type, user_metadata, body_stream)
            .await?;
        (m, "none")
    } else {
        match state
            .orchestrator
            .select_algorithm(forced_algo, declared_len)
        {
            AlgorithmChoice::GcmSingleShot => {
                let m = state
                    .orchestrator
                    .encrypt_single(bucket, key, content_type, user_metadata, body_stream)
                    .await?;
                (m, "aes-gcm")
            }
            AlgorithmChoice::CtrSingleShot => {
                let m = state
                    .orchestrator
                    .encrypt_single_ctr(bucket, key, content_type, user_metadata, body_stream)
                    .await?;
                (m, "aes-256-ctr")
            }
            AlgorithmChoice::CtrMultipart => {
                let m = put_object_via_internal_multipart(
                    state,
                    bucket,
                    key,
                    content_type,
                    user_metadata,
                    body_stream,
                )
                .await?;
                (m, "aes-256-ctr")
            }
        }
    };

    record_crypto_op(state, algorithm_label, "encrypt");
    debug!("Stored {}/{} ({} bytes)", bucket, key, metadata.size);

    Ok((StatusCode::OK, [("ETag", format!("\"{}\"", metadata.etag))], "").into_response())
}

/// Drive a direct PUT whose plaintext is too large (or of unknown length)
/// for a one-shot write through the orchestrator's own multipart API,
/// chunking the decoded body into `segment_size`-sized parts. Invisible to
/// the client — from the outside this is still a single PUT request.
async fn put_object_via_internal_multipart(
    state: &Arc<AppState>,
    bucket: &str,
    key: &str,
    content_type: Option<String>,
    user_metadata: HashMap<String, String>,
    mut body: crate::storage::ByteStream,
) -> Result<ObjectMetadata, crate::orchestrator::OrchestratorError> {
    let upload_id = state
        .orchestrator
        .open_encrypt_session(bucket, key, content_type, user_metadata)
        .await?;

    let segment_size = state.segment_size as usize;
    let mut buffer = BytesMut::new();
    let mut part_number: i32 = 0;
    let mut parts: Vec<(u32, String)> = Vec::new();

    let result: Result<(), crate::orchestrator::OrchestratorError> = async {
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
            while buffer.len() >= segment_size {
                let part = buffer.split_to(segment_size).freeze();
                part_number += 1;
                let etag = state
                    .orchestrator
                    .encrypt_part_streaming(&upload_id, bucket, key, part_number, part)
                    .await?;
                parts.push((part_number as u32, etag));
            }
        }
        if !buffer.is_empty() || parts.is_empty() {
            let part = buffer.split().freeze();
            part_number += 1;
            let etag = state
                .orchestrator
                .encrypt_part_streaming(&upload_id, bucket, key, part_number, part)
                .await?;
            parts.push((part_number as u32, etag));
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            state
                .orchestrator
                .finalize_session(&upload_id, bucket, key, &parts)
                .await
        }
        Err(e) => {
            let _ = state.orchestrator.abort_session(&upload_id, bucket, key).await;
            Err(e)
        }
    }
}

/// GET object handler.
/// GET /{bucket}/{key}
/// GET /{bucket}/{key}?uploadId=X - ListParts
#[instrument(skip(state))]
pub async fn get_object(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
    Query(query): Query<ObjectQuery>,
) -> Result<Response, S3Error> {
    if let Some(upload_id) = &query.upload_id {
        info!("ListParts {}/{} uploadId={}", bucket, key, upload_id);
        let parts = state.sessions().list_parts(upload_id, &bucket, &key)?;
        let xml_parts: Vec<PartInfo> = parts
            .into_iter()
            .map(|p| PartInfo {
                part_number: p.part_number,
                etag: p.etag,
                size: p.plaintext_bytes,
                last_modified: Utc::now(),
            })
            .collect();
        let result = ListPartsResult {
            bucket: bucket.clone(),
            key: key.clone(),
            upload_id: upload_id.clone(),
            parts: xml_parts,
            max_parts: 1000,
            is_truncated: false,
        };
        return Ok(xml_response(result.to_xml()));
    }

    info!("GET {}/{}", bucket, key);

    let got = state.backend.get_object(&bucket, &key, None).await?;
    let mut user_metadata = got.metadata.clone();
    let envelope = state.orchestrator.parse_envelope(&user_metadata)?;

    let Some(envelope) = envelope else {
        let headers = build_response_headers(
            &got.content_type,
            got.content_length,
            got.etag.as_deref().unwrap_or(""),
            Utc::now(),
            &user_metadata,
        );
        let body = Body::from_stream(got.body);
        return Ok((StatusCode::OK, headers, body).into_response());
    };

    state.orchestrator.strip_envelope_metadata(&mut user_metadata);

    match envelope.algorithm {
        DekAlgorithm::AesGcm => {
            let plaintext = match state.orchestrator.decrypt_single(got.body, &envelope).await {
                Ok(p) => p,
                Err(e) => {
                    if matches!(e, crate::orchestrator::OrchestratorError::Integrity) {
                        record_integrity_failure(&state, "aes-gcm");
                    }
                    return Err(e.into());
                }
            };
            record_crypto_op(&state, "aes-gcm", "decrypt");
            let content_length = envelope.plaintext_length.unwrap_or(plaintext.len() as u64);
            let headers = build_response_headers(
                &got.content_type,
                Some(content_length),
                got.etag.as_deref().unwrap_or(""),
                Utc::now(),
                &user_metadata,
            );
            Ok((StatusCode::OK, headers, plaintext).into_response())
        }
        DekAlgorithm::Aes256Ctr => {
            let dek = state
                .orchestrator
                .key_provider()
                .unwrap(&envelope.encrypted_dek, &envelope.key_fingerprint)
                .await
                .map_err(key_provider_err_to_s3)?;
            let iv: [u8; 16] = envelope
                .iv
                .as_slice()
                .try_into()
                .map_err(|_| S3Error::InternalError("CTR envelope has malformed iv".to_string()))?;
            let expected_hmac: [u8; 32] = envelope
                .hmac
                .clone()
                .ok_or_else(|| S3Error::InternalError("CTR envelope missing hmac".to_string()))?
                .as_slice()
                .try_into()
                .map_err(|_| S3Error::InternalError("CTR envelope has malformed hmac".to_string()))?;

            let reader = state.orchestrator.create_decrypt_reader(
                got.body,
                dek,
                BaseIv::from_bytes(iv),
                expected_hmac,
            );
            record_crypto_op(&state, "aes-256-ctr", "decrypt");

            let headers = build_response_headers(
                &got.content_type,
                got.content_length,
                got.etag.as_deref().unwrap_or(""),
                Utc::now(),
                &user_metadata,
            );
            let state_for_stream = state.clone();
            let stream = reader.inspect(move |chunk| {
                if chunk.is_err() {
                    record_integrity_failure(&state_for_stream, "aes-256-ctr");
                }
            });
            let body = Body::from_stream(stream);
            Ok((StatusCode::OK, headers, body).into_response())
        }
    }
}

/// HEAD object handler.
/// HEAD /{bucket}/{key}
#[instrument(skip(state))]
pub async fn head_object(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
) -> Result<Response, S3Error> {
    info!("HEAD {}/{}", bucket, key);

    let meta = state.backend.head_object(&bucket, &key).await?;
    let mut user_metadata = meta.user_metadata.clone();
    let envelope = state.orchestrator.parse_envelope(&user_metadata)?;

    let content_length = match &envelope {
        Some(env) if env.algorithm == DekAlgorithm::AesGcm => {
            env.plaintext_length.unwrap_or(meta.size)
        }
        _ => meta.size,
    };
    if envelope.is_some() {
        state.orchestrator.strip_envelope_metadata(&mut user_metadata);
    }

    let headers = build_response_headers(
        &meta.content_type,
        Some(content_length),
        &meta.etag,
        meta.created_at,
        &user_metadata,
    );
    Ok((StatusCode::OK, headers).into_response())
}

/// Bucket-level GET handler — dispatches on query params.
/// GET /{bucket}?list-type=2&prefix=  -> ListObjectsV2
/// GET /{bucket}?location            -> GetBucketLocation
/// GET /{bucket}?versioning          -> GetBucketVersioning
/// GET /{bucket}?uploads             -> ListMultipartUploads
#[instrument(skip(state))]
pub async fn bucket_get_handler(
    State(state): State<Arc<AppState>>,
    ValidatedBucket(bucket): ValidatedBucket,
    Query(query): Query<BucketGetQuery>,
) -> Result<Response, S3Error> {
    if query.location.is_some() {
        info!("GET bucket location: {}", bucket);
        return get_bucket_location(&bucket).await;
    }

    if query.versioning.is_some() {
        info!("GET bucket versioning: {}", bucket);
        return get_bucket_versioning(&bucket).await;
    }

    if query.uploads.is_some() {
        info!("LIST multipart uploads: {}", bucket);
        return list_multipart_uploads(&bucket).await;
    }

    if let Some(list_type) = query.list_type {
        if list_type != 2 {
            return Err(S3Error::InvalidArgument(
                "Only ListObjectsV2 is supported (list-type=2)".to_string(),
            ));
        }
    }
    let prefix = query.prefix.unwrap_or_default();
    let delimiter = query.delimiter.clone();
    info!("LIST {}/{}*", bucket, prefix);

    let (objects, is_truncated, next_continuation_token) = state
        .backend
        .list_objects_v2(
            &bucket,
            &prefix,
            query.max_keys.unwrap_or(1000),
            query.continuation_token.as_deref(),
        )
        .await?;

    let all_objects: Vec<S3Object> = objects
        .into_iter()
        .map(|(key, meta)| S3Object::new(key, meta.size, meta.created_at, meta.etag))
        .collect();

    let (s3_objects, common_prefixes) = if let Some(ref delim) = delimiter {
        let mut prefixes = std::collections::BTreeSet::new();
        let mut direct_objects = Vec::new();

        for obj in all_objects {
            let after_prefix = &obj.key[prefix.len().min(obj.key.len())..];
            if let Some(pos) = after_prefix.find(delim.as_str()) {
                let common = format!("{}{}{}", prefix, &after_prefix[..pos], delim);
                prefixes.insert(common);
            } else {
                direct_objects.push(obj);
            }
        }

        (direct_objects, prefixes.into_iter().collect::<Vec<_>>())
    } else {
        (all_objects, Vec::new())
    };

    let result = ListBucketResult::new_v2(
        bucket,
        prefix,
        delimiter,
        query.max_keys.unwrap_or(1000),
        s3_objects,
        common_prefixes,
        query.continuation_token,
        next_continuation_token,
        is_truncated,
    );

    Ok(xml_response(result.to_xml()))
}

async fn get_bucket_location(_bucket: &str) -> Result<Response, S3Error> {
    let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<LocationConstraint xmlns="http://s3.amazonaws.com/doc/2006-03-01/">us-east-1</LocationConstraint>"#;
    Ok(xml_response(xml.to_string()))
}

async fn get_bucket_versioning(_bucket: &str) -> Result<Response, S3Error> {
    let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<VersioningConfiguration xmlns="http://s3.amazonaws.com/doc/2006-03-01/"/>"#;
    Ok(xml_response(xml.to_string()))
}

/// ListMultipartUploads always reports empty: in-flight sessions are keyed
/// by upload ID only, with no per-bucket/prefix index to enumerate them by.
async fn list_multipart_uploads(bucket: &str) -> Result<Response, S3Error> {
    let result = ListMultipartUploadsResult {
        bucket: bucket.to_string(),
        uploads: Vec::new(),
        prefix: String::new(),
        max_uploads: 1000,
        is_truncated: false,
    };
    Ok(xml_response(result.to_xml()))
}

/// DELETE object handler.
/// DELETE /{bucket}/{key}
/// DELETE /{bucket}/{key}?uploadId=X - AbortMultipartUpload
#[instrument(skip(state))]
pub async fn delete_object(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
    Query(query): Query<ObjectQuery>,
) -> Result<Response, S3Error> {
    if let Some(upload_id) = &query.upload_id {
        info!(
            "AbortMultipartUpload {}/{} uploadId={}",
            bucket, key, upload_id
        );
        if state.orchestrator.key_provider().is_identity() {
            state
                .backend
                .abort_multipart_upload(&bucket, &key, upload_id)
                .await?;
        } else {
            state.orchestrator.abort_session(upload_id, &bucket, &key).await?;
        }
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    info!("DELETE {}/{}", bucket, key);

    if let Err(err) = state.backend.delete_object(&bucket, &key).await {
        match S3Error::from(err) {
            S3Error::NoSuchKey(_) => {}
            other => return Err(other),
        }
    }

    debug!("Deleted {}/{}", bucket, key);
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// DELETE multiple objects handler.
/// POST /{bucket}?delete
#[instrument(skip(state, body))]
pub async fn delete_objects(
    State(state): State<Arc<AppState>>,
    ValidatedBucket(bucket): ValidatedBucket,
    Query(query): Query<BucketPostQuery>,
    body: Bytes,
) -> Result<Response, S3Error> {
    if query.delete.is_none() {
        return Err(S3Error::InvalidRequest(
            "POST requires ?delete query parameter".to_string(),
        ));
    }

    let body_str = String::from_utf8(body.to_vec()).map_err(|_| S3Error::MalformedXML)?;
    let delete_req = DeleteRequest::from_xml(&body_str).map_err(|e| {
        warn!("Failed to parse DeleteObjects XML: {}", e);
        S3Error::MalformedXML
    })?;

    info!(
        "DELETE multiple objects in {} ({} objects)",
        bucket,
        delete_req.objects.len()
    );

    let quiet = delete_req.quiet.unwrap_or(false);
    let mut deleted = Vec::new();
    let mut errors = Vec::new();

    for obj in delete_req.objects {
        let key = obj.key.trim_start_matches('/');
        match state.backend.delete_object(&bucket, key).await {
            Ok(()) => {
                debug!("Deleted {}/{}", bucket, key);
                deleted.push(DeletedObject {
                    key: obj.key.clone(),
                    version_id: obj.version_id.clone(),
                });
            }
            Err(e) => {
                let s3_err = S3Error::from(e);
                if matches!(s3_err, S3Error::NoSuchKey(_)) {
                    deleted.push(DeletedObject {
                        key: obj.key.clone(),
                        version_id: obj.version_id.clone(),
                    });
                } else {
                    warn!("Failed to delete {}/{}: {}", bucket, key, s3_err);
                    errors.push(DeleteError {
                        key: obj.key.clone(),
                        version_id: obj.version_id.clone(),
                        code: s3_err.code().to_string(),
                        message: s3_err.to_string(),
                    });
                }
            }
        }
    }

    let result = DeleteResult { deleted, errors };
    Ok(xml_response(result.to_xml(quiet)))
}

/// COPY object handler (internal). Only reachable when the key provider is
/// the identity provider — encrypted-object copy is rejected one level up in
/// `put_object_or_copy` with `NotSupportedWithEncryption`.
#[instrument(skip(state))]
async fn copy_object_inner(
    state: &Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let copy_source = headers
        .get("x-amz-copy-source")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| S3Error::InvalidRequest("Missing x-amz-copy-source header".to_string()))?;

    let copy_source = urlencoding::decode(copy_source)
        .map_err(|_| S3Error::InvalidArgument("Invalid copy source encoding".to_string()))?;
    let copy_source = copy_source.trim_start_matches('/');

    let (source_bucket, source_key) = copy_source
        .split_once('/')
        .ok_or_else(|| S3Error::InvalidArgument("Copy source must be bucket/key".to_string()))?;

    info!(
        "COPY {}/{} -> {}/{}",
        source_bucket, source_key, bucket, key
    );

    let source_meta = state.backend.head_object(source_bucket, source_key).await?;
    let source = state.backend.get_object(source_bucket, source_key, None).await?;

    let result = state
        .backend
        .put_object(
            bucket,
            key,
            source.body,
            PutObjectRequest {
                content_type: source_meta.content_type.clone(),
                metadata: source_meta.user_metadata.clone(),
            },
        )
        .await?;

    debug!("Copied {}/{} -> {}/{}", source_bucket, source_key, bucket, key);

    let copy_result = CopyObjectResult {
        etag: result.etag_quoted(),
        last_modified: result.created_at,
    };
    Ok(xml_response(copy_result.to_xml()))
}

/// PUT object handler with copy detection and multipart-part upload support.
/// PUT /{bucket}/{key}
/// PUT /{bucket}/{key}?partNumber=N&uploadId=X - UploadPart
#[instrument(skip(state, headers, body))]
pub async fn put_object_or_copy(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
    Query(query): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    if let (Some(part_number), Some(upload_id)) = (query.part_number, &query.upload_id) {
        // UploadPartCopy is not supported: a part's ciphertext is bound to a
        // deterministic block offset derived from its part number, which a
        // server-side copy from another object can't honor.
        if headers.contains_key("x-amz-copy-source") {
            return Err(S3Error::NotSupportedWithEncryption);
        }
        return upload_part(&state, &bucket, &key, upload_id, part_number, headers, body).await;
    }

    if headers.contains_key("x-amz-copy-source") {
        if !state.orchestrator.key_provider().is_identity() {
            return Err(S3Error::NotSupportedWithEncryption);
        }
        return copy_object_inner(&state, &bucket, &key, &headers).await;
    }

    put_object_inner(&state, &bucket, &key, headers, body).await
}

/// UploadPart: fully buffer the (already-decoded) part body, then either
/// encrypt it at its deterministic block offset or pass it straight through
/// to the backend under the identity key provider.
async fn upload_part(
    state: &Arc<AppState>,
    bucket: &str,
    key: &str,
    upload_id: &str,
    part_number: u32,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    info!(
        "UploadPart {}/{} part={} uploadId={}",
        bucket, key, part_number, upload_id
    );

    let raw = body
        .into_data_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let reader = StreamReader::new(raw);
    let mut decoded = crate::normalizer::wrap_body(&headers, reader)
        .await
        .map_err(|e| S3Error::InvalidRequest(e.to_string()))?;
    let mut buf = Vec::new();
    decoded
        .read_to_end(&mut buf)
        .await
        .map_err(|e| S3Error::InvalidRequest(e.to_string()))?;
    let body_bytes = Bytes::from(buf);

    if state.orchestrator.key_provider().is_identity() {
        let result = state
            .backend
            .upload_part(bucket, key, upload_id, part_number as i32, body_bytes)
            .await?;
        return Ok((StatusCode::OK, [("ETag", format!("\"{}\"", result.etag))], "").into_response());
    }

    let etag = state
        .orchestrator
        .encrypt_part_streaming(upload_id, bucket, key, part_number as i32, body_bytes)
        .await?;
    record_crypto_op(state, "aes-256-ctr", "encrypt");
    Ok((StatusCode::OK, [("ETag", format!("\"{etag}\""))], "").into_response())
}

/// POST object handler for multipart upload operations.
/// POST /{bucket}/{key}?uploads - CreateMultipartUpload
/// POST /{bucket}/{key}?uploadId=X - CompleteMultipartUpload
#[instrument(skip(state, body))]
pub async fn post_object(
    State(state): State<Arc<AppState>>,
    ValidatedPath { bucket, key }: ValidatedPath,
    Query(query): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    if query.uploads.is_some() {
        info!("CreateMultipartUpload {}/{}", bucket, key);

        let raw_content_type = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let (content_type, _forced_algo) = strip_force_sentinel(raw_content_type);
        let user_metadata = extract_user_metadata(&headers);

        let upload_id = if state.orchestrator.key_provider().is_identity() {
            state
                .backend
                .create_multipart_upload(
                    &bucket,
                    &key,
                    PutObjectRequest { content_type, metadata: user_metadata },
                )
                .await?
        } else {
            state
                .orchestrator
                .open_encrypt_session(&bucket, &key, content_type, user_metadata)
                .await?
        };

        let result = InitiateMultipartUploadResult {
            bucket: bucket.clone(),
            key: key.clone(),
            upload_id,
        };
        return Ok(xml_response(result.to_xml()));
    }

    if let Some(upload_id) = &query.upload_id {
        info!(
            "CompleteMultipartUpload {}/{} uploadId={}",
            bucket, key, upload_id
        );

        let body_str = String::from_utf8(body.to_vec()).map_err(|_| S3Error::MalformedXML)?;
        let complete_req = CompleteMultipartUploadRequest::from_xml(&body_str).map_err(|e| {
            warn!("Failed to parse CompleteMultipartUpload XML: {}", e);
            S3Error::MalformedXML
        })?;

        let requested_parts: Vec<(u32, String)> = complete_req
            .parts
            .iter()
            .map(|p| (p.part_number, p.etag.clone()))
            .collect();

        let metadata = if state.orchestrator.key_provider().is_identity() {
            let completed: Vec<CompletedPart> = requested_parts
                .iter()
                .map(|(n, etag)| CompletedPart {
                    part_number: *n as i32,
                    etag: etag.clone(),
                })
                .collect();
            state
                .backend
                .complete_multipart_upload(&bucket, &key, upload_id, completed)
                .await?
        } else {
            let m = state
                .orchestrator
                .finalize_session(upload_id, &bucket, &key, &requested_parts)
                .await?;
            record_crypto_op(&state, "aes-256-ctr", "encrypt");
            m
        };

        debug!(
            "CompleteMultipartUpload {}/{} ({} bytes)",
            bucket, key, metadata.size
        );

        let result = CompleteMultipartUploadResult {
            location: format!("/{}/{}", bucket, key),
            bucket: bucket.clone(),
            key: key.clone(),
            etag: metadata.etag_quoted(),
        };
        return Ok(xml_response(result.to_xml()));
    }

    Err(S3Error::InvalidRequest(
        "POST on object requires ?uploads or ?uploadId parameter".to_string(),
    ))
}

// ============================================================================
// Bucket Operations
// ============================================================================

/// CREATE bucket handler.
/// PUT /{bucket}
#[instrument(skip(state))]
pub async fn create_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Result<Response, S3Error> {
    info!("CREATE bucket {}", bucket);

    if bucket.is_empty() {
        return Err(S3Error::InvalidArgument(
            "Bucket name cannot be empty".to_string(),
        ));
    }

    state.backend.create_bucket(&bucket).await?;
    Ok((StatusCode::OK, [("Location", format!("/{}", bucket))], "").into_response())
}

/// DELETE bucket handler.
/// DELETE /{bucket}
#[instrument(skip(state))]
pub async fn delete_bucket(
    State(state): State<Arc<AppState>>,
    ValidatedBucket(bucket): ValidatedBucket,
) -> Result<Response, S3Error> {
    info!("DELETE bucket {}", bucket);

    let (objects, _, _) = state.backend.list_objects_v2(&bucket, "", 1, None).await?;
    if !objects.is_empty() {
        return Err(S3Error::BucketNotEmpty(bucket.to_string()));
    }

    state.backend.delete_bucket(&bucket).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// HEAD bucket handler.
/// HEAD /{bucket}
#[instrument(skip(state))]
pub async fn head_bucket(
    State(state): State<Arc<AppState>>,
    ValidatedBucket(bucket): ValidatedBucket,
) -> Result<Response, S3Error> {
    info!("HEAD bucket {}", bucket);

    let exists = state.backend.head_bucket(&bucket).await?;
    if !exists {
        return Err(S3Error::NoSuchBucket(bucket.to_string()));
    }

    Ok((StatusCode::OK, [("x-amz-bucket-region", "us-east-1")]).into_response())
}

/// LIST buckets handler.
/// GET /
#[instrument(skip(state))]
pub async fn list_buckets(State(state): State<Arc<AppState>>) -> Result<Response, S3Error> {
    info!("LIST buckets");

    let mut bucket_list = state.backend.list_buckets().await?;
    bucket_list.sort();

    let result = ListBucketsResult {
        owner_id: "s3ep".to_string(),
        owner_display_name: "s3ep".to_string(),
        buckets: bucket_list
            .into_iter()
            .map(|name| BucketInfo {
                name,
                creation_date: Utc::now(),
            })
            .collect(),
    };

    Ok(xml_response(result.to_xml()))
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// S3 root HEAD handler — connection probe used by Cyberduck and other S3 clients.
/// HEAD /
pub async fn head_root() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("server", "s3ep")
        .body(Body::empty())
        .unwrap()
}
