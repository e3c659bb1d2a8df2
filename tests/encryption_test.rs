//! End-to-end envelope-encryption scenarios (SPEC_FULL.md §8): GCM and CTR
//! round-trips, identity passthrough, metadata-header stripping, and
//! integrity-tamper detection on both algorithms.

mod common;

use common::{generate_binary, TestServer};

const GCM_FORCE_CONTENT_TYPE: &str = "application/x-s3ep-force-aes-gcm";
const CTR_FORCE_CONTENT_TYPE: &str = "application/x-s3ep-force-aes-ctr";

#[tokio::test]
async fn identity_mode_stores_objects_unencrypted() {
    let server = TestServer::identity().await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();

    let body = generate_binary(4096, 1);
    client
        .put_object()
        .bucket("b")
        .key("plain.bin")
        .body(body.clone().into())
        .send()
        .await
        .unwrap();

    let got = client
        .get_object()
        .bucket("b")
        .key("plain.bin")
        .send()
        .await
        .unwrap();
    let bytes = got.body.collect().await.unwrap().into_bytes();
    assert_eq!(bytes.as_ref(), body.as_slice());
}

#[tokio::test]
async fn gcm_round_trip_below_streaming_threshold() {
    let server = TestServer::encrypted().await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();

    // Below the 4096-byte streaming threshold configured for this server:
    // single-shot AES-256-GCM.
    let body = generate_binary(1024, 2);
    client
        .put_object()
        .bucket("b")
        .key("small.bin")
        .content_type("text/plain")
        .metadata("owner", "alice")
        .body(body.clone().into())
        .send()
        .await
        .unwrap();

    let got = client
        .get_object()
        .bucket("b")
        .key("small.bin")
        .send()
        .await
        .unwrap();
    assert_eq!(got.metadata().unwrap().get("owner").unwrap(), "alice");
    let bytes = got.body.collect().await.unwrap().into_bytes();
    assert_eq!(bytes.as_ref(), body.as_slice());

    // No response header leaks the envelope metadata prefix.
    let head = client.head_object().bucket("b").key("small.bin").send().await.unwrap();
    for key in head.metadata().unwrap().keys() {
        assert!(!key.starts_with("s3ep-"), "leaked envelope header: {key}");
    }
}

#[tokio::test]
async fn ctr_round_trip_above_streaming_threshold() {
    let server = TestServer::encrypted().await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();

    // Above the 4096-byte streaming threshold: internally-chunked AES-256-CTR.
    let body = generate_binary(20_000, 3);
    client
        .put_object()
        .bucket("b")
        .key("large.bin")
        .body(body.clone().into())
        .send()
        .await
        .unwrap();

    let got = client
        .get_object()
        .bucket("b")
        .key("large.bin")
        .send()
        .await
        .unwrap();
    assert_eq!(got.content_length(), Some(body.len() as i64));
    let bytes = got.body.collect().await.unwrap().into_bytes();
    assert_eq!(bytes.as_ref(), body.as_slice());
}

#[tokio::test]
async fn forced_gcm_sentinel_overrides_threshold() {
    let server = TestServer::encrypted().await;
    let http = server.http_client();
    let s3 = server.s3_client();
    s3.create_bucket().bucket("b2").send().await.unwrap();

    // Body is well above the streaming threshold, but the force-GCM
    // sentinel content-type routes it through the one-shot path anyway.
    let body = generate_binary(10_000, 4);
    let resp = http
        .put(server.object_url("b2", "forced-gcm.bin"))
        .header("content-type", GCM_FORCE_CONTENT_TYPE)
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let got = http.get(server.object_url("b2", "forced-gcm.bin")).send().await.unwrap();
    assert!(got.status().is_success());
    let bytes = got.bytes().await.unwrap();
    assert_eq!(bytes.as_ref(), body.as_slice());
}

#[tokio::test]
async fn forced_ctr_sentinel_below_floor_uses_direct_put() {
    let server = TestServer::encrypted().await;
    let http = server.http_client();
    let s3 = server.s3_client();
    s3.create_bucket().bucket("b3").send().await.unwrap();

    // Below FORCE_CTR_DIRECT_PUT_FLOOR (1024 bytes): one-shot CTR, no
    // internal multipart session opened.
    let body = generate_binary(200, 5);
    let resp = http
        .put(server.object_url("b3", "forced-ctr.bin"))
        .header("content-type", CTR_FORCE_CONTENT_TYPE)
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let got = http.get(server.object_url("b3", "forced-ctr.bin")).send().await.unwrap();
    let bytes = got.bytes().await.unwrap();
    assert_eq!(bytes.as_ref(), body.as_slice());
}

#[tokio::test]
async fn gcm_tamper_is_detected() {
    let server = TestServer::encrypted().await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();

    let body = generate_binary(512, 6);
    client
        .put_object()
        .bucket("b")
        .key("tampered-gcm.bin")
        .body(body.into())
        .send()
        .await
        .unwrap();

    corrupt_stored_object(&server, "b", "tampered-gcm.bin");

    let err = client
        .get_object()
        .bucket("b")
        .key("tampered-gcm.bin")
        .send()
        .await
        .unwrap_err();
    let status = err.raw_response().map(|r| r.status().as_u16());
    assert_eq!(status, Some(403), "tampered object should be rejected as IntegrityError, got {err:?}");
}

#[tokio::test]
async fn ctr_tamper_is_detected() {
    let server = TestServer::encrypted().await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();

    let body = generate_binary(20_000, 7);
    client
        .put_object()
        .bucket("b")
        .key("tampered-ctr.bin")
        .body(body.into())
        .send()
        .await
        .unwrap();

    corrupt_stored_object(&server, "b", "tampered-ctr.bin");

    let err = client
        .get_object()
        .bucket("b")
        .key("tampered-ctr.bin")
        .send()
        .await
        .unwrap_err();
    let status = err.raw_response().map(|r| r.status().as_u16());
    assert_eq!(status, Some(403), "tampered object should be rejected as IntegrityError, got {err:?}");
}

/// Flip a byte past the envelope header in the stored ciphertext, bypassing
/// the proxy entirely, so a round-trip GET must fail integrity checking.
fn corrupt_stored_object(server: &TestServer, bucket: &str, key: &str) {
    let path = server.stored_object_path(bucket, key);
    let mut bytes = std::fs::read(&path).expect("stored object missing on disk");
    let flip_at = bytes.len() - 1;
    bytes[flip_at] ^= 0xff;
    std::fs::write(&path, bytes).expect("failed to rewrite stored object");
}
