//! S3 API compliance tests against a filesystem backend.
//!
//! Exercises bucket/object CRUD, listing, and multipart upload semantics
//! through the AWS SDK. No Docker/MinIO required — the real `s3ep` binary
//! is spawned per test via `common::TestServer`.

mod common;

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use common::{generate_binary, TestServer};

// ============================================================================
// Bucket operations
// ============================================================================

#[tokio::test]
async fn create_list_delete_bucket() {
    let server = TestServer::identity().await;
    let client = server.s3_client();

    client.create_bucket().bucket("alpha").send().await.unwrap();
    client.create_bucket().bucket("beta").send().await.unwrap();

    let listed = client.list_buckets().send().await.unwrap();
    let names: Vec<_> = listed
        .buckets()
        .iter()
        .filter_map(|b| b.name())
        .collect();
    assert!(names.contains(&"alpha"));
    assert!(names.contains(&"beta"));

    client.head_bucket().bucket("alpha").send().await.unwrap();

    client.delete_bucket().bucket("beta").send().await.unwrap();
    let err = client.head_bucket().bucket("beta").send().await.unwrap_err();
    assert_eq!(err.raw_response().map(|r| r.status().as_u16()), Some(404));
}

#[tokio::test]
async fn delete_nonempty_bucket_is_rejected() {
    let server = TestServer::identity().await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();
    client
        .put_object()
        .bucket("b")
        .key("k")
        .body(ByteStream::from_static(b"x"))
        .send()
        .await
        .unwrap();

    let err = client.delete_bucket().bucket("b").send().await.unwrap_err();
    assert!(err.raw_response().is_some());
}

// ============================================================================
// Object CRUD lifecycle
// ============================================================================

#[tokio::test]
async fn put_get_roundtrip() {
    let server = TestServer::identity().await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();

    let data = b"hello s3ep";
    client
        .put_object()
        .bucket("b")
        .key("test.txt")
        .body(ByteStream::from(data.to_vec()))
        .send()
        .await
        .expect("PUT should succeed");

    let got = client
        .get_object()
        .bucket("b")
        .key("test.txt")
        .send()
        .await
        .expect("GET should succeed");
    let body = got.body.collect().await.unwrap().into_bytes();
    assert_eq!(body.as_ref(), data);
}

#[tokio::test]
async fn put_get_delete_lifecycle() {
    let server = TestServer::identity().await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();

    let data = b"to be deleted";
    client
        .put_object()
        .bucket("b")
        .key("deleteme.txt")
        .body(ByteStream::from(data.to_vec()))
        .send()
        .await
        .unwrap();

    client.delete_object().bucket("b").key("deleteme.txt").send().await.unwrap();

    let err = client.get_object().bucket("b").key("deleteme.txt").send().await.unwrap_err();
    assert_eq!(err.raw_response().map(|r| r.status().as_u16()), Some(404));
}

#[tokio::test]
async fn put_overwrite_same_key() {
    let server = TestServer::identity().await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();

    client
        .put_object()
        .bucket("b")
        .key("k")
        .body(ByteStream::from_static(b"version one"))
        .send()
        .await
        .unwrap();
    client
        .put_object()
        .bucket("b")
        .key("k")
        .body(ByteStream::from_static(b"version two"))
        .send()
        .await
        .unwrap();

    let got = client.get_object().bucket("b").key("k").send().await.unwrap();
    let body = got.body.collect().await.unwrap().into_bytes();
    assert_eq!(body.as_ref(), b"version two");
}

#[tokio::test]
async fn head_object_reports_length_and_etag() {
    let server = TestServer::identity().await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();

    let data = generate_binary(2048, 11);
    client
        .put_object()
        .bucket("b")
        .key("k")
        .body(ByteStream::from(data.clone()))
        .send()
        .await
        .unwrap();

    let head = client.head_object().bucket("b").key("k").send().await.unwrap();
    assert_eq!(head.content_length(), Some(data.len() as i64));
    assert!(head.e_tag().is_some());
}

#[tokio::test]
async fn get_nonexistent_key_is_404() {
    let server = TestServer::identity().await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();

    let err = client.get_object().bucket("b").key("missing").send().await.unwrap_err();
    assert_eq!(err.raw_response().map(|r| r.status().as_u16()), Some(404));
}

// ============================================================================
// Listing
// ============================================================================

#[tokio::test]
async fn list_objects_v2_returns_all_keys() {
    let server = TestServer::identity().await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();

    for i in 0..5 {
        client
            .put_object()
            .bucket("b")
            .key(format!("obj-{i}"))
            .body(ByteStream::from_static(b"x"))
            .send()
            .await
            .unwrap();
    }

    let listed = client.list_objects_v2().bucket("b").send().await.unwrap();
    let keys: Vec<_> = listed.contents().iter().filter_map(|o| o.key()).collect();
    assert_eq!(keys.len(), 5);
    for i in 0..5 {
        assert!(keys.contains(&format!("obj-{i}").as_str()));
    }
}

#[tokio::test]
async fn list_objects_v2_respects_prefix() {
    let server = TestServer::identity().await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();

    client.put_object().bucket("b").key("logs/a.txt").body(ByteStream::from_static(b"x")).send().await.unwrap();
    client.put_object().bucket("b").key("logs/b.txt").body(ByteStream::from_static(b"x")).send().await.unwrap();
    client.put_object().bucket("b").key("data/c.txt").body(ByteStream::from_static(b"x")).send().await.unwrap();

    let listed = client.list_objects_v2().bucket("b").prefix("logs/").send().await.unwrap();
    let keys: Vec<_> = listed.contents().iter().filter_map(|o| o.key()).collect();
    assert_eq!(keys.len(), 2);
    assert!(keys.iter().all(|k| k.starts_with("logs/")));
}

// ============================================================================
// Multipart upload semantics
// ============================================================================

#[tokio::test]
async fn multipart_upload_round_trip() {
    let server = TestServer::encrypted_with_threshold(1_000_000).await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();

    let create = client
        .create_multipart_upload()
        .bucket("b")
        .key("big.bin")
        .send()
        .await
        .unwrap();
    let upload_id = create.upload_id().unwrap().to_string();

    let part1 = generate_binary(5 * 1024 * 1024, 100);
    let part2 = generate_binary(3 * 1024 * 1024, 101);

    let up1 = client
        .upload_part()
        .bucket("b")
        .key("big.bin")
        .upload_id(&upload_id)
        .part_number(1)
        .body(ByteStream::from(part1.clone()))
        .send()
        .await
        .unwrap();
    let up2 = client
        .upload_part()
        .bucket("b")
        .key("big.bin")
        .upload_id(&upload_id)
        .part_number(2)
        .body(ByteStream::from(part2.clone()))
        .send()
        .await
        .unwrap();

    let completed = CompletedMultipartUpload::builder()
        .parts(CompletedPart::builder().part_number(1).e_tag(up1.e_tag().unwrap_or_default()).build())
        .parts(CompletedPart::builder().part_number(2).e_tag(up2.e_tag().unwrap_or_default()).build())
        .build();

    client
        .complete_multipart_upload()
        .bucket("b")
        .key("big.bin")
        .upload_id(&upload_id)
        .multipart_upload(completed)
        .send()
        .await
        .unwrap();

    let got = client.get_object().bucket("b").key("big.bin").send().await.unwrap();
    let bytes = got.body.collect().await.unwrap().into_bytes();
    let mut expected = part1;
    expected.extend_from_slice(&part2);
    assert_eq!(bytes.as_ref(), expected.as_slice());
}

#[tokio::test]
async fn multipart_part_reupload_keeps_last_bytes() {
    let server = TestServer::encrypted_with_threshold(1_000_000).await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();

    let create = client.create_multipart_upload().bucket("b").key("k").send().await.unwrap();
    let upload_id = create.upload_id().unwrap().to_string();

    let stale = generate_binary(5 * 1024 * 1024, 1);
    let fresh = generate_binary(5 * 1024 * 1024, 2);

    client
        .upload_part()
        .bucket("b")
        .key("k")
        .upload_id(&upload_id)
        .part_number(1)
        .body(ByteStream::from(stale))
        .send()
        .await
        .unwrap();
    // Re-upload part 1: only the final bytes for a given part number count.
    let final_part = client
        .upload_part()
        .bucket("b")
        .key("k")
        .upload_id(&upload_id)
        .part_number(1)
        .body(ByteStream::from(fresh.clone()))
        .send()
        .await
        .unwrap();

    let completed = CompletedMultipartUpload::builder()
        .parts(CompletedPart::builder().part_number(1).e_tag(final_part.e_tag().unwrap_or_default()).build())
        .build();
    client
        .complete_multipart_upload()
        .bucket("b")
        .key("k")
        .upload_id(&upload_id)
        .multipart_upload(completed)
        .send()
        .await
        .unwrap();

    let got = client.get_object().bucket("b").key("k").send().await.unwrap();
    let bytes = got.body.collect().await.unwrap().into_bytes();
    assert_eq!(bytes.as_ref(), fresh.as_slice());
}

#[tokio::test]
async fn multipart_abort_is_idempotent() {
    let server = TestServer::encrypted_with_threshold(1_000_000).await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();

    let create = client.create_multipart_upload().bucket("b").key("k").send().await.unwrap();
    let upload_id = create.upload_id().unwrap().to_string();

    client
        .upload_part()
        .bucket("b")
        .key("k")
        .upload_id(&upload_id)
        .part_number(1)
        .body(ByteStream::from(generate_binary(5 * 1024 * 1024, 3)))
        .send()
        .await
        .unwrap();

    client.abort_multipart_upload().bucket("b").key("k").upload_id(&upload_id).send().await.unwrap();
    // Aborting an already-aborted upload must still succeed.
    client.abort_multipart_upload().bucket("b").key("k").upload_id(&upload_id).send().await.unwrap();
}
