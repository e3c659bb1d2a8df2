//! Error response XML compliance tests
//!
//! Uses reqwest (not aws-sdk-s3) to inspect raw HTTP responses: error
//! codes, status codes, and Content-Type headers.

mod common;

use common::TestServer;

#[tokio::test]
async fn nosuchkey_xml_response() {
    let server = TestServer::identity().await;
    let client = server.http_client();
    let s3 = server.s3_client();
    s3.create_bucket().bucket("b").send().await.unwrap();

    let resp = client.get(server.object_url("b", "nonexistent.txt")).send().await.unwrap();

    assert_eq!(resp.status().as_u16(), 404);
    let body = resp.text().await.unwrap();
    assert!(
        body.contains("<Code>NoSuchKey</Code>"),
        "should contain NoSuchKey error code, got: {body}"
    );
}

#[tokio::test]
async fn nosuchbucket_xml_response() {
    let server = TestServer::identity().await;
    let client = server.http_client();

    let resp = client
        .get(server.object_url("nonexistent-bucket", "file.txt"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 404);
    let body = resp.text().await.unwrap();
    assert!(
        body.contains("<Code>NoSuchBucket</Code>"),
        "should contain NoSuchBucket error code, got: {body}"
    );
}

#[tokio::test]
async fn malformed_xml_delete_request() {
    let server = TestServer::identity().await;
    let client = server.http_client();
    let s3 = server.s3_client();
    s3.create_bucket().bucket("b").send().await.unwrap();

    let url = format!("{}/b?delete", server.endpoint());
    let resp = client
        .post(&url)
        .header("content-type", "application/xml")
        .body("this is not valid xml at all <<<>>>")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 400);
    let body = resp.text().await.unwrap();
    assert!(
        body.contains("<Code>MalformedXML</Code>"),
        "should contain MalformedXML error code, got: {body}"
    );
}

#[tokio::test]
async fn error_content_type_is_xml() {
    let server = TestServer::identity().await;
    let client = server.http_client();
    let s3 = server.s3_client();
    s3.create_bucket().bucket("b").send().await.unwrap();

    let resp = client.get(server.object_url("b", "missing.txt")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    let ct = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    assert!(
        ct.contains("application/xml"),
        "error Content-Type should be application/xml, got: {ct}"
    );
}

#[tokio::test]
async fn copy_object_rejected_with_encryption_enabled() {
    let server = TestServer::encrypted().await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();

    let body = common::generate_binary(256, 42);
    client
        .put_object()
        .bucket("b")
        .key("src.bin")
        .body(body.into())
        .send()
        .await
        .unwrap();

    let err = client
        .copy_object()
        .bucket("b")
        .key("dst.bin")
        .copy_source("b/src.bin")
        .send()
        .await
        .unwrap_err();

    let status = err.raw_response().map(|r| r.status().as_u16());
    assert_eq!(status, Some(422), "CopyObject with an active key provider must be rejected, got {err:?}");
}

#[tokio::test]
async fn copy_object_allowed_in_identity_mode() {
    let server = TestServer::identity().await;
    let client = server.s3_client();
    client.create_bucket().bucket("b").send().await.unwrap();

    let body = common::generate_binary(256, 43);
    client
        .put_object()
        .bucket("b")
        .key("src.bin")
        .body(body.clone().into())
        .send()
        .await
        .unwrap();

    client
        .copy_object()
        .bucket("b")
        .key("dst.bin")
        .copy_source("b/src.bin")
        .send()
        .await
        .unwrap();

    let got = client.get_object().bucket("b").key("dst.bin").send().await.unwrap();
    let bytes = got.body.collect().await.unwrap().into_bytes();
    assert_eq!(bytes.as_ref(), body.as_slice());
}
