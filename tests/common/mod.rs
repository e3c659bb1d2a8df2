//! Shared test infrastructure for integration tests
//!
//! Spawns the real `s3ep` binary against a filesystem backend (optionally
//! with a static key provider enabled) and hands back an S3 SDK client
//! pointed at it.

#![allow(dead_code)]

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::Client;
use rand::{Rng, SeedableRng};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

static PORT_COUNTER: AtomicU16 = AtomicU16::new(19500);

/// A 32-byte key used by every test that wants the static key provider.
pub const TEST_KEY_HEX: &str =
    "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

/// Test server wrapper that spawns a real `s3ep` binary.
pub struct TestServer {
    process: Child,
    port: u16,
    _data_dir: TempDir,
}

impl TestServer {
    /// Filesystem backend, identity key provider (no encryption).
    pub async fn identity() -> Self {
        Self::spawn(&[]).await
    }

    /// Filesystem backend, static key provider, small streaming threshold so
    /// tests can exercise the CTR path without huge payloads.
    pub async fn encrypted() -> Self {
        Self::spawn(&[
            ("S3EP_STATIC_KEY_HEX", TEST_KEY_HEX),
            ("S3EP_STREAMING_THRESHOLD", "4096"),
        ])
        .await
    }

    /// Filesystem backend, static key provider, with a caller-chosen
    /// streaming threshold.
    pub async fn encrypted_with_threshold(threshold: u64) -> Self {
        Self::spawn(&[
            ("S3EP_STATIC_KEY_HEX", TEST_KEY_HEX),
            ("S3EP_STREAMING_THRESHOLD", &threshold.to_string()),
        ])
        .await
    }

    async fn spawn(extra_env: &[(&str, &str)]) -> Self {
        let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let data_dir = TempDir::new().expect("failed to create temp dir");

        let mut cmd = Command::new(env!("CARGO_BIN_EXE_s3ep"));
        cmd.env("S3EP_LISTEN_ADDR", format!("127.0.0.1:{port}"))
            .env("S3EP_DATA_DIR", data_dir.path())
            .env("RUST_LOG", "s3ep=warn");
        for (k, v) in extra_env {
            cmd.env(k, v);
        }

        let process = cmd.spawn().expect("failed to start s3ep");

        let mut server = Self {
            process,
            port,
            _data_dir: data_dir,
        };
        server.wait_ready().await;
        server
    }

    async fn wait_ready(&mut self) {
        let addr = format!("127.0.0.1:{}", self.port);
        for _ in 0..150 {
            if std::net::TcpStream::connect(&addr).is_ok() {
                sleep(Duration::from_millis(100)).await;
                return;
            }
            if let Ok(Some(status)) = self.process.try_wait() {
                panic!("server exited before becoming ready: {status}");
            }
            sleep(Duration::from_millis(100)).await;
        }
        let _ = self.process.kill();
        panic!("timed out waiting for server on {addr}");
    }

    /// Create an S3 SDK client configured for this test server.
    pub fn s3_client(&self) -> Client {
        let credentials = Credentials::new("test", "test", None, None, "test");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(self.endpoint())
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Client::from_conf(config)
    }

    /// Plain HTTP client for tests that need raw headers (force-algorithm
    /// sentinels, direct object GET/HEAD) the S3 SDK doesn't expose cleanly.
    pub fn http_client(&self) -> reqwest::Client {
        reqwest::Client::new()
    }

    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint(), bucket, key)
    }

    /// Path to the stored (ciphertext) object on disk, for tests that need
    /// to tamper with bytes the proxy never lets a client touch directly.
    pub fn stored_object_path(&self, bucket: &str, key: &str) -> std::path::PathBuf {
        self._data_dir.path().join(bucket).join("objects").join(key)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.process.kill();
    }
}

/// Generate deterministic pseudo-random binary data.
pub fn generate_binary(size: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; size];
    rng.fill(&mut data[..]);
    data
}
