//! Configuration for the s3ep envelope-encryption proxy.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Backend S3-compatible store the proxy forwards to.
    #[serde(default)]
    pub backend: BackendConfig,

    /// How the DEK for each object is protected at rest.
    #[serde(default)]
    pub key_provider: KeyProviderConfig,

    /// TLS configuration for the listener.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Object prefix for envelope metadata keys (e.g. `s3ep-encrypted-dek`).
    #[serde(default = "default_metadata_prefix")]
    pub metadata_prefix: String,

    /// Objects at or above this size use streaming AES-256-CTR instead of
    /// one-shot AES-256-GCM, unless a force-content-type sentinel overrides
    /// the choice.
    #[serde(default = "default_streaming_threshold")]
    pub streaming_threshold: u64,

    /// Plaintext bytes per CTR segment for objects above the small-object
    /// threshold.
    #[serde(default = "default_segment_size")]
    pub segment_size: u64,

    /// Minimum multipart part size accepted by the backend (parts below
    /// this can't be streamed as CTR multipart and fall back to direct PUT).
    #[serde(default = "default_min_part_size")]
    pub min_part_size: u64,

    /// How long an idle (non-terminal) multipart session is kept before
    /// the sweeper aborts it.
    #[serde(default = "default_session_idle_ttl_secs", with = "duration_secs")]
    pub session_idle_ttl: Duration,

    /// How often the idle-session sweeper runs.
    #[serde(default = "default_sweep_interval_secs", with = "duration_secs")]
    pub sweep_interval: Duration,

    /// Proxy-level SigV4 credentials. Distinct from any backend S3
    /// connection credentials under `backend` — when unset, the proxy
    /// accepts requests unauthenticated.
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// In-memory/filesystem backend for local development and tests.
    Filesystem {
        /// Directory for object data storage.
        path: PathBuf,
    },

    /// Real S3-compatible backend for production use. Bucket names are
    /// taken from each request and passed through unchanged — the proxy
    /// does not remap or flatten bucket namespaces.
    S3 {
        /// S3 endpoint URL (for MinIO, LocalStack, or a custom
        /// S3-compatible service). If unset, uses the AWS default endpoint.
        #[serde(default)]
        endpoint: Option<String>,

        /// AWS region.
        #[serde(default = "default_region")]
        region: String,

        /// Use path-style URLs (required for MinIO, LocalStack).
        #[serde(default = "default_force_path_style")]
        force_path_style: bool,

        /// AWS access key ID (optional, can use env/instance credentials).
        #[serde(default)]
        access_key_id: Option<String>,

        /// AWS secret access key (optional, can use env/instance credentials).
        #[serde(default)]
        secret_access_key: Option<String>,
    },
}

/// Which [`crate::keys::KeyProvider`] to construct at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KeyProviderConfig {
    /// Crypto path disabled; objects pass through unmodified.
    None,
    /// A single 32-byte key, held in memory, wrapping every DEK.
    Static {
        /// Hex-encoded 32-byte key.
        key_hex: String,
    },
    /// An external KMS reached over an opaque RPC trait object.
    Kms {
        key_id: String,
        endpoint: Option<String>,
    },
}

impl Default for KeyProviderConfig {
    fn default() -> Self {
        KeyProviderConfig::None
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain path. If unset (along with `key_path`), a
    /// self-signed certificate is generated for `localhost`/`127.0.0.1`.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// PEM private key path.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:9000".parse().unwrap()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_force_path_style() -> bool {
    true
}

fn default_metadata_prefix() -> String {
    crate::types::meta_keys::DEFAULT_PREFIX.to_string()
}

fn default_streaming_threshold() -> u64 {
    1024 * 1024 // 1 MiB
}

fn default_segment_size() -> u64 {
    crate::codec::streaming::DEFAULT_SEGMENT_SIZE
}

fn default_min_part_size() -> u64 {
    1024 // 1 KiB
}

fn default_session_idle_ttl_secs() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_sweep_interval_secs() -> Duration {
    Duration::from_secs(60)
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Filesystem {
            path: PathBuf::from("./data"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            backend: BackendConfig::default(),
            key_provider: KeyProviderConfig::default(),
            tls: TlsConfig::default(),
            metadata_prefix: default_metadata_prefix(),
            streaming_threshold: default_streaming_threshold(),
            segment_size: default_segment_size(),
            min_part_size: default_min_part_size(),
            session_idle_ttl: default_session_idle_ttl_secs(),
            sweep_interval: default_sweep_interval_secs(),
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

impl Config {
    /// Whether the proxy requires SigV4-authenticated requests.
    pub fn auth_enabled(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("S3EP_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.listen_addr = parsed;
            }
        }

        if std::env::var("S3EP_S3_ENDPOINT").is_ok() || std::env::var("AWS_ACCESS_KEY_ID").is_ok() {
            config.backend = BackendConfig::S3 {
                endpoint: std::env::var("S3EP_S3_ENDPOINT").ok(),
                region: std::env::var("S3EP_S3_REGION").unwrap_or_else(|_| default_region()),
                force_path_style: std::env::var("S3EP_S3_FORCE_PATH_STYLE")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or_else(|_| default_force_path_style()),
                access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
                secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
            };
        } else if let Ok(dir) = std::env::var("S3EP_DATA_DIR") {
            config.backend = BackendConfig::Filesystem {
                path: PathBuf::from(dir),
            };
        }

        if let Ok(key_hex) = std::env::var("S3EP_STATIC_KEY_HEX") {
            config.key_provider = KeyProviderConfig::Static { key_hex };
        } else if let Ok(key_id) = std::env::var("S3EP_KMS_KEY_ID") {
            config.key_provider = KeyProviderConfig::Kms {
                key_id,
                endpoint: std::env::var("S3EP_KMS_ENDPOINT").ok(),
            };
        }

        if let Ok(cert) = std::env::var("S3EP_TLS_CERT_PATH") {
            config.tls.cert_path = Some(PathBuf::from(cert));
        }
        if let Ok(key) = std::env::var("S3EP_TLS_KEY_PATH") {
            config.tls.key_path = Some(PathBuf::from(key));
        }

        if let Ok(prefix) = std::env::var("S3EP_METADATA_PREFIX") {
            config.metadata_prefix = prefix;
        }

        if let Ok(threshold) = std::env::var("S3EP_STREAMING_THRESHOLD") {
            if let Ok(parsed) = threshold.parse() {
                config.streaming_threshold = parsed;
            }
        }

        if let Ok(ttl) = std::env::var("S3EP_SESSION_IDLE_TTL_SECS") {
            if let Ok(parsed) = ttl.parse() {
                config.session_idle_ttl = Duration::from_secs(parsed);
            }
        }

        config.access_key_id = std::env::var("S3EP_ACCESS_KEY_ID").ok();
        config.secret_access_key = std::env::var("S3EP_SECRET_ACCESS_KEY").ok();

        config
    }

    /// Load configuration from file if configured/present, otherwise from
    /// environment variables.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("S3EP_CONFIG") {
            if let Ok(config) = Self::from_file(&path) {
                return config;
            }
        }

        for path in &["s3ep.toml", "/etc/s3ep/config.toml"] {
            if std::path::Path::new(path).exists() {
                if let Ok(config) = Self::from_file(path) {
                    return config;
                }
            }
        }

        Self::from_env()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_filesystem_backend() {
        let config = Config::default();
        assert_eq!(config.listen_addr.port(), 9000);
        assert!(matches!(config.backend, BackendConfig::Filesystem { .. }));
        assert!(matches!(config.key_provider, KeyProviderConfig::None));
    }

    #[test]
    fn parses_filesystem_backend() {
        let toml = r#"
            listen_addr = "0.0.0.0:8080"

            [backend]
            type = "filesystem"
            path = "/var/lib/s3ep"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        match config.backend {
            BackendConfig::Filesystem { path } => assert_eq!(path, PathBuf::from("/var/lib/s3ep")),
            _ => panic!("expected filesystem backend"),
        }
    }

    #[test]
    fn parses_s3_backend_and_static_key() {
        let toml = r#"
            [backend]
            type = "s3"
            endpoint = "http://localhost:9000"
            region = "us-east-1"
            force_path_style = true

            [key_provider]
            type = "static"
            key_hex = "00112233445566778899aabbccddeeff00112233445566778899aabbccddee"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        match config.backend {
            BackendConfig::S3 {
                endpoint,
                region,
                force_path_style,
                ..
            } => {
                assert_eq!(endpoint, Some("http://localhost:9000".to_string()));
                assert_eq!(region, "us-east-1");
                assert!(force_path_style);
            }
            _ => panic!("expected S3 backend"),
        }
        assert!(matches!(config.key_provider, KeyProviderConfig::Static { .. }));
    }

    #[test]
    fn default_segment_size_matches_codec_default() {
        assert_eq!(
            Config::default().segment_size,
            crate::codec::streaming::DEFAULT_SEGMENT_SIZE
        );
    }
}
