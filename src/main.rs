//! s3ep - a transparent envelope-encryption proxy for S3-compatible object storage

use axum::{extract::DefaultBodyLimit, middleware, routing::get, Router};
use clap::Parser;
use s3ep::api::auth::{sigv4_auth_middleware, AuthConfig};
use s3ep::api::handlers::{
    bucket_get_handler, create_bucket, delete_bucket, delete_object, delete_objects, get_object,
    head_bucket, head_object, head_root, health_check, list_buckets, post_object,
    put_object_or_copy, AppState,
};
use s3ep::config::{BackendConfig, Config, KeyProviderConfig};
use s3ep::keys::{KeyProvider, NoneKeyProvider, StaticKeyProvider};
use s3ep::metrics::{http_metrics_middleware, metrics_handler, Metrics};
use s3ep::multipart::MultipartSessionManager;
use s3ep::orchestrator::CryptoOrchestrator;
use s3ep::storage::{FilesystemBackend, S3Backend, S3BackendClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// s3ep - transparent envelope-encryption proxy for S3-compatible object storage
#[derive(Parser, Debug)]
#[command(name = "s3ep")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let initial_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("s3ep=trace,tower_http=trace")
        } else {
            EnvFilter::new("s3ep=debug,tower_http=debug")
        }
    });
    tracing_subscriber::fmt().with_env_filter(initial_filter).init();

    let mut config = if let Some(ref path) = cli.config {
        Config::from_file(path)?
    } else {
        Config::load()
    };

    if let Some(ref addr) = cli.listen {
        config.listen_addr = addr.parse()?;
    }

    info!("Starting s3ep v{}", env!("CARGO_PKG_VERSION"));
    info!("  Listen address: {}", config.listen_addr);

    let backend: Arc<dyn S3Backend> = match &config.backend {
        BackendConfig::Filesystem { path } => {
            info!("  Backend: Filesystem");
            info!("  Data directory: {:?}", path);
            Arc::new(FilesystemBackend::new(path.clone()).await?)
        }
        BackendConfig::S3 {
            endpoint, region, ..
        } => {
            info!("  Backend: S3");
            info!("  Region: {}", region);
            if let Some(ep) = endpoint {
                info!("  Endpoint: {}", ep);
            }
            Arc::new(S3BackendClient::new(&config.backend).await?)
        }
    };

    let key_provider: Arc<dyn KeyProvider> = match &config.key_provider {
        KeyProviderConfig::None => {
            warn!("  Key provider: none (objects stored unencrypted)");
            Arc::new(NoneKeyProvider)
        }
        KeyProviderConfig::Static { key_hex } => {
            info!("  Key provider: static");
            let key_bytes = hex::decode(key_hex)
                .map_err(|e| format!("S3EP_STATIC_KEY_HEX is not valid hex: {e}"))?;
            let key: [u8; 32] = key_bytes
                .try_into()
                .map_err(|_| "S3EP_STATIC_KEY_HEX must decode to exactly 32 bytes".to_string())?;
            Arc::new(StaticKeyProvider::new(key))
        }
        KeyProviderConfig::Kms { .. } => {
            return Err(
                "key_provider.type = \"kms\" requires a concrete KmsClient implementation, \
                 which this build does not provide. Configure key_provider.type = \"static\" \
                 or \"none\" instead."
                    .into(),
            );
        }
    };

    info!(
        "  Streaming threshold: {} bytes, segment size: {} bytes",
        config.streaming_threshold, config.segment_size
    );

    if config.auth_enabled() {
        info!(
            "  Authentication: SigV4 ENABLED (access key: {})",
            config.access_key_id.as_deref().unwrap_or("")
        );
    } else {
        warn!("  Authentication: DISABLED (open access) — set S3EP_ACCESS_KEY_ID and S3EP_SECRET_ACCESS_KEY to enable");
    }

    let metrics = Arc::new(Metrics::new());
    metrics.process_start_time_seconds.set(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64(),
    );

    let sessions = Arc::new(MultipartSessionManager::new());
    let orchestrator = Arc::new(CryptoOrchestrator::new(
        backend.clone(),
        key_provider,
        sessions.clone(),
        config.metadata_prefix.clone(),
        config.streaming_threshold,
        config.segment_size,
    ));

    // Spawn periodic sweep of idle multipart crypto sessions.
    spawn_periodic(config.sweep_interval, {
        let orchestrator = orchestrator.clone();
        let idle_ttl = config.session_idle_ttl;
        let metrics = metrics.clone();
        move || {
            let orchestrator = orchestrator.clone();
            let metrics = metrics.clone();
            async move {
                orchestrator.sweep_expired_sessions(idle_ttl).await;
                metrics
                    .multipart_sessions_active
                    .set(orchestrator.sessions().active_count() as f64);
            }
        }
    });

    let state = Arc::new(AppState {
        orchestrator,
        backend,
        metrics: Some(metrics.clone()),
        segment_size: config.segment_size,
    });

    let auth_config: Option<Arc<AuthConfig>> = if let (Some(key_id), Some(secret)) =
        (&config.access_key_id, &config.secret_access_key)
    {
        Some(Arc::new(AuthConfig {
            access_key_id: key_id.clone(),
            secret_access_key: secret.clone(),
        }))
    } else {
        None
    };

    // Build router with S3-style paths
    // S3 API paths:
    //   GET / - list buckets
    //   PUT /{bucket} - create bucket
    //   DELETE /{bucket} - delete bucket
    //   HEAD /{bucket} - head bucket
    //   GET /{bucket}?list-type=2 - list objects
    //   POST /{bucket}?delete - delete multiple objects
    //   PUT /{bucket}/{key...} - upload object (or copy with x-amz-copy-source)
    //   GET /{bucket}/{key...} - download object
    //   HEAD /{bucket}/{key...} - get object metadata
    //   DELETE /{bucket}/{key...} - delete object
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        // Root: list buckets + HEAD probe for S3 client compatibility (Cyberduck, etc.)
        .route("/", get(list_buckets).head(head_root))
        // Object operations (wildcard routes first - more specific)
        .route(
            "/:bucket/*key",
            get(get_object)
                .put(put_object_or_copy)
                .delete(delete_object)
                .head(head_object)
                .post(post_object),
        )
        // Bucket operations (without trailing slash)
        .route(
            "/:bucket",
            get(bucket_get_handler)
                .put(create_bucket)
                .delete(delete_bucket)
                .head(head_bucket)
                .post(delete_objects),
        )
        // Bucket operations (with trailing slash)
        .route(
            "/:bucket/",
            get(bucket_get_handler)
                .put(create_bucket)
                .delete(delete_bucket)
                .head(head_bucket)
                .post(delete_objects),
        )
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            http_metrics_middleware,
        ))
        // SigV4 authentication (no-op when auth_config is None)
        .layer(middleware::from_fn(sigv4_auth_middleware))
        .layer(axum::Extension(auth_config))
        .layer(DefaultBodyLimit::disable())
        // CORS must be outermost to handle OPTIONS preflight before auth
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    // TLS is opt-in: only stand up an HTTPS listener when the operator has
    // configured a certificate/key pair. Plain HTTP otherwise.
    let tls_requested = config.tls.cert_path.is_some() || config.tls.key_path.is_some();

    if tls_requested {
        let rustls_config = s3ep::tls::build_rustls_config(&config.tls).await?;
        info!("  TLS: enabled (user-provided certificate)");

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });

        info!("s3ep listening on https://{}", config.listen_addr);
        axum_server::bind_rustls(config.listen_addr, rustls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        info!("s3ep listening on http://{}", config.listen_addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Spawn a background task that runs an async closure's future every `interval`.
fn spawn_periodic<F, Fut>(interval: Duration, f: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            f().await;
        }
    });
}

/// Handle shutdown signals (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
