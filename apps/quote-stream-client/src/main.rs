//! Quote Stream Client Binary
//!
//! Streams the configured watchlist into the quote table and serves health
//! and metrics endpoints.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin quote-stream-client
//! ```
//!
//! # Environment Variables
//!
//! - `QUOTE_STREAM_URL`: Gateway WebSocket URL (unset: snapshots only)
//! - `QUOTE_STREAM_MARKET_STATUS_URL`: Market-status endpoint
//! - `QUOTE_STREAM_SNAPSHOT_URL`: Snapshot-quote endpoint
//! - `QUOTE_STREAM_WATCHLIST`: Comma-separated canonical instrument keys
//! - `QUOTE_STREAM_CACHE_PATH`: Persistence cache (default: .quote-cache.json)
//! - `QUOTE_STREAM_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: Log level (default: info)
//!
//! Timing knobs (`QUOTE_STREAM_BATCH_WINDOW_MS`, `QUOTE_STREAM_GRACE_MS`,
//! `QUOTE_STREAM_RECONNECT_*`, `QUOTE_STREAM_PING_INTERVAL_SECS`, ...) are
//! listed on `ClientConfig`.

use std::sync::Arc;
use std::time::Duration;

use quote_stream_client::application::ports::{MarketStatusPort, QuoteCache, SnapshotPort};
use quote_stream_client::infrastructure::collaborators::{
    HttpMarketStatusClient, HttpSnapshotClient, build_http_client,
};
use quote_stream_client::infrastructure::persistence::FileQuoteCache;
use quote_stream_client::infrastructure::telemetry;
use quote_stream_client::{
    ClientConfig, ConnectionManager, HealthServer, HealthServerState, InstrumentKey, ManagerDeps,
    QuoteStore, SnapshotPoller, TungsteniteConnector, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        return Err("failed to install rustls crypto provider".into());
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Quote Stream Client");

    let _metrics_handle = init_metrics()?;

    let config = ClientConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Restore last known quotes
    let store = Arc::new(QuoteStore::default());
    let (file_cache, cache_writer) = FileQuoteCache::open(&config.cache_path);
    let file_cache = Arc::new(file_cache);
    let writer_handle = tokio::spawn(cache_writer.run());
    let cache: Arc<dyn QuoteCache> = file_cache.clone();
    seed_store(&store, cache.as_ref());

    // Collaborators
    let http = build_http_client(config.collaborators.timeout)?;
    let market = config.collaborators.market_status_url.as_ref().map(|url| {
        Arc::new(HttpMarketStatusClient::new(http.clone(), url.clone())) as Arc<dyn MarketStatusPort>
    });
    let poller = config.collaborators.snapshot_url.as_ref().map(|url| {
        let snapshots: Arc<dyn SnapshotPort> = Arc::new(HttpSnapshotClient::new(http.clone(), url.clone()));
        SnapshotPoller::new(snapshots, Arc::clone(&store), Arc::clone(&cache))
    });

    let deps = ManagerDeps {
        connector: Arc::new(TungsteniteConnector::new()),
        market,
        poller,
        store: Arc::clone(&store),
        cache,
    };
    let (client, manager_handle) =
        ConnectionManager::spawn(config.manager_config(), deps, shutdown_token.child_token());

    client.set_desired(config.watchlist.clone()).await?;
    client.connect().await?;

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        client.clone(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    await_shutdown(shutdown_token.clone()).await;

    if let Err(e) = client.disconnect().await {
        tracing::debug!(error = %e, "Connection manager already stopped");
    }
    shutdown_token.cancel();

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = manager_handle.await;
        let _ = health_handle.await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out"
        );
    }

    if let Err(e) = file_cache.flush().await {
        tracing::warn!(error = %e, "Failed to flush quote cache");
    }
    writer_handle.abort();

    tracing::info!("Quote Stream Client stopped");
    Ok(())
}

/// Seed the quote table from the persistence cache.
fn seed_store(store: &QuoteStore, cache: &dyn QuoteCache) {
    let records = match cache.load_all() {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read quote cache");
            return;
        }
    };

    let quotes = records.into_iter().filter_map(|(canonical, record)| {
        match canonical.parse::<InstrumentKey>() {
            Ok(key) => Some(record.into_quote(key)),
            Err(e) => {
                tracing::debug!(key = %canonical, error = %e, "Skipping unparseable cache entry");
                None
            }
        }
    });
    let restored = store.upsert(quotes);
    tracing::info!(restored, "Restored last known quotes");
}

/// Log the parsed configuration.
fn log_config(config: &ClientConfig) {
    tracing::info!(
        streaming = config.stream.url.is_some(),
        market_status = config.collaborators.market_status_url.is_some(),
        snapshots = config.collaborators.snapshot_url.is_some(),
        watchlist = config.watchlist.len(),
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        url = ?config.stream.url,
        batch_window_ms = u64::try_from(config.stream.batch_window.as_millis()).unwrap_or(u64::MAX),
        cache_path = %config.cache_path.display(),
        "Stream settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_token.cancelled() => {}
    }
}
