// =============================================================================
// Lux Engine — Main Entry Point
// =============================================================================
//
// Aggregates upstream price ticks into per-asset candles, mirrors them to disk
// and an optional SQLite store, and serves them over HTTP and WebSocket.
//
// Missing upstream credentials do not stop the process: the feed session
// parks in `Failed` and the API keeps serving disk-cached data.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod clock;
mod config;
mod engine;
mod error;
mod feed;
mod market_data;
mod mirror;
mod resolution;
mod supervisor;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::clock::SystemClock;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::feed::bridge::BridgeConnector;
use crate::mirror::{LocalMirror, RemoteStore, SqliteStore};

const CONFIG_PATH: &str = "lux_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Lux Engine starting up");

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %format!("{e:#}"), "Failed to load config, using defaults");
        EngineConfig::default()
    });
    config.apply_env();
    config.validate()?;

    if !config.credentials.is_complete() {
        warn!("LUX_FEED_EMAIL / LUX_FEED_PASSWORD not set, serving cached data only");
    }
    info!(
        interval_secs = config.interval_secs,
        data_dir = %config.data_dir.display(),
        bridge = %config.bridge_url,
        "Engine configured"
    );

    // ── 2. Persistence ───────────────────────────────────────────────────
    let mirror = Arc::new(LocalMirror::open(
        &config.data_dir,
        config.history_max_candles,
    )?);

    let remote: Option<Arc<dyn RemoteStore>> = match &config.remote_db_path {
        Some(path) => match SqliteStore::open(path) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Remote store unavailable, remote sync disabled");
                None
            }
        },
        None => None,
    };

    // ── 3. Upstream & engine ─────────────────────────────────────────────
    let connector = Arc::new(BridgeConnector::new(config.bridge_url.clone())?);
    let bind_addr = config.bind_addr.clone();
    let engine = Engine::new(config, connector, Arc::new(SystemClock), mirror, remote);

    let handles = engine.spawn_background();

    // ── 4. API server ────────────────────────────────────────────────────
    let app = api::router(engine.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let mut stop = engine.shutdown_signal();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop.wait_for(|s| *s).await;
            })
            .await
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping gracefully");
    engine.shutdown();

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "background task did not stop cleanly");
        }
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
    }
    engine.release().await;

    info!("Lux Engine shut down complete.");
    Ok(())
}
