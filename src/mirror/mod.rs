// =============================================================================
// Durable Mirror — background persistence of the Snapshot Store
// =============================================================================
//
// Two independent loops, neither on the tick path:
//
//   flush loop        every flush_interval (+ random jitter): snapshot file
//                     and history rings on local disk
//   remote sync loop  every remote_sync: upsert-merge the history rings into
//                     the remote store, then prune past the retention window
//
// Failures are logged and the loop carries on; the live path never waits on
// either of them.
// =============================================================================

pub mod local;
pub mod remote;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::market_data::SnapshotStore;

pub use local::{FlushReport, LocalMirror};
pub use remote::{CandleRow, RemoteStore, SqliteStore};

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub upserted: usize,
    pub pruned: usize,
    pub cutoff: i64,
}

/// Copy the store and write it out on the blocking pool. Errors are logged.
pub async fn flush_now(
    store: &SnapshotStore,
    mirror: &Arc<LocalMirror>,
    now: i64,
) -> Option<FlushReport> {
    let live: Vec<_> = store.all().collect();
    let mirror = mirror.clone();
    match tokio::task::spawn_blocking(move || mirror.flush(&live, now)).await {
        Ok(Ok(report)) => Some(report),
        Ok(Err(e)) => {
            warn!(error = %format!("{e:#}"), "mirror flush failed");
            None
        }
        Err(e) => {
            warn!(error = %e, "mirror flush task panicked");
            None
        }
    }
}

/// Flush on a jittered period until shutdown, then flush once more.
pub async fn run_flush_loop(
    store: Arc<SnapshotStore>,
    mirror: Arc<LocalMirror>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    jitter: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let jitter_ms = jitter.as_millis() as u64;
    info!(
        interval_ms = interval.as_millis() as u64,
        jitter_ms,
        "mirror flush loop starting"
    );

    loop {
        let extra = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        tokio::select! {
            _ = tokio::time::sleep(interval + extra) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
        flush_now(&store, &mirror, clock.now()).await;
    }

    if let Some(report) = flush_now(&store, &mirror, clock.now()).await {
        info!(assets = report.snapshot_assets, "final mirror flush complete");
    }
    Ok(())
}

/// Push every history candle inside the retention window to the remote
/// store, then prune what fell out of it.
pub async fn sync_to_remote(
    mirror: &LocalMirror,
    remote: &dyn RemoteStore,
    now: i64,
    retention_days: i64,
) -> Result<SyncReport> {
    let cutoff = now - retention_days * SECS_PER_DAY;
    let rows: Vec<CandleRow> = mirror
        .all_history()
        .into_iter()
        .flat_map(|(asset, candles)| {
            candles
                .into_iter()
                .filter(move |c| c.time >= cutoff)
                .map(move |candle| CandleRow {
                    asset: asset.clone(),
                    candle,
                })
        })
        .collect();

    let upserted = remote.upsert_merge(&rows).await?;
    let pruned = remote.prune_before(cutoff).await?;
    Ok(SyncReport {
        upserted,
        pruned,
        cutoff,
    })
}

/// Remote sync on a fixed period until shutdown, with one last pass on exit.
pub async fn run_remote_sync_loop(
    mirror: Arc<LocalMirror>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    every: Duration,
    retention_days: i64,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    info!(every_secs = every.as_secs(), retention_days, "remote sync loop starting");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        sync_once(&mirror, remote.as_ref(), clock.now(), retention_days).await;
    }

    sync_once(&mirror, remote.as_ref(), clock.now(), retention_days).await;
    Ok(())
}

async fn sync_once(mirror: &LocalMirror, remote: &dyn RemoteStore, now: i64, retention_days: i64) {
    match sync_to_remote(mirror, remote, now, retention_days).await {
        Ok(report) => debug!(
            upserted = report.upserted,
            pruned = report.pruned,
            "remote sync complete"
        ),
        Err(e) => warn!(error = %format!("{e:#}"), "remote sync failed"),
    }
}
