// =============================================================================
// Subscription Manager — which instruments stream, and how fast we ask
// =============================================================================
//
// The broker drops connections that open many streams back to back, so every
// bulk subscription is paced: after each `batch_size` upstream requests the
// manager pauses for `throttle` before issuing the next batch. No pause
// follows the final batch.
//
// Counters are atomics so the status endpoint can read them lock-free.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::FeedError;
use crate::feed::{Catalog, CatalogDiff, FeedSession};
use crate::types::FeedStatus;

/// Outcome of one bulk subscription pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubscribeReport {
    pub requested: usize,
    pub started: usize,
    pub already_streaming: usize,
    pub failed: Vec<String>,
    pub throttle_pauses: usize,
}

/// Serialisable view of the lifetime counters.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSnapshot {
    pub streams_started: u64,
    pub streams_stopped: u64,
    pub failures: u64,
    pub throttle_pauses: u64,
    pub catalog_refreshes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    stopped: AtomicU64,
    failures: AtomicU64,
    pauses: AtomicU64,
    refreshes: AtomicU64,
}

pub struct SubscriptionManager {
    session: Arc<FeedSession>,
    catalog: Arc<Catalog>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    throttle: Duration,
    stop_closed: bool,
    refresh_every: Duration,
    counters: Counters,
}

impl SubscriptionManager {
    pub fn new(
        session: Arc<FeedSession>,
        catalog: Arc<Catalog>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            session,
            catalog,
            clock,
            batch_size: config.subscribe_batch_size.max(1),
            throttle: config.subscribe_throttle(),
            stop_closed: config.stop_closed_streams,
            refresh_every: config.catalog_refresh(),
            counters: Counters::default(),
        }
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            streams_started: self.counters.started.load(Ordering::Relaxed),
            streams_stopped: self.counters.stopped.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            throttle_pauses: self.counters.pauses.load(Ordering::Relaxed),
            catalog_refreshes: self.counters.refreshes.load(Ordering::Relaxed),
        }
    }

    /// Refresh the catalog and stream every instrument whose market is open.
    pub async fn subscribe_all_open(&self) -> Result<SubscribeReport, FeedError> {
        self.reload_catalog().await?;
        let open = self.catalog.open_symbols();
        let report = self.subscribe_batch(&open).await;
        info!(
            open = open.len(),
            started = report.started,
            already = report.already_streaming,
            failed = report.failed.len(),
            pauses = report.throttle_pauses,
            "subscribed to open instruments"
        );
        Ok(report)
    }

    /// Stream one asset on a consumer's request. `Ok(false)` if it already
    /// streams.
    pub async fn subscribe(&self, asset: &str) -> Result<bool, FeedError> {
        match self.session.start_stream(asset).await {
            Ok(started) => {
                if started {
                    self.counters.started.fetch_add(1, Ordering::Relaxed);
                    info!(asset, "stream started on request");
                }
                Ok(started)
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Re-read the catalog, start newly opened markets and (optionally) stop
    /// the ones that closed.
    pub async fn refresh(&self) -> Result<CatalogDiff, FeedError> {
        self.reload_catalog().await?;
        let diff = self.catalog.diff(&self.session.subscribed_symbols());

        if !diff.opened.is_empty() {
            let report = self.subscribe_batch(&diff.opened).await;
            info!(opened = diff.opened.len(), started = report.started, "markets opened");
        }

        if self.stop_closed {
            for symbol in &diff.closed {
                match self.session.stop_stream(symbol).await {
                    Ok(true) => {
                        self.counters.stopped.fetch_add(1, Ordering::Relaxed);
                        info!(asset = %symbol, "market closed, stream stopped");
                    }
                    Ok(false) => {}
                    Err(e) => {
                        self.counters.failures.fetch_add(1, Ordering::Relaxed);
                        warn!(asset = %symbol, error = %e, "failed to stop closed stream");
                    }
                }
            }
        }
        Ok(diff)
    }

    async fn reload_catalog(&self) -> Result<(), FeedError> {
        let instruments = self.session.list_instruments().await?;
        debug!(count = instruments.len(), "catalog reloaded");
        self.catalog.replace(instruments, self.clock.now());
        self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Issue start requests in paced batches. Already-streaming symbols cost
    /// no upstream request and do not count towards a batch.
    async fn subscribe_batch(&self, symbols: &[String]) -> SubscribeReport {
        let mut report = SubscribeReport {
            requested: symbols.len(),
            ..SubscribeReport::default()
        };
        let mut issued = 0usize;

        for (i, symbol) in symbols.iter().enumerate() {
            match self.session.start_stream(symbol).await {
                Ok(false) => {
                    report.already_streaming += 1;
                    continue;
                }
                Ok(true) => {
                    report.started += 1;
                    self.counters.started.fetch_add(1, Ordering::Relaxed);
                }
                Err(FeedError::NotConnected) => {
                    warn!(remaining = symbols.len() - i, "session dropped during subscription pass");
                    report.failed.extend(symbols[i..].iter().cloned());
                    break;
                }
                Err(e) => {
                    warn!(asset = %symbol, error = %e, "subscription failed");
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    report.failed.push(symbol.clone());
                }
            }

            issued += 1;
            if issued % self.batch_size == 0 && i + 1 < symbols.len() {
                debug!(issued, pause_ms = self.throttle.as_millis() as u64, "subscription throttle");
                self.clock.sleep(self.throttle).await;
                report.throttle_pauses += 1;
                self.counters.pauses.fetch_add(1, Ordering::Relaxed);
            }
        }
        report
    }

    /// Subscribe on every transition into `Connected`, refresh the catalog
    /// periodically, stop on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut status_rx = self.session.subscribe_status();
        let mut ticker = tokio::time::interval(self.refresh_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        info!(
            batch = self.batch_size,
            throttle_ms = self.throttle.as_millis() as u64,
            refresh_secs = self.refresh_every.as_secs(),
            "subscription manager starting"
        );

        if *status_rx.borrow_and_update() == FeedStatus::Connected {
            self.on_connected().await;
        }

        loop {
            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = *status_rx.borrow_and_update();
                    if status == FeedStatus::Connected {
                        self.on_connected().await;
                    }
                }
                _ = ticker.tick() => {
                    if self.session.status() == FeedStatus::Connected {
                        if let Err(e) = self.refresh().await {
                            warn!(error = %e, "catalog refresh failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("subscription manager stopped");
        Ok(())
    }

    async fn on_connected(&self) {
        if let Err(e) = self.subscribe_all_open().await {
            warn!(error = %e, "initial subscription pass failed");
        }
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("batch_size", &self.batch_size)
            .field("throttle", &self.throttle)
            .field("counters", &self.counters)
            .finish()
    }
}
