// =============================================================================
// Engine — the single owned aggregate of every shared component
// =============================================================================
//
// Built once in `main` and handed to the API and background loops as an
// `Arc<Engine>`. Nothing in the crate reaches for process-wide globals; the
// upstream client handle lives inside the Feed Session and is released by
// `Engine::release` on shutdown.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::feed::{Catalog, FeedSession, SubscriptionManager, UpstreamConnector};
use crate::market_data::SnapshotStore;
use crate::mirror::{self, LocalMirror, RemoteStore};
use crate::resolution::ResolutionService;
use crate::supervisor::{supervise, FailureLog, RestartPolicy};

pub struct Engine {
    pub config: EngineConfig,
    pub clock: Arc<dyn Clock>,

    // ── Live state ──────────────────────────────────────────────────────
    pub store: Arc<SnapshotStore>,
    pub catalog: Arc<Catalog>,

    // ── Upstream ────────────────────────────────────────────────────────
    pub session: Arc<FeedSession>,
    pub subscriptions: Arc<SubscriptionManager>,

    // ── Persistence ─────────────────────────────────────────────────────
    pub mirror: Arc<LocalMirror>,
    pub remote: Option<Arc<dyn RemoteStore>>,

    // ── Queries ─────────────────────────────────────────────────────────
    pub resolution: ResolutionService,

    // ── Operations ──────────────────────────────────────────────────────
    pub failures: Arc<FailureLog>,
    pub start_time: Instant,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        connector: Arc<dyn UpstreamConnector>,
        clock: Arc<dyn Clock>,
        mirror: Arc<LocalMirror>,
        remote: Option<Arc<dyn RemoteStore>>,
    ) -> Arc<Self> {
        let store = Arc::new(SnapshotStore::new());
        let catalog = Arc::new(Catalog::new());
        let session = Arc::new(FeedSession::new(connector, clock.clone(), &config));
        let subscriptions = Arc::new(SubscriptionManager::new(
            session.clone(),
            catalog.clone(),
            clock.clone(),
            &config,
        ));
        let resolution = ResolutionService::new(
            store.clone(),
            mirror.clone(),
            catalog.clone(),
            session.clone(),
            remote.clone(),
            config.interval_secs,
        );
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            config,
            clock,
            store,
            catalog,
            session,
            subscriptions,
            mirror,
            remote,
            resolution,
            failures: Arc::new(FailureLog::new()),
            start_time: Instant::now(),
            shutdown_tx,
        })
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Ask every background loop to stop.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Release the upstream connection.
    pub async fn release(&self) {
        self.session.shutdown().await;
    }

    /// Start the feed session, subscription manager and mirror loops under
    /// supervision.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let policy = RestartPolicy::default();
        let mut handles = Vec::new();

        {
            let session = self.session.clone();
            let store = self.store.clone();
            let rx = self.shutdown_signal();
            handles.push(supervise(
                "feed_session",
                policy,
                self.failures.clone(),
                self.shutdown_signal(),
                move || session.clone().run(store.clone(), rx.clone()),
            ));
        }

        {
            let subscriptions = self.subscriptions.clone();
            let rx = self.shutdown_signal();
            handles.push(supervise(
                "subscriptions",
                policy,
                self.failures.clone(),
                self.shutdown_signal(),
                move || subscriptions.clone().run(rx.clone()),
            ));
        }

        {
            let store = self.store.clone();
            let mirror = self.mirror.clone();
            let clock = self.clock.clone();
            let interval = std::time::Duration::from_millis(self.config.flush_interval_ms);
            let jitter = std::time::Duration::from_millis(self.config.flush_jitter_ms);
            let rx = self.shutdown_signal();
            handles.push(supervise(
                "mirror_flush",
                policy,
                self.failures.clone(),
                self.shutdown_signal(),
                move || {
                    mirror::run_flush_loop(
                        store.clone(),
                        mirror.clone(),
                        clock.clone(),
                        interval,
                        jitter,
                        rx.clone(),
                    )
                },
            ));
        }

        if let Some(remote) = &self.remote {
            let remote = remote.clone();
            let mirror = self.mirror.clone();
            let clock = self.clock.clone();
            let every = self.config.remote_sync();
            let retention = self.config.retention_days;
            let rx = self.shutdown_signal();
            handles.push(supervise(
                "remote_sync",
                policy,
                self.failures.clone(),
                self.shutdown_signal(),
                move || {
                    mirror::run_remote_sync_loop(
                        mirror.clone(),
                        remote.clone(),
                        clock.clone(),
                        every,
                        retention,
                        rx.clone(),
                    )
                },
            ));
        }

        info!(tasks = handles.len(), "background tasks started");
        handles
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("session", &self.session)
            .field("live_assets", &self.store.len())
            .field("mirror", &self.mirror)
            .finish()
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::Credentials;
    use crate::feed::fake::{FakeConnector, FakeFeed};

    pub fn credentials() -> Credentials {
        Credentials {
            email: "ops@example.com".into(),
            password: "secret".into(),
        }
    }

    /// Engine over a fake upstream and a temporary data dir.
    pub fn engine_with(
        config: EngineConfig,
        feed: FakeFeed,
    ) -> (Arc<Engine>, Arc<FakeConnector>, tempfile::TempDir) {
        engine_parts(config, feed, Arc::new(SystemClock), None)
    }

    /// Engine with an explicit clock and remote store.
    pub fn engine_parts(
        config: EngineConfig,
        feed: FakeFeed,
        clock: Arc<dyn Clock>,
        remote: Option<Arc<dyn RemoteStore>>,
    ) -> (Arc<Engine>, Arc<FakeConnector>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mirror = Arc::new(LocalMirror::open(dir.path(), config.history_max_candles).unwrap());
        let connector = Arc::new(FakeConnector::new(feed));
        let engine = Engine::new(config, connector.clone(), clock, mirror, remote);
        (engine, connector, dir)
    }

    pub fn engine(feed: FakeFeed) -> (Arc<Engine>, Arc<FakeConnector>, tempfile::TempDir) {
        engine_with(
            EngineConfig {
                credentials: credentials(),
                ..EngineConfig::default()
            },
            feed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::engine;
    use super::*;
    use crate::feed::fake::{instrument, FakeFeed};
    use crate::types::{FeedStatus, Tick};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn background_loops_ingest_and_shut_down_cleanly() {
        let feed = FakeFeed::with_instruments(vec![
            instrument("EURUSD_otc", true),
            instrument("GBPUSD_otc", true),
            instrument("USDJPY_otc", false),
        ]);
        let (engine, connector, _dir) = engine(feed);
        let handles = engine.spawn_background();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(engine.session.status(), FeedStatus::Connected);
        assert_eq!(engine.session.subscribed_count(), 2);

        connector
            .feed
            .ticks
            .push(Tick::new("EURUSD_otc", 1.0841, engine.clock.now()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(engine.store.get("EURUSD_otc").is_some());

        engine.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(engine.is_shutting_down());
        assert!(connector.feed.closed.load(Ordering::SeqCst));
        assert_eq!(engine.session.status(), FeedStatus::Disconnected);
        assert!(engine.mirror.is_cached("EURUSD_otc"));
        assert!(engine.failures.is_empty());
    }
}
