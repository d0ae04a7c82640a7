// =============================================================================
// Feed Session — upstream connection lifecycle
// =============================================================================
//
//   Disconnected ──try_connect──▶ Connecting ──ok──▶ Connected
//        ▲                           │  │                │
//        │  retries exhausted /      │  └─ verification ─┤ code accepted
//        │  rejected (cooldown set)  │     required      │
//        └───────────────────────────┘                   │
//        └────────────── drain error / disconnect ───────┘
//
// `Failed` is reserved for configuration problems and is never left.
//
// The session is the only owner of the upstream client handle. Every other
// component goes through the methods here, and the handle is dropped on
// every disconnect so the next cycle starts from a clean handshake.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{Credentials, EngineConfig};
use crate::error::FeedError;
use crate::feed::{UpstreamConnector, UpstreamFeed};
use crate::market_data::candle_folder::FoldOutcome;
use crate::market_data::snapshot_store::SnapshotStore;
use crate::types::{Candle, FeedStatus, Instrument};

/// How long a pending verification may wait for its code.
pub const VERIFICATION_WINDOW_SECS: i64 = 600;

/// Poll period while waiting for a verification code.
const VERIFICATION_POLL: Duration = Duration::from_secs(1);

/// Observable session state. Status and reason always change together.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionState {
    pub status: FeedStatus,
    pub last_attempt_time: Option<i64>,
    pub cooldown_until: Option<i64>,
    pub error_reason: Option<String>,
    pub awaiting_verification: bool,
    pub verification_deadline: Option<i64>,
}

/// Result of one [`FeedSession::try_connect`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    Connected,
    AwaitingVerification,
    /// Denied: a previous failure set a cooldown that has not elapsed.
    CoolingDown { until: i64 },
    AlreadyConnected,
    /// Another connect cycle is in flight.
    Busy,
    /// Retries exhausted or credentials rejected; cooldown armed.
    GaveUp(FeedError),
    /// Terminal configuration error.
    Fatal(FeedError),
}

pub struct FeedSession {
    connector: Arc<dyn UpstreamConnector>,
    clock: Arc<dyn Clock>,
    credentials: Credentials,
    cooldown_secs: i64,
    retries: u32,
    retry_delay: Duration,
    interval: i64,
    drain_poll: Duration,
    state: RwLock<SessionState>,
    client: RwLock<Option<Arc<dyn UpstreamFeed>>>,
    subscribed: Mutex<HashSet<String>>,
    connect_lock: tokio::sync::Mutex<()>,
    status_tx: watch::Sender<FeedStatus>,
}

impl FeedSession {
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(FeedStatus::Disconnected);
        Self {
            connector,
            clock,
            credentials: config.credentials.clone(),
            cooldown_secs: config.cooldown_secs,
            retries: config.connect_retries.max(1),
            retry_delay: config.retry_delay(),
            interval: config.interval_secs,
            drain_poll: config.drain_poll(),
            state: RwLock::new(SessionState::default()),
            client: RwLock::new(None),
            subscribed: Mutex::new(HashSet::new()),
            connect_lock: tokio::sync::Mutex::new(()),
            status_tx,
        }
    }

    // -------------------------------------------------------------------------
    // Observability
    // -------------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn status(&self) -> FeedStatus {
        self.state.read().status
    }

    /// Receiver that observes every status transition.
    pub fn subscribe_status(&self) -> watch::Receiver<FeedStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.subscribed.lock().contains(symbol)
    }

    pub fn subscribed_symbols(&self) -> HashSet<String> {
        self.subscribed.lock().clone()
    }

    pub fn subscribed_count(&self) -> usize {
        self.subscribed.lock().len()
    }

    /// Apply `f` to the state and publish the new status while still holding
    /// the write lock, so readers never see status and reason disagree.
    fn transition(&self, f: impl FnOnce(&mut SessionState)) {
        let mut state = self.state.write();
        f(&mut state);
        self.status_tx.send_replace(state.status);
    }

    fn connected_client(&self) -> Result<Arc<dyn UpstreamFeed>, FeedError> {
        if self.status() != FeedStatus::Connected {
            return Err(FeedError::NotConnected);
        }
        self.client.read().clone().ok_or(FeedError::NotConnected)
    }

    // -------------------------------------------------------------------------
    // Connect / verify / disconnect
    // -------------------------------------------------------------------------

    /// Run one connect cycle if the current state allows it.
    pub async fn try_connect(&self) -> ConnectOutcome {
        {
            let state = self.state.read();
            match state.status {
                FeedStatus::Failed => {
                    let reason = state.error_reason.clone().unwrap_or_default();
                    return ConnectOutcome::Fatal(FeedError::Config(reason));
                }
                FeedStatus::Connected => return ConnectOutcome::AlreadyConnected,
                FeedStatus::Connecting if state.awaiting_verification => {
                    return ConnectOutcome::AwaitingVerification
                }
                _ => {}
            }
            if let Some(until) = state.cooldown_until {
                if self.clock.now() < until {
                    return ConnectOutcome::CoolingDown { until };
                }
            }
        }

        let Ok(_guard) = self.connect_lock.try_lock() else {
            return ConnectOutcome::Busy;
        };
        self.connect_cycle().await
    }

    async fn connect_cycle(&self) -> ConnectOutcome {
        if !self.credentials.is_complete() {
            let err = FeedError::Config("upstream credentials are not configured".into());
            self.transition(|s| {
                s.status = FeedStatus::Failed;
                s.error_reason = Some(err.to_string());
            });
            warn!(error = %err, "feed session failed permanently");
            return ConnectOutcome::Fatal(err);
        }

        let started = self.clock.now();
        self.transition(|s| {
            s.status = FeedStatus::Connecting;
            s.last_attempt_time = Some(started);
            s.error_reason = None;
        });
        info!(retries = self.retries, "connecting to upstream feed");

        let mut last_err = None;
        for attempt in 1..=self.retries {
            let client = self.connector.open();
            match client.connect(&self.credentials).await {
                Ok(()) => {
                    *self.client.write() = Some(client);
                    self.subscribed.lock().clear();
                    self.transition(|s| {
                        s.status = FeedStatus::Connected;
                        s.cooldown_until = None;
                        s.error_reason = None;
                        s.awaiting_verification = false;
                        s.verification_deadline = None;
                    });
                    info!(attempt, "upstream feed connected");
                    return ConnectOutcome::Connected;
                }
                Err(FeedError::VerificationRequired(reason)) => {
                    *self.client.write() = Some(client);
                    let deadline = self.clock.now() + VERIFICATION_WINDOW_SECS;
                    self.transition(|s| {
                        s.awaiting_verification = true;
                        s.verification_deadline = Some(deadline);
                        s.error_reason = Some(reason.clone());
                    });
                    info!(reason = %reason, deadline, "upstream requires a verification code");
                    return ConnectOutcome::AwaitingVerification;
                }
                Err(FeedError::Config(reason)) => {
                    client.close().await;
                    let err = FeedError::Config(reason);
                    self.transition(|s| {
                        s.status = FeedStatus::Failed;
                        s.error_reason = Some(err.to_string());
                    });
                    warn!(error = %err, "feed session failed permanently");
                    return ConnectOutcome::Fatal(err);
                }
                Err(e @ FeedError::Rejected(_)) => {
                    client.close().await;
                    warn!(attempt, error = %e, "upstream rejected credentials");
                    last_err = Some(e);
                    break;
                }
                Err(e) => {
                    client.close().await;
                    warn!(attempt, max = self.retries, error = %e, "connect attempt failed");
                    last_err = Some(e);
                    if attempt < self.retries {
                        self.clock.sleep(self.retry_delay).await;
                    }
                }
            }
        }

        let err = last_err.unwrap_or_else(|| FeedError::Transient("connect failed".into()));
        let until = self.clock.now() + self.cooldown_secs;
        self.transition(|s| {
            s.status = FeedStatus::Disconnected;
            s.cooldown_until = Some(until);
            s.error_reason = Some(err.to_string());
        });
        warn!(error = %err, cooldown_until = until, "giving up on connect cycle");
        ConnectOutcome::GaveUp(err)
    }

    /// Complete a handshake that stopped at the verification step.
    pub async fn submit_verification_code(&self, code: &str) -> Result<FeedStatus, FeedError> {
        let client = {
            if !self.state.read().awaiting_verification {
                return Err(FeedError::NotConnected);
            }
            self.client.read().clone().ok_or(FeedError::NotConnected)?
        };

        match client.submit_verification_code(code).await {
            Ok(()) => {
                self.subscribed.lock().clear();
                self.transition(|s| {
                    s.status = FeedStatus::Connected;
                    s.cooldown_until = None;
                    s.error_reason = None;
                    s.awaiting_verification = false;
                    s.verification_deadline = None;
                });
                info!("verification accepted, upstream feed connected");
                Ok(FeedStatus::Connected)
            }
            Err(FeedError::VerificationRequired(reason)) => {
                // Wrong code: the handshake is still open for another try.
                self.transition(|s| s.error_reason = Some(reason.clone()));
                warn!(reason = %reason, "verification code not accepted");
                Err(FeedError::VerificationRequired(reason))
            }
            Err(e) => {
                self.mark_disconnected(&e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Abandon a pending verification whose window has elapsed.
    pub async fn expire_verification(&self) -> bool {
        let expired = {
            let state = self.state.read();
            state.awaiting_verification
                && state
                    .verification_deadline
                    .map(|d| self.clock.now() >= d)
                    .unwrap_or(false)
        };
        if expired {
            self.mark_disconnected("verification window expired").await;
        }
        expired
    }

    /// Drop the client, forget every subscription and arm the cooldown.
    pub async fn mark_disconnected(&self, reason: &str) {
        if self.status() == FeedStatus::Failed {
            return;
        }
        let client = self.client.write().take();
        self.subscribed.lock().clear();
        let until = self.clock.now() + self.cooldown_secs;
        self.transition(|s| {
            s.status = FeedStatus::Disconnected;
            s.cooldown_until = Some(until);
            s.error_reason = Some(reason.to_string());
            s.awaiting_verification = false;
            s.verification_deadline = None;
        });
        warn!(reason, cooldown_until = until, "upstream feed disconnected");
        if let Some(client) = client {
            client.close().await;
        }
    }

    /// Release the upstream connection for process shutdown.
    pub async fn shutdown(&self) {
        let client = self.client.write().take();
        self.subscribed.lock().clear();
        if self.status() != FeedStatus::Failed {
            self.transition(|s| {
                s.status = FeedStatus::Disconnected;
                s.awaiting_verification = false;
                s.verification_deadline = None;
            });
        }
        if let Some(client) = client {
            client.close().await;
            info!("upstream connection released");
        }
    }

    // -------------------------------------------------------------------------
    // Tick ingestion
    // -------------------------------------------------------------------------

    /// Drain pending ticks into the store. Any drain error disconnects.
    pub async fn drain_once(&self, store: &SnapshotStore) -> usize {
        let Ok(client) = self.connected_client() else {
            return 0;
        };
        match client.drain_ticks() {
            Ok(ticks) => {
                for tick in &ticks {
                    match store.apply_tick(tick, self.interval) {
                        FoldOutcome::Stale => {
                            debug!(asset = %tick.asset, ts = tick.timestamp, "stale tick dropped")
                        }
                        FoldOutcome::Opened { candle, closed: Some(prev) } => {
                            debug!(asset = %tick.asset, closed = prev.time, opened = candle.time, "bucket rolled")
                        }
                        _ => {}
                    }
                }
                ticks.len()
            }
            Err(e) => {
                self.mark_disconnected(&e.to_string()).await;
                0
            }
        }
    }

    // -------------------------------------------------------------------------
    // Upstream calls on behalf of other components
    // -------------------------------------------------------------------------

    /// Start streaming `symbol`. Returns `Ok(false)` if it already streams.
    pub async fn start_stream(&self, symbol: &str) -> Result<bool, FeedError> {
        let client = self.connected_client()?;
        if !self.subscribed.lock().insert(symbol.to_string()) {
            return Ok(false);
        }
        if let Err(e) = client.start_stream(symbol, self.interval).await {
            self.subscribed.lock().remove(symbol);
            return Err(e);
        }
        debug!(symbol, "stream started");
        Ok(true)
    }

    /// Stop streaming `symbol`. Returns `Ok(false)` if it was not streaming.
    pub async fn stop_stream(&self, symbol: &str) -> Result<bool, FeedError> {
        let client = self.connected_client()?;
        if !self.subscribed.lock().remove(symbol) {
            return Ok(false);
        }
        client.stop_stream(symbol, self.interval).await?;
        debug!(symbol, "stream stopped");
        Ok(true)
    }

    pub async fn list_instruments(&self) -> Result<Vec<Instrument>, FeedError> {
        self.connected_client()?.list_instruments().await
    }

    pub async fn recent_candles(
        &self,
        symbol: &str,
        count: u32,
        interval: i64,
    ) -> Result<Vec<Candle>, FeedError> {
        self.connected_client()?
            .get_recent_candles(symbol, count, interval)
            .await
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    /// Connect, drain and reconnect until `shutdown` flips.
    pub async fn run(
        self: Arc<Self>,
        store: Arc<SnapshotStore>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(poll_ms = self.drain_poll.as_millis() as u64, "feed session loop starting");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let state = self.state();
            let wait = match state.status {
                FeedStatus::Connected => {
                    self.drain_once(&store).await;
                    self.drain_poll
                }
                FeedStatus::Failed => {
                    // Nothing left to do but serve cached data until shutdown.
                    let _ = shutdown.changed().await;
                    break;
                }
                FeedStatus::Connecting if state.awaiting_verification => {
                    self.expire_verification().await;
                    VERIFICATION_POLL
                }
                _ => match self.try_connect().await {
                    ConnectOutcome::CoolingDown { until } => {
                        Duration::from_secs((until - self.clock.now()).max(1) as u64)
                    }
                    ConnectOutcome::Connected | ConnectOutcome::AlreadyConnected => Duration::ZERO,
                    _ => VERIFICATION_POLL,
                },
            };

            if self.pause(wait, &mut shutdown).await {
                break;
            }
        }

        self.shutdown().await;
        info!("feed session loop stopped");
        Ok(())
    }

    /// Sleep on the injected clock unless shutdown arrives first.
    async fn pause(&self, wait: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        if wait.is_zero() {
            return *shutdown.borrow();
        }
        tokio::select! {
            _ = self.clock.sleep(wait) => *shutdown.borrow(),
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }
}

impl std::fmt::Debug for FeedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSession")
            .field("state", &*self.state.read())
            .field("subscribed", &self.subscribed.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::feed::fake::{FakeConnector, FakeFeed};
    use crate::types::Tick;
    use std::sync::atomic::Ordering;

    fn config() -> EngineConfig {
        EngineConfig {
            credentials: Credentials {
                email: "ops@example.com".into(),
                password: "secret".into(),
            },
            ..EngineConfig::default()
        }
    }

    fn session_with(
        feed: FakeFeed,
        cfg: EngineConfig,
    ) -> (FeedSession, Arc<FakeConnector>, Arc<ManualClock>) {
        let connector = Arc::new(FakeConnector::new(feed));
        let clock = Arc::new(ManualClock::new(1_000));
        let session = FeedSession::new(connector.clone(), clock.clone(), &cfg);
        (session, connector, clock)
    }

    fn session(feed: FakeFeed) -> (FeedSession, Arc<FakeConnector>, Arc<ManualClock>) {
        session_with(feed, config())
    }

    #[tokio::test]
    async fn missing_credentials_is_terminal() {
        let (session, connector, _) = session_with(FakeFeed::default(), EngineConfig::default());
        let outcome = session.try_connect().await;
        assert!(matches!(outcome, ConnectOutcome::Fatal(FeedError::Config(_))));
        assert_eq!(session.status(), FeedStatus::Failed);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 0);

        // Never leaves Failed.
        assert!(matches!(session.try_connect().await, ConnectOutcome::Fatal(_)));
        session.mark_disconnected("ignored").await;
        assert_eq!(session.status(), FeedStatus::Failed);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_cool_down() {
        let feed = FakeFeed::default();
        feed.script_connect(vec![
            Err(FeedError::Transient("reset".into())),
            Err(FeedError::Transient("reset".into())),
            Err(FeedError::Transient("reset".into())),
        ]);
        let (session, connector, clock) = session(feed);

        let outcome = session.try_connect().await;
        assert!(matches!(outcome, ConnectOutcome::GaveUp(FeedError::Transient(_))));
        assert_eq!(connector.feed.connect_calls.load(Ordering::SeqCst), 3);
        // Delays between attempts only, not after the last one.
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5); 2]);

        let state = session.state();
        assert_eq!(state.status, FeedStatus::Disconnected);
        assert_eq!(state.cooldown_until, Some(clock.now() + 45));
        assert!(state.error_reason.is_some());
    }

    #[tokio::test]
    async fn rejection_skips_remaining_retries() {
        let feed = FakeFeed::default();
        feed.script_connect(vec![Err(FeedError::Rejected("Invalid password".into()))]);
        let (session, connector, clock) = session(feed);

        let outcome = session.try_connect().await;
        assert!(matches!(outcome, ConnectOutcome::GaveUp(FeedError::Rejected(_))));
        assert_eq!(connector.feed.connect_calls.load(Ordering::SeqCst), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn reconnect_is_gated_by_cooldown() {
        let (session, connector, clock) = session(FakeFeed::default());
        assert_eq!(session.try_connect().await, ConnectOutcome::Connected);

        session.mark_disconnected("socket closed").await;
        assert!(connector.feed.closed.load(Ordering::SeqCst));
        let until = session.state().cooldown_until.unwrap();

        clock.advance(10);
        assert_eq!(session.try_connect().await, ConnectOutcome::CoolingDown { until });
        assert_eq!(connector.feed.connect_calls.load(Ordering::SeqCst), 1);

        clock.set(until);
        assert_eq!(session.try_connect().await, ConnectOutcome::Connected);
        assert_eq!(connector.feed.connect_calls.load(Ordering::SeqCst), 2);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn verification_completes_without_new_cycle() {
        let feed = FakeFeed::default();
        feed.script_connect(vec![Err(FeedError::VerificationRequired("enter PIN".into()))]);
        *feed.verify_results.lock() =
            vec![Err(FeedError::VerificationRequired("wrong code".into())), Ok(())].into();
        let (session, connector, _) = session(feed);

        assert_eq!(session.try_connect().await, ConnectOutcome::AwaitingVerification);
        let state = session.state();
        assert_eq!(state.status, FeedStatus::Connecting);
        assert!(state.awaiting_verification);
        assert_eq!(session.try_connect().await, ConnectOutcome::AwaitingVerification);

        assert!(session.submit_verification_code("000000").await.is_err());
        assert!(session.state().awaiting_verification);

        assert_eq!(
            session.submit_verification_code("123456").await,
            Ok(FeedStatus::Connected)
        );
        assert_eq!(connector.feed.connect_calls.load(Ordering::SeqCst), 1);
        assert!(!session.state().awaiting_verification);
    }

    #[tokio::test]
    async fn verification_window_expires() {
        let feed = FakeFeed::default();
        feed.script_connect(vec![Err(FeedError::VerificationRequired("enter PIN".into()))]);
        let (session, _, clock) = session(feed);

        session.try_connect().await;
        assert!(!session.expire_verification().await);
        clock.advance(VERIFICATION_WINDOW_SECS);
        assert!(session.expire_verification().await);
        assert_eq!(session.status(), FeedStatus::Disconnected);
        assert!(session.submit_verification_code("123456").await.is_err());
    }

    #[tokio::test]
    async fn drain_folds_ticks_into_store() {
        let (session, connector, _) = session(FakeFeed::default());
        let store = SnapshotStore::new();
        assert_eq!(session.drain_once(&store).await, 0);

        session.try_connect().await;
        connector.feed.ticks.push(Tick::new("EURUSD_otc", 1.10, 600));
        connector.feed.ticks.push(Tick::new("EURUSD_otc", 1.12, 610));
        assert_eq!(session.drain_once(&store).await, 2);

        let candle = store.get("EURUSD_otc").unwrap();
        assert_eq!((candle.open, candle.close, candle.high), (1.10, 1.12, 1.12));
        assert_eq!(session.drain_once(&store).await, 0);
    }

    #[tokio::test]
    async fn drain_error_disconnects_and_clears_subscriptions() {
        let (session, connector, _) = session(FakeFeed::default());
        session.try_connect().await;
        assert_eq!(session.start_stream("EURUSD_otc").await, Ok(true));
        assert_eq!(session.subscribed_count(), 1);

        *connector.feed.drain_error.lock() = Some(FeedError::Malformed("bad frame".into()));
        session.drain_once(&SnapshotStore::new()).await;

        let state = session.state();
        assert_eq!(state.status, FeedStatus::Disconnected);
        assert!(state.error_reason.unwrap().contains("bad frame"));
        assert_eq!(session.subscribed_count(), 0);
        assert!(connector.feed.closed.load(Ordering::SeqCst));
        assert_eq!(session.start_stream("EURUSD_otc").await, Err(FeedError::NotConnected));
    }

    #[tokio::test]
    async fn start_stream_is_idempotent_and_rolls_back() {
        let (session, connector, _) = session(FakeFeed::default());
        session.try_connect().await;

        assert_eq!(session.start_stream("A").await, Ok(true));
        assert_eq!(session.start_stream("A").await, Ok(false));
        assert_eq!(connector.feed.started.lock().len(), 1);

        *connector.feed.start_error.lock() = Some(FeedError::Transient("busy".into()));
        assert!(session.start_stream("B").await.is_err());
        assert!(!session.is_subscribed("B"));

        assert_eq!(session.stop_stream("A").await, Ok(true));
        assert_eq!(session.stop_stream("A").await, Ok(false));
    }

    #[tokio::test]
    async fn status_watch_follows_transitions() {
        let (session, _, _) = session(FakeFeed::default());
        let rx = session.subscribe_status();
        assert_eq!(*rx.borrow(), FeedStatus::Disconnected);
        session.try_connect().await;
        assert_eq!(*rx.borrow(), FeedStatus::Connected);
        session.shutdown().await;
        assert_eq!(*rx.borrow(), FeedStatus::Disconnected);
    }
}
