// =============================================================================
// Resolution Service — "what is the price of X right now?"
// =============================================================================
//
// Lookup order, first hit wins:
//
//   1. Snapshot Store           LIVE      source = memory
//   2. Local mirror             CACHED    source = disk
//   3. Known to the catalog     PENDING   (collection starting)
//   4. Otherwise                NOT_FOUND
//
// Market-open status is reported alongside but never changes the order.
// Nothing here returns an error: every miss is a well-formed result.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::feed::{Catalog, FeedSession};
use crate::market_data::{bucket_start, SnapshotStore};
use crate::mirror::{LocalMirror, RemoteStore};
use crate::types::{Candle, FeedStatus, PriceSource, ResolutionStatus};

/// Upper bound on any history request.
pub const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceResolution {
    pub asset: String,
    pub status: ResolutionStatus,
    pub source: PriceSource,
    pub candle: Option<Candle>,
    pub price: Option<f64>,
    pub timestamp: Option<i64>,
    pub market_open: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PriceResolution {
    fn found(
        asset: &str,
        status: ResolutionStatus,
        source: PriceSource,
        candle: Candle,
        market_open: Option<bool>,
    ) -> Self {
        Self {
            asset: asset.to_string(),
            status,
            source,
            candle: Some(candle),
            price: Some(candle.close),
            timestamp: Some(candle.time),
            market_open,
            message: None,
        }
    }

    fn missing(
        asset: &str,
        status: ResolutionStatus,
        market_open: Option<bool>,
        message: &str,
    ) -> Self {
        Self {
            asset: asset.to_string(),
            status,
            source: PriceSource::None,
            candle: None,
            price: None,
            timestamp: None,
            market_open,
            message: Some(message.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistorySource {
    Mirror,
    Remote,
    Upstream,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentHistory {
    pub asset: String,
    pub source: HistorySource,
    pub candles: Vec<Candle>,
}

/// One candle summarising the last `period` candles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OhlcSummary {
    pub asset: String,
    pub period: usize,
    pub candles: usize,
    pub start: i64,
    pub end: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Candles inside a fixed time window, for the archive endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveRange {
    pub asset: String,
    pub from: i64,
    pub to: i64,
    pub candles: Vec<Candle>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetInfo {
    pub symbol: String,
    pub display_name: Option<String>,
    pub live: bool,
    pub cached: bool,
    pub market_open: Option<bool>,
    pub streaming: bool,
}

pub struct ResolutionService {
    store: Arc<SnapshotStore>,
    mirror: Arc<LocalMirror>,
    catalog: Arc<Catalog>,
    session: Arc<FeedSession>,
    remote: Option<Arc<dyn RemoteStore>>,
    interval: i64,
}

impl ResolutionService {
    pub fn new(
        store: Arc<SnapshotStore>,
        mirror: Arc<LocalMirror>,
        catalog: Arc<Catalog>,
        session: Arc<FeedSession>,
        remote: Option<Arc<dyn RemoteStore>>,
        interval: i64,
    ) -> Self {
        Self {
            store,
            mirror,
            catalog,
            session,
            remote,
            interval,
        }
    }

    pub async fn resolve_price(&self, asset: &str) -> PriceResolution {
        let market_open = self.catalog.is_open(asset);

        if let Some(candle) = self.store.get(asset) {
            return PriceResolution::found(
                asset,
                ResolutionStatus::Live,
                PriceSource::Memory,
                candle,
                market_open,
            );
        }
        if let Some(candle) = self.mirror.last_known(asset).await {
            return PriceResolution::found(
                asset,
                ResolutionStatus::Cached,
                PriceSource::Disk,
                candle,
                market_open,
            );
        }
        if self.catalog.contains(asset) {
            return PriceResolution::missing(
                asset,
                ResolutionStatus::Pending,
                market_open,
                "asset is known but no data has been collected yet; retry shortly",
            );
        }
        PriceResolution::missing(asset, ResolutionStatus::NotFound, None, "unknown asset")
    }

    /// Historical candles with the live candle merged onto the tail.
    pub async fn recent(&self, asset: &str, limit: usize) -> RecentHistory {
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        let (history, source) = self.history_for(asset, limit).await;
        let mut candles = merge_live(history, self.store.get(asset));
        let skip = candles.len().saturating_sub(limit);
        let candles = candles.split_off(skip);
        RecentHistory {
            asset: asset.to_string(),
            source,
            candles,
        }
    }

    async fn history_for(&self, asset: &str, limit: usize) -> (Vec<Candle>, HistorySource) {
        let local = self.mirror.history(asset);
        if !local.is_empty() {
            return (local, HistorySource::Mirror);
        }

        if let Some(remote) = &self.remote {
            match remote.fetch_recent(asset, limit).await {
                Ok(candles) if !candles.is_empty() => return (candles, HistorySource::Remote),
                Ok(_) => {}
                Err(e) => warn!(asset, error = %format!("{e:#}"), "remote history fetch failed"),
            }
        }

        if self.session.status() == FeedStatus::Connected {
            match self
                .session
                .recent_candles(asset, limit as u32, self.interval)
                .await
            {
                Ok(candles) if !candles.is_empty() => return (candles, HistorySource::Upstream),
                Ok(_) => {}
                Err(e) => debug!(asset, error = %e, "upstream history unavailable"),
            }
        }
        (Vec::new(), HistorySource::None)
    }

    /// Aggregate the newest `period` candles into one.
    pub async fn ohlc(&self, asset: &str, period: usize) -> Option<OhlcSummary> {
        let recent = self.recent(asset, period).await;
        let first = recent.candles.first()?;
        let last = recent.candles.last()?;
        Some(OhlcSummary {
            asset: asset.to_string(),
            period,
            candles: recent.candles.len(),
            start: first.time,
            end: last.time,
            open: first.open,
            high: recent.candles.iter().map(|c| c.high).fold(f64::MIN, f64::max),
            low: recent.candles.iter().map(|c| c.low).fold(f64::MAX, f64::min),
            close: last.close,
        })
    }

    /// Every candle with `from <= time < to`: remote rows, then the local
    /// history ring, then the live candle. Later sources win a shared bucket.
    pub async fn range(&self, asset: &str, from: i64, to: i64) -> ArchiveRange {
        let in_window = |c: &Candle| c.time >= from && c.time < to;
        let mut merged: BTreeMap<i64, Candle> = BTreeMap::new();

        if let Some(remote) = &self.remote {
            match remote.fetch_range(asset, from, to).await {
                Ok(candles) => merged.extend(candles.into_iter().map(|c| (c.time, c))),
                Err(e) => warn!(asset, error = %format!("{e:#}"), "remote range fetch failed"),
            }
        }
        for c in self.mirror.history(asset).into_iter().filter(in_window) {
            merged.insert(c.time, c);
        }
        if let Some(live) = self.store.get(asset).filter(in_window) {
            merged.insert(live.time, live);
        }

        ArchiveRange {
            asset: asset.to_string(),
            from,
            to,
            candles: merged.into_values().collect(),
        }
    }

    /// History at an arbitrary `period` for a focused push client. Native
    /// period reads locally; other periods ask the upstream and fall back to
    /// resampling local candles when the period is a multiple of ours.
    pub async fn focused_history(&self, asset: &str, period: i64, count: usize) -> Vec<Candle> {
        if period == self.interval || period <= 0 {
            return self.recent(asset, count).await.candles;
        }

        if self.session.status() == FeedStatus::Connected {
            match self.session.recent_candles(asset, count as u32, period).await {
                Ok(candles) if !candles.is_empty() => return candles,
                Ok(_) => {}
                Err(e) => debug!(asset, period, error = %e, "upstream focused history unavailable"),
            }
        }

        if period % self.interval != 0 {
            return Vec::new();
        }
        let per_bucket = (period / self.interval) as usize;
        let native = self.recent(asset, count.saturating_mul(per_bucket)).await;
        let mut resampled = resample(&native.candles, period);
        let skip = resampled.len().saturating_sub(count);
        resampled.split_off(skip)
    }

    /// Every symbol the engine knows about from any tier.
    pub fn assets(&self) -> Vec<AssetInfo> {
        let mut out: BTreeMap<String, AssetInfo> = BTreeMap::new();
        let streaming = self.session.subscribed_symbols();

        let entry = |symbol: &str| -> AssetInfo {
            AssetInfo {
                symbol: symbol.to_string(),
                display_name: None,
                live: self.store.contains(symbol),
                cached: self.mirror.is_cached(symbol),
                market_open: None,
                streaming: streaming.contains(symbol),
            }
        };

        for inst in self.catalog.all() {
            let mut info = entry(&inst.symbol);
            info.display_name = Some(inst.display_name);
            info.market_open = Some(inst.is_open);
            out.insert(inst.symbol, info);
        }
        for (symbol, _) in self.store.all() {
            if !out.contains_key(&symbol) {
                let info = entry(&symbol);
                out.insert(symbol, info);
            }
        }
        for symbol in self.mirror.cached_assets() {
            if !out.contains_key(&symbol) {
                let info = entry(&symbol);
                out.insert(symbol, info);
            }
        }
        out.into_values().collect()
    }
}

/// Overlay the live candle onto history: same bucket replaces the last
/// element, a newer bucket is appended, an older one is ignored.
pub fn merge_live(mut history: Vec<Candle>, live: Option<Candle>) -> Vec<Candle> {
    let Some(live) = live else {
        return history;
    };
    match history.last().map(|c| c.time) {
        Some(time) if time == live.time => {
            if let Some(last) = history.last_mut() {
                *last = live;
            }
        }
        Some(time) if time > live.time => {}
        _ => history.push(live),
    }
    history
}

/// Fold consecutive candles into `period`-wide buckets.
pub fn resample(candles: &[Candle], period: i64) -> Vec<Candle> {
    let mut out: Vec<Candle> = Vec::new();
    for c in candles {
        let bucket = bucket_start(c.time, period);
        match out.last_mut() {
            Some(agg) if agg.time == bucket => {
                agg.high = agg.high.max(c.high);
                agg.low = agg.low.min(c.low);
                agg.close = c.close;
            }
            _ => out.push(Candle {
                time: bucket,
                ..*c
            }),
        }
    }
    out
}

impl std::fmt::Debug for ResolutionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionService")
            .field("interval", &self.interval)
            .field("remote", &self.remote.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{Credentials, EngineConfig};
    use crate::feed::fake::{instrument, FakeConnector, FakeFeed};
    use crate::mirror::{CandleRow, SqliteStore};
    use crate::types::Tick;

    struct Harness {
        service: ResolutionService,
        store: Arc<SnapshotStore>,
        mirror: Arc<LocalMirror>,
        catalog: Arc<Catalog>,
        session: Arc<FeedSession>,
        connector: Arc<FakeConnector>,
        _dir: tempfile::TempDir,
    }

    fn harness(remote: Option<Arc<dyn RemoteStore>>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig {
            credentials: Credentials {
                email: "ops@example.com".into(),
                password: "secret".into(),
            },
            ..EngineConfig::default()
        };
        let store = Arc::new(SnapshotStore::new());
        let mirror = Arc::new(LocalMirror::open(dir.path(), 600).unwrap());
        let catalog = Arc::new(Catalog::new());
        let connector = Arc::new(FakeConnector::new(FakeFeed::default()));
        let session = Arc::new(FeedSession::new(
            connector.clone(),
            Arc::new(ManualClock::new(0)),
            &cfg,
        ));
        let service = ResolutionService::new(
            store.clone(),
            mirror.clone(),
            catalog.clone(),
            session.clone(),
            remote,
            60,
        );
        Harness {
            service,
            store,
            mirror,
            catalog,
            session,
            connector,
            _dir: dir,
        }
    }

    fn candle(time: i64, close: f64) -> Candle {
        Candle {
            time,
            open: close,
            high: close,
            low: close,
            close,
        }
    }

    #[tokio::test]
    async fn memory_wins_over_disk() {
        let h = harness(None);
        h.mirror.flush(&[("A".into(), candle(60, 1.0))], 70).unwrap();
        h.store.apply_tick(&Tick::new("A", 2.0, 120), 60);

        let res = h.service.resolve_price("A").await;
        assert_eq!(res.status, ResolutionStatus::Live);
        assert_eq!(res.source, PriceSource::Memory);
        assert_eq!(res.price, Some(2.0));
        assert_eq!(res.timestamp, Some(120));
    }

    #[tokio::test]
    async fn disk_fallback_is_cached() {
        let h = harness(None);
        h.mirror.flush(&[("A".into(), candle(60, 1.0))], 70).unwrap();
        let res = h.service.resolve_price("A").await;
        assert_eq!(res.status, ResolutionStatus::Cached);
        assert_eq!(res.source, PriceSource::Disk);
        assert_eq!(res.candle, Some(candle(60, 1.0)));
    }

    #[tokio::test]
    async fn catalog_distinguishes_pending_from_not_found() {
        let h = harness(None);
        h.catalog.replace(vec![instrument("EURUSD_otc", false)], 0);

        let pending = h.service.resolve_price("EURUSD_otc").await;
        assert_eq!(pending.status, ResolutionStatus::Pending);
        assert_eq!(pending.market_open, Some(false));
        assert!(pending.message.is_some());

        let missing = h.service.resolve_price("NOPE").await;
        assert_eq!(missing.status, ResolutionStatus::NotFound);
        assert_eq!(missing.source, PriceSource::None);
        assert_eq!(missing.candle, None);
    }

    #[test]
    fn merge_live_replaces_same_bucket_and_appends_newer() {
        let history = vec![candle(240, 1.0), candle(300, 1.1)];

        let replaced = merge_live(history.clone(), Some(candle(300, 1.2)));
        assert_eq!(replaced.len(), 2);
        assert_eq!(replaced[1].close, 1.2);

        let appended = merge_live(history.clone(), Some(candle(360, 1.3)));
        assert_eq!(appended.len(), 3);
        assert_eq!(appended[2].time, 360);

        assert_eq!(merge_live(history.clone(), Some(candle(120, 9.0))), history);
        assert_eq!(merge_live(Vec::new(), Some(candle(60, 1.0))), vec![candle(60, 1.0)]);
    }

    #[tokio::test]
    async fn recent_merges_live_onto_mirror_history() {
        let h = harness(None);
        h.mirror.flush(&[("A".into(), candle(240, 1.0))], 250).unwrap();
        h.mirror.flush(&[("A".into(), candle(300, 1.1))], 310).unwrap();
        h.store.upsert("A", candle(300, 1.2));

        let recent = h.service.recent("A", 10).await;
        assert_eq!(recent.source, HistorySource::Mirror);
        assert_eq!(recent.candles, vec![candle(240, 1.0), candle(300, 1.2)]);

        let limited = h.service.recent("A", 1).await;
        assert_eq!(limited.candles, vec![candle(300, 1.2)]);
    }

    #[tokio::test]
    async fn recent_falls_back_to_remote_then_upstream() {
        let remote: Arc<dyn RemoteStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        remote
            .upsert_merge(&[CandleRow {
                asset: "R".into(),
                candle: candle(60, 3.0),
            }])
            .await
            .unwrap();
        let h = harness(Some(remote));

        let from_remote = h.service.recent("R", 10).await;
        assert_eq!(from_remote.source, HistorySource::Remote);

        h.connector
            .feed
            .history
            .lock()
            .insert("U".into(), vec![candle(60, 4.0), candle(120, 4.1)]);
        assert_eq!(h.service.recent("U", 10).await.source, HistorySource::None);

        h.session.try_connect().await;
        let from_upstream = h.service.recent("U", 10).await;
        assert_eq!(from_upstream.source, HistorySource::Upstream);
        assert_eq!(from_upstream.candles.len(), 2);
    }

    #[tokio::test]
    async fn ohlc_aggregates_tail() {
        let h = harness(None);
        for (t, c) in [(60, 1.0), (120, 3.0), (180, 0.5), (240, 2.0)] {
            h.mirror.flush(&[("A".into(), candle(t, c))], t).unwrap();
        }
        let summary = h.service.ohlc("A", 3).await.unwrap();
        assert_eq!(summary.start, 120);
        assert_eq!(summary.end, 240);
        assert_eq!((summary.open, summary.high, summary.low, summary.close), (3.0, 3.0, 0.5, 2.0));
        assert_eq!(h.service.ohlc("NOPE", 3).await, None);
    }

    #[tokio::test]
    async fn range_merges_remote_mirror_and_live() {
        let remote: Arc<dyn RemoteStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        remote
            .upsert_merge(&[
                CandleRow { asset: "A".into(), candle: candle(0, 1.0) },
                CandleRow { asset: "A".into(), candle: candle(60, 1.0) },
                CandleRow { asset: "A".into(), candle: candle(600, 1.0) },
            ])
            .await
            .unwrap();
        let h = harness(Some(remote));
        h.mirror.flush(&[("A".into(), candle(60, 2.0))], 70).unwrap();
        h.store.upsert("A", candle(120, 3.0));

        let range = h.service.range("A", 0, 600).await;
        assert_eq!(
            range.candles,
            vec![candle(0, 1.0), candle(60, 2.0), candle(120, 3.0)]
        );
        assert!(h.service.range("A", 700, 800).await.candles.is_empty());
    }

    #[test]
    fn resample_folds_into_wider_buckets() {
        let native = vec![candle(0, 1.0), candle(60, 3.0), candle(120, 2.0), candle(300, 5.0)];
        let out = resample(&native, 300);
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].time, out[0].open, out[0].high, out[0].low, out[0].close), (0, 1.0, 3.0, 1.0, 2.0));
        assert_eq!(out[1].time, 300);
    }

    #[tokio::test]
    async fn focused_history_resamples_when_offline() {
        let h = harness(None);
        for t in (0..10).map(|i| i * 60) {
            h.mirror.flush(&[("A".into(), candle(t, t as f64))], t).unwrap();
        }
        let out = h.service.focused_history("A", 300, 5).await;
        assert_eq!(out.iter().map(|c| c.time).collect::<Vec<_>>(), vec![0, 300]);
        assert!(h.service.focused_history("A", 90, 5).await.is_empty());
    }

    #[tokio::test]
    async fn assets_union_every_tier() {
        let h = harness(None);
        h.catalog.replace(vec![instrument("C", true)], 0);
        h.store.upsert("L", candle(60, 1.0));
        h.mirror.flush(&[("D".into(), candle(60, 1.0))], 70).unwrap();

        let assets = h.service.assets();
        let symbols: Vec<&str> = assets.iter().map(|a| a.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["C", "D", "L"]);
        assert_eq!(assets[0].market_open, Some(true));
        assert!(assets[1].cached && !assets[1].live);
        assert!(assets[2].live);
    }
}
