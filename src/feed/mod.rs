//! Upstream feed boundary.
//!
//! The broker protocol itself lives behind [`UpstreamFeed`]. Raw catalog rows
//! and tick payloads are interpreted here, once, and everything past this
//! module only sees [`Instrument`] and [`Tick`].

pub mod bridge;
pub mod session;
pub mod subscription;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::config::Credentials;
use crate::error::FeedError;
use crate::types::{is_valid_symbol, Candle, Instrument, Tick};

pub use session::FeedSession;
pub use subscription::SubscriptionManager;

/// Index of the open/closed flag in a positional catalog row.
const ROW_OPEN_INDEX: usize = 14;

static NULL: Value = Value::Null;

/// One live connection to the broker. Implementations use interior
/// mutability; the Feed Session is the only caller.
#[async_trait]
pub trait UpstreamFeed: Send + Sync {
    /// Credential handshake. `Err(VerificationRequired)` leaves the
    /// connection open for [`UpstreamFeed::submit_verification_code`].
    async fn connect(&self, credentials: &Credentials) -> Result<(), FeedError>;

    async fn submit_verification_code(&self, code: &str) -> Result<(), FeedError>;

    async fn list_instruments(&self) -> Result<Vec<Instrument>, FeedError>;

    async fn start_stream(&self, symbol: &str, interval: i64) -> Result<(), FeedError>;

    async fn stop_stream(&self, symbol: &str, interval: i64) -> Result<(), FeedError>;

    async fn get_recent_candles(
        &self,
        symbol: &str,
        count: u32,
        interval: i64,
    ) -> Result<Vec<Candle>, FeedError>;

    /// Read-and-clear every pending tick.
    fn drain_ticks(&self) -> Result<Vec<Tick>, FeedError>;

    /// Release the connection. Idempotent.
    async fn close(&self);
}

/// Produces a fresh, unauthenticated client for every connect cycle.
pub trait UpstreamConnector: Send + Sync {
    fn open(&self) -> Arc<dyn UpstreamFeed>;
}

// ---------------------------------------------------------------------------
// Parsing at the boundary
// ---------------------------------------------------------------------------

/// Interpret one raw catalog row.
///
/// Accepts the broker's positional layout (`[id, symbol, name, ..., open]`
/// with the open flag at index 14) or an object with `symbol`, `name` and
/// `open` / `is_open`.
pub fn parse_instrument(row: &Value) -> Result<Instrument, FeedError> {
    let (symbol, name, open) = match row {
        Value::Array(cols) => {
            if cols.len() <= ROW_OPEN_INDEX {
                return Err(FeedError::Malformed(format!(
                    "catalog row has {} columns, need {}",
                    cols.len(),
                    ROW_OPEN_INDEX + 1
                )));
            }
            (&cols[1], &cols[2], &cols[ROW_OPEN_INDEX])
        }
        Value::Object(map) => (
            map.get("symbol").unwrap_or(&NULL),
            map.get("name").unwrap_or(&NULL),
            map.get("open").or_else(|| map.get("is_open")).unwrap_or(&NULL),
        ),
        other => {
            return Err(FeedError::Malformed(format!(
                "catalog row is neither array nor object: {other}"
            )))
        }
    };

    let symbol = symbol
        .as_str()
        .filter(|s| is_valid_symbol(s))
        .ok_or_else(|| FeedError::Malformed(format!("invalid symbol in catalog row: {symbol}")))?;

    let is_open = match open {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        other => {
            return Err(FeedError::Malformed(format!(
                "invalid open flag for {symbol}: {other}"
            )))
        }
    };

    Ok(Instrument {
        symbol: symbol.to_string(),
        display_name: name.as_str().unwrap_or(symbol).to_string(),
        is_open,
    })
}

/// Parse every row, dropping (and logging) the malformed ones.
pub fn parse_instruments(rows: &[Value]) -> Vec<Instrument> {
    rows.iter()
        .filter_map(|row| match parse_instrument(row) {
            Ok(inst) => Some(inst),
            Err(e) => {
                warn!(error = %e, "dropping malformed catalog row");
                None
            }
        })
        .collect()
}

/// Parse a pushed tick:
///
/// ```json
/// { "type": "tick", "asset": "EURUSD_otc", "data": { "time": 1700000000.42, "price": 1.0841 } }
/// ```
///
/// Fractional timestamps are floored to whole seconds.
pub fn parse_tick(msg: &Value) -> Result<Tick, FeedError> {
    let asset = msg["asset"]
        .as_str()
        .filter(|s| is_valid_symbol(s))
        .ok_or_else(|| FeedError::Malformed("tick missing asset".into()))?;
    let data = &msg["data"];
    let price = json_f64(&data["price"])
        .filter(|p| p.is_finite() && *p > 0.0)
        .ok_or_else(|| FeedError::Malformed(format!("tick for {asset} has invalid price")))?;
    let time = json_f64(&data["time"])
        .filter(|t| t.is_finite())
        .ok_or_else(|| FeedError::Malformed(format!("tick for {asset} has invalid time")))?;

    Ok(Tick::new(asset, price, time.floor() as i64))
}

/// Parse a `{time, open, high, low, close}` object.
pub fn parse_candle(value: &Value) -> Result<Candle, FeedError> {
    let field = |name: &str| {
        json_f64(&value[name])
            .ok_or_else(|| FeedError::Malformed(format!("candle missing {name}: {value}")))
    };
    Ok(Candle {
        time: field("time")? as i64,
        open: field("open")?,
        high: field("high")?,
        low: field("low")?,
        close: field("close")?,
    })
}

/// Numbers may arrive as JSON numbers or numeric strings.
fn json_f64(val: &Value) -> Option<f64> {
    match val {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Pending tick buffer
// ---------------------------------------------------------------------------

/// Per-symbol pending ticks filled by a transport and emptied by the session.
#[derive(Debug, Default)]
pub struct TickBuffer {
    pending: Mutex<HashMap<String, Vec<Tick>>>,
}

impl TickBuffer {
    pub fn push(&self, tick: Tick) {
        self.pending
            .lock()
            .entry(tick.asset.clone())
            .or_default()
            .push(tick);
    }

    /// Take everything buffered so far, leaving the buffer empty. Per-symbol
    /// arrival order is preserved.
    pub fn drain(&self) -> Vec<Tick> {
        let taken = std::mem::take(&mut *self.pending.lock());
        taken.into_values().flatten().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().values().map(Vec::len).sum()
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Last instrument list fetched from the broker.
#[derive(Debug, Default)]
pub struct Catalog {
    instruments: RwLock<HashMap<String, Instrument>>,
    refreshed_at: RwLock<Option<i64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogDiff {
    pub opened: Vec<String>,
    pub closed: Vec<String>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole catalog, stamped with `now`.
    pub fn replace(&self, instruments: Vec<Instrument>, now: i64) {
        let map = instruments
            .into_iter()
            .map(|i| (i.symbol.clone(), i))
            .collect();
        *self.instruments.write() = map;
        *self.refreshed_at.write() = Some(now);
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.instruments.read().contains_key(symbol)
    }

    pub fn is_open(&self, symbol: &str) -> Option<bool> {
        self.instruments.read().get(symbol).map(|i| i.is_open)
    }

    pub fn open_symbols(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .instruments
            .read()
            .values()
            .filter(|i| i.is_open)
            .map(|i| i.symbol.clone())
            .collect();
        open.sort();
        open
    }

    pub fn all(&self) -> Vec<Instrument> {
        let mut all: Vec<Instrument> = self.instruments.read().values().cloned().collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        all
    }

    /// Compare the open set against what is currently streamed.
    pub fn diff(&self, subscribed: &HashSet<String>) -> CatalogDiff {
        let map = self.instruments.read();
        let mut opened: Vec<String> = map
            .values()
            .filter(|i| i.is_open && !subscribed.contains(&i.symbol))
            .map(|i| i.symbol.clone())
            .collect();
        let mut closed: Vec<String> = subscribed
            .iter()
            .filter(|s| map.get(*s).map(|i| !i.is_open).unwrap_or(false))
            .cloned()
            .collect();
        opened.sort();
        closed.sort();
        CatalogDiff { opened, closed }
    }

    pub fn len(&self) -> usize {
        self.instruments.read().len()
    }

    pub fn refreshed_at(&self) -> Option<i64> {
        *self.refreshed_at.read()
    }
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scriptable in-process upstream.
    #[derive(Default)]
    pub struct FakeFeed {
        pub connect_results: Mutex<VecDeque<Result<(), FeedError>>>,
        pub verify_results: Mutex<VecDeque<Result<(), FeedError>>>,
        pub instruments: Mutex<Vec<Instrument>>,
        pub ticks: TickBuffer,
        pub drain_error: Mutex<Option<FeedError>>,
        pub start_error: Mutex<Option<FeedError>>,
        pub started: Mutex<Vec<String>>,
        pub stopped: Mutex<Vec<String>>,
        pub history: Mutex<HashMap<String, Vec<Candle>>>,
        pub connect_calls: AtomicUsize,
        pub closed: AtomicBool,
    }

    impl FakeFeed {
        pub fn with_instruments(instruments: Vec<Instrument>) -> Self {
            let feed = Self::default();
            *feed.instruments.lock() = instruments;
            feed
        }

        pub fn script_connect(&self, results: Vec<Result<(), FeedError>>) {
            *self.connect_results.lock() = results.into();
        }
    }

    pub fn instrument(symbol: &str, is_open: bool) -> Instrument {
        Instrument {
            symbol: symbol.to_string(),
            display_name: symbol.replace('_', " "),
            is_open,
        }
    }

    #[async_trait]
    impl UpstreamFeed for FakeFeed {
        async fn connect(&self, _credentials: &Credentials) -> Result<(), FeedError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            self.closed.store(false, Ordering::SeqCst);
            self.connect_results.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn submit_verification_code(&self, _code: &str) -> Result<(), FeedError> {
            self.verify_results.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn list_instruments(&self) -> Result<Vec<Instrument>, FeedError> {
            Ok(self.instruments.lock().clone())
        }

        async fn start_stream(&self, symbol: &str, _interval: i64) -> Result<(), FeedError> {
            if let Some(e) = self.start_error.lock().take() {
                return Err(e);
            }
            self.started.lock().push(symbol.to_string());
            Ok(())
        }

        async fn stop_stream(&self, symbol: &str, _interval: i64) -> Result<(), FeedError> {
            self.stopped.lock().push(symbol.to_string());
            Ok(())
        }

        async fn get_recent_candles(
            &self,
            symbol: &str,
            count: u32,
            _interval: i64,
        ) -> Result<Vec<Candle>, FeedError> {
            let all = self.history.lock().get(symbol).cloned().unwrap_or_default();
            let start = all.len().saturating_sub(count as usize);
            Ok(all[start..].to_vec())
        }

        fn drain_ticks(&self) -> Result<Vec<Tick>, FeedError> {
            if let Some(e) = self.drain_error.lock().take() {
                return Err(e);
            }
            Ok(self.ticks.drain())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Hands out the same [`FakeFeed`] on every open and counts the opens.
    pub struct FakeConnector {
        pub feed: Arc<FakeFeed>,
        pub opened: AtomicUsize,
    }

    impl FakeConnector {
        pub fn new(feed: FakeFeed) -> Self {
            Self {
                feed: Arc::new(feed),
                opened: AtomicUsize::new(0),
            }
        }
    }

    impl UpstreamConnector for FakeConnector {
        fn open(&self) -> Arc<dyn UpstreamFeed> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.feed.clone()
        }
    }
}
