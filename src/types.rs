// =============================================================================
// Shared types used across the Lux aggregation engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Longest symbol accepted anywhere in the engine.
pub const MAX_SYMBOL_LEN: usize = 64;

/// Symbols are case-sensitive identifiers such as `EURUSD_otc`. Anything
/// outside `[A-Za-z0-9_.#-]` is rejected; symbols double as file names in
/// the local mirror.
pub fn is_valid_symbol(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_SYMBOL_LEN
        && s != "."
        && s != ".."
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '#'))
}

/// A single price observation from the upstream feed. Never stored; folded
/// into the per-asset live candle as soon as it is drained.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub asset: String,
    pub price: f64,
    /// Unix seconds.
    pub timestamp: i64,
}

impl Tick {
    pub fn new(asset: impl Into<String>, price: f64, timestamp: i64) -> Self {
        Self {
            asset: asset.into(),
            price,
            timestamp,
        }
    }
}

/// OHLC summary of every tick inside one bucket. `time` is the bucket start
/// and is always a multiple of the aggregation interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    /// A fresh candle opened by a single tick.
    pub fn opened_at(time: i64, price: f64) -> Self {
        Self {
            time,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }
}

/// One row of the upstream instrument catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub display_name: String,
    pub is_open: bool,
}

/// Connection status of the upstream feed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: configuration-level problem (e.g. missing credentials).
    Failed,
}

impl Default for FeedStatus {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Outcome tier of a price resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStatus {
    Live,
    Cached,
    Pending,
    NotFound,
}

impl std::fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "LIVE"),
            Self::Cached => write!(f, "CACHED"),
            Self::Pending => write!(f, "PENDING"),
            Self::NotFound => write!(f, "NOT_FOUND"),
        }
    }
}

/// Where a resolved candle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Memory,
    Disk,
    None,
}
