// =============================================================================
// Engine Configuration — file defaults with environment overrides
// =============================================================================
//
// All fields carry `#[serde(default)]` so that an older or partial config
// file always loads. Credentials are never read from the file; they come
// from the environment only and are redacted from `Debug` output.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Upper bound on the tick drain poll interval.
const MAX_DRAIN_POLL_MS: u64 = 100;

fn default_interval_secs() -> i64 {
    60
}
fn default_cooldown_secs() -> i64 {
    45
}
fn default_connect_retries() -> u32 {
    3
}
fn default_retry_delay_secs() -> u64 {
    5
}
fn default_drain_poll_ms() -> u64 {
    MAX_DRAIN_POLL_MS
}
fn default_subscribe_batch_size() -> usize {
    10
}
fn default_subscribe_throttle_ms() -> u64 {
    1000
}
fn default_catalog_refresh_secs() -> u64 {
    25
}
fn default_true() -> bool {
    true
}
fn default_flush_interval_ms() -> u64 {
    2000
}
fn default_flush_jitter_ms() -> u64 {
    500
}
fn default_remote_sync_secs() -> u64 {
    600
}
fn default_retention_days() -> i64 {
    30
}
fn default_history_max_candles() -> usize {
    600
}
fn default_relay_interval_ms() -> u64 {
    250
}
fn default_history_fetch_count() -> u32 {
    300
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_bridge_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_bind_addr() -> String {
    "0.0.0.0:8001".to_string()
}

/// Login credentials for the upstream broker.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        !self.email.trim().is_empty() && !self.password.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Aggregation ---------------------------------------------------------

    /// Candle bucket width in seconds.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: i64,

    // --- Feed session --------------------------------------------------------

    /// Minimum wait after a failure before the next connect attempt.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: i64,

    /// Handshake attempts within one connect cycle.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_drain_poll_ms")]
    pub drain_poll_ms: u64,

    // --- Subscriptions -------------------------------------------------------

    /// Number of subscriptions issued between two throttle pauses.
    #[serde(default = "default_subscribe_batch_size")]
    pub subscribe_batch_size: usize,

    #[serde(default = "default_subscribe_throttle_ms")]
    pub subscribe_throttle_ms: u64,

    #[serde(default = "default_catalog_refresh_secs")]
    pub catalog_refresh_secs: u64,

    /// Stop upstream streams for assets whose market closed.
    #[serde(default = "default_true")]
    pub stop_closed_streams: bool,

    // --- Durable mirror ------------------------------------------------------

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_flush_jitter_ms")]
    pub flush_jitter_ms: u64,

    #[serde(default = "default_remote_sync_secs")]
    pub remote_sync_secs: u64,

    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Candles kept per asset in the local history ring.
    #[serde(default = "default_history_max_candles")]
    pub history_max_candles: usize,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// SQLite file used as the remote store. Remote sync is off when unset.
    #[serde(default)]
    pub remote_db_path: Option<PathBuf>,

    // --- Push / API ----------------------------------------------------------

    #[serde(default = "default_relay_interval_ms")]
    pub relay_interval_ms: u64,

    #[serde(default = "default_history_fetch_count")]
    pub history_fetch_count: u32,

    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(skip)]
    pub credentials: Credentials,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            cooldown_secs: default_cooldown_secs(),
            connect_retries: default_connect_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            drain_poll_ms: default_drain_poll_ms(),
            subscribe_batch_size: default_subscribe_batch_size(),
            subscribe_throttle_ms: default_subscribe_throttle_ms(),
            catalog_refresh_secs: default_catalog_refresh_secs(),
            stop_closed_streams: true,
            flush_interval_ms: default_flush_interval_ms(),
            flush_jitter_ms: default_flush_jitter_ms(),
            remote_sync_secs: default_remote_sync_secs(),
            retention_days: default_retention_days(),
            history_max_candles: default_history_max_candles(),
            data_dir: default_data_dir(),
            remote_db_path: None,
            relay_interval_ms: default_relay_interval_ms(),
            history_fetch_count: default_history_fetch_count(),
            bridge_url: default_bridge_url(),
            bind_addr: default_bind_addr(),
            credentials: Credentials::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(path = %path.display(), interval_secs = config.interval_secs, "engine config loaded");
        Ok(config)
    }

    /// Apply `LUX_*` environment overrides and read credentials.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("LUX_INTERVAL_SECS").and_then(|s| s.parse().ok()) {
            self.interval_secs = v;
        }
        if let Some(v) = var("LUX_COOLDOWN_SECS").and_then(|s| s.parse().ok()) {
            self.cooldown_secs = v;
        }
        if let Some(v) = var("LUX_SUBSCRIBE_BATCH").and_then(|s| s.parse().ok()) {
            self.subscribe_batch_size = v;
        }
        if let Some(v) = var("LUX_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("LUX_REMOTE_DB") {
            self.remote_db_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("LUX_BRIDGE_URL") {
            self.bridge_url = v;
        }
        if let Some(v) = var("LUX_BIND_ADDR") {
            self.bind_addr = v;
        } else if let Some(port) = var("PORT") {
            self.bind_addr = format!("0.0.0.0:{port}");
        }
        self.credentials = Credentials {
            email: var("LUX_FEED_EMAIL").unwrap_or_default(),
            password: var("LUX_FEED_PASSWORD").unwrap_or_default(),
        };
    }

    /// Reject values that would make a loop spin or divide by zero.
    pub fn validate(&mut self) -> Result<()> {
        if self.interval_secs <= 0 {
            bail!("interval_secs must be positive, got {}", self.interval_secs);
        }
        if self.subscribe_batch_size == 0 {
            bail!("subscribe_batch_size must be at least 1");
        }
        if self.connect_retries == 0 {
            bail!("connect_retries must be at least 1");
        }
        if self.flush_interval_ms == 0 || self.relay_interval_ms == 0 {
            bail!("flush and relay intervals must be non-zero");
        }
        self.drain_poll_ms = self.drain_poll_ms.clamp(1, MAX_DRAIN_POLL_MS);
        Ok(())
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn subscribe_throttle(&self) -> Duration {
        Duration::from_millis(self.subscribe_throttle_ms)
    }

    pub fn catalog_refresh(&self) -> Duration {
        Duration::from_secs(self.catalog_refresh_secs)
    }

    pub fn relay_interval(&self) -> Duration {
        Duration::from_millis(self.relay_interval_ms)
    }

    pub fn remote_sync(&self) -> Duration {
        Duration::from_secs(self.remote_sync_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.interval_secs, 60);
        assert_eq!(cfg.connect_retries, 3);
        assert_eq!(cfg.retention_days, 30);
        assert!(cfg.stop_closed_streams);
        assert!(cfg.remote_db_path.is_none());
        assert!(!cfg.credentials.is_complete());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{ "interval_secs": 300, "subscribe_batch_size": 5 }"#).unwrap();
        assert_eq!(cfg.interval_secs, 300);
        assert_eq!(cfg.subscribe_batch_size, 5);
        assert_eq!(cfg.flush_interval_ms, 2000);
    }

    #[test]
    fn env_overrides_and_credentials() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("LUX_INTERVAL_SECS", "120"),
            ("PORT", "9000"),
            ("LUX_FEED_EMAIL", "ops@example.com"),
            ("LUX_FEED_PASSWORD", "hunter2"),
        ]);
        let mut cfg = EngineConfig::default();
        cfg.apply_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.interval_secs, 120);
        assert_eq!(cfg.bind_addr, "0.0.0.0:9000");
        assert!(cfg.credentials.is_complete());
        assert!(!format!("{:?}", cfg.credentials).contains("hunter2"));
    }

    #[test]
    fn validate_clamps_poll_and_rejects_zero_interval() {
        let mut cfg = EngineConfig {
            drain_poll_ms: 5_000,
            ..EngineConfig::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.drain_poll_ms, 100);

        let mut bad = EngineConfig {
            interval_secs: 0,
            ..EngineConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
