// =============================================================================
// Broker Bridge Client — HTTP control plane + WebSocket tick push
// =============================================================================
//
// The broker's own protocol runs in a sidecar ("bridge") that exposes:
//
//   POST /session/connect   { email, password }  -> { ok, reason }
//   POST /session/verify    { code }             -> { ok, reason }
//   GET  /instruments                            -> [ row, ... ]
//   POST /streams/start     { symbol, period }   -> { ok, reason }
//   POST /streams/stop      { symbol, period }   -> { ok, reason }
//   GET  /candles?symbol=&count=&period=         -> [ { time, open, ... } ]
//   WS   /ticks                                  -> { type: "tick", asset, data }
//
// SECURITY: the password is sent once in the connect body and never logged.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

use crate::config::Credentials;
use crate::error::FeedError;
use crate::feed::{parse_candle, parse_instruments, parse_tick, TickBuffer, UpstreamConnector, UpstreamFeed};
use crate::types::{Candle, Instrument, Tick};

/// Per-request timeout for control calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// `{ ok, reason }` acknowledgement returned by every control endpoint.
#[derive(Debug, Deserialize)]
struct Ack {
    ok: bool,
    #[serde(default)]
    reason: String,
}

/// Opens [`BridgeFeed`] clients that share one HTTP connection pool.
pub struct BridgeConnector {
    base_url: String,
    http: reqwest::Client,
}

impl BridgeConnector {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build bridge HTTP client")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "BridgeConnector initialised");
        Ok(Self { base_url, http })
    }
}

impl UpstreamConnector for BridgeConnector {
    fn open(&self) -> Arc<dyn UpstreamFeed> {
        Arc::new(BridgeFeed::new(self.base_url.clone(), self.http.clone()))
    }
}

/// One authenticated session against the bridge.
pub struct BridgeFeed {
    base_url: String,
    http: reqwest::Client,
    ticks: Arc<TickBuffer>,
    /// Set by the tick reader when the push socket dies.
    broken: Arc<Mutex<Option<String>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeFeed {
    fn new(base_url: String, http: reqwest::Client) -> Self {
        Self {
            base_url,
            http,
            ticks: Arc::new(TickBuffer::default()),
            broken: Arc::new(Mutex::new(None)),
            reader: Mutex::new(None),
        }
    }

    fn ws_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{ws_base}/ticks")
    }

    async fn post_ack(&self, path: &str, body: Value) -> Result<Ack, FeedError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| FeedError::Transient(format!("POST {path} failed: {e}")))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(FeedError::Transient(format!("POST {path} returned {status}")));
        }
        resp.json::<Ack>()
            .await
            .map_err(|e| FeedError::Malformed(format!("POST {path} response: {e}")))
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http.get(format!("{}{}", self.base_url, path))
    }

    /// Symbols such as `#AAPL_otc` must be percent-encoded, not spliced.
    fn candles_request(&self, symbol: &str, count: u32, interval: i64) -> RequestBuilder {
        self.get("/candles").query(&[
            ("symbol", symbol.to_string()),
            ("count", count.to_string()),
            ("period", interval.to_string()),
        ])
    }

    async fn get_json(&self, path: &str, request: RequestBuilder) -> Result<Value, FeedError> {
        let resp = request
            .send()
            .await
            .map_err(|e| FeedError::Transient(format!("GET {path} failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FeedError::Transient(format!("GET {path} returned {status}")));
        }
        resp.json()
            .await
            .map_err(|e| FeedError::Malformed(format!("GET {path} response: {e}")))
    }

    async fn control(&self, path: &str, symbol: &str, interval: i64) -> Result<(), FeedError> {
        let ack = self
            .post_ack(path, json!({ "symbol": symbol, "period": interval }))
            .await?;
        if ack.ok {
            Ok(())
        } else {
            Err(FeedError::Transient(format!("{path} {symbol}: {}", ack.reason)))
        }
    }

    /// Open the push socket and spawn the reader that fills the tick buffer.
    async fn start_tick_reader(&self) -> Result<(), FeedError> {
        let url = self.ws_url();
        info!(url = %url, "connecting to bridge tick stream");

        let (ws_stream, _response) = connect_async(&url)
            .await
            .map_err(|e| FeedError::Transient(format!("tick stream connect failed: {e}")))?;

        let ticks = self.ticks.clone();
        let broken = self.broken.clone();
        *broken.lock() = None;

        let handle = tokio::spawn(async move {
            let (_write, mut read) = ws_stream.split();
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match decode_push(&text) {
                        Ok(Some(tick)) => ticks.push(tick),
                        Ok(None) => {}
                        Err(e) => break format!("malformed push frame: {e}"),
                    },
                    Some(Ok(Message::Close(_))) => break "tick stream closed by bridge".to_string(),
                    // Ping / Pong / Binary: tungstenite answers pings itself.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("tick stream read error: {e}"),
                    None => break "tick stream ended".to_string(),
                }
            };
            warn!(reason = %reason, "bridge tick stream stopped");
            *broken.lock() = Some(reason);
        });

        if let Some(previous) = self.reader.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }
}

/// Decode one push frame. Non-tick frames yield `Ok(None)`.
fn decode_push(text: &str) -> Result<Option<Tick>, FeedError> {
    let msg: Value =
        serde_json::from_str(text).map_err(|e| FeedError::Malformed(format!("push frame: {e}")))?;
    match msg["type"].as_str() {
        Some("tick") => parse_tick(&msg).map(Some),
        _ => Ok(None),
    }
}

#[async_trait]
impl UpstreamFeed for BridgeFeed {
    #[instrument(skip(self, credentials), name = "bridge::connect")]
    async fn connect(&self, credentials: &Credentials) -> Result<(), FeedError> {
        let ack = self
            .post_ack(
                "/session/connect",
                json!({ "email": credentials.email, "password": credentials.password }),
            )
            .await?;
        if !ack.ok {
            return Err(FeedError::from_handshake_reason(&ack.reason));
        }
        self.start_tick_reader().await
    }

    #[instrument(skip(self, code), name = "bridge::verify")]
    async fn submit_verification_code(&self, code: &str) -> Result<(), FeedError> {
        let ack = self.post_ack("/session/verify", json!({ "code": code })).await?;
        if !ack.ok {
            return Err(FeedError::VerificationRequired(ack.reason));
        }
        self.start_tick_reader().await
    }

    #[instrument(skip(self), name = "bridge::list_instruments")]
    async fn list_instruments(&self) -> Result<Vec<Instrument>, FeedError> {
        let body = self.get_json("/instruments", self.get("/instruments")).await?;
        let rows = body
            .as_array()
            .ok_or_else(|| FeedError::Malformed("instruments response is not an array".into()))?;
        let instruments = parse_instruments(rows);
        debug!(rows = rows.len(), parsed = instruments.len(), "instrument catalog fetched");
        Ok(instruments)
    }

    #[instrument(skip(self), name = "bridge::start_stream")]
    async fn start_stream(&self, symbol: &str, interval: i64) -> Result<(), FeedError> {
        self.control("/streams/start", symbol, interval).await
    }

    #[instrument(skip(self), name = "bridge::stop_stream")]
    async fn stop_stream(&self, symbol: &str, interval: i64) -> Result<(), FeedError> {
        self.control("/streams/stop", symbol, interval).await
    }

    #[instrument(skip(self), name = "bridge::get_recent_candles")]
    async fn get_recent_candles(
        &self,
        symbol: &str,
        count: u32,
        interval: i64,
    ) -> Result<Vec<Candle>, FeedError> {
        let body = self
            .get_json("/candles", self.candles_request(symbol, count, interval))
            .await?;
        let raw = body
            .as_array()
            .ok_or_else(|| FeedError::Malformed("candles response is not an array".into()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            match parse_candle(entry) {
                Ok(c) => candles.push(c),
                Err(e) => warn!(symbol, error = %e, "skipping malformed history candle"),
            }
        }
        candles.sort_by_key(|c| c.time);
        debug!(symbol, count = candles.len(), "history fetched");
        Ok(candles)
    }

    fn drain_ticks(&self) -> Result<Vec<Tick>, FeedError> {
        if let Some(reason) = self.broken.lock().clone() {
            return Err(FeedError::Transient(reason));
        }
        Ok(self.ticks.drain())
    }

    async fn close(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        // Best effort: the bridge drops the session on its own when the
        // socket goes away.
        if let Err(e) = self.post_ack("/session/close", json!({})).await {
            debug!(error = %e, "bridge session close not acknowledged");
        }
    }
}

impl std::fmt::Debug for BridgeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeFeed")
            .field("base_url", &self.base_url)
            .field("pending_ticks", &self.ticks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(base: &str) -> BridgeFeed {
        BridgeFeed::new(base.to_string(), reqwest::Client::new())
    }

    #[test]
    fn ws_url_follows_scheme() {
        assert_eq!(feed("http://127.0.0.1:8000").ws_url(), "ws://127.0.0.1:8000/ticks");
        assert_eq!(feed("https://bridge.local").ws_url(), "wss://bridge.local/ticks");
    }

    #[test]
    fn decode_push_ignores_non_tick_frames() {
        assert_eq!(decode_push(r#"{"type":"assets","data":[]}"#).unwrap(), None);
        let tick = decode_push(
            r#"{"type":"tick","asset":"EURUSD_otc","data":{"time":120,"price":1.1}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(tick.asset, "EURUSD_otc");
        assert!(decode_push("not json").is_err());
    }

    #[test]
    fn broken_stream_surfaces_on_drain() {
        let f = feed("http://127.0.0.1:1");
        f.ticks.push(Tick::new("A", 1.0, 1));
        assert_eq!(f.drain_ticks().unwrap().len(), 1);
        *f.broken.lock() = Some("tick stream ended".into());
        assert!(matches!(f.drain_ticks(), Err(FeedError::Transient(_))));
    }

    #[test]
    fn candle_query_encodes_symbol() {
        let f = feed("http://127.0.0.1:8000");
        let request = f.candles_request("#AAPL_otc", 50, 60).build().unwrap();
        let url = request.url();
        assert_eq!(url.path(), "/candles");
        assert_eq!(url.fragment(), None);
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("symbol".to_string(), "#AAPL_otc".to_string()),
                ("count".to_string(), "50".to_string()),
                ("period".to_string(), "60".to_string()),
            ]
        );
    }

    /// Serve one push socket that sends `frames` and then idles.
    async fn push_server(frames: Vec<&'static str>) -> String {
        use futures_util::SinkExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            for frame in frames {
                ws.send(Message::Text(frame.to_string())).await.unwrap();
            }
            while ws.next().await.is_some() {}
        });
        format!("http://{addr}")
    }

    async fn wait_until_broken(f: &BridgeFeed) -> FeedError {
        for _ in 0..200 {
            if let Err(e) = f.drain_ticks() {
                return e;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tick reader never reported a broken stream");
    }

    #[tokio::test]
    async fn malformed_push_frame_breaks_stream() {
        let base = push_server(vec![
            r#"{"type":"tick","asset":"EURUSD_otc","data":{"time":120,"price":1.1}}"#,
            "{not json at all",
        ])
        .await;
        let f = feed(&base);
        f.start_tick_reader().await.unwrap();

        let err = wait_until_broken(&f).await;
        assert!(err.to_string().contains("malformed push frame"), "{err}");
        // Stays broken until a new reader is started.
        assert!(f.drain_ticks().is_err());
    }

    #[tokio::test]
    async fn invalid_tick_price_breaks_stream() {
        let base = push_server(vec![
            r#"{"type":"tick","asset":"EURUSD_otc","data":{"time":120,"price":-5}}"#,
        ])
        .await;
        let f = feed(&base);
        f.start_tick_reader().await.unwrap();

        let err = wait_until_broken(&f).await;
        assert!(err.to_string().contains("invalid price"), "{err}");
    }
}
