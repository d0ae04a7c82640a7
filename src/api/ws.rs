// =============================================================================
// Broadcast Relay — push API over WebSocket
// =============================================================================
//
// Clients connect to `/lux/ws` and receive:
//   1. `{"type":"assets","data":[...]}` immediately on connect.
//   2. `{"type":"tick","asset":..,"data":candle}` for every candle that changed
//      since the previous push, at most once per `relay_interval`.
//
// Nothing is streamed until the client picks a focus:
//   {"type":"switch","asset":"EURUSD_otc","period":60}
//       focused history for one asset, then live ticks for that asset only
//   {"type":"subscribe_all"}
//       ticks for every asset
//
// Supervised task failures are forwarded to every client as `alert` messages.
//
// Each connection owns its own loop and reads the Snapshot Store through
// `changed_since`, so the ingestion path never waits on a socket. A send that
// does not complete within SEND_TIMEOUT drops that client only.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::resolution::AssetInfo;
use crate::types::{is_valid_symbol, Candle, FeedStatus};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Wire messages
// =============================================================================

/// Inbound control message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Switch {
        asset: String,
        /// Candle period in seconds; defaults to the engine interval.
        #[serde(default, alias = "interval")]
        period: Option<i64>,
    },
    SubscribeAll,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Assets {
        data: Vec<AssetInfo>,
    },
    History {
        asset: String,
        period: i64,
        data: Vec<Candle>,
    },
    Tick {
        asset: String,
        data: Candle,
    },
    Error {
        message: String,
    },
    /// A supervised background task failed and is being restarted.
    Alert {
        task: String,
        error: String,
        restart_in_ms: u64,
    },
}

/// Parse and validate one text frame.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, String> {
    let msg: ClientMessage =
        serde_json::from_str(text).map_err(|e| format!("invalid message: {e}"))?;
    if let ClientMessage::Switch { asset, period } = &msg {
        if !is_valid_symbol(asset) {
            return Err(format!("invalid asset symbol: {asset:?}"));
        }
        if matches!(period, Some(p) if *p <= 0) {
            return Err("period must be a positive number of seconds".into());
        }
    }
    Ok(msg)
}

/// Which assets a connection currently wants ticks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Focus {
    Idle,
    Asset(String),
    All,
}

impl Focus {
    pub fn wants(&self, asset: &str) -> bool {
        match self {
            Self::Idle => false,
            Self::Asset(focused) => focused == asset,
            Self::All => true,
        }
    }
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<Engine>>,
) -> impl IntoResponse {
    info!("relay client connected, upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, engine))
}

// =============================================================================
// Connection handler
// =============================================================================

/// Runs one client until it disconnects, stalls, or the engine shuts down.
async fn handle_ws_connection(socket: WebSocket, engine: Arc<Engine>) {
    let (mut sender, mut receiver) = socket.split();
    let mut focus = Focus::Idle;
    let mut since = engine.store.current_seq();
    let mut shutdown = engine.shutdown_signal();
    let mut alerts = engine.failures.subscribe();

    let hello = ServerMessage::Assets {
        data: engine.resolution.assets(),
    };
    if let Err(e) = send_message(&mut sender, &hello).await {
        warn!(error = %e, "failed to send asset list, dropping relay client");
        return;
    }

    let mut push_interval = interval(engine.config.relay_interval());
    push_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            // ── Push: changed candles since the last tick ───────────────
            _ = push_interval.tick() => {
                let (changed, next) = engine.store.changed_since(since);
                since = next;
                if let Err(e) = push_changes(&mut sender, &focus, changed).await {
                    debug!(error = %e, "relay push failed, disconnecting");
                    break;
                }
            }

            // ── Recv: control messages ──────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let result = match parse_client_message(&text) {
                            Ok(cmd) => on_command(&mut sender, &engine, &mut focus, cmd).await,
                            Err(message) => {
                                debug!(%message, "rejected relay message");
                                send_message(&mut sender, &ServerMessage::Error { message }).await
                            }
                        };
                        if let Err(e) = result {
                            debug!(error = %e, "relay reply failed, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!("relay client sent Close");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("relay binary frame ignored");
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "relay receive error, disconnecting");
                        break;
                    }
                    None => break,
                }
            }

            // ── Task failures ───────────────────────────────────────────
            failure = alerts.recv() => {
                let alert = match failure {
                    Ok(f) => ServerMessage::Alert {
                        task: f.task,
                        error: f.error,
                        restart_in_ms: f.restart_in_ms,
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Err(e) = send_message(&mut sender, &alert).await {
                    debug!(error = %e, "relay alert failed, disconnecting");
                    break;
                }
            }

            // ── Engine shutdown ─────────────────────────────────────────
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    info!(focus = ?focus, "relay client disconnected");
}

async fn on_command<S>(
    sender: &mut S,
    engine: &Engine,
    focus: &mut Focus,
    cmd: ClientMessage,
) -> anyhow::Result<()>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    match cmd {
        ClientMessage::Switch { asset, period } => {
            let period = period.unwrap_or(engine.config.interval_secs);
            if engine.session.status() == FeedStatus::Connected
                && !engine.session.is_subscribed(&asset)
            {
                if let Err(e) = engine.subscriptions.subscribe(&asset).await {
                    warn!(asset = %asset, error = %e, "could not stream focused asset");
                }
            }
            let data = engine
                .resolution
                .focused_history(&asset, period, engine.config.history_fetch_count as usize)
                .await;
            debug!(asset = %asset, period, candles = data.len(), "relay focus switched");
            *focus = Focus::Asset(asset.clone());
            send_message(sender, &ServerMessage::History { asset, period, data }).await
        }
        ClientMessage::SubscribeAll => {
            *focus = Focus::All;
            push_changes(sender, focus, engine.store.all().collect()).await
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn push_changes<S>(
    sender: &mut S,
    focus: &Focus,
    changed: Vec<(String, Candle)>,
) -> anyhow::Result<()>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    for (asset, data) in changed {
        if focus.wants(&asset) {
            send_message(sender, &ServerMessage::Tick { asset, data }).await?;
        }
    }
    Ok(())
}

/// Serialize and send one message, giving up after SEND_TIMEOUT.
async fn send_message<S>(sender: &mut S, msg: &ServerMessage) -> anyhow::Result<()>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let json = serde_json::to_string(msg)?;
    match timeout(SEND_TIMEOUT, sender.send(Message::Text(json))).await {
        Ok(result) => Ok(result?),
        Err(_) => anyhow::bail!("relay send timed out after {SEND_TIMEOUT:?}"),
    }
}
