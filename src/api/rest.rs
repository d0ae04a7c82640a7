// =============================================================================
// Query API — Axum 0.7
// =============================================================================
//
// Read-only views over the engine plus the verification hand-off. Every
// endpoint lives under `/lux/api/`; the push relay is mounted at `/lux/ws`.
//
// Missing data is never an HTTP error: price lookups answer with a
// PENDING/NOT_FOUND body, history lookups with an empty list. Only malformed
// input (400) and a verification request with nothing pending (503) fail.
//
// CORS is permissive; the API carries no credentials.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{ApiError, FeedError};
use crate::feed::session::SessionState;
use crate::feed::subscription::SubscriptionSnapshot;
use crate::resolution::{OhlcSummary, MAX_HISTORY_LIMIT};
use crate::supervisor::TaskFailure;
use crate::types::{is_valid_symbol, Candle, FeedStatus, ResolutionStatus};

const DEFAULT_RECENT_LIMIT: usize = 100;
const DEFAULT_OHLC_PERIOD: usize = 10;
const MAX_CODE_LEN: usize = 32;
const SECS_PER_DAY: i64 = 86_400;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and the shared engine.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Operations ──────────────────────────────────────────────
        .route("/lux/api/health", get(health))
        .route("/lux/api/status", get(status))
        // ── Queries ─────────────────────────────────────────────────
        .route("/lux/api/assets", get(assets))
        .route("/lux/api/snapshot", get(snapshot))
        .route("/lux/api/price/:asset", get(price))
        .route("/lux/api/recent/:asset", get(recent))
        .route("/lux/api/ohlc/:asset", get(ohlc))
        .route("/lux/api/daily/:asset", get(daily))
        .route("/lux/api/monthly/:asset", get(monthly))
        // ── Upstream session ────────────────────────────────────────
        .route("/lux/api/verify", get(verify_query).post(verify_body))
        // ── Push relay ──────────────────────────────────────────────
        .route("/lux/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(engine)
}

fn check_asset(asset: &str) -> Result<(), ApiError> {
    if is_valid_symbol(asset) {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("invalid asset symbol: {asset:?}")))
    }
}

// =============================================================================
// Health & status
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    live_assets: usize,
    data_dir_present: bool,
    /// Some supervised task failed since startup; see `/lux/api/status`.
    degraded: bool,
    shutting_down: bool,
    server_time: i64,
}

async fn health(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: engine.uptime_secs(),
        live_assets: engine.store.len(),
        data_dir_present: engine.mirror.dir().is_dir(),
        degraded: !engine.failures.is_empty(),
        shutting_down: engine.is_shutting_down(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

#[derive(Serialize)]
struct StatusResponse {
    feed: SessionState,
    subscribed: usize,
    catalog_size: usize,
    catalog_refreshed_at: Option<i64>,
    live_assets: usize,
    interval_secs: i64,
    subscriptions: SubscriptionSnapshot,
    failures: Vec<TaskFailure>,
}

async fn status(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(StatusResponse {
        feed: engine.session.state(),
        subscribed: engine.session.subscribed_count(),
        catalog_size: engine.catalog.len(),
        catalog_refreshed_at: engine.catalog.refreshed_at(),
        live_assets: engine.store.len(),
        interval_secs: engine.config.interval_secs,
        subscriptions: engine.subscriptions.snapshot(),
        failures: engine.failures.recent(),
    })
}

// =============================================================================
// Assets & snapshot
// =============================================================================

async fn assets(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    let assets = engine.resolution.assets();
    Json(serde_json::json!({ "count": assets.len(), "assets": assets }))
}

#[derive(Serialize)]
struct SnapshotResponse {
    count: usize,
    interval_secs: i64,
    data: BTreeMap<String, Candle>,
}

async fn snapshot(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    let data: BTreeMap<String, Candle> = engine.store.all().collect();
    Json(SnapshotResponse {
        count: data.len(),
        interval_secs: engine.config.interval_secs,
        data,
    })
}

// =============================================================================
// Price resolution
// =============================================================================

async fn price(
    State(engine): State<Arc<Engine>>,
    Path(asset): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_asset(&asset)?;
    let resolution = engine.resolution.resolve_price(&asset).await;
    let code = match resolution.status {
        ResolutionStatus::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    Ok((code, Json(resolution)))
}

// =============================================================================
// History
// =============================================================================

#[derive(Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

async fn recent(
    State(engine): State<Arc<Engine>>,
    Path(asset): Path<String>,
    Query(query): Query<RecentQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_asset(&asset)?;
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT);
    if limit == 0 || limit > MAX_HISTORY_LIMIT {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {MAX_HISTORY_LIMIT}"
        )));
    }
    Ok(Json(engine.resolution.recent(&asset, limit).await))
}

#[derive(Deserialize)]
struct OhlcQuery {
    period: Option<usize>,
}

#[derive(Serialize)]
struct OhlcResponse {
    asset: String,
    period: usize,
    data: Option<OhlcSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
}

async fn ohlc(
    State(engine): State<Arc<Engine>>,
    Path(asset): Path<String>,
    Query(query): Query<OhlcQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_asset(&asset)?;
    let period = query.period.unwrap_or(DEFAULT_OHLC_PERIOD);
    if period == 0 || period > MAX_HISTORY_LIMIT {
        return Err(ApiError::BadRequest(format!(
            "period must be between 1 and {MAX_HISTORY_LIMIT}"
        )));
    }
    let data = engine.resolution.ohlc(&asset, period).await;
    let message = data.is_none().then_some("no candles collected yet");
    Ok(Json(OhlcResponse {
        asset,
        period,
        data,
        message,
    }))
}

// =============================================================================
// Archives
// =============================================================================

#[derive(Deserialize)]
struct DailyQuery {
    date: Option<String>,
}

#[derive(Serialize)]
struct DailyResponse {
    asset: String,
    date: String,
    interval_secs: i64,
    count: usize,
    candles: Vec<Candle>,
}

/// One UTC day, `[00:00, 24:00)`. Defaults to today.
async fn daily(
    State(engine): State<Arc<Engine>>,
    Path(asset): Path<String>,
    Query(query): Query<DailyQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_asset(&asset)?;
    let date = match query.date.as_deref() {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| ApiError::BadRequest(format!("date must be YYYY-MM-DD, got {raw:?}")))?,
        None => DateTime::from_timestamp(engine.clock.now(), 0)
            .map(|now| now.date_naive())
            .ok_or_else(|| ApiError::Internal("clock is out of range".into()))?,
    };
    let from = date
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc().timestamp())
        .ok_or_else(|| ApiError::BadRequest(format!("date {date} has no midnight")))?;

    let range = engine.resolution.range(&asset, from, from + SECS_PER_DAY).await;
    Ok(Json(DailyResponse {
        asset,
        date: date.format("%Y-%m-%d").to_string(),
        interval_secs: engine.config.interval_secs,
        count: range.candles.len(),
        candles: range.candles,
    }))
}

#[derive(Deserialize)]
struct MonthlyQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct MonthlyResponse {
    asset: String,
    interval_secs: i64,
    retention_days: i64,
    count: usize,
    candles: Vec<Candle>,
}

/// The whole retention window, newest `limit` candles if given.
async fn monthly(
    State(engine): State<Arc<Engine>>,
    Path(asset): Path<String>,
    Query(query): Query<MonthlyQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_asset(&asset)?;
    if query.limit == Some(0) {
        return Err(ApiError::BadRequest("limit must be positive".into()));
    }
    let retention_days = engine.config.retention_days;
    let now = engine.clock.now();
    let from = now - retention_days * SECS_PER_DAY;
    // Include the bucket that is still open.
    let to = now + engine.config.interval_secs;

    let mut candles = engine.resolution.range(&asset, from, to).await.candles;
    if let Some(limit) = query.limit {
        let skip = candles.len().saturating_sub(limit);
        candles = candles.split_off(skip);
    }
    Ok(Json(MonthlyResponse {
        asset,
        interval_secs: engine.config.interval_secs,
        retention_days,
        count: candles.len(),
        candles,
    }))
}

// =============================================================================
// Verification code hand-off
// =============================================================================

#[derive(Deserialize)]
struct VerifyRequest {
    code: Option<String>,
}

#[derive(Serialize)]
struct VerifyResponse {
    accepted: bool,
    status: FeedStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

async fn verify_query(
    State(engine): State<Arc<Engine>>,
    Query(req): Query<VerifyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    submit_code(&engine, req.code).await
}

async fn verify_body(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<VerifyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    submit_code(&engine, req.code).await
}

async fn submit_code(
    engine: &Engine,
    code: Option<String>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let code = code.unwrap_or_default();
    let code = code.trim();
    let well_formed = !code.is_empty()
        && code.len() <= MAX_CODE_LEN
        && code.chars().all(|c| c.is_ascii_alphanumeric());
    if !well_formed {
        return Err(ApiError::BadRequest("code must be 1-32 alphanumeric characters".into()));
    }

    match engine.session.submit_verification_code(code).await {
        Ok(status) => {
            info!(%status, "verification code accepted");
            Ok(Json(VerifyResponse {
                accepted: true,
                status,
                reason: None,
            }))
        }
        Err(FeedError::NotConnected) => Err(ApiError::Unavailable(
            "no verification is pending on the upstream session".into(),
        )),
        Err(e) => {
            warn!(error = %e, "verification code rejected");
            Ok(Json(VerifyResponse {
                accepted: false,
                status: engine.session.status(),
                reason: Some(e.to_string()),
            }))
        }
    }
}
