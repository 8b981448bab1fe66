// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`.  Feeds are addressed by
// `/{symbol}/{interval}`; the symbol is upper-cased on the way in, the
// interval is taken literally (`1m` and `1M` differ).
//
// CORS is permissive; the surface carries no credentials.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::chart::ChartSnapshot;
use crate::config::IndicatorSpec;
use crate::coordinator::CoordinatorError;
use crate::market_data::SubscriptionKey;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/errors", get(errors))
        // ── Feeds ───────────────────────────────────────────────────
        .route("/api/v1/feeds", get(list_feeds).post(start_feed))
        .route(
            "/api/v1/feeds/:symbol/:interval",
            get(feed_snapshot).delete(stop_feed),
        )
        .route("/api/v1/feeds/:symbol/:interval/reload", post(reload_feed))
        .route("/api/v1/feeds/:symbol/:interval/switch", post(switch_feed))
        .route(
            "/api/v1/feeds/:symbol/:interval/indicators",
            post(attach_indicator),
        )
        .route(
            "/api/v1/feeds/:symbol/:interval/indicators/:name",
            delete(detach_indicator),
        )
        .route("/api/v1/symbols/:symbol/valid", get(symbol_valid))
        // ── WebSocket (handled in the ws module, mounted here) ──────
        .route("/api/v1/ws/:symbol/:interval", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

fn coordinator_error(e: CoordinatorError) -> Response {
    let status = match e {
        CoordinatorError::AlreadyRunning(_) => StatusCode::CONFLICT,
        CoordinatorError::NotRunning(_) => StatusCode::NOT_FOUND,
    };
    error_response(status, e.to_string())
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    feeds: usize,
    uptime_secs: u64,
    rest_weight_1m: u32,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        feeds: state.coordinator.running_keys().len(),
        uptime_secs: state.uptime_secs(),
        rest_weight_1m: state.feed.rest().rate_limit().snapshot().used_weight_1m,
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

async fn errors(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.diagnostics.recent())
}

// =============================================================================
// Feeds
// =============================================================================

async fn list_feeds(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.summaries())
}

#[derive(Deserialize)]
struct StartFeedRequest {
    symbol: String,
    #[serde(default)]
    interval: Option<String>,
}

#[derive(Serialize)]
struct FeedStarted {
    key: String,
    candles: usize,
}

async fn start_feed(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartFeedRequest>,
) -> Response {
    let interval = req
        .interval
        .unwrap_or_else(|| state.config.read().interval.clone());
    let key = SubscriptionKey::new(&req.symbol, &interval);

    if key.interval.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "interval must not be empty");
    }
    if !state.feed.validate_symbol(&key.symbol).await {
        warn!(symbol = %key.symbol, "start rejected: symbol not listed");
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("invalid symbol {}", key.symbol),
        );
    }

    match state.start_chart(&key).await {
        Ok(candles) => {
            info!(key = %key, candles, "feed started via API");
            (
                StatusCode::CREATED,
                Json(FeedStarted {
                    key: key.to_string(),
                    candles,
                }),
            )
                .into_response()
        }
        Err(e) => coordinator_error(e),
    }
}

#[derive(Serialize)]
struct FeedSnapshot {
    key: String,
    connection_state: String,
    indicators: Vec<String>,
    #[serde(flatten)]
    chart: ChartSnapshot,
}

async fn feed_snapshot(
    State(state): State<Arc<AppState>>,
    Path((symbol, interval)): Path<(String, String)>,
) -> Response {
    let key = SubscriptionKey::new(symbol, interval);
    let Some(view) = state.view(&key) else {
        return error_response(StatusCode::NOT_FOUND, format!("no feed running for {key}"));
    };
    Json(FeedSnapshot {
        key: key.to_string(),
        connection_state: state.feed.connection_state(&key).to_string(),
        indicators: state.coordinator.indicator_names(&key),
        chart: view.snapshot(),
    })
    .into_response()
}

async fn stop_feed(
    State(state): State<Arc<AppState>>,
    Path((symbol, interval)): Path<(String, String)>,
) -> Response {
    let key = SubscriptionKey::new(symbol, interval);
    if state.stop_chart(&key) {
        info!(key = %key, "feed stopped via API");
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, format!("no feed running for {key}"))
    }
}

async fn reload_feed(
    State(state): State<Arc<AppState>>,
    Path((symbol, interval)): Path<(String, String)>,
) -> Response {
    let key = SubscriptionKey::new(symbol, interval);
    match state.coordinator.reload(&key).await {
        Ok(candles) => Json(FeedStarted {
            key: key.to_string(),
            candles,
        })
        .into_response(),
        Err(e) => coordinator_error(e),
    }
}

#[derive(Deserialize)]
struct SwitchRequest {
    interval: String,
}

async fn switch_feed(
    State(state): State<Arc<AppState>>,
    Path((symbol, interval)): Path<(String, String)>,
    Json(req): Json<SwitchRequest>,
) -> Response {
    let old = SubscriptionKey::new(&symbol, interval);
    let new = SubscriptionKey::new(&symbol, &req.interval);
    if new.interval.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "interval must not be empty");
    }
    if old == new {
        return error_response(StatusCode::CONFLICT, format!("feed {new} is already running"));
    }

    match state.switch_chart(&old, &new).await {
        Ok(candles) => Json(FeedStarted {
            key: new.to_string(),
            candles,
        })
        .into_response(),
        Err(e) => coordinator_error(e),
    }
}

// =============================================================================
// Indicators
// =============================================================================

#[derive(Serialize)]
struct IndicatorList {
    key: String,
    indicators: Vec<String>,
}

/// Attach (or replace, by name) one indicator on a running feed.
async fn attach_indicator(
    State(state): State<Arc<AppState>>,
    Path((symbol, interval)): Path<(String, String)>,
    Json(spec): Json<IndicatorSpec>,
) -> Response {
    let key = SubscriptionKey::new(symbol, interval);
    if let IndicatorSpec::Ema(ema) = &spec {
        if ema.period == 0 {
            return error_response(StatusCode::BAD_REQUEST, "ema period must be positive");
        }
    }

    match state.coordinator.attach_indicator(&key, spec.build()) {
        Ok(()) => (
            StatusCode::CREATED,
            Json(IndicatorList {
                key: key.to_string(),
                indicators: state.coordinator.indicator_names(&key),
            }),
        )
            .into_response(),
        Err(e) => coordinator_error(e),
    }
}

async fn detach_indicator(
    State(state): State<Arc<AppState>>,
    Path((symbol, interval, name)): Path<(String, String, String)>,
) -> Response {
    let key = SubscriptionKey::new(symbol, interval);
    match state.coordinator.detach_indicator(&key, &name) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_response(
            StatusCode::NOT_FOUND,
            format!("no indicator {name} on {key}"),
        ),
        Err(e) => coordinator_error(e),
    }
}

// =============================================================================
// Symbols
// =============================================================================

#[derive(Serialize)]
struct SymbolValidity {
    symbol: String,
    valid: bool,
}

async fn symbol_valid(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let symbol = symbol.trim().to_uppercase();
    let valid = state.feed.validate_symbol(&symbol).await;
    Json(SymbolValidity { symbol, valid })
}

// =============================================================================
// Tests
// =============================================================================
