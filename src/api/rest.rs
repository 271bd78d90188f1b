// =============================================================================
// REST API Endpoints - Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Candle reads copy out of the
// aggregator under a per-symbol lock and never wait on ingestion of other
// symbols. Paper orders only read the latest price.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::error::{AggregatorError, LedgerError};
use crate::types::Side;

/// Fills returned by `GET /api/v1/trades` when no limit is given.
const DEFAULT_TRADES_LIMIT: usize = 100;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Status ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/symbols", get(symbols))
        // ── Candles ─────────────────────────────────────────────────
        .route("/api/v1/candles/:symbol", get(candles))
        .route("/api/v1/candles/:symbol/latest", get(latest_candle))
        // ── Paper trading ───────────────────────────────────────────
        .route("/api/v1/trade", post(place_trade))
        .route("/api/v1/trades", get(trades))
        .route("/api/v1/portfolio", get(portfolio))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

impl IntoResponse for AggregatorError {
    fn into_response(self) -> Response {
        let status = match self {
            AggregatorError::UnknownSymbol(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        };
        error_response(status, self.to_string())
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = match self {
            LedgerError::NoPrice(_) => StatusCode::CONFLICT,
            _ => StatusCode::BAD_REQUEST,
        };
        error_response(status, self.to_string())
    }
}

// =============================================================================
// Status
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    subscribers: usize,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = if state.is_shutting_down() {
        "shutting_down"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status,
        subscribers: state.registry.len(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_stats())
}

#[derive(Serialize)]
struct SymbolInfo {
    symbol: String,
    live: bool,
    latest_price: Option<f64>,
}

async fn symbols(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let agg = &state.aggregator;
    let list: Vec<SymbolInfo> = agg
        .symbols()
        .into_iter()
        .map(|symbol| SymbolInfo {
            live: agg.is_live(&symbol),
            latest_price: agg.latest_price(&symbol),
            symbol,
        })
        .collect();

    Json(serde_json::json!({
        "timeframe": state.timeframe.label(),
        "symbols": list,
    }))
}

// =============================================================================
// Candles
// =============================================================================

#[derive(Deserialize)]
struct CandlesQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn candles(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<CandlesQuery>,
) -> Result<impl IntoResponse, AggregatorError> {
    let candles = match query.limit {
        Some(limit) => state.aggregator.snapshot_tail(&symbol, limit)?,
        None => state.aggregator.snapshot(&symbol)?,
    };
    Ok(Json(serde_json::json!({
        "symbol": symbol.to_uppercase(),
        "timeframe": state.timeframe.label(),
        "candles": candles,
    })))
}

async fn latest_candle(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Response {
    match state.aggregator.latest_candle(&symbol) {
        Ok(Some(candle)) => Json(candle).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("no candles yet for {symbol}")),
        Err(e) => e.into_response(),
    }
}

// =============================================================================
// Paper trading
// =============================================================================

#[derive(Deserialize)]
struct TradeRequest {
    symbol: String,
    side: Side,
    quantity: f64,
}

async fn place_trade(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TradeRequest>,
) -> Result<impl IntoResponse, LedgerError> {
    let trade = state
        .ledger
        .place_market_order(&state.aggregator, &req.symbol, req.side, req.quantity)
        .map_err(|e| {
            warn!(symbol = %req.symbol, side = %req.side, error = %e, "paper order rejected");
            e
        })?;

    info!(id = %trade.id, "paper order filled via API");
    Ok((StatusCode::CREATED, Json(trade)))
}

#[derive(Deserialize)]
struct TradesQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn trades(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TradesQuery>,
) -> impl IntoResponse {
    Json(state.ledger.trades(query.limit.unwrap_or(DEFAULT_TRADES_LIMIT)))
}

async fn portfolio(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let prices = state.aggregator.latest_prices();
    Json(state.ledger.portfolio(&prices))
}

// =============================================================================
// Tests
// =============================================================================
