// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires a valid Bearer token via the `AuthBearer` extractor. CORS is
// permissive for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::debate::DebateOrchestrator;
use crate::types::{DebateTrigger, Symbol, TradingMode};

/// Everything the handlers need.
#[derive(Clone)]
pub struct ApiContext {
    pub state: Arc<AppState>,
    pub orchestrator: Arc<DebateOrchestrator>,
}

/// Build the full REST router with CORS middleware and shared state.
pub fn router(ctx: ApiContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/signals", get(signals))
        .route("/api/v1/trades", get(trades))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/quota", get(quota))
        .route("/api/v1/debate/:symbol", post(trigger_debate))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        // ── WebSocket upgrades ──────────────────────────────────────
        .route("/ws/market", get(crate::api::ws::market_ws_handler))
        .route("/ws/signals", get(crate::api::ws::signals_ws_handler))
        .layer(cors)
        .with_state(ctx)
}

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "state_version": ctx.state.current_state_version(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

async fn full_state(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.build_snapshot())
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn signals(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50).min(500);
    match ctx.state.store.recent_signals(limit) {
        Ok(signals) => Json(serde_json::json!({ "signals": signals })).into_response(),
        Err(e) => {
            warn!(error = %e, "signal query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": "query failed"})))
                .into_response()
        }
    }
}

async fn trades(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50).min(500);
    match ctx.state.store.recent_trades(limit) {
        Ok(trades) => Json(serde_json::json!({ "trades": trades })).into_response(),
        Err(e) => {
            warn!(error = %e, "trade query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": "query failed"})))
                .into_response()
        }
    }
}

async fn positions(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(serde_json::json!({ "positions": ctx.state.supervisor.snapshot() }))
}

async fn quota(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.state.quota.snapshot())
}

/// Manual debate trigger. Runs the debate in the background and returns
/// immediately; the result arrives on `/ws/signals`.
async fn trigger_debate(
    _auth: AuthBearer,
    State(ctx): State<ApiContext>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let Some(symbol) = Symbol::parse(&symbol) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": format!("invalid symbol '{symbol}'")})),
        )
            .into_response();
    };

    info!(symbol = %symbol, "manual debate requested");
    let orchestrator = ctx.orchestrator.clone();
    let state = ctx.state.clone();
    let response_symbol = symbol.raw().to_string();
    tokio::spawn(async move {
        match orchestrator.run_debate(&symbol, DebateTrigger::Manual).await {
            Ok(signal) => {
                info!(symbol = %symbol, id = signal.id, "manual debate finished");
                state.increment_version();
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "manual debate failed");
                state.push_error(format!("manual debate {symbol}: {e}"));
            }
        }
    });

    Json(serde_json::json!({ "accepted": true, "symbol": response_symbol })).into_response()
}

async fn control_pause(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    ctx.state.config.write().trading_mode = TradingMode::Paused;
    ctx.state.increment_version();
    info!("trading paused by operator");
    Json(serde_json::json!({ "trading_mode": "Paused" }))
}

async fn control_resume(_auth: AuthBearer, State(ctx): State<ApiContext>) -> impl IntoResponse {
    ctx.state.config.write().trading_mode = TradingMode::Live;
    ctx.state.increment_version();
    warn!("trading set LIVE by operator");
    Json(serde_json::json!({ "trading_mode": "Live" }))
}
