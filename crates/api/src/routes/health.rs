use std::sync::atomic::Ordering;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;

use common::{EngineState, TradingMode};

use crate::AppState;

pub fn health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
}

/// Liveness check — no auth required. 200 only if the exchange adapter is
/// connected, the store is reachable, and the engine is not halted. Ops
/// scripts and container orchestrators should restart on a sustained 503.
async fn health(State(state): State<AppState>) -> Response {
    let engine_state = *state.engine_state.read().await;
    let halted = engine_state == EngineState::Halted;

    let store_ok = sqlx::query("SELECT 1").fetch_one(&state.db).await.is_ok();

    // Paper mode has no live socket or REST adapter to the exchange, so
    // both are vacuously connected.
    let (adapter_ok, ws_ok) = match state.trading_mode {
        TradingMode::Paper => (true, true),
        TradingMode::Live => (
            state.adapter_connected.load(Ordering::Relaxed),
            state.ws_connected.load(Ordering::Relaxed),
        ),
    };

    let healthy = !halted && store_ok && adapter_ok && ws_ok;
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status,
        Json(json!({
            "healthy": healthy,
            "engine": engine_state.to_string(),
            "mode": state.trading_mode.to_string(),
            "adapter_connected": adapter_ok,
            "ws_connected": ws_ok,
            "store_reachable": store_ok,
        })),
    )
        .into_response()
}

/// Readiness check — 200 only once every enabled strategy has started its
/// tick loop. Used by deploy tooling to gate traffic/alerts until the bot
/// has actually begun polling, not just booted the process.
async fn ready(State(state): State<AppState>) -> Response {
    let ready_set = state.strategy_ready.read().await;
    let pending: Vec<String> = state
        .enabled_strategies
        .iter()
        .filter(|s| !ready_set.contains(s))
        .map(|s| s.to_string())
        .collect();

    let status = if pending.is_empty() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status,
        Json(json!({
            "ready": pending.is_empty(),
            "pending": pending,
        })),
    )
        .into_response()
}
