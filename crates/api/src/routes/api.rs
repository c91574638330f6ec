use axum::{
    extract::{Query, State},
    http::StatusCode,
    middleware,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::warn;

use common::{store, StrategyKind};

use crate::{auth::require_auth, AppState};

pub fn api_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api/portfolio", get(get_portfolio))
        .route("/api/trades", get(get_trades))
        .route("/api/performance", get(get_performance))
        .route("/api/strategies", get(get_strategies))
        .route("/api/kill", axum::routing::post(post_kill))
        .route("/api/config", get(get_config).post(post_config))
        .route_layer(middleware::from_fn_with_state(state, require_auth))
}

// ─── Portfolio ────────────────────────────────────────────────────────────────

async fn get_portfolio(State(state): State<AppState>) -> Json<Value> {
    let positions = store::open_positions(&state.db).await.unwrap_or_default();

    let mut by_strategy: HashMap<&'static str, usize> = HashMap::new();
    let mut unrealized_cost_basis = 0.0f64;

    let pos_json: Vec<Value> = positions
        .iter()
        .map(|p| {
            *by_strategy.entry(strategy_label(p.strategy)).or_default() += 1;
            unrealized_cost_basis += p.entry_price * p.shares;
            json!({
                "id": p.id,
                "market_id": p.market_id,
                "token_id": p.token_id,
                "outcome": p.outcome.to_string(),
                "side": format!("{:?}", p.side).to_lowercase(),
                "entry_price": p.entry_price,
                "shares": p.shares,
                "entry_shares": p.entry_shares,
                "realized_pnl": p.realized_pnl,
                "status": format!("{:?}", p.status).to_lowercase(),
                "strategy": p.strategy.to_string(),
                "source_wallet": p.source_wallet,
                "sl_price": p.sl_price,
                "trail_pct": p.trail_pct,
                "trail_anchor": p.trail_anchor,
                "opened_at": p.opened_at,
            })
        })
        .collect();

    let realized_today = store::realized_pnl_today(&state.db).await.unwrap_or(0.0);

    Json(json!({
        "positions": pos_json,
        "total_open": pos_json.len(),
        "by_strategy": by_strategy,
        "open_cost_basis_usd": unrealized_cost_basis,
        "realized_pnl_today_usd": realized_today,
    }))
}

fn strategy_label(kind: StrategyKind) -> &'static str {
    match kind {
        StrategyKind::Copy => "copy",
        StrategyKind::Arb => "arb",
        StrategyKind::Stink => "stink",
    }
}

// ─── Trades ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TradesQuery {
    page: Option<i64>,
    limit: Option<i64>,
    market_id: Option<String>,
}

async fn get_trades(
    State(state): State<AppState>,
    Query(q): Query<TradesQuery>,
) -> Json<Value> {
    let page = q.page.unwrap_or(1).max(1);
    let limit = q.limit.unwrap_or(50).min(200);
    let offset = (page - 1) * limit;

    let orders = match &q.market_id {
        Some(market_id) => store::orders_for_market(&state.db, market_id, limit, offset).await,
        None => store::recent_orders(&state.db, limit, offset).await,
    }
    .unwrap_or_default();

    let trades: Vec<Value> = orders
        .iter()
        .map(|o| {
            json!({
                "id": o.id,
                "exchange_order_id": o.exchange_order_id,
                "market_id": o.market_id,
                "token_id": o.token_id,
                "side": o.side.to_string(),
                "size_shares": o.size_shares,
                "price": o.price,
                "order_type": o.order_type.to_string(),
                "status": format!("{:?}", o.status).to_lowercase(),
                "filled_shares": o.filled_shares,
                "avg_fill_price": o.avg_fill_price,
                "fee_paid": o.fee_paid,
                "created_at": o.created_at,
                "updated_at": o.updated_at,
            })
        })
        .collect();

    Json(json!({ "trades": trades, "page": page, "limit": limit }))
}

// ─── Performance ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PerformanceQuery {
    days: Option<i64>,
}

async fn get_performance(
    State(state): State<AppState>,
    Query(q): Query<PerformanceQuery>,
) -> Json<Value> {
    let lookback_days = q.days.unwrap_or(30).clamp(1, 365);
    let since = chrono::Utc::now() - chrono::Duration::days(lookback_days);

    let closed = store::closed_positions_since(&state.db, since).await.unwrap_or_default();

    if closed.is_empty() {
        return Json(json!({
            "equity_curve": [],
            "win_rate": 0.0,
            "total_pnl_usd": 0.0,
            "trade_count": 0,
            "max_drawdown_pct": 0.0,
        }));
    }

    let mut equity = state.initial_balance;
    let mut peak = equity;
    let mut max_dd = 0.0f64;
    let mut wins = 0usize;
    let mut curve: Vec<Value> = Vec::new();

    for p in &closed {
        equity += p.realized_pnl;
        if equity > peak {
            peak = equity;
        }
        let dd = if peak > 0.0 { (peak - equity) / peak } else { 0.0 };
        if dd > max_dd {
            max_dd = dd;
        }
        if p.realized_pnl > 0.0 {
            wins += 1;
        }
        curve.push(json!({ "timestamp": p.closed_at, "value": equity, "strategy": p.strategy.to_string() }));
    }

    let win_rate = wins as f64 / closed.len() as f64;
    let total_pnl: f64 = closed.iter().map(|p| p.realized_pnl).sum();

    Json(json!({
        "equity_curve": curve,
        "win_rate": win_rate,
        "total_pnl_usd": total_pnl,
        "trade_count": closed.len(),
        "max_drawdown_pct": max_dd,
    }))
}

// ─── Strategies ───────────────────────────────────────────────────────────────

async fn get_strategies(State(state): State<AppState>) -> Json<Value> {
    let engine_state = *state.engine_state.read().await;
    let ready = state.strategy_ready.read().await;

    let strategies: Vec<Value> = state
        .enabled_strategies
        .iter()
        .map(|s| {
            json!({
                "name": s.to_string(),
                "ready": ready.contains(s),
            })
        })
        .collect();

    Json(json!({
        "engine_state": engine_state.to_string(),
        "strategies": strategies,
    }))
}

// ─── Kill switch ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct KillRequest {
    reason: String,
}

/// Activates the kill switch from the dashboard, via the same
/// `KillSwitch::activate` path the Telegram control surface uses — cancels
/// resting orders, persists the halt, and alerts.
async fn post_kill(
    State(state): State<AppState>,
    Json(body): Json<KillRequest>,
) -> (StatusCode, Json<Value>) {
    warn!(reason = %body.reason, "kill switch activated via dashboard API");

    match state.kill.activate(body.reason).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "killed" }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

// ─── Config ───────────────────────────────────────────────────────────────────

async fn get_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "mode": state.trading_mode.to_string(),
        "enabled_strategies": state.enabled_strategies.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
    }))
}

async fn post_config(Json(_body): Json<Value>) -> (StatusCode, Json<Value>) {
    warn!("POST /api/config received — runtime config mutation is not supported, use Telegram to pause/resume strategies");
    (StatusCode::NOT_IMPLEMENTED, Json(json!({ "status": "not_implemented" })))
}
