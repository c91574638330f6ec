mod auth;
pub mod routes;

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::Router;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, Mutex, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use common::{EngineState, StrategyKind, TradingMode};

/// Ring buffer that keeps recent log lines so new clients get history.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub async fn push(&self, line: String) {
        let mut buf = self.inner.lock().await;
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(line);
    }

    pub async fn snapshot(&self) -> Vec<String> {
        self.inner.lock().await.iter().cloned().collect()
    }
}

/// Shared application state injected into every route handler.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub engine_state: Arc<RwLock<EngineState>>,
    pub trading_mode: TradingMode,
    pub dashboard_token: String,
    pub initial_balance: f64,
    /// Broadcast channel for streaming log lines to WebSocket clients.
    pub log_tx: broadcast::Sender<String>,
    /// Recent log history for new clients.
    pub log_buffer: LogBuffer,
    /// True while the CLOB price-stream websocket is connected. Always
    /// reported healthy in paper mode, where no live socket exists.
    pub ws_connected: Arc<AtomicBool>,
    /// True while the CLOB REST adapter's recent calls are succeeding.
    /// Always reported healthy in paper mode.
    pub adapter_connected: Arc<AtomicBool>,
    /// Strategies enabled for this run, checked against `strategy_ready`
    /// by `/ready`.
    pub enabled_strategies: Vec<StrategyKind>,
    /// Strategies whose tick loop has started at least once.
    pub strategy_ready: Arc<RwLock<HashSet<StrategyKind>>>,
    /// Shared kill-switch handle so the dashboard `/api/kill` endpoint
    /// drives the same activation path as the Telegram control surface.
    pub kill: Arc<risk::KillSwitch>,
}

/// Build and run the Axum API server.
pub async fn serve(state: AppState, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any);

    let app = Router::new()
        .merge(routes::api_router(state.clone()))
        .merge(routes::ws_router())
        .merge(routes::health_router())
        .with_state(state)
        .layer(cors);

    // `api_router` takes `state` directly because `route_layer`'s auth
    // middleware needs a concrete `AppState` to build its layer from —
    // `with_state` below only supplies it to the router's own handlers.

    info!(%addr, "Dashboard API listening");
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
