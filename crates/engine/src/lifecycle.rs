use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{info, warn};

use common::{EngineCommand, EngineState, PriceEvent, StrategyKind};

use crate::clob::PriceStream;

/// Cloneable handle passed to other crates (Telegram, API).
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<EngineCommand>,
    state: Arc<RwLock<EngineState>>,
    paused_strategies: Arc<RwLock<HashSet<StrategyKind>>>,
    price_tx: broadcast::Sender<PriceEvent>,
    ws_connected: Arc<AtomicBool>,
}

impl EngineHandle {
    pub async fn send(&self, cmd: EngineCommand) {
        let _ = self.command_tx.send(cmd).await;
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    pub async fn is_paused(&self, strategy: StrategyKind) -> bool {
        self.paused_strategies.read().await.contains(&strategy)
    }

    /// Subscribe to the price-tick broadcast.
    pub fn subscribe_prices(&self) -> broadcast::Receiver<PriceEvent> {
        self.price_tx.subscribe()
    }

    /// Whether the CLOB price-stream websocket currently has an open
    /// connection. Read by the dashboard `/health` endpoint.
    pub fn ws_connected(&self) -> bool {
        self.ws_connected.load(Ordering::Relaxed)
    }

    /// Raw handle to the engine's paused-strategy set, for wiring directly
    /// into `strategy::run_strategy`.
    pub fn paused_strategies_handle(&self) -> Arc<RwLock<HashSet<StrategyKind>>> {
        self.paused_strategies.clone()
    }

    /// Raw handle to the engine lifecycle state, for wiring directly into
    /// `strategy::run_strategy`.
    pub fn state_handle(&self) -> Arc<RwLock<EngineState>> {
        self.state.clone()
    }
}

/// The main engine: manages price-stream lifecycle and command processing.
/// Starts in `Starting`; `lifecycle::run` flips it to `Running` once the
/// initial price streams are spawned. A kill-switch activation flips it to
/// `Halted` directly via the shared `EngineState` handle — this loop never
/// transitions out of `Halted` itself, since clearing a kill requires
/// editing the database and restarting the process.
pub struct Engine {
    token_ids: Vec<String>,
    ws_url: String,
    state: Arc<RwLock<EngineState>>,
    paused_strategies: Arc<RwLock<HashSet<StrategyKind>>>,
    price_tx: broadcast::Sender<PriceEvent>,
    command_rx: mpsc::Receiver<EngineCommand>,
    #[allow(dead_code)] // kept alive to prevent the channel from closing
    command_tx: mpsc::Sender<EngineCommand>,
    ws_connected: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(ws_url: impl Into<String>, token_ids: Vec<String>) -> (Self, EngineHandle) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (price_tx, _) = broadcast::channel(4096);
        let state = Arc::new(RwLock::new(EngineState::Starting));
        let paused_strategies = Arc::new(RwLock::new(HashSet::new()));
        let ws_connected = Arc::new(AtomicBool::new(false));

        let handle = EngineHandle {
            command_tx: command_tx.clone(),
            state: state.clone(),
            paused_strategies: paused_strategies.clone(),
            price_tx: price_tx.clone(),
            ws_connected: ws_connected.clone(),
        };

        let engine = Engine {
            token_ids,
            ws_url: ws_url.into(),
            state,
            paused_strategies,
            price_tx,
            command_rx,
            command_tx,
            ws_connected,
        };

        (engine, handle)
    }

    /// Run the engine. This task drives stream spawning and command
    /// processing. Call from `tokio::spawn`.
    pub async fn run(mut self) {
        info!(tokens = self.token_ids.len(), "starting CLOB price streams");

        let stream = PriceStream::new(
            self.ws_url.clone(),
            self.token_ids.clone(),
            self.price_tx.clone(),
            self.ws_connected.clone(),
        );
        let _stream_handle = tokio::spawn(stream.run());
        *self.state.write().await = EngineState::Running;

        loop {
            match self.command_rx.recv().await {
                Some(EngineCommand::Pause(strategy)) => {
                    info!(?strategy, "pausing strategy");
                    self.paused_strategies.write().await.insert(strategy);
                }

                Some(EngineCommand::Resume(strategy)) => {
                    let current = *self.state.read().await;
                    if current == EngineState::Halted {
                        warn!(?strategy, "ignoring resume: engine is halted by kill switch");
                        continue;
                    }
                    info!(?strategy, "resuming strategy");
                    self.paused_strategies.write().await.remove(&strategy);
                }

                Some(EngineCommand::Kill(reason)) => {
                    warn!(%reason, "engine received kill command");
                    *self.state.write().await = EngineState::Halted;
                }

                None => {
                    warn!("engine command channel closed — shutting down");
                    break;
                }
            }
        }
    }
}
