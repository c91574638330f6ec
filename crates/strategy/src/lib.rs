pub mod arb;
pub mod config;
pub mod copy;
pub mod stink;

pub use config::StrategyFileConfig;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use common::{EngineState, Signal, StrategyKind};

/// All strategy state machines satisfy this trait. Unlike a pure indicator
/// strategy reacting to a market-event stream, these are periodic pollers —
/// each owns its own tick cadence and reaches out to the exchange directly
/// (wallet balances, orderbooks, open orders) rather than waiting on a
/// push feed.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> StrategyKind;
    fn poll_interval(&self) -> Duration;

    /// Run one tick. Signals are pushed directly onto `signal_tx` —
    /// the strategy never talks to the Risk Gate or Order Manager itself.
    async fn tick(&mut self, signal_tx: &mpsc::Sender<Signal>);
}

/// Drives one strategy's tick loop on its own interval, suppressing ticks
/// while the engine is halted or this specific strategy is paused.
pub async fn run_strategy(
    mut strategy: Box<dyn Strategy>,
    signal_tx: mpsc::Sender<Signal>,
    engine_state: Arc<RwLock<EngineState>>,
    paused: Arc<RwLock<HashSet<StrategyKind>>>,
    ready: Arc<RwLock<HashSet<StrategyKind>>>,
) {
    let mut ticker = tokio::time::interval(strategy.poll_interval());
    info!(strategy = strategy.name(), "strategy loop starting");
    ready.write().await.insert(strategy.kind());

    loop {
        ticker.tick().await;

        let state = *engine_state.read().await;
        if state != EngineState::Running {
            debug!(strategy = strategy.name(), ?state, "engine not running, skipping tick");
            continue;
        }
        if paused.read().await.contains(&strategy.kind()) {
            debug!(strategy = strategy.name(), "strategy paused, skipping tick");
            continue;
        }

        strategy.tick(&signal_tx).await;

        if signal_tx.is_closed() {
            warn!(strategy = strategy.name(), "signal channel closed, stopping strategy loop");
            return;
        }
    }
}
