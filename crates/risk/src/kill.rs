use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use common::{EngineState, ExchangeClient, Result, RiskEvent};

/// Coordinates the kill-switch: the one path that stops the bot trading
/// entirely, independent of the normal signal queue. Activation is
/// idempotent — calling it twice while already active is a no-op.
pub struct KillSwitch {
    db: SqlitePool,
    client: Arc<dyn ExchangeClient>,
    engine_state: Arc<RwLock<EngineState>>,
    active: Arc<RwLock<bool>>,
    risk_event_tx: mpsc::Sender<RiskEvent>,
}

impl KillSwitch {
    /// Re-reads the persisted kill-switch row and mirrors it into
    /// `engine_state` before anything else starts — a restart must never
    /// silently clear a kill that was active when the process died.
    pub async fn load(
        db: SqlitePool,
        client: Arc<dyn ExchangeClient>,
        engine_state: Arc<RwLock<EngineState>>,
        risk_event_tx: mpsc::Sender<RiskEvent>,
    ) -> Result<Self> {
        let state = common::store::risk_state(&db).await?;
        if state.kill_switch_active {
            *engine_state.write().await = EngineState::Halted;
            warn!("kill switch was active at last shutdown; staying halted");
        }

        Ok(Self {
            db,
            client,
            engine_state,
            active: Arc::new(RwLock::new(state.kill_switch_active)),
            risk_event_tx,
        })
    }

    pub async fn is_active(&self) -> bool {
        *self.active.read().await
    }

    /// Activates the kill switch: cancels every resting order, persists
    /// the halt, flips the engine to `Halted`, and alerts. Does not sell
    /// down open positions — that is a deliberate operator decision, left
    /// for a human to review via the dashboard or a manual order.
    pub async fn activate(&self, reason: impl Into<String>) -> Result<()> {
        {
            let mut active = self.active.write().await;
            if *active {
                return Ok(());
            }
            *active = true;
        }
        let reason = reason.into();
        warn!(%reason, "activating kill switch");

        *self.engine_state.write().await = EngineState::Halted;

        if let Err(e) = self.client.cancel_all(None).await {
            error!(error = %e, "kill switch: failed to cancel all open orders");
        }

        common::store::set_kill_switch(&self.db, true, Some(&reason)).await?;
        let _ = self
            .risk_event_tx
            .send(RiskEvent::KillActivated { reason })
            .await;

        Ok(())
    }

    /// Clears the kill switch and returns the engine to `Running`. There
    /// is deliberately no chat command for this — clearing a kill requires
    /// editing the database directly, so an operator has to look at what
    /// happened before trading resumes.
    pub async fn clear(&self) -> Result<()> {
        *self.active.write().await = false;
        *self.engine_state.write().await = EngineState::Running;
        common::store::set_kill_switch(&self.db, false, None).await?;
        info!("kill switch cleared, engine resuming");
        Ok(())
    }
}
