use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use common::{Order, PortfolioSnapshot, Position, Result, Signal, StrategyKind};

use crate::gate::{self, GateContext, RiskConfig};
use crate::kill::KillSwitch;

/// Maximum age, in seconds, a `PortfolioSnapshot` may have before the gate
/// treats it as unknown and fails closed.
const PORTFOLIO_STALE_SECS: i64 = 5;

/// The gatekeeper between the strategy layer and the Order Manager.
///
/// ALL signals — entries and exits alike — pass through `run()` before an
/// `Order` is ever persisted or submitted. No strategy or the Position
/// Manager holds a direct reference to the order channel.
pub struct RiskManager {
    config: RiskConfig,
    db: SqlitePool,
    signal_rx: mpsc::Receiver<Signal>,
    exit_rx: mpsc::Receiver<Signal>,
    order_tx: mpsc::Sender<Order>,
    /// Mirrors every approved `Signal` alongside its `Order` so the Order
    /// Manager can recover strategy/outcome context it has no other way to
    /// reach once only the `Order` is in hand.
    approved_signal_tx: mpsc::Sender<Signal>,
    risk_event_tx: mpsc::Sender<common::RiskEvent>,
    kill: Arc<KillSwitch>,
    portfolio: Arc<RwLock<Option<PortfolioSnapshot>>>,
    open_positions: Arc<RwLock<Vec<Position>>>,
}

impl RiskManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RiskConfig,
        db: SqlitePool,
        signal_rx: mpsc::Receiver<Signal>,
        exit_rx: mpsc::Receiver<Signal>,
        order_tx: mpsc::Sender<Order>,
        approved_signal_tx: mpsc::Sender<Signal>,
        risk_event_tx: mpsc::Sender<common::RiskEvent>,
        kill: Arc<KillSwitch>,
        portfolio: Arc<RwLock<Option<PortfolioSnapshot>>>,
        open_positions: Arc<RwLock<Vec<Position>>>,
    ) -> Self {
        Self {
            config,
            db,
            signal_rx,
            exit_rx,
            order_tx,
            approved_signal_tx,
            risk_event_tx,
            kill,
            portfolio,
            open_positions,
        }
    }

    /// Run the risk manager loop. `exit_rx` is polled with priority over
    /// `signal_rx` via `biased` select — an exit waiting behind a burst of
    /// entry signals must never starve.
    pub async fn run(mut self) {
        info!("RiskManager running");
        loop {
            let signal = tokio::select! {
                biased;

                exit = self.exit_rx.recv() => match exit {
                    Some(sig) => sig,
                    None => {
                        warn!("exit signal channel closed — RiskManager exiting");
                        return;
                    }
                },

                entry = self.signal_rx.recv() => match entry {
                    Some(sig) => sig,
                    None => {
                        warn!("entry signal channel closed — RiskManager exiting");
                        return;
                    }
                },
            };

            if let Err(e) = self.handle_signal(signal).await {
                warn!(error = %e, "failed to handle signal");
            }
        }
    }

    async fn handle_signal(&mut self, signal: Signal) -> Result<()> {
        let snapshot = *self.portfolio.read().await;
        let (cash_usd, portfolio_usd, daily_unrealized_pnl_usd, portfolio_unknown) = match snapshot
        {
            Some(s) if !s.is_stale(PORTFOLIO_STALE_SECS) => {
                (Some(s.cash_usd), Some(s.total_usd), s.unrealized_pnl_usd, false)
            }
            Some(_) => (None, None, 0.0, true),
            None => (None, None, 0.0, true),
        };

        let daily_realized_pnl_usd = common::store::realized_pnl_today(&self.db)
            .await
            .unwrap_or(0.0);

        let positions = self.open_positions.read().await;
        let open_position_count = positions.len();
        let open_markets: Vec<String> = positions.iter().map(|p| p.market_id.clone()).collect();

        let mut strategy_exposure_usd: HashMap<StrategyKind, f64> = HashMap::new();
        for p in positions.iter() {
            *strategy_exposure_usd.entry(p.strategy).or_insert(0.0) += p.shares * p.entry_price;
        }
        drop(positions);

        let ctx = GateContext {
            config: &self.config,
            kill_switch_active: self.kill.is_active().await,
            cash_usd,
            portfolio_usd,
            portfolio_unknown,
            daily_realized_pnl_usd,
            daily_unrealized_pnl_usd,
            open_position_count,
            strategy_exposure_usd,
            open_markets: &open_markets,
        };

        match gate::evaluate(&signal, &ctx) {
            Ok(()) => self.approve(signal).await,
            Err(reason) => self.reject(&signal, reason).await,
        }
    }

    async fn approve(&self, signal: Signal) -> Result<()> {
        // Share conversion happens exactly once, inside the Order Manager,
        // against a freshly-fetched live price — not here, against the
        // signal's possibly-stale reference price.
        let order = Order::pending(&signal);
        info!(
            market = %order.market_id,
            size_usd = signal.size_usd,
            is_exit = signal.is_exit(),
            "signal approved by RiskManager"
        );

        common::store::insert_order(&self.db, &order).await?;
        let _ = self.approved_signal_tx.send(signal).await;
        let _ = self.order_tx.send(order).await;
        Ok(())
    }

    async fn reject(&self, signal: &Signal, reason: common::RejectionReason) -> Result<()> {
        warn!(
            market = %signal.market_id,
            reason = %reason,
            "signal rejected by RiskManager"
        );

        common::store::log_risk_event(
            &self.db,
            "signal_rejected",
            &format!(
                "{} rejected signal {} in {}",
                reason, signal.id, signal.market_id
            ),
        )
        .await?;

        let _ = self
            .risk_event_tx
            .send(common::RiskEvent::SignalRejected {
                signal_id: signal.id,
                market_id: signal.market_id.clone(),
                strategy: signal.strategy,
                reason,
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{OrderSide, OrderType};

    async fn test_db() -> SqlitePool {
        let pool = common::store::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("../../migrations").run(&pool).await.unwrap();
        pool
    }

    fn make_signal(size_usd: f64) -> Signal {
        Signal::entry(
            StrategyKind::Copy,
            "market-1",
            "token-yes",
            OrderSide::Buy,
            size_usd,
            0.5,
            OrderType::Gtc,
            "test",
        )
    }

    async fn make_kill(db: SqlitePool) -> Arc<KillSwitch> {
        let (risk_event_tx, _rx) = mpsc::channel(8);
        let client: Arc<dyn common::ExchangeClient> = Arc::new(NoopClient);
        let engine_state = Arc::new(RwLock::new(common::EngineState::Running));
        Arc::new(
            KillSwitch::load(db, client, engine_state, risk_event_tx)
                .await
                .unwrap(),
        )
    }

    struct NoopClient;

    #[async_trait::async_trait]
    impl common::ExchangeClient for NoopClient {
        async fn place(&self, _args: &common::OrderArgs) -> Result<common::PlacedOrder> {
            unimplemented!()
        }
        async fn cancel(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn cancel_all(&self, _market_id: Option<&str>) -> Result<()> {
            Ok(())
        }
        async fn open_orders(&self) -> Result<Vec<common::ExchangeOrder>> {
            Ok(vec![])
        }
        async fn positions(&self) -> Result<Vec<common::ExchangePosition>> {
            Ok(vec![])
        }
        async fn balance_usd(&self) -> Result<f64> {
            Ok(0.0)
        }
        async fn price(&self, _token_id: &str) -> Result<f64> {
            Ok(0.5)
        }
        async fn orderbook(&self, _token_id: &str) -> Result<common::OrderBook> {
            unimplemented!()
        }
        async fn market(&self, _market_id: &str) -> Result<common::MarketInfo> {
            unimplemented!()
        }
        async fn wallet_positions(&self, _addr: &str) -> Result<Vec<common::ExchangePosition>> {
            Ok(vec![])
        }
        async fn trades_for_order(&self, _exchange_order_id: &str) -> Result<Vec<common::TradeRecord>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn rejects_when_portfolio_unknown() {
        let db = test_db().await;
        let (signal_tx, signal_rx) = mpsc::channel(8);
        let (_exit_tx, exit_rx) = mpsc::channel(8);
        let (order_tx, mut order_rx) = mpsc::channel(8);
        let (approved_signal_tx, _approved_signal_rx) = mpsc::channel(8);
        let (risk_event_tx, mut risk_event_rx) = mpsc::channel(8);
        let kill = make_kill(db.clone()).await;
        let portfolio = Arc::new(RwLock::new(None));
        let positions = Arc::new(RwLock::new(Vec::new()));

        let manager = RiskManager::new(
            RiskConfig::default(),
            db,
            signal_rx,
            exit_rx,
            order_tx,
            approved_signal_tx,
            risk_event_tx,
            kill,
            portfolio,
            positions,
        );
        tokio::spawn(manager.run());

        signal_tx.send(make_signal(10.0)).await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), risk_event_rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");

        assert!(matches!(
            event,
            common::RiskEvent::SignalRejected {
                reason: common::RejectionReason::BalanceUnknown,
                ..
            }
        ));
        assert!(order_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn approves_signal_with_fresh_portfolio() {
        let db = test_db().await;
        let (signal_tx, signal_rx) = mpsc::channel(8);
        let (_exit_tx, exit_rx) = mpsc::channel(8);
        let (order_tx, mut order_rx) = mpsc::channel(8);
        let (approved_signal_tx, _approved_signal_rx) = mpsc::channel(8);
        let (risk_event_tx, _risk_event_rx) = mpsc::channel(8);
        let kill = make_kill(db.clone()).await;
        let portfolio = Arc::new(RwLock::new(Some(PortfolioSnapshot {
            cash_usd: 1_000.0,
            positions_value_usd: 0.0,
            total_usd: 1_000.0,
            unrealized_pnl_usd: 0.0,
            realized_pnl_today_usd: 0.0,
            as_of: chrono::Utc::now(),
        })));
        let positions = Arc::new(RwLock::new(Vec::new()));

        let manager = RiskManager::new(
            RiskConfig::default(),
            db,
            signal_rx,
            exit_rx,
            order_tx,
            approved_signal_tx,
            risk_event_tx,
            kill,
            portfolio,
            positions,
        );
        tokio::spawn(manager.run());

        signal_tx.send(make_signal(10.0)).await.unwrap();

        let order = tokio::time::timeout(std::time::Duration::from_secs(1), order_rx.recv())
            .await
            .expect("timeout")
            .expect("no order produced");
        assert_eq!(order.market_id, "market-1");
    }

    #[tokio::test]
    async fn exit_signal_bypasses_queue_priority() {
        let db = test_db().await;
        let (_signal_tx, signal_rx) = mpsc::channel(8);
        let (exit_tx, exit_rx) = mpsc::channel(8);
        let (order_tx, mut order_rx) = mpsc::channel(8);
        let (approved_signal_tx, _approved_signal_rx) = mpsc::channel(8);
        let (risk_event_tx, _risk_event_rx) = mpsc::channel(8);
        let kill = make_kill(db.clone()).await;
        let portfolio = Arc::new(RwLock::new(Some(PortfolioSnapshot {
            cash_usd: 1_000.0,
            positions_value_usd: 0.0,
            total_usd: 1_000.0,
            unrealized_pnl_usd: 0.0,
            realized_pnl_today_usd: 0.0,
            as_of: chrono::Utc::now(),
        })));
        let positions = Arc::new(RwLock::new(Vec::new()));

        let manager = RiskManager::new(
            RiskConfig::default(),
            db,
            signal_rx,
            exit_rx,
            order_tx,
            approved_signal_tx,
            risk_event_tx,
            kill,
            portfolio,
            positions,
        );
        tokio::spawn(manager.run());

        let exit = Signal::exit(
            StrategyKind::Copy,
            "market-1",
            "token-yes",
            OrderSide::Sell,
            999_999.0,
            0.5,
            OrderType::Gtc,
            "stop loss",
            uuid::Uuid::new_v4(),
        );
        exit_tx.send(exit).await.unwrap();

        let order = tokio::time::timeout(std::time::Duration::from_secs(1), order_rx.recv())
            .await
            .expect("timeout")
            .expect("no order produced");
        assert_eq!(order.side, OrderSide::Sell);
    }
}
