use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use common::{
    ExchangeClient, OrderSide, OrderType, Position, Signal, StrategyKind, WhalePosition,
};

use crate::config::CopyConfig;
use crate::Strategy;

/// Whale-copy tracker. On each tick, diffs every tracked wallet's current
/// on-chain holdings against the last observed snapshot and emits entry or
/// exit signals for the delta.
pub struct CopyStrategy {
    client: Arc<dyn ExchangeClient>,
    db: SqlitePool,
    config: CopyConfig,
    open_positions: Arc<RwLock<Vec<Position>>>,
    portfolio_usd_hint: f64,
}

impl CopyStrategy {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        db: SqlitePool,
        config: CopyConfig,
        open_positions: Arc<RwLock<Vec<Position>>>,
    ) -> Self {
        Self {
            client,
            db,
            config,
            open_positions,
            portfolio_usd_hint: 0.0,
        }
    }

    async fn process_wallet(&mut self, wallet: &crate::config::TrackedWalletConfig, signal_tx: &mpsc::Sender<Signal>) {
        let positions = match self.client.wallet_positions(&wallet.addr).await {
            Ok(p) => p,
            Err(e) => {
                warn!(wallet = %wallet.name, error = %e, "failed to fetch wallet positions");
                return;
            }
        };

        for pos in positions {
            let usd_value = pos.shares * pos.avg_price;
            let snapshot = WhalePosition {
                wallet_addr: wallet.addr.clone(),
                market_id: pos.market_id.clone(),
                token_id: pos.token_id.clone(),
                shares: pos.shares,
                avg_price: pos.avg_price,
                last_seen_at: chrono::Utc::now(),
            };

            let previous = match common::store::upsert_whale_position(&self.db, &snapshot).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "failed to persist whale position snapshot");
                    continue;
                }
            };

            match previous {
                None => self.maybe_emit_entry(wallet, &pos, usd_value, signal_tx).await,
                Some(prev) if pos.shares > prev.shares * 1.01 => {
                    self.maybe_emit_entry(wallet, &pos, usd_value, signal_tx).await
                }
                Some(prev) if pos.shares < prev.shares * 0.99 => {
                    let reduced_fraction = 1.0 - (pos.shares / prev.shares).max(0.0);
                    self.maybe_emit_exit(wallet, &pos, reduced_fraction, signal_tx).await
                }
                Some(_) => {}
            }
        }
    }

    async fn maybe_emit_entry(
        &self,
        wallet: &crate::config::TrackedWalletConfig,
        pos: &common::ExchangePosition,
        usd_value: f64,
        signal_tx: &mpsc::Sender<Signal>,
    ) {
        if usd_value < self.config.conviction_usd {
            debug!(wallet = %wallet.name, usd_value, "below conviction threshold, skipping");
            return;
        }

        let current_price = match self.client.price(&pos.token_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to fetch current price for slippage guard");
                return;
            }
        };

        // Copying is a BUY: an adverse move is the price rising above the
        // whale's entry, making the copy more expensive than their fill.
        let adverse_move = (current_price - pos.avg_price) / pos.avg_price.max(1e-9);
        if adverse_move > self.config.slippage_pct {
            debug!(wallet = %wallet.name, adverse_move, "slippage guard tripped, skipping");
            return;
        }

        let size_usd = self
            .config
            .sizing
            .size_usd(usd_value, self.portfolio_usd_hint)
            .min(wallet.max_allocation_usd);

        let signal = Signal::entry(
            StrategyKind::Copy,
            pos.market_id.clone(),
            pos.token_id.clone(),
            OrderSide::Buy,
            size_usd,
            current_price,
            OrderType::Gtc,
            format!("copying {} new/increased holding", wallet.name),
        );

        let _ = signal_tx.send(signal).await;
    }

    async fn maybe_emit_exit(
        &self,
        wallet: &crate::config::TrackedWalletConfig,
        pos: &common::ExchangePosition,
        reduced_fraction: f64,
        signal_tx: &mpsc::Sender<Signal>,
    ) {
        let positions = self.open_positions.read().await;
        let Some(own_position) = positions
            .iter()
            .find(|p| p.market_id == pos.market_id && p.token_id == pos.token_id && p.strategy == StrategyKind::Copy)
        else {
            return;
        };

        let current_price = match self.client.price(&pos.token_id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to fetch current price for copy exit");
                return;
            }
        };

        let shares_to_close = own_position.shares * reduced_fraction.clamp(0.0, 1.0);
        if shares_to_close <= 0.0 {
            return;
        }

        let signal = Signal::exit(
            StrategyKind::Copy,
            own_position.market_id.clone(),
            own_position.token_id.clone(),
            OrderSide::Sell,
            shares_to_close * current_price,
            current_price,
            OrderType::Gtc,
            format!("{} reduced position, following", wallet.name),
            own_position.id,
        );

        let _ = signal_tx.send(signal).await;
    }
}

#[async_trait]
impl Strategy for CopyStrategy {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Copy
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval_secs)
    }

    async fn tick(&mut self, signal_tx: &mpsc::Sender<Signal>) {
        if let Some(snapshot) = self.client.positions().await.ok() {
            self.portfolio_usd_hint = snapshot.iter().map(|p| p.shares * p.avg_price).sum();
        }

        let wallets = self.config.wallets.clone();
        for wallet in wallets.iter().filter(|w| w.enabled) {
            self.process_wallet(wallet, signal_tx).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackedWalletConfig;
    use crate::config::SizingFactor;
    use paper::PaperClient;

    async fn test_db() -> SqlitePool {
        let pool = common::store::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("../../migrations").run(&pool).await.unwrap();
        pool
    }

    fn config() -> CopyConfig {
        CopyConfig {
            enabled: true,
            poll_interval_secs: 60,
            conviction_usd: 100.0,
            slippage_pct: 0.05,
            sizing: SizingFactor::FixedUsd { amount: 50.0 },
            wallets: vec![TrackedWalletConfig {
                addr: "0xabc".to_string(),
                name: "whale1".to_string(),
                max_allocation_usd: 1_000.0,
                enabled: true,
            }],
        }
    }

    async fn seeded_client() -> Arc<PaperClient> {
        let client = Arc::new(PaperClient::new(10_000.0, 0.0));
        client.update_price("yes", 0.50).await;
        client
            .seed_wallet_position(
                "0xabc",
                common::ExchangePosition {
                    market_id: "m1".to_string(),
                    token_id: "yes".to_string(),
                    outcome: common::Outcome::Yes,
                    shares: 1_000.0,
                    avg_price: 0.50,
                },
            )
            .await;
        client
    }

    #[tokio::test]
    async fn emits_entry_on_first_observed_holding() {
        let db = test_db().await;
        let client = seeded_client().await;
        let open_positions = Arc::new(RwLock::new(Vec::new()));

        let mut strategy = CopyStrategy::new(client, db, config(), open_positions);
        let (tx, mut rx) = mpsc::channel(8);
        strategy.tick(&tx).await;

        let signal = rx.try_recv().expect("new whale holding should emit an entry signal");
        assert_eq!(signal.market_id, "m1");
        assert_eq!(signal.strategy, StrategyKind::Copy);
        assert_eq!(signal.size_usd, 50.0);
    }

    #[tokio::test]
    async fn slippage_guard_skips_when_price_has_risen_above_whale_entry() {
        let db = test_db().await;
        let client = seeded_client().await;
        client.update_price("yes", 0.60).await; // 20% above the whale's 0.50 entry, adverse for a buy copier
        let open_positions = Arc::new(RwLock::new(Vec::new()));

        let mut strategy = CopyStrategy::new(client, db, config(), open_positions);
        let (tx, mut rx) = mpsc::channel(8);
        strategy.tick(&tx).await;

        assert!(rx.try_recv().is_err(), "adverse price move should trip the guard");
    }

    #[tokio::test]
    async fn slippage_guard_allows_favorable_price_drop() {
        let db = test_db().await;
        let client = seeded_client().await;
        client.update_price("yes", 0.40).await; // below the whale's entry, favorable for a buy copier
        let open_positions = Arc::new(RwLock::new(Vec::new()));

        let mut strategy = CopyStrategy::new(client, db, config(), open_positions);
        let (tx, mut rx) = mpsc::channel(8);
        strategy.tick(&tx).await;

        rx.try_recv().expect("favorable price drop should not trip the guard");
    }

    #[tokio::test]
    async fn does_not_re_emit_for_an_unchanged_holding() {
        let db = test_db().await;
        let client = seeded_client().await;
        let open_positions = Arc::new(RwLock::new(Vec::new()));

        let mut strategy = CopyStrategy::new(client, db, config(), open_positions);
        let (tx, mut rx) = mpsc::channel(8);
        strategy.tick(&tx).await;
        rx.try_recv().expect("first tick should emit an entry signal");

        strategy.tick(&tx).await;
        assert!(rx.try_recv().is_err());
    }
}
