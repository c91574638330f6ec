use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use common::{ExchangeClient, OrderArgs, OrderSide, OrderType, Signal, StinkOrder, StrategyKind};

use crate::config::StinkConfig;
use crate::Strategy;

/// Deep-discount resting bid placer. Keeps at most one GTC bid open per
/// configured market, priced at a fixed discount below the best bid, and
/// reconciles its bookkeeping against the exchange's own open-orders list
/// so a bid filled or cancelled out-of-band is noticed on the next tick.
pub struct StinkStrategy {
    client: Arc<dyn ExchangeClient>,
    db: SqlitePool,
    config: StinkConfig,
}

impl StinkStrategy {
    pub fn new(client: Arc<dyn ExchangeClient>, db: SqlitePool, config: StinkConfig) -> Self {
        Self { client, db, config }
    }

    async fn reconcile_market(&self, market_id: &str, signal_tx: &mpsc::Sender<Signal>) {
        let market = match self.client.market(market_id).await {
            Ok(m) => m,
            Err(e) => {
                warn!(market_id, error = %e, "failed to fetch market info for stink reconcile");
                return;
            }
        };

        if !market.active || market.closed {
            return;
        }

        let resting = match common::store::stink_order(&self.db, market_id, &market.yes_token_id).await {
            Ok(r) => r,
            Err(e) => {
                warn!(market_id, error = %e, "failed to read stink order record");
                return;
            }
        };

        let open_orders = match self.client.open_orders().await {
            Ok(o) => o,
            Err(e) => {
                warn!(market_id, error = %e, "failed to list open orders for stink reconcile");
                return;
            }
        };

        if let Some(record) = &resting {
            let still_open = open_orders
                .iter()
                .any(|o| o.exchange_order_id == record.exchange_order_id);

            if still_open {
                debug!(market_id, "stink bid still resting, nothing to do");
                return;
            }

            info!(market_id, "stink bid no longer resting, clearing record");
            if let Err(e) = common::store::delete_stink_order(&self.db, market_id, &market.yes_token_id).await {
                warn!(market_id, error = %e, "failed to clear filled/cancelled stink order record");
            }
        }

        if let Err(e) = self.place_new_bid(&market, signal_tx).await {
            warn!(market_id, error = %e, "failed to place new stink bid");
        }
    }

    async fn place_new_bid(
        &self,
        market: &common::MarketInfo,
        signal_tx: &mpsc::Sender<Signal>,
    ) -> common::Result<()> {
        let allocated = common::store::total_stink_notional(&self.db).await?;
        let portfolio_usd: f64 = self
            .client
            .positions()
            .await
            .map(|ps| ps.iter().map(|p| p.shares * p.avg_price).sum())
            .unwrap_or(0.0);
        let cap = portfolio_usd * self.config.allocation_cap_pct;
        if cap > 0.0 && allocated + self.config.size_usd > cap {
            debug!(market_id = %market.market_id, allocated, cap, "stink allocation cap reached, skipping");
            return Ok(());
        }

        let book = self.client.orderbook(&market.yes_token_id).await?;
        let Some(mid_price) = book.mid_price() else {
            return Ok(());
        };

        let bid_price = (mid_price * (1.0 - self.config.discount)).clamp(0.001, 0.999);
        let size_shares = self.config.size_usd / bid_price.max(1e-9);

        let args = OrderArgs {
            market_id: market.market_id.clone(),
            token_id: market.yes_token_id.clone(),
            side: OrderSide::Buy,
            size_shares,
            price: bid_price,
            order_type: OrderType::Gtc,
        };

        let placed = self.client.place(&args).await?;

        let record = StinkOrder {
            market_id: market.market_id.clone(),
            token_id: market.yes_token_id.clone(),
            exchange_order_id: placed.exchange_order_id,
            price: bid_price,
            size_usd: self.config.size_usd,
            placed_at: chrono::Utc::now(),
        };
        common::store::upsert_stink_order(&self.db, &record).await?;

        info!(market_id = %market.market_id, bid_price, "placed new stink bid");

        if placed.filled_shares > 0.0 {
            let signal = Signal::entry(
                StrategyKind::Stink,
                market.market_id.clone(),
                market.yes_token_id.clone(),
                OrderSide::Buy,
                placed.filled_shares * placed.avg_fill_price,
                placed.avg_fill_price,
                OrderType::Gtc,
                "stink bid filled immediately on placement",
            );
            let _ = signal_tx.send(signal).await;
        }

        Ok(())
    }
}

#[async_trait]
impl Strategy for StinkStrategy {
    fn name(&self) -> &'static str {
        "stink"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Stink
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval_secs)
    }

    async fn tick(&mut self, signal_tx: &mpsc::Sender<Signal>) {
        let markets = self.config.markets.clone();
        for market_id in &markets {
            self.reconcile_market(market_id, signal_tx).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::MarketInfo;
    use paper::PaperClient;
    use std::sync::Arc;

    async fn test_db() -> SqlitePool {
        let pool = common::store::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("../../migrations").run(&pool).await.unwrap();
        pool
    }

    fn config() -> StinkConfig {
        StinkConfig {
            enabled: true,
            poll_interval_secs: 300,
            discount: 0.20,
            size_usd: 25.0,
            allocation_cap_pct: 0.0, // disables the cap for this test
            markets: vec!["m1".to_string()],
        }
    }

    async fn seeded_client() -> Arc<PaperClient> {
        let client = Arc::new(PaperClient::new(10_000.0, 0.0));
        client
            .register_market(MarketInfo {
                market_id: "m1".to_string(),
                question: "will it happen".to_string(),
                yes_token_id: "yes".to_string(),
                no_token_id: "no".to_string(),
                active: true,
                closed: false,
                resolved: false,
                winning_outcome: None,
            })
            .await;
        client.update_price("yes", 0.50).await;
        client
    }

    #[tokio::test]
    async fn places_a_bid_below_the_mid_price_by_the_configured_discount() {
        let db = test_db().await;
        let client = seeded_client().await;

        let mut strategy = StinkStrategy::new(client.clone(), db.clone(), config());
        let (tx, mut rx) = mpsc::channel(8);
        strategy.tick(&tx).await;

        let record = common::store::stink_order(&db, "m1", "yes").await.unwrap();
        let record = record.expect("a stink bid should have been recorded");

        // PaperClient's synthetic book straddles the last price symmetrically,
        // so its mid price is the last price itself.
        let expected_mid = 0.50;
        let expected_price = (expected_mid * (1.0 - config().discount)).clamp(0.001, 0.999);
        assert!((record.price - expected_price).abs() < 1e-9);
    }

    #[tokio::test]
    async fn skips_placing_when_allocation_cap_is_reached() {
        let db = test_db().await;
        let client = seeded_client().await;

        // Seed an unrelated held position so the portfolio has nonzero value
        // for the allocation cap to be computed against.
        client
            .place(&OrderArgs {
                market_id: "m1".to_string(),
                token_id: "yes".to_string(),
                side: OrderSide::Buy,
                size_shares: 1_000.0,
                price: 0.0,
                order_type: OrderType::Gtc,
            })
            .await
            .unwrap();

        let mut cfg = config();
        cfg.allocation_cap_pct = 0.01; // cap well below size_usd given the seeded position value

        let mut strategy = StinkStrategy::new(client, db.clone(), cfg);
        let (tx, mut rx) = mpsc::channel(8);
        strategy.tick(&tx).await;

        assert!(common::store::stink_order(&db, "m1", "yes").await.unwrap().is_none());
        assert!(rx.try_recv().is_err());
    }
}
