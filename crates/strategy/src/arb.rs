use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::{ExchangeClient, OrderArgs, OrderSide, OrderType, Signal, StrategyKind};

use crate::config::ArbConfig;
use crate::Strategy;

/// Parity-arbitrage scanner. A binary market's YES and NO asks should sum to
/// (roughly) 1.0 before fees; when the combined cost undercuts `1 - margin`
/// it buys both legs and locks in the spread regardless of resolution.
///
/// The two legs are executed directly against the exchange client, bypassing
/// the Risk Gate/Order Manager pipeline entirely for leg 2 and any unwind —
/// once leg 1 has cleared risk, the pair trade is an atomic protocol owned
/// by this strategy alone; routing leg 2 back through the signal queue
/// could leave leg 1 filled with no guaranteed leg 2 execution.
pub struct ArbStrategy {
    client: Arc<dyn ExchangeClient>,
    config: ArbConfig,
}

impl ArbStrategy {
    pub fn new(client: Arc<dyn ExchangeClient>, config: ArbConfig) -> Self {
        Self { client, config }
    }

    async fn scan_market(&self, market_id: &str, signal_tx: &mpsc::Sender<Signal>) {
        let market = match self.client.market(market_id).await {
            Ok(m) => m,
            Err(e) => {
                warn!(market_id, error = %e, "failed to fetch market info for arb scan");
                return;
            }
        };

        if !market.active || market.closed {
            return;
        }

        let (yes_book, no_book) = tokio::join!(
            self.client.orderbook(&market.yes_token_id),
            self.client.orderbook(&market.no_token_id),
        );

        let (yes_book, no_book) = match (yes_book, no_book) {
            (Ok(y), Ok(n)) => (y, n),
            _ => {
                debug!(market_id, "orderbook fetch failed for one or both legs");
                return;
            }
        };

        let (Some(yes_ask), Some(no_ask)) = (yes_book.best_ask(), no_book.best_ask()) else {
            return;
        };

        let fee_yes = yes_ask * self.config.taker_fee_rate;
        let fee_no = no_ask * self.config.taker_fee_rate;
        let total_cost = yes_ask + no_ask + fee_yes + fee_no;
        let breakeven = 1.0 - self.config.margin;

        if total_cost >= breakeven {
            return;
        }

        info!(
            market_id,
            total_cost, breakeven, "arbitrage opportunity detected, executing both legs"
        );

        self.execute_pair(&market.market_id, &market.yes_token_id, yes_ask, &market.no_token_id, no_ask, signal_tx)
            .await;
    }

    async fn execute_pair(
        &self,
        market_id: &str,
        yes_token_id: &str,
        yes_ask: f64,
        no_token_id: &str,
        no_ask: f64,
        signal_tx: &mpsc::Sender<Signal>,
    ) {
        let leg_shares = self.config.leg_size_usd / yes_ask.max(1e-9);

        let leg1 = OrderArgs {
            market_id: market_id.to_string(),
            token_id: yes_token_id.to_string(),
            side: OrderSide::Buy,
            size_shares: leg_shares,
            price: yes_ask,
            order_type: OrderType::Fok,
        };

        let leg1_result = match self.client.place(&leg1).await {
            Ok(r) => r,
            Err(e) => {
                warn!(market_id, error = %e, "arb leg 1 failed, aborting pair");
                return;
            }
        };

        if leg1_result.filled_shares <= 0.0 {
            warn!(market_id, "arb leg 1 did not fill, aborting pair");
            return;
        }

        let leg2_shares = leg1_result.filled_shares;
        let leg2 = OrderArgs {
            market_id: market_id.to_string(),
            token_id: no_token_id.to_string(),
            side: OrderSide::Buy,
            size_shares: leg2_shares,
            price: no_ask,
            order_type: OrderType::Fok,
        };

        match self.client.place(&leg2).await {
            Ok(leg2_result) if (leg2_result.filled_shares - leg2_shares).abs() < 1e-6 => {
                info!(market_id, "arb pair fully filled, reporting as exit-exempt locked position");
                let arb_id = Uuid::new_v4();
                let mut signal = Signal::entry(
                    StrategyKind::Arb,
                    market_id.to_string(),
                    yes_token_id.to_string(),
                    OrderSide::Buy,
                    leg1_result.filled_shares * leg1_result.avg_fill_price,
                    leg1_result.avg_fill_price,
                    OrderType::Fok,
                    "arb leg 1 (YES) already filled, locking pair for bookkeeping",
                );
                signal.metadata.arb_leg_of = Some(arb_id);
                let _ = signal_tx.send(signal).await;
            }
            Ok(leg2_result) => {
                warn!(
                    market_id,
                    filled = leg2_result.filled_shares,
                    wanted = leg2_shares,
                    "arb leg 2 partially filled, unwinding leg 1"
                );
                self.unwind_leg1(market_id, yes_token_id, leg1_result.filled_shares - leg2_result.filled_shares)
                    .await;
            }
            Err(e) => {
                warn!(market_id, error = %e, "arb leg 2 failed entirely, unwinding leg 1");
                self.unwind_leg1(market_id, yes_token_id, leg1_result.filled_shares).await;
            }
        }
    }

    /// Sells back the unmatched portion of leg 1. Retried until confirmed —
    /// a stuck unwind leaves a naked directional position outside the
    /// arbitrage's risk model.
    async fn unwind_leg1(&self, market_id: &str, yes_token_id: &str, shares: f64) {
        if shares <= 0.0 {
            return;
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let price = match self.client.price(yes_token_id).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(market_id, attempt, error = %e, "unwind: failed to fetch price, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let unwind = OrderArgs {
                market_id: market_id.to_string(),
                token_id: yes_token_id.to_string(),
                side: OrderSide::Sell,
                size_shares: shares,
                price,
                order_type: OrderType::Fok,
            };

            match self.client.place(&unwind).await {
                Ok(r) if r.filled_shares > 0.0 => {
                    info!(market_id, attempt, "unwind confirmed");
                    return;
                }
                Ok(_) => {
                    warn!(market_id, attempt, "unwind order placed but unfilled, retrying");
                }
                Err(e) => {
                    warn!(market_id, attempt, error = %e, "unwind attempt failed, retrying");
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

#[async_trait]
impl Strategy for ArbStrategy {
    fn name(&self) -> &'static str {
        "arb"
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Arb
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval_secs)
    }

    async fn tick(&mut self, signal_tx: &mpsc::Sender<Signal>) {
        let markets = self.config.markets.clone();
        for market_id in &markets {
            self.scan_market(market_id, signal_tx).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::MarketInfo;
    use paper::PaperClient;

    fn config() -> ArbConfig {
        ArbConfig {
            enabled: true,
            poll_interval_secs: 10,
            margin: 0.05,
            taker_fee_rate: 0.0,
            markets: vec!["m1".to_string()],
            leg_size_usd: 50.0,
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
        client
    }

    #[tokio::test]
    async fn executes_both_legs_when_combined_ask_undercuts_breakeven() {
        let client = seeded_client().await;
        client.update_price("yes", 0.40).await;
        client.update_price("no", 0.50).await;

        let mut strategy = ArbStrategy::new(client, config());
        let (tx, mut rx) = mpsc::channel(8);
        strategy.tick(&tx).await;

        let signal = rx.try_recv().expect("arb opportunity should emit a signal");
        assert_eq!(signal.market_id, "m1");
        assert_eq!(signal.strategy, StrategyKind::Arb);
    }

    #[tokio::test]
    async fn skips_market_priced_above_breakeven() {
        let client = seeded_client().await;
        client.update_price("yes", 0.55).await;
        client.update_price("no", 0.55).await;

        let mut strategy = ArbStrategy::new(client, config());
        let (tx, mut rx) = mpsc::channel(8);
        strategy.tick(&tx).await;

        assert!(rx.try_recv().is_err());
    }
}
