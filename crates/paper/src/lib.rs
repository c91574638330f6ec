use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use common::{
    Error, ExchangeClient, ExchangeOrder, ExchangePosition, MarketInfo, OrderArgs, OrderBook,
    OrderBookLevel, OrderSide, PlacedOrder, Result, TradeRecord,
};

/// Fee rate applied to every simulated fill, matching the live CLOB's
/// taker fee so paper P&L is a realistic estimate of live performance.
const PAPER_FEE_RATE: f64 = 0.02;

/// Synthetic half-spread used to derive a simulated orderbook around the
/// last known price.
const PAPER_SPREAD_PCT: f64 = 0.01;

/// Simulated exchange client for paper trading.
///
/// Every order fills immediately at the latest known price plus
/// configurable slippage — there is no resting-order book to match
/// against. No real orders are ever sent to the exchange.
pub struct PaperClient {
    balance_usd: Arc<RwLock<f64>>,
    positions: Arc<RwLock<Vec<ExchangePosition>>>,
    prices: Arc<RwLock<HashMap<String, f64>>>,
    markets: Arc<RwLock<HashMap<String, MarketInfo>>>,
    wallet_positions: Arc<RwLock<HashMap<String, Vec<ExchangePosition>>>>,
    slippage_bps: f64,
    next_order_id: Arc<RwLock<u64>>,
    next_trade_id: Arc<RwLock<u64>>,
}

impl PaperClient {
    pub fn new(initial_balance_usd: f64, slippage_bps: f64) -> Self {
        info!(
            balance = initial_balance_usd,
            slippage_bps, "PaperClient initialized"
        );
        Self {
            balance_usd: Arc::new(RwLock::new(initial_balance_usd)),
            positions: Arc::new(RwLock::new(Vec::new())),
            prices: Arc::new(RwLock::new(HashMap::new())),
            markets: Arc::new(RwLock::new(HashMap::new())),
            wallet_positions: Arc::new(RwLock::new(HashMap::new())),
            slippage_bps,
            next_order_id: Arc::new(RwLock::new(0)),
            next_trade_id: Arc::new(RwLock::new(0)),
        }
    }

    /// Update the latest simulated price for a token (called by the price
    /// stream consumer driving the paper engine).
    pub async fn update_price(&self, token_id: &str, price: f64) {
        self.prices.write().await.insert(token_id.to_string(), price);
    }

    /// Registers static market metadata so `market()` has something to
    /// return. In live trading this comes from the exchange; in paper
    /// mode the caller seeds it once at startup per tracked market.
    pub async fn register_market(&self, market: MarketInfo) {
        self.markets.write().await.insert(market.market_id.clone(), market);
    }

    /// Seeds a simulated wallet's holdings, for exercising the copy-trading
    /// strategy against paper mode without a real on-chain lookup.
    pub async fn seed_wallet_position(&self, addr: &str, position: ExchangePosition) {
        self.wallet_positions
            .write()
            .await
            .entry(addr.to_string())
            .or_default()
            .push(position);
    }

    /// Expose open positions (for the dashboard API and auditing).
    pub fn positions_handle(&self) -> Arc<RwLock<Vec<ExchangePosition>>> {
        self.positions.clone()
    }

    pub async fn balance_usd(&self) -> f64 {
        *self.balance_usd.read().await
    }

    async fn next_order_id(&self) -> String {
        let mut n = self.next_order_id.write().await;
        *n += 1;
        format!("paper-{n}")
    }

    async fn next_trade_id(&self) -> String {
        let mut n = self.next_trade_id.write().await;
        *n += 1;
        format!("paper-trade-{n}")
    }
}

#[async_trait]
impl ExchangeClient for PaperClient {
    async fn place(&self, args: &OrderArgs) -> Result<PlacedOrder> {
        let mid_price = self.prices.read().await.get(&args.token_id).copied().ok_or_else(|| {
            Error::Exchange(format!(
                "PaperClient has no price for token '{}'. Ensure the price stream is flowing.",
                args.token_id
            ))
        })?;

        let fill_price = match args.side {
            OrderSide::Buy => mid_price * (1.0 + self.slippage_bps / 10_000.0),
            OrderSide::Sell => mid_price * (1.0 - self.slippage_bps / 10_000.0),
        };
        let notional = fill_price * args.size_shares;
        let fee = notional * PAPER_FEE_RATE;

        debug!(
            market_id = %args.market_id,
            token_id = %args.token_id,
            side = %args.side,
            mid = mid_price,
            fill = fill_price,
            shares = args.size_shares,
            "paper fill simulated"
        );

        {
            let mut balance = self.balance_usd.write().await;
            match args.side {
                OrderSide::Buy => *balance -= notional + fee,
                OrderSide::Sell => *balance += notional - fee,
            }
        }

        let mut positions = self.positions.write().await;
        match args.side {
            OrderSide::Buy => match positions.iter_mut().find(|p| p.token_id == args.token_id) {
                Some(existing) => {
                    let total_shares = existing.shares + args.size_shares;
                    existing.avg_price = (existing.avg_price * existing.shares
                        + fill_price * args.size_shares)
                        / total_shares.max(1e-9);
                    existing.shares = total_shares;
                }
                None => positions.push(ExchangePosition {
                    market_id: args.market_id.clone(),
                    token_id: args.token_id.clone(),
                    outcome: common::Outcome::Yes,
                    shares: args.size_shares,
                    avg_price: fill_price,
                }),
            },
            OrderSide::Sell => {
                if let Some(idx) = positions.iter().position(|p| p.token_id == args.token_id) {
                    positions[idx].shares -= args.size_shares;
                    if positions[idx].shares <= 1e-9 {
                        positions.remove(idx);
                    }
                }
            }
        }

        Ok(PlacedOrder {
            exchange_order_id: self.next_order_id().await,
            status: "filled".to_string(),
            filled_shares: args.size_shares,
            avg_fill_price: fill_price,
            fee_paid: fee,
            trade_id: Some(self.next_trade_id().await),
        })
    }

    async fn cancel(&self, _exchange_order_id: &str) -> Result<()> {
        // Nothing ever rests in paper mode; cancel is always a no-op success.
        Ok(())
    }

    async fn cancel_all(&self, _market_id: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn open_orders(&self) -> Result<Vec<ExchangeOrder>> {
        Ok(Vec::new())
    }

    async fn positions(&self) -> Result<Vec<ExchangePosition>> {
        Ok(self.positions.read().await.clone())
    }

    async fn balance_usd(&self) -> Result<f64> {
        Ok(*self.balance_usd.read().await)
    }

    async fn price(&self, token_id: &str) -> Result<f64> {
        self.prices
            .read()
            .await
            .get(token_id)
            .copied()
            .ok_or_else(|| Error::Exchange(format!("no simulated price available for {token_id}")))
    }

    async fn orderbook(&self, token_id: &str) -> Result<OrderBook> {
        let mid = self.price(token_id).await?;
        let half_spread = mid * PAPER_SPREAD_PCT;
        Ok(OrderBook {
            token_id: token_id.to_string(),
            bids: vec![OrderBookLevel {
                price: (mid - half_spread).max(0.001),
                size: 1_000.0,
            }],
            asks: vec![OrderBookLevel {
                price: (mid + half_spread).min(0.999),
                size: 1_000.0,
            }],
            as_of: Utc::now(),
        })
    }

    async fn market(&self, market_id: &str) -> Result<MarketInfo> {
        self.markets.read().await.get(market_id).cloned().ok_or_else(|| {
            Error::Exchange(format!("PaperClient has no market registered for '{market_id}'"))
        })
    }

    async fn wallet_positions(&self, addr: &str) -> Result<Vec<ExchangePosition>> {
        Ok(self.wallet_positions.read().await.get(addr).cloned().unwrap_or_default())
    }

    async fn trades_for_order(&self, _exchange_order_id: &str) -> Result<Vec<TradeRecord>> {
        // Paper fills resolve synchronously inside `place`; there is never a
        // later fill to poll for.
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::OrderType;

    fn args(token_id: &str, side: OrderSide, shares: f64) -> OrderArgs {
        OrderArgs {
            market_id: "market-1".into(),
            token_id: token_id.into(),
            side,
            size_shares: shares,
            price: 0.0,
            order_type: OrderType::Fok,
        }
    }

    #[tokio::test]
    async fn buy_fill_applies_positive_slippage() {
        let client = PaperClient::new(10_000.0, 10.0); // 10 bps
        client.update_price("token-yes", 0.5).await;

        let placed = client.place(&args("token-yes", OrderSide::Buy, 100.0)).await.unwrap();

        let expected = 0.5 * (1.0 + 10.0 / 10_000.0);
        assert!((placed.avg_fill_price - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sell_fill_applies_negative_slippage() {
        let client = PaperClient::new(10_000.0, 10.0);
        client.update_price("token-yes", 0.5).await;

        client.place(&args("token-yes", OrderSide::Buy, 100.0)).await.unwrap();
        let placed = client.place(&args("token-yes", OrderSide::Sell, 100.0)).await.unwrap();

        let expected = 0.5 * (1.0 - 10.0 / 10_000.0);
        assert!((placed.avg_fill_price - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn position_recorded_after_buy() {
        let client = PaperClient::new(10_000.0, 0.0);
        client.update_price("token-yes", 0.5).await;

        client.place(&args("token-yes", OrderSide::Buy, 50.0)).await.unwrap();

        let positions = client.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].token_id, "token-yes");
        assert_eq!(positions[0].shares, 50.0);
    }

    #[tokio::test]
    async fn position_removed_after_full_sell() {
        let client = PaperClient::new(10_000.0, 0.0);
        client.update_price("token-yes", 0.5).await;

        client.place(&args("token-yes", OrderSide::Buy, 50.0)).await.unwrap();
        client.place(&args("token-yes", OrderSide::Sell, 50.0)).await.unwrap();

        let positions = client.positions().await.unwrap();
        assert!(positions.is_empty());
    }

    #[tokio::test]
    async fn repeated_buys_average_the_entry_price() {
        let client = PaperClient::new(10_000.0, 0.0);
        client.update_price("token-yes", 0.4).await;
        client.place(&args("token-yes", OrderSide::Buy, 100.0)).await.unwrap();

        client.update_price("token-yes", 0.6).await;
        client.place(&args("token-yes", OrderSide::Buy, 100.0)).await.unwrap();

        let positions = client.positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].avg_price - 0.5).abs() < 1e-9);
        assert_eq!(positions[0].shares, 200.0);
    }

    #[tokio::test]
    async fn place_without_a_known_price_fails() {
        let client = PaperClient::new(10_000.0, 0.0);
        let result = client.place(&args("token-unknown", OrderSide::Buy, 10.0)).await;
        assert!(result.is_err());
    }
}
