use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{OrderSide, OrderType, Outcome, Result};

/// Parameters for a new order, already sized in shares. The Order Manager
/// is the only caller that constructs one of these — it is where USD
/// notional from a `Signal` gets converted to shares.
#[derive(Debug, Clone)]
pub struct OrderArgs {
    pub market_id: String,
    pub token_id: String,
    pub side: OrderSide,
    pub size_shares: f64,
    pub price: f64,
    pub order_type: OrderType,
}

/// Exchange's immediate acknowledgement of an order submission. Does not
/// imply a fill — `status` may still be "live" for a GTC limit order.
///
/// `trade_id` is the exchange's own identifier for the fill reported inline
/// with this acknowledgement, if any. It is `None` for an order that rests
/// unfilled (a GTC placed away from the touch) — the fill, and its trade
/// id, arrive later via `trades_for_order`.
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub exchange_order_id: String,
    pub status: String,
    pub filled_shares: f64,
    pub avg_fill_price: f64,
    pub fee_paid: f64,
    pub trade_id: Option<String>,
}

/// One fill against a previously placed order, as reported by the
/// exchange's trade history. `trade_id` is the exchange-assigned identifier
/// used as the primary key for fill storage, so a redelivered poll result
/// never double-records the same fill.
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub trade_id: String,
    pub price: f64,
    pub shares: f64,
    pub fee: f64,
}

/// One resting order as reported by the exchange's open-orders endpoint.
#[derive(Debug, Clone)]
pub struct ExchangeOrder {
    pub exchange_order_id: String,
    pub market_id: String,
    pub token_id: String,
    pub side: OrderSide,
    pub price: f64,
    pub remaining_shares: f64,
}

/// One held position as reported by the exchange or derived from a
/// wallet's on-chain token balances (used by the copy-trading strategy).
#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub market_id: String,
    pub token_id: String,
    pub outcome: Outcome,
    pub shares: f64,
    pub avg_price: f64,
}

#[derive(Debug, Clone)]
pub struct OrderBookLevel {
    pub price: f64,
    pub size: f64,
}

/// Top-of-book snapshot for one token, used by the arbitrage and stink-bid
/// strategies to compute executable prices.
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub token_id: String,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub as_of: DateTime<Utc>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    /// Midpoint of the top-of-book spread, the reference price for pricing
    /// a resting bid at a discount. `None` if either side is empty.
    pub fn mid_price(&self) -> Option<f64> {
        Some((self.best_bid()? + self.best_ask()?) / 2.0)
    }
}

/// Static market metadata: the two outcome tokens, whether the market is
/// still accepting orders, and its resolution status once settled.
#[derive(Debug, Clone)]
pub struct MarketInfo {
    pub market_id: String,
    pub question: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub active: bool,
    pub closed: bool,
    pub resolved: bool,
    pub winning_outcome: Option<Outcome>,
}

impl MarketInfo {
    /// Resolve a token ID to its outcome string for this market. Never
    /// infer outcome from array position — always compare against the
    /// market's own token IDs.
    pub fn outcome_of(&self, token_id: &str) -> Option<Outcome> {
        if token_id == self.yes_token_id {
            Some(Outcome::Yes)
        } else if token_id == self.no_token_id {
            Some(Outcome::No)
        } else {
            None
        }
    }
}

/// Abstraction over the exchange connection.
///
/// `ClobClient` implements this for live trading against the CLOB.
/// `PaperClient` implements this for simulation.
///
/// Only the Order Manager in `crates/engine` should hold a reference to a
/// `dyn ExchangeClient`. All order flow must go through the Risk Gate
/// before reaching it.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Submit an order and return the exchange's immediate acknowledgement.
    async fn place(&self, args: &OrderArgs) -> Result<PlacedOrder>;

    /// Cancel a single resting order.
    async fn cancel(&self, exchange_order_id: &str) -> Result<()>;

    /// Cancel all resting orders, optionally scoped to one market.
    async fn cancel_all(&self, market_id: Option<&str>) -> Result<()>;

    /// List this account's resting orders.
    async fn open_orders(&self) -> Result<Vec<ExchangeOrder>>;

    /// List this account's held positions.
    async fn positions(&self) -> Result<Vec<ExchangePosition>>;

    /// Available USDC collateral, read fresh by the portfolio snapshotter
    /// task on each refresh cycle.
    async fn balance_usd(&self) -> Result<f64>;

    /// Latest traded price for a token.
    async fn price(&self, token_id: &str) -> Result<f64>;

    /// Top-of-book snapshot for a token.
    async fn orderbook(&self, token_id: &str) -> Result<OrderBook>;

    /// Static metadata for a market.
    async fn market(&self, market_id: &str) -> Result<MarketInfo>;

    /// Token holdings of an arbitrary wallet address, used by the
    /// copy-trading strategy to diff a tracked wallet's positions.
    async fn wallet_positions(&self, addr: &str) -> Result<Vec<ExchangePosition>>;

    /// Fills recorded against a resting order since it was placed. Polled by
    /// the Order Manager while an order is still open so a GTC bid's fill
    /// gets the exchange's own trade id rather than one minted locally.
    async fn trades_for_order(&self, exchange_order_id: &str) -> Result<Vec<TradeRecord>>;
}
