use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use common::{ExchangeClient, Order, OrderArgs, OrderStatus, Outcome, RiskEvent, Signal};

/// Minimum shares a submitted order may size down to. Below this the
/// exchange's own tick/lot rules would reject it outright; rejecting here
/// avoids burning a round trip and a rate-limit slot on a doomed order.
const MIN_SHARES: f64 = 5.0;

/// Maximum fractional move between a signal's reference price and the live
/// price fetched immediately before submission. Above this, the reference
/// price the strategy reasoned about is considered stale and the order is
/// rejected rather than sized against a price nobody evaluated the signal
/// against.
const MAX_PRICE_DRIFT_PCT: f64 = 0.03;

/// Receives approved orders from the Risk Manager and submits them to the
/// exchange. This is the ONLY component that calls `ExchangeClient::place`,
/// and the only one that converts a signal's USD notional into shares —
/// always against a live price fetched right before submission, never the
/// signal's own (possibly stale) reference price.
///
/// On a non-terminal acknowledgement (a resting GTC order), polls
/// `open_orders` until the order reaches a terminal status or is no longer
/// reported as resting, at which point it is treated as filled/cancelled.
pub struct OrderManager {
    order_rx: mpsc::Receiver<Order>,
    risk_event_tx: mpsc::Sender<RiskEvent>,
    position_tx: mpsc::Sender<PositionFill>,
    client: Arc<dyn ExchangeClient>,
    db: SqlitePool,
    poll_interval: Duration,
}

/// What the Order Manager reports back to the Position Manager once an
/// order is confirmed filled, so it can open or adjust a `Position`.
#[derive(Debug, Clone)]
pub struct PositionFill {
    pub order: Order,
    pub signal: SignalSummary,
}

/// The fields of the originating `Signal` the Position Manager needs but
/// that don't live on `Order` itself.
#[derive(Debug, Clone)]
pub struct SignalSummary {
    pub strategy: common::StrategyKind,
    pub outcome: common::Outcome,
    pub is_exit: bool,
    pub parent_position_id: Option<uuid::Uuid>,
}

impl OrderManager {
    pub fn new(
        order_rx: mpsc::Receiver<Order>,
        risk_event_tx: mpsc::Sender<RiskEvent>,
        position_tx: mpsc::Sender<PositionFill>,
        client: Arc<dyn ExchangeClient>,
        db: SqlitePool,
    ) -> Self {
        Self {
            order_rx,
            risk_event_tx,
            position_tx,
            client,
            db,
            poll_interval: Duration::from_secs(2),
        }
    }

    /// Run the order manager loop. Call from `tokio::spawn`.
    ///
    /// Orders and their originating signals arrive on separate channels, so
    /// an order can overtake its own signal. `pending_orders` holds any
    /// order whose signal hasn't shown up yet rather than processing it
    /// without one — share conversion below has no size_usd to convert
    /// without the signal, so an order must never proceed without it.
    pub async fn run(mut self, mut signals: mpsc::Receiver<Signal>) {
        info!("OrderManager running");
        let mut pending_signals: std::collections::HashMap<uuid::Uuid, Signal> =
            std::collections::HashMap::new();
        let mut pending_orders: Vec<Order> = Vec::new();

        loop {
            tokio::select! {
                biased;

                signal = signals.recv() => match signal {
                    Some(sig) => {
                        if let Some(idx) = pending_orders.iter().position(|o| o.signal_id == sig.id) {
                            let order = pending_orders.remove(idx);
                            self.handle_order(order, sig).await;
                        } else {
                            pending_signals.insert(sig.id, sig);
                        }
                    }
                    None => {}
                },
                order = self.order_rx.recv() => match order {
                    Some(order) => {
                        match pending_signals.remove(&order.signal_id) {
                            Some(sig) => self.handle_order(order, sig).await,
                            None => {
                                warn!(order_id = %order.id, "order arrived before its signal, queuing");
                                pending_orders.push(order);
                            }
                        }
                    }
                    None => {
                        warn!("OrderManager: order channel closed");
                        return;
                    }
                },
            }
        }
    }

    async fn handle_order(&self, mut order: Order, signal: Signal) {
        let live_price = match self.client.price(&order.token_id).await {
            Ok(p) => p,
            Err(e) => {
                error!(market = %order.market_id, error = %e, "failed to fetch live price, failing order");
                self.fail_order(&mut order, format!("live price fetch failed: {e}")).await;
                return;
            }
        };

        let drift = (live_price - signal.limit_price).abs() / signal.limit_price.max(1e-9);
        if drift > MAX_PRICE_DRIFT_PCT {
            warn!(
                market = %order.market_id,
                live_price,
                reference_price = signal.limit_price,
                drift,
                "live price drifted too far from signal reference price, rejecting"
            );
            self.fail_order(&mut order, format!("price drifted {:.1}% from signal reference", drift * 100.0))
                .await;
            return;
        }

        let shares = signal.size_usd / live_price.max(1e-9);
        if shares < MIN_SHARES {
            warn!(market = %order.market_id, shares, "order size below minimum shares, rejecting");
            self.fail_order(&mut order, format!("{shares:.4} shares below minimum {MIN_SHARES}"))
                .await;
            return;
        }

        order.size_shares = shares;
        order.price = live_price;

        info!(
            market = %order.market_id,
            side = %order.side,
            shares = order.size_shares,
            price = order.price,
            "submitting order"
        );

        let args = OrderArgs {
            market_id: order.market_id.clone(),
            token_id: order.token_id.clone(),
            side: order.side,
            size_shares: order.size_shares,
            price: order.price,
            order_type: order.order_type,
        };

        match self.client.place(&args).await {
            Ok(placed) => {
                order.exchange_order_id = Some(placed.exchange_order_id.clone());
                order.filled_shares = placed.filled_shares;
                order.avg_fill_price = placed.avg_fill_price;
                order.fee_paid = placed.fee_paid;
                order.status = map_exchange_status(&placed.status, order.size_shares, placed.filled_shares);

                if let Err(e) = common::store::update_order(&self.db, &order).await {
                    error!(error = %e, "failed to persist order after submission");
                }

                let mut trade_id = placed.trade_id;
                if !order.status.is_terminal() {
                    let (status, polled_trade_id) = self.await_terminal(&mut order).await;
                    order.status = status;
                    trade_id = trade_id.or(polled_trade_id);
                    let _ = common::store::update_order(&self.db, &order).await;
                }

                if order.status == OrderStatus::Filled || order.status == OrderStatus::Partial {
                    let trade_id = match trade_id {
                        Some(id) => id,
                        None => self.fallback_trade_id(&order).await,
                    };
                    self.record_fill_and_forward(&order, signal, &trade_id).await;
                }
            }
            Err(e) => {
                error!(market = %order.market_id, error = %e, "order submission failed");
                self.fail_order(&mut order, e.to_string()).await;
            }
        }
    }

    async fn fail_order(&self, order: &mut Order, reason: String) {
        order.status = OrderStatus::Failed;
        let _ = common::store::update_order(&self.db, order).await;
        let _ = self
            .risk_event_tx
            .send(RiskEvent::OrderFailed {
                signal_id: order.signal_id,
                market_id: order.market_id.clone(),
                error: reason,
            })
            .await;
    }

    /// Polls `open_orders` until the exchange no longer reports this order
    /// as resting, treating its disappearance as a fill (matches the
    /// teacher's polling pattern for exchanges with no push fill channel).
    /// Returns the trade id of the fill that closed it out, if the exchange
    /// reports one.
    async fn await_terminal(&self, order: &mut Order) -> (OrderStatus, Option<String>) {
        let Some(exchange_id) = order.exchange_order_id.clone() else {
            return (order.status, None);
        };

        loop {
            tokio::time::sleep(self.poll_interval).await;

            match self.client.open_orders().await {
                Ok(open) => {
                    match open.iter().find(|o| o.exchange_order_id == exchange_id) {
                        Some(resting) => {
                            order.filled_shares = order.size_shares - resting.remaining_shares;
                            if resting.remaining_shares <= 0.0 {
                                let trade_id = self.latest_trade_id(&exchange_id).await;
                                return (OrderStatus::Filled, trade_id);
                            }
                        }
                        None => {
                            // No longer resting: either fully filled or cancelled.
                            return if order.filled_shares > 0.0 {
                                let trade_id = self.latest_trade_id(&exchange_id).await;
                                (OrderStatus::Filled, trade_id)
                            } else {
                                (OrderStatus::Cancelled, None)
                            };
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to poll open orders, retrying");
                }
            }
        }
    }

    /// Most recent fill reported against an exchange order, per the
    /// exchange's own trade history.
    async fn latest_trade_id(&self, exchange_order_id: &str) -> Option<String> {
        match self.client.trades_for_order(exchange_order_id).await {
            Ok(trades) => trades.last().map(|t| t.trade_id.clone()),
            Err(e) => {
                warn!(error = %e, "failed to fetch trade history for order");
                None
            }
        }
    }

    /// Last-resort id for a confirmed fill the exchange's trade history
    /// couldn't account for. Never dedupes across a redelivered poll like a
    /// real exchange trade id would — only reached if the exchange gave no
    /// inline trade id and its trade-history endpoint came back empty.
    async fn fallback_trade_id(&self, order: &Order) -> String {
        if let Some(exchange_id) = &order.exchange_order_id {
            if let Some(id) = self.latest_trade_id(exchange_id).await {
                return id;
            }
        }
        warn!(order_id = %order.id, "exchange reported no trade id for a filled order, minting a local one");
        uuid::Uuid::new_v4().to_string()
    }

    async fn record_fill_and_forward(&self, order: &Order, signal: Signal, trade_id: &str) {
        if let Err(e) = common::store::record_fill(
            &self.db,
            trade_id,
            &order.id.to_string(),
            order.exchange_order_id.as_deref(),
            &order.market_id,
            &order.token_id,
            order.side,
            order.avg_fill_price,
            order.filled_shares,
            order.fee_paid,
        )
        .await
        {
            error!(error = %e, "failed to persist fill");
        }

        let outcome = match self.client.market(&order.market_id).await {
            Ok(market) => market.outcome_of(&order.token_id).unwrap_or(Outcome::Yes),
            Err(e) => {
                warn!(error = %e, "failed to resolve market for outcome lookup, defaulting to Yes");
                Outcome::Yes
            }
        };

        let summary = SignalSummary {
            strategy: signal.strategy,
            outcome,
            is_exit: signal.is_exit(),
            parent_position_id: signal.metadata.parent_position_id,
        };

        let _ = self
            .position_tx
            .send(PositionFill {
                order: order.clone(),
                signal: summary,
            })
            .await;
    }
}

fn map_exchange_status(raw: &str, size_shares: f64, filled_shares: f64) -> OrderStatus {
    match raw.to_ascii_lowercase().as_str() {
        "live" | "open" | "unmatched" => OrderStatus::Submitted,
        "matched" | "filled" => {
            if filled_shares + f64::EPSILON < size_shares {
                OrderStatus::Partial
            } else {
                OrderStatus::Filled
            }
        }
        "cancelled" | "canceled" | "expired" => OrderStatus::Cancelled,
        "rejected" => OrderStatus::Rejected,
        _ => OrderStatus::Submitted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_partial_fill_correctly() {
        assert_eq!(map_exchange_status("matched", 10.0, 4.0), OrderStatus::Partial);
        assert_eq!(map_exchange_status("matched", 10.0, 10.0), OrderStatus::Filled);
        assert_eq!(map_exchange_status("live", 10.0, 0.0), OrderStatus::Submitted);
        assert_eq!(map_exchange_status("cancelled", 10.0, 0.0), OrderStatus::Cancelled);
    }
}
