use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use common::{
    ExchangeClient, OrderSide, OrderType, PortfolioSnapshot, Position, PositionSide,
    PositionStatus, PriceEvent, RiskEvent, Signal, StrategyKind,
};

use crate::order_manager::PositionFill;

/// How often to poll the exchange for market resolution on open positions.
/// Resolutions are rare and not latency-sensitive, unlike price-triggered
/// exits, so this runs far slower than the price stream.
const RESOLUTION_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Fee taken on a resolved position's winnings, applied only to the
/// winning side's payout (a losing close has nothing to take a fee from).
const RESOLUTION_FEE_RATE: f64 = 0.02;

/// Margin below a take-profit or stop trigger price within which the
/// Position Manager still fires — guards against missing a trigger because
/// of float rounding on a price tick that lands exactly on the line.
const TRIGGER_EPSILON: f64 = 1e-9;

/// Owns every open position's lifecycle once it has been filled: take-profit
/// ladder, stop-loss, trailing stop, and market resolution. Subscribes to
/// the price broadcast and to filled orders from the Order Manager, and is
/// the only component permitted to emit an exit `Signal`.
///
/// `closing` tracks positions for which an exit signal has already been
/// sent but not yet confirmed filled — without it a sustained adverse price
/// tick would emit one exit signal per tick for the same position.
pub struct PositionManager {
    db: SqlitePool,
    client: Arc<dyn ExchangeClient>,
    price_rx: broadcast::Receiver<PriceEvent>,
    fill_rx: mpsc::Receiver<PositionFill>,
    exit_tx: mpsc::Sender<Signal>,
    risk_event_tx: mpsc::Sender<RiskEvent>,
    positions: Arc<RwLock<Vec<Position>>>,
    portfolio: Arc<RwLock<Option<PortfolioSnapshot>>>,
    closing: HashSet<Uuid>,
}

impl PositionManager {
    pub async fn load(
        db: SqlitePool,
        client: Arc<dyn ExchangeClient>,
        price_rx: broadcast::Receiver<PriceEvent>,
        fill_rx: mpsc::Receiver<PositionFill>,
        exit_tx: mpsc::Sender<Signal>,
        risk_event_tx: mpsc::Sender<RiskEvent>,
        positions: Arc<RwLock<Vec<Position>>>,
        portfolio: Arc<RwLock<Option<PortfolioSnapshot>>>,
    ) -> common::Result<Self> {
        let existing = common::store::open_positions(&db).await?;
        info!(count = existing.len(), "loaded open positions");
        *positions.write().await = existing;

        Ok(Self {
            db,
            client,
            price_rx,
            fill_rx,
            exit_tx,
            risk_event_tx,
            positions,
            portfolio,
            closing: HashSet::new(),
        })
    }

    /// Run the position manager loop. Call from `tokio::spawn`.
    pub async fn run(mut self) {
        info!("PositionManager running");
        let mut resolution_ticker = tokio::time::interval(RESOLUTION_POLL_INTERVAL);
        resolution_ticker.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                fill = self.fill_rx.recv() => match fill {
                    Some(fill) => self.handle_fill(fill).await,
                    None => {
                        warn!("PositionManager: fill channel closed");
                        return;
                    }
                },
                price = self.price_rx.recv() => match price {
                    Ok(event) => self.handle_price(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "PositionManager lagged behind price stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("PositionManager: price stream closed");
                        return;
                    }
                },
                _ = resolution_ticker.tick() => self.poll_resolutions().await,
            }
        }
    }

    /// Checks every open position's market for resolution. A resolved
    /// market settles instantly at the winning outcome's payout (1.0) or
    /// the losing outcome's (0.0) — there is no exit order to place, just
    /// a synthetic close recorded directly against the position.
    async fn poll_resolutions(&mut self) {
        let candidates: Vec<Position> = {
            let positions = self.positions.read().await;
            positions
                .iter()
                .filter(|p| p.status == PositionStatus::Open && !self.closing.contains(&p.id))
                .cloned()
                .collect()
        };

        for position in candidates {
            let market = match self.client.market(&position.market_id).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(market_id = %position.market_id, error = %e, "failed to poll market for resolution");
                    continue;
                }
            };

            if !market.resolved {
                continue;
            }

            let Some(winning) = market.winning_outcome else {
                continue;
            };

            let payout_price = if winning == position.outcome { 1.0 } else { 0.0 };
            info!(
                position_id = %position.id,
                market_id = %position.market_id,
                ?winning,
                "market resolved, closing position at synthetic payout"
            );
            self.resolve_position(&position, payout_price).await;
        }
    }

    async fn resolve_position(&mut self, position: &Position, payout_price: f64) {
        let mut positions = self.positions.write().await;
        let Some(idx) = positions.iter().position(|p| p.id == position.id) else {
            return;
        };

        let p = &mut positions[idx];
        let gross = match p.side {
            PositionSide::Long => (payout_price - p.entry_price) * p.shares,
            PositionSide::Short => (p.entry_price - payout_price) * p.shares,
        };
        let resolution_fee = (payout_price * p.shares * RESOLUTION_FEE_RATE).max(0.0);
        let proportional_entry_fee = p.entry_fee * (p.shares / p.entry_shares.max(1e-9));
        let net = gross - proportional_entry_fee - resolution_fee;

        p.realized_pnl += net;
        p.exit_fee += resolution_fee;
        p.shares = 0.0;
        p.status = PositionStatus::Resolved;
        p.closed_at = Some(chrono::Utc::now());

        let snapshot = p.clone();
        drop(positions);

        if let Err(e) = common::store::update_position(&self.db, &snapshot).await {
            warn!(error = %e, "failed to persist resolved position");
        }
        if let Err(e) = common::store::add_realized_pnl_today(&self.db, net).await {
            warn!(error = %e, "failed to accumulate daily realized pnl for resolution");
        }

        let _ = self
            .risk_event_tx
            .send(RiskEvent::PositionClosed {
                position_id: snapshot.id,
                market_id: snapshot.market_id.clone(),
                realized_pnl: snapshot.realized_pnl,
            })
            .await;

        self.positions.write().await.retain(|p| p.id != snapshot.id);
    }

    async fn handle_fill(&mut self, fill: PositionFill) {
        if fill.signal.is_exit {
            self.handle_exit_fill(fill).await;
        } else {
            self.handle_entry_fill(fill).await;
        }
    }

    async fn handle_entry_fill(&mut self, fill: PositionFill) {
        let order = fill.order;
        let side = match order.side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        };

        let position = Position {
            id: Uuid::new_v4(),
            market_id: order.market_id.clone(),
            token_id: order.token_id.clone(),
            outcome: fill.signal.outcome,
            side,
            entry_price: order.avg_fill_price,
            shares: order.filled_shares,
            entry_shares: order.filled_shares,
            entry_fee: order.fee_paid,
            exit_fee: 0.0,
            realized_pnl: 0.0,
            status: PositionStatus::Open,
            strategy: fill.signal.strategy,
            source_wallet: None,
            tp_levels: default_tp_ladder(fill.signal.strategy, order.avg_fill_price),
            sl_price: default_stop_loss(fill.signal.strategy, order.avg_fill_price, side),
            trail_pct: None,
            trail_anchor: None,
            opened_at: order.created_at,
            closed_at: None,
        };

        if let Err(e) = common::store::insert_position(&self.db, &position).await {
            warn!(error = %e, "failed to persist new position");
            return;
        }

        let _ = self
            .risk_event_tx
            .send(RiskEvent::PositionOpened {
                position_id: position.id,
                market_id: position.market_id.clone(),
                strategy: position.strategy,
                entry_price: position.entry_price,
                shares: position.shares,
            })
            .await;

        self.positions.write().await.push(position);
    }

    async fn handle_exit_fill(&mut self, fill: PositionFill) {
        let Some(parent_id) = fill.signal.parent_position_id else {
            warn!("exit fill has no parent position id, ignoring");
            return;
        };

        let mut positions = self.positions.write().await;
        let Some(idx) = positions.iter().position(|p| p.id == parent_id) else {
            warn!(position_id = %parent_id, "exit fill for unknown position");
            return;
        };

        let order = fill.order;
        let position = &mut positions[idx];
        let closed_shares = order.filled_shares.min(position.shares);
        let gross = match position.side {
            PositionSide::Long => (order.avg_fill_price - position.entry_price) * closed_shares,
            PositionSide::Short => (position.entry_price - order.avg_fill_price) * closed_shares,
        };
        // Entry fee is amortized across the position's entry shares; only the
        // portion attributable to the shares closed by this fill is netted out.
        let proportional_entry_fee =
            position.entry_fee * (closed_shares / position.entry_shares.max(1e-9));
        let realized = gross - proportional_entry_fee - order.fee_paid;

        position.shares -= closed_shares;
        position.realized_pnl += realized;
        position.exit_fee += order.fee_paid;

        let fully_closed = position.shares <= TRIGGER_EPSILON;
        position.status = if fully_closed {
            PositionStatus::Closed
        } else {
            PositionStatus::Open
        };
        if fully_closed {
            position.closed_at = Some(order.updated_at);
        }

        let snapshot = position.clone();
        if let Err(e) = common::store::update_position(&self.db, &snapshot).await {
            warn!(error = %e, "failed to persist position update after exit fill");
        }
        if let Err(e) = common::store::add_realized_pnl_today(&self.db, realized).await {
            warn!(error = %e, "failed to accumulate daily realized pnl");
        }

        self.closing.remove(&parent_id);

        let _ = self
            .risk_event_tx
            .send(RiskEvent::PositionClosed {
                position_id: parent_id,
                market_id: snapshot.market_id.clone(),
                realized_pnl: snapshot.realized_pnl,
            })
            .await;

        if fully_closed {
            positions.remove(idx);
        }
    }

    async fn handle_price(&mut self, event: PriceEvent) {
        let mut triggers = Vec::new();
        {
            let mut positions = self.positions.write().await;
            for position in positions.iter_mut() {
                if position.token_id != event.token_id
                    || position.status != PositionStatus::Open
                    || self.closing.contains(&position.id)
                {
                    continue;
                }
                if let Some(trigger) = evaluate_and_arm(position, event.price) {
                    triggers.push((position.clone(), trigger));
                }
            }
        }

        for (position, trigger) in triggers {
            // Persist the ladder/trailing state mutated above regardless of
            // whether the exit signal below is accepted — a fired TP level
            // or a newly armed trail must never be re-evaluated on the next
            // tick even if the exit itself fails to send.
            if let Err(e) = common::store::update_position(&self.db, &position).await {
                warn!(error = %e, "failed to persist position state after price evaluation");
            }

            let (reason, fraction) = match trigger {
                ExitTrigger::StopLoss => ("stop loss", 1.0),
                ExitTrigger::TrailingStop => ("trailing stop", 1.0),
                ExitTrigger::TakeProfit { fraction } => ("take profit", fraction),
            };

            self.closing.insert(position.id);

            let exit_shares = position.shares * fraction;
            let exit_usd = exit_shares * event.price;
            let signal = Signal::exit(
                position.strategy,
                position.market_id.clone(),
                position.token_id.clone(),
                opposite_side(position.side),
                exit_usd,
                event.price,
                OrderType::Fok,
                reason,
                position.id,
            );

            if self.exit_tx.send(signal).await.is_err() {
                warn!("exit signal channel closed, dropping exit signal");
                self.closing.remove(&position.id);
            }
        }
    }
}

fn opposite_side(side: PositionSide) -> OrderSide {
    match side {
        PositionSide::Long => OrderSide::Sell,
        PositionSide::Short => OrderSide::Buy,
    }
}

/// Which rule fired for a position on this price tick.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ExitTrigger {
    StopLoss,
    TrailingStop,
    TakeProfit { fraction: f64 },
}

/// Checks stop-loss, then the armed trailing stop, then the take-profit
/// ladder, in that order — the first to fire wins for this tick. Mutates
/// `position` in place: ratchets `trail_anchor` toward the favorable
/// direction on every call, and arms a fresh trailing stop (per I-P4, in
/// the direction matching `side`) whenever a TP rung fires. The caller is
/// responsible for persisting these mutations via `update_position`.
fn evaluate_and_arm(position: &mut Position, current_price: f64) -> Option<ExitTrigger> {
    if let Some(sl) = position.sl_price {
        let hit = match position.side {
            PositionSide::Long => current_price <= sl + TRIGGER_EPSILON,
            PositionSide::Short => current_price >= sl - TRIGGER_EPSILON,
        };
        if hit {
            return Some(ExitTrigger::StopLoss);
        }
    }

    if let (Some(trail_pct), Some(anchor)) = (position.trail_pct, position.trail_anchor) {
        let new_anchor = match position.side {
            PositionSide::Long => anchor.max(current_price),
            PositionSide::Short => anchor.min(current_price),
        };
        position.trail_anchor = Some(new_anchor);

        let retrace = match position.side {
            PositionSide::Long => (new_anchor - current_price) / new_anchor.max(1e-9),
            PositionSide::Short => (current_price - new_anchor) / new_anchor.max(1e-9),
        };
        if retrace >= trail_pct - TRIGGER_EPSILON {
            return Some(ExitTrigger::TrailingStop);
        }
    }

    for level in position.tp_levels.iter_mut() {
        if level.fired {
            continue;
        }
        let hit = match position.side {
            PositionSide::Long => current_price >= level.trigger_price - TRIGGER_EPSILON,
            PositionSide::Short => current_price <= level.trigger_price + TRIGGER_EPSILON,
        };
        if hit {
            level.fired = true;
            if position.trail_pct.is_none() {
                position.trail_pct = Some(default_trail_pct(position.strategy));
            }
            position.trail_anchor = Some(current_price);
            return Some(ExitTrigger::TakeProfit {
                fraction: level.fraction_to_sell,
            });
        }
    }

    None
}

/// Trailing-stop retrace percentage armed once a TP rung fires.
fn default_trail_pct(strategy: StrategyKind) -> f64 {
    match strategy {
        StrategyKind::Copy => 0.04,
        StrategyKind::Arb => 0.04,
        StrategyKind::Stink => 0.06,
    }
}

/// Default take-profit ladder, strategy-dependent: whale copies ride
/// further before scaling out, stink-bid fills take a flatter single rung
/// since they are already entered at a favorable discount.
fn default_tp_ladder(strategy: StrategyKind, entry_price: f64) -> Vec<common::TpLevel> {
    let rungs: &[(f64, f64)] = match strategy {
        StrategyKind::Copy => &[(0.05, 0.5), (0.12, 0.5)],
        StrategyKind::Arb => &[],
        StrategyKind::Stink => &[(0.08, 1.0)],
    };

    rungs
        .iter()
        .map(|(pct, fraction)| common::TpLevel {
            trigger_price: (entry_price * (1.0 + pct)).min(0.999),
            fraction_to_sell: *fraction,
            fired: false,
        })
        .collect()
}

fn default_stop_loss(strategy: StrategyKind, entry_price: f64, side: PositionSide) -> Option<f64> {
    let pct = match strategy {
        StrategyKind::Copy => 0.15,
        StrategyKind::Arb => return None,
        StrategyKind::Stink => 0.20,
    };

    let price = match side {
        PositionSide::Long => (entry_price * (1.0 - pct)).max(0.001),
        PositionSide::Short => (entry_price * (1.0 + pct)).min(0.999),
    };
    Some(price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn base_position(side: PositionSide, entry_price: f64) -> Position {
        Position {
            id: Uuid::new_v4(),
            market_id: "market-1".into(),
            token_id: "token-yes".into(),
            outcome: common::Outcome::Yes,
            side,
            entry_price,
            shares: 100.0,
            entry_shares: 100.0,
            entry_fee: 0.0,
            exit_fee: 0.0,
            realized_pnl: 0.0,
            status: PositionStatus::Open,
            strategy: StrategyKind::Copy,
            source_wallet: None,
            tp_levels: default_tp_ladder(StrategyKind::Copy, entry_price),
            sl_price: default_stop_loss(StrategyKind::Copy, entry_price, side),
            trail_pct: None,
            trail_anchor: None,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    #[test]
    fn stop_loss_fires_before_take_profit_check() {
        let mut position = base_position(PositionSide::Long, 0.5);
        let trigger = evaluate_and_arm(&mut position, 0.4);
        assert_eq!(trigger, Some(ExitTrigger::StopLoss));
    }

    #[test]
    fn take_profit_fires_on_first_unfired_rung_and_arms_trailing() {
        let mut position = base_position(PositionSide::Long, 0.5);
        let trigger = evaluate_and_arm(&mut position, 0.53);
        assert_eq!(trigger, Some(ExitTrigger::TakeProfit { fraction: 0.5 }));
        assert!(position.tp_levels[0].fired);
        assert_eq!(position.trail_anchor, Some(0.53));
        assert!(position.trail_pct.is_some());
    }

    #[test]
    fn fired_rung_is_never_retriggered() {
        let mut position = base_position(PositionSide::Long, 0.5);
        position.tp_levels[0].fired = true;
        let trigger = evaluate_and_arm(&mut position, 0.53);
        assert_eq!(trigger, None);
    }

    #[test]
    fn no_exit_inside_the_band() {
        let mut position = base_position(PositionSide::Long, 0.5);
        let trigger = evaluate_and_arm(&mut position, 0.5);
        assert_eq!(trigger, None);
    }

    #[test]
    fn arb_positions_have_no_stop_loss() {
        assert!(default_stop_loss(StrategyKind::Arb, 0.5, PositionSide::Long).is_none());
    }

    #[test]
    fn trailing_stop_ratchets_up_then_fires_on_retrace() {
        let mut position = base_position(PositionSide::Long, 0.5);
        position.sl_price = None;
        position.trail_pct = Some(0.10);
        position.trail_anchor = Some(0.5);

        assert_eq!(evaluate_and_arm(&mut position, 0.6), None);
        assert_eq!(position.trail_anchor, Some(0.6));

        // retrace of exactly 10% from the 0.6 anchor should fire.
        let trigger = evaluate_and_arm(&mut position, 0.54);
        assert_eq!(trigger, Some(ExitTrigger::TrailingStop));
    }

    #[test]
    fn trailing_stop_never_fires_on_monotonic_favorable_move_for_short() {
        let mut position = base_position(PositionSide::Short, 0.5);
        position.sl_price = None;
        position.trail_pct = Some(0.10);
        position.trail_anchor = Some(0.5);

        // A steadily falling price is favorable for a short; never an adverse retrace.
        assert_eq!(evaluate_and_arm(&mut position, 0.45), None);
        assert_eq!(evaluate_and_arm(&mut position, 0.40), None);
        assert_eq!(position.trail_anchor, Some(0.40));
    }
}
