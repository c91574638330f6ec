use std::collections::HashMap;

use common::{RejectionReason, Signal, StrategyKind};
use serde::{Deserialize, Serialize};

/// User-configurable risk parameters, loaded from `risk.toml`. Every
/// notional ceiling is a fraction of total portfolio value rather than a
/// flat USD figure, so the limits scale automatically as the pool grows
/// or shrinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum fraction of total portfolio value for a single signal.
    pub max_position_pct: f64,
    /// Maximum fraction of total portfolio value a single strategy may
    /// have deployed at once, summed across all of its open positions.
    pub strategy_allocation_pct: HashMap<StrategyKind, f64>,
    /// Hard ceiling on simultaneous open positions.
    pub max_open_positions: usize,
    /// Realized + unrealized loss in one UTC day, as a fraction of total
    /// portfolio value, that halts new entries for the rest of the day
    /// (exits are exempt — see `evaluate`).
    pub daily_loss_pct: f64,
    /// Minimum fraction of total portfolio value that must remain in cash
    /// after a signal's notional is deducted.
    pub reserve_pct: f64,
    /// Minimum post-fee edge an arbitrage signal must declare to be
    /// accepted. Ignored for signals with no `expected_edge`.
    pub min_edge_pct: f64,
}

impl RiskConfig {
    /// Load from a TOML file. Exits the process on error — a malformed
    /// risk config has no sensible fallback.
    pub fn load(path: &str) -> Self {
        let content = std::fs::read_to_string(path)
            .unwrap_or_else(|e| panic!("failed to read risk config at '{path}': {e}"));
        toml::from_str(&content)
            .unwrap_or_else(|e| panic!("failed to parse risk config at '{path}': {e}"))
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        let mut strategy_allocation_pct = HashMap::new();
        strategy_allocation_pct.insert(StrategyKind::Copy, 0.25);
        strategy_allocation_pct.insert(StrategyKind::Arb, 0.25);
        strategy_allocation_pct.insert(StrategyKind::Stink, 0.125);

        Self {
            max_position_pct: 0.05,
            strategy_allocation_pct,
            max_open_positions: 25,
            daily_loss_pct: 0.10,
            reserve_pct: 0.10,
            min_edge_pct: 0.05,
        }
    }
}

/// Everything the gate needs to evaluate one signal. Built fresh by the
/// caller on every signal — never cached across calls, so a stale
/// portfolio snapshot always shows up as `portfolio_unknown`.
pub struct GateContext<'a> {
    pub config: &'a RiskConfig,
    pub kill_switch_active: bool,
    pub cash_usd: Option<f64>,
    /// Total portfolio value (cash + positions), the denominator every
    /// percentage-based check below is measured against.
    pub portfolio_usd: Option<f64>,
    pub portfolio_unknown: bool,
    pub daily_realized_pnl_usd: f64,
    pub daily_unrealized_pnl_usd: f64,
    pub open_position_count: usize,
    pub strategy_exposure_usd: HashMap<StrategyKind, f64>,
    pub open_markets: &'a [String],
}

/// Pure, synchronous, short-circuiting risk evaluation. Every branch that
/// can reject does so before any branch that could panic on missing data
/// — a `None` cash balance or a stale portfolio snapshot fails closed
/// rather than falling through to an economic check with bad inputs.
///
/// Exit signals (`signal.is_exit()`) skip every check below
/// `DailyLossLimit` — the whole point of an exit is to shed risk, so
/// cash reserve, position-size, allocation, and duplicate-market limits
/// must never block one.
pub fn evaluate(signal: &Signal, ctx: &GateContext) -> Result<(), RejectionReason> {
    if ctx.kill_switch_active {
        return Err(RejectionReason::KillSwitch);
    }

    let cash_usd = match ctx.cash_usd {
        Some(c) => c,
        None => return Err(RejectionReason::BalanceUnknown),
    };

    if ctx.portfolio_unknown {
        return Err(RejectionReason::PortfolioUnknown);
    }

    let portfolio_usd = match ctx.portfolio_usd {
        Some(p) => p,
        None => return Err(RejectionReason::PortfolioUnknown),
    };

    if signal.is_exit() {
        return Ok(());
    }

    let daily_pnl = ctx.daily_realized_pnl_usd + ctx.daily_unrealized_pnl_usd;
    if daily_pnl <= -ctx.config.daily_loss_pct * portfolio_usd {
        return Err(RejectionReason::DailyLossLimit);
    }

    if signal.size_usd > cash_usd {
        return Err(RejectionReason::InsufficientCash);
    }

    let post_trade_cash = cash_usd - signal.size_usd;
    if post_trade_cash < ctx.config.reserve_pct * portfolio_usd {
        return Err(RejectionReason::InsufficientCash);
    }

    if signal.size_usd > ctx.config.max_position_pct * portfolio_usd {
        return Err(RejectionReason::ExceedsPositionLimit);
    }

    if ctx.open_position_count >= ctx.config.max_open_positions {
        return Err(RejectionReason::TooManyPositions);
    }

    let allocation_cap = ctx
        .config
        .strategy_allocation_pct
        .get(&signal.strategy)
        .copied()
        .unwrap_or(0.0)
        * portfolio_usd;
    let deployed = ctx
        .strategy_exposure_usd
        .get(&signal.strategy)
        .copied()
        .unwrap_or(0.0);
    if deployed + signal.size_usd > allocation_cap {
        return Err(RejectionReason::ExceedsStrategyAllocation);
    }

    if ctx.open_markets.iter().any(|m| m == &signal.market_id) {
        return Err(RejectionReason::DuplicateMarket);
    }

    if let Some(edge) = signal.metadata.expected_edge {
        if edge < ctx.config.min_edge_pct {
            return Err(RejectionReason::BelowMinEdge);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{OrderSide, OrderType};

    fn base_ctx(config: &RiskConfig) -> GateContext {
        GateContext {
            config,
            kill_switch_active: false,
            cash_usd: Some(1_000.0),
            portfolio_usd: Some(1_000.0),
            portfolio_unknown: false,
            daily_realized_pnl_usd: 0.0,
            daily_unrealized_pnl_usd: 0.0,
            open_position_count: 0,
            strategy_exposure_usd: HashMap::new(),
            open_markets: &[],
        }
    }

    fn sig(size_usd: f64) -> Signal {
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

    #[test]
    fn kill_switch_rejects_everything_first() {
        let config = RiskConfig::default();
        let mut ctx = base_ctx(&config);
        ctx.kill_switch_active = true;
        ctx.cash_usd = None; // would also fail BalanceUnknown, but KillSwitch wins
        assert_eq!(evaluate(&sig(10.0), &ctx), Err(RejectionReason::KillSwitch));
    }

    #[test]
    fn unknown_balance_fails_closed() {
        let config = RiskConfig::default();
        let mut ctx = base_ctx(&config);
        ctx.cash_usd = None;
        assert_eq!(evaluate(&sig(10.0), &ctx), Err(RejectionReason::BalanceUnknown));
    }

    #[test]
    fn exit_bypasses_size_and_allocation_checks() {
        let config = RiskConfig::default();
        let ctx = base_ctx(&config);
        let exit = Signal::exit(
            StrategyKind::Copy,
            "market-1",
            "token-yes",
            OrderSide::Sell,
            999_999.0, // far above any limit
            0.5,
            OrderType::Gtc,
            "stop loss",
            uuid::Uuid::new_v4(),
        );
        assert_eq!(evaluate(&exit, &ctx), Ok(()));
    }

    #[test]
    fn exceeds_position_limit() {
        let config = RiskConfig {
            max_position_pct: 0.05, // 5% of $1,000 == $50
            ..RiskConfig::default()
        };
        let ctx = base_ctx(&config);
        assert_eq!(
            evaluate(&sig(60.0), &ctx),
            Err(RejectionReason::ExceedsPositionLimit)
        );
    }

    #[test]
    fn cash_reserve_rejected_when_post_trade_cash_falls_below_floor() {
        let config = RiskConfig {
            reserve_pct: 0.90, // leaves only $100 of headroom on a $1,000 portfolio
            ..RiskConfig::default()
        };
        let mut ctx = base_ctx(&config);
        ctx.cash_usd = Some(150.0);
        assert_eq!(
            evaluate(&sig(100.0), &ctx),
            Err(RejectionReason::InsufficientCash)
        );
    }

    #[test]
    fn daily_loss_limit_counts_unrealized_pnl() {
        let config = RiskConfig::default();
        let mut ctx = base_ctx(&config);
        ctx.daily_realized_pnl_usd = -50.0;
        ctx.daily_unrealized_pnl_usd = -60.0; // combined -110 breaches 10% of $1,000
        assert_eq!(evaluate(&sig(10.0), &ctx), Err(RejectionReason::DailyLossLimit));
    }

    #[test]
    fn duplicate_market_rejected() {
        let config = RiskConfig::default();
        let mut ctx = base_ctx(&config);
        let markets = vec!["market-1".to_string()];
        ctx.open_markets = &markets;
        assert_eq!(evaluate(&sig(10.0), &ctx), Err(RejectionReason::DuplicateMarket));
    }

    #[test]
    fn below_min_edge_rejected() {
        let config = RiskConfig {
            min_edge_pct: 0.02,
            ..RiskConfig::default()
        };
        let ctx = base_ctx(&config);
        let mut signal = sig(10.0);
        signal.metadata.expected_edge = Some(0.01);
        assert_eq!(evaluate(&signal, &ctx), Err(RejectionReason::BelowMinEdge));
    }

    #[test]
    fn approves_clean_signal() {
        let config = RiskConfig::default();
        let ctx = base_ctx(&config);
        assert_eq!(evaluate(&sig(10.0), &ctx), Ok(()));
    }
}
