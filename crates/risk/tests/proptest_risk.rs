use std::collections::HashMap;

use common::{OrderSide, OrderType, RejectionReason, Signal, StrategyKind};
use proptest::prelude::*;
use risk::{GateContext, RiskConfig};

proptest! {
    /// The gate must never panic on extreme signal inputs, and approval
    /// must imply the signal actually fit under both the per-trade and
    /// strategy allocation caps.
    #[test]
    fn gate_never_panics_and_approval_respects_caps(
        size_usd in 0.0001f64..1_000_000.0f64,
        limit_price in 0.0001f64..1.0f64,
        cash_usd in 0.0f64..1_000_000.0f64,
        portfolio_usd in 1.0f64..1_000_000.0f64,
        deployed in 0.0f64..1_000_000.0f64,
    ) {
        let config = RiskConfig::default();
        let mut strategy_exposure_usd = HashMap::new();
        strategy_exposure_usd.insert(StrategyKind::Copy, deployed);

        let ctx = GateContext {
            config: &config,
            kill_switch_active: false,
            cash_usd: Some(cash_usd),
            portfolio_usd: Some(portfolio_usd),
            portfolio_unknown: false,
            daily_realized_pnl_usd: 0.0,
            daily_unrealized_pnl_usd: 0.0,
            open_position_count: 0,
            strategy_exposure_usd,
            open_markets: &[],
        };

        let signal = Signal::entry(
            StrategyKind::Copy,
            "market-1",
            "token-yes",
            OrderSide::Buy,
            size_usd,
            limit_price,
            OrderType::Gtc,
            "fuzz",
        );

        let result = risk::gate::evaluate(&signal, &ctx);
        if result.is_ok() {
            prop_assert!(size_usd <= cash_usd);
            prop_assert!(size_usd <= config.max_position_pct * portfolio_usd);
            let cap = config
                .strategy_allocation_pct
                .get(&StrategyKind::Copy)
                .copied()
                .unwrap_or(0.0)
                * portfolio_usd;
            prop_assert!(deployed + size_usd <= cap);
        }
    }

    /// Exit signals must never be rejected for size or allocation reasons
    /// regardless of how large their notional is, as long as the portfolio
    /// is known and the kill switch is off.
    #[test]
    fn exit_signals_never_rejected_for_size(
        size_usd in 0.0001f64..10_000_000.0f64,
        limit_price in 0.0001f64..1.0f64,
    ) {
        let config = RiskConfig::default();
        let ctx = GateContext {
            config: &config,
            kill_switch_active: false,
            cash_usd: Some(0.0),
            portfolio_usd: Some(0.0),
            portfolio_unknown: false,
            daily_realized_pnl_usd: -1_000_000.0,
            daily_unrealized_pnl_usd: -1_000_000.0,
            open_position_count: 999,
            strategy_exposure_usd: HashMap::new(),
            open_markets: &["market-1".to_string()],
        };

        let exit = Signal::exit(
            StrategyKind::Copy,
            "market-1",
            "token-yes",
            OrderSide::Sell,
            size_usd,
            limit_price,
            OrderType::Gtc,
            "fuzz exit",
            uuid::Uuid::new_v4(),
        );

        let result = risk::gate::evaluate(&exit, &ctx);
        prop_assert!(
            !matches!(
                result,
                Err(RejectionReason::ExceedsPositionLimit)
                    | Err(RejectionReason::ExceedsStrategyAllocation)
                    | Err(RejectionReason::DuplicateMarket)
                    | Err(RejectionReason::InsufficientCash)
                    | Err(RejectionReason::DailyLossLimit)
            )
        );
    }
}
