use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which strategy state machine produced a `Signal` or owns a `Position`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum StrategyKind {
    Copy,
    Arb,
    Stink,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Copy => write!(f, "copy"),
            StrategyKind::Arb => write!(f, "arb"),
            StrategyKind::Stink => write!(f, "stink"),
        }
    }
}

/// Side of an order. Distinct from `PositionSide`: a SELL can open a short
/// position or close a long one depending on context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum OrderType {
    Gtc,
    Fok,
    Ioc,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Gtc => write!(f, "GTC"),
            OrderType::Fok => write!(f, "FOK"),
            OrderType::Ioc => write!(f, "IOC"),
        }
    }
}

/// Binary-market outcome. Tokens are always selected by this string, never
/// by array index — the exchange does not guarantee outcome ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Yes => write!(f, "Yes"),
            Outcome::No => write!(f, "No"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

/// A trade intention emitted by a strategy or the Position Manager.
///
/// Ephemeral — lives only in the Order Manager's queue. `size_usd` is
/// always USD notional, never shares; the Order Manager is the only
/// component that converts it to shares, exactly once, at submission time.
#[derive(Debug, Clone)]
pub struct Signal {
    pub id: Uuid,
    pub strategy: StrategyKind,
    pub market_id: String,
    pub token_id: String,
    pub side: OrderSide,
    pub size_usd: f64,
    pub limit_price: f64,
    pub order_type: OrderType,
    pub reasoning: String,
    pub metadata: SignalMetadata,
}

/// Extra context carried alongside a `Signal`. `is_exit` signals are exempt
/// from allocation/size/duplicate-market risk checks and get reserved
/// queue capacity ahead of entry signals.
#[derive(Debug, Clone, Default)]
pub struct SignalMetadata {
    pub is_exit: bool,
    pub parent_position_id: Option<Uuid>,
    pub arb_leg_of: Option<Uuid>,
    /// Expected edge after fees, for strategies that declare one (arb).
    /// Checked against `min_edge_pct` by the Risk Gate when present.
    pub expected_edge: Option<f64>,
}

impl Signal {
    pub fn entry(
        strategy: StrategyKind,
        market_id: impl Into<String>,
        token_id: impl Into<String>,
        side: OrderSide,
        size_usd: f64,
        limit_price: f64,
        order_type: OrderType,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy,
            market_id: market_id.into(),
            token_id: token_id.into(),
            side,
            size_usd,
            limit_price,
            order_type,
            reasoning: reasoning.into(),
            metadata: SignalMetadata::default(),
        }
    }

    pub fn exit(
        strategy: StrategyKind,
        market_id: impl Into<String>,
        token_id: impl Into<String>,
        side: OrderSide,
        size_usd: f64,
        limit_price: f64,
        order_type: OrderType,
        reasoning: impl Into<String>,
        parent_position_id: Uuid,
    ) -> Self {
        let mut sig = Self::entry(
            strategy, market_id, token_id, side, size_usd, limit_price, order_type, reasoning,
        );
        sig.metadata.is_exit = true;
        sig.metadata.parent_position_id = Some(parent_position_id);
        sig
    }

    pub fn is_exit(&self) -> bool {
        self.metadata.is_exit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Submitted,
    Filled,
    Partial,
    Cancelled,
    Rejected,
    Failed,
}

impl OrderStatus {
    /// Terminal statuses end the confirm-fill polling loop in the Order Manager.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Failed
        )
    }
}

/// A persisted order. Links to `Position` by ID only — never hold an
/// `Arc<Position>` inside an `Order` or vice versa.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: Uuid,
    pub exchange_order_id: Option<String>,
    pub signal_id: Uuid,
    pub market_id: String,
    pub token_id: String,
    pub side: OrderSide,
    pub size_shares: f64,
    pub price: f64,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub filled_shares: f64,
    pub avg_fill_price: f64,
    pub fee_paid: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Builds a pending order straight from an approved signal. `size_shares`
    /// is a placeholder zero — the Order Manager is the only component that
    /// converts USD notional to shares, done once against a freshly-fetched
    /// live price immediately before submission, not here.
    pub fn pending(signal: &Signal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            exchange_order_id: None,
            signal_id: signal.id,
            market_id: signal.market_id.clone(),
            token_id: signal.token_id.clone(),
            side: signal.side,
            size_shares: 0.0,
            price: signal.limit_price,
            order_type: signal.order_type,
            status: OrderStatus::Pending,
            filled_shares: 0.0,
            avg_fill_price: 0.0,
            fee_paid: 0.0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
    Resolved,
}

/// One take-profit rung. `fired` is sticky — once a level triggers it is
/// never re-evaluated even if price retraces back below `trigger_price`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TpLevel {
    pub trigger_price: f64,
    pub fraction_to_sell: f64,
    pub fired: bool,
}

/// A persisted open or closed position. See spec invariants I-P1..I-P4.
#[derive(Debug, Clone)]
pub struct Position {
    pub id: Uuid,
    pub market_id: String,
    pub token_id: String,
    pub outcome: Outcome,
    pub side: PositionSide,
    pub entry_price: f64,
    pub shares: f64,
    pub entry_shares: f64,
    pub entry_fee: f64,
    pub exit_fee: f64,
    pub realized_pnl: f64,
    pub status: PositionStatus,
    pub strategy: StrategyKind,
    pub source_wallet: Option<String>,
    pub tp_levels: Vec<TpLevel>,
    pub sl_price: Option<f64>,
    pub trail_pct: Option<f64>,
    pub trail_anchor: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Unrealized P&L at `current_price`, fee-exclusive — fees apply only
    /// on realized closes.
    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        match self.side {
            PositionSide::Long => (current_price - self.entry_price) * self.shares,
            PositionSide::Short => (self.entry_price - current_price) * self.shares,
        }
    }

    /// True if `current_price` has moved against the position relative to `reference`.
    pub fn is_adverse_move(&self, reference: f64, current_price: f64) -> bool {
        match self.side {
            PositionSide::Long => current_price < reference,
            PositionSide::Short => current_price > reference,
        }
    }
}

/// A snapshot of a tracked wallet's holding in one market/token, used to
/// diff against the next poll tick.
#[derive(Debug, Clone)]
pub struct WhalePosition {
    pub wallet_addr: String,
    pub market_id: String,
    pub token_id: String,
    pub shares: f64,
    pub avg_price: f64,
    pub last_seen_at: DateTime<Utc>,
}

/// Tracks the single resting stink bid for a `(market_id, token_id)` pair.
#[derive(Debug, Clone)]
pub struct StinkOrder {
    pub market_id: String,
    pub token_id: String,
    pub exchange_order_id: String,
    pub price: f64,
    pub size_usd: f64,
    pub placed_at: DateTime<Utc>,
}

/// Derived, cached view of account health. Refreshed on a ~1s cadence by the
/// portfolio snapshotter task; the Risk Gate treats a stale snapshot as
/// `PortfolioUnknown` (fail closed).
#[derive(Debug, Clone, Copy)]
pub struct PortfolioSnapshot {
    pub cash_usd: f64,
    pub positions_value_usd: f64,
    pub total_usd: f64,
    pub unrealized_pnl_usd: f64,
    pub realized_pnl_today_usd: f64,
    pub as_of: DateTime<Utc>,
}

impl PortfolioSnapshot {
    pub fn is_stale(&self, max_age_secs: i64) -> bool {
        (Utc::now() - self.as_of).num_seconds() > max_age_secs
    }
}

/// Persisted singleton. Re-read once at startup — never trusted from memory
/// alone across a restart.
#[derive(Debug, Clone)]
pub struct RiskState {
    pub kill_switch_active: bool,
    pub activated_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl Default for RiskState {
    fn default() -> Self {
        Self {
            kill_switch_active: false,
            activated_at: None,
            reason: None,
        }
    }
}

/// Reason the Risk Gate rejected a signal. Ordering here matches the
/// short-circuit check order the gate evaluates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    KillSwitch,
    BalanceUnknown,
    PortfolioUnknown,
    DailyLossLimit,
    InsufficientCash,
    ExceedsPositionLimit,
    TooManyPositions,
    ExceedsStrategyAllocation,
    DuplicateMarket,
    BelowMinEdge,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectionReason::KillSwitch => "kill switch active",
            RejectionReason::BalanceUnknown => "balance unknown",
            RejectionReason::PortfolioUnknown => "portfolio unknown",
            RejectionReason::DailyLossLimit => "daily loss limit reached",
            RejectionReason::InsufficientCash => "insufficient cash",
            RejectionReason::ExceedsPositionLimit => "exceeds position size limit",
            RejectionReason::TooManyPositions => "too many open positions",
            RejectionReason::ExceedsStrategyAllocation => "exceeds strategy allocation",
            RejectionReason::DuplicateMarket => "duplicate market",
            RejectionReason::BelowMinEdge => "below minimum edge",
        };
        write!(f, "{s}")
    }
}

/// A price tick from the exchange's push stream, for one token.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriceEvent {
    pub market_id: String,
    pub token_id: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Current lifecycle state of the engine as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    #[default]
    Starting,
    Running,
    Halted,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Starting => write!(f, "starting"),
            EngineState::Running => write!(f, "running"),
            EngineState::Halted => write!(f, "halted"),
        }
    }
}

/// Commands accepted from the control surface (chat bot / CLI).
#[derive(Debug, Clone)]
pub enum EngineCommand {
    Pause(StrategyKind),
    Resume(StrategyKind),
    Kill(String),
}

/// Events the engine emits outward for alerting (Telegram) and the dashboard.
#[derive(Debug, Clone)]
pub enum RiskEvent {
    SignalRejected {
        signal_id: Uuid,
        market_id: String,
        strategy: StrategyKind,
        reason: RejectionReason,
    },
    PositionOpened {
        position_id: Uuid,
        market_id: String,
        strategy: StrategyKind,
        entry_price: f64,
        shares: f64,
    },
    PositionClosed {
        position_id: Uuid,
        market_id: String,
        realized_pnl: f64,
    },
    OrderFailed {
        signal_id: Uuid,
        market_id: String,
        error: String,
    },
    KillActivated {
        reason: String,
    },
    RiskWarning {
        message: String,
    },
    HealthDegraded {
        component: String,
        detail: String,
    },
}

/// Whether the bot is running against the real exchange or simulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum TradingMode {
    Live,
    Paper,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Live => write!(f, "live"),
            TradingMode::Paper => write!(f, "paper"),
        }
    }
}
