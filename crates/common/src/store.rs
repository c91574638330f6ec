use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::{
    Order, OrderSide, OrderStatus, OrderType, Outcome, Position, PositionSide, PositionStatus,
    Result, RiskState, StinkOrder, StrategyKind, TpLevel, WhalePosition,
};

/// Opens the sqlite pool with WAL journaling and a busy timeout so the
/// Order Manager and dashboard API can both hold connections without
/// `database is locked` errors under normal load.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let opts: SqliteConnectOptions = database_url
        .parse::<SqliteConnectOptions>()
        .map_err(sqlx::Error::from)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(opts)
        .await?;

    Ok(pool)
}

fn parse_side(s: &str) -> OrderSide {
    match s {
        "BUY" => OrderSide::Buy,
        _ => OrderSide::Sell,
    }
}

fn parse_order_type(s: &str) -> OrderType {
    match s {
        "FOK" => OrderType::Fok,
        "IOC" => OrderType::Ioc,
        _ => OrderType::Gtc,
    }
}

fn parse_order_status(s: &str) -> OrderStatus {
    match s {
        "submitted" => OrderStatus::Submitted,
        "filled" => OrderStatus::Filled,
        "partial" => OrderStatus::Partial,
        "cancelled" => OrderStatus::Cancelled,
        "rejected" => OrderStatus::Rejected,
        "failed" => OrderStatus::Failed,
        _ => OrderStatus::Pending,
    }
}

fn parse_position_status(s: &str) -> PositionStatus {
    match s {
        "closing" => PositionStatus::Closing,
        "closed" => PositionStatus::Closed,
        "resolved" => PositionStatus::Resolved,
        _ => PositionStatus::Open,
    }
}

fn parse_strategy(s: &str) -> StrategyKind {
    match s {
        "arb" => StrategyKind::Arb,
        "stink" => StrategyKind::Stink,
        _ => StrategyKind::Copy,
    }
}

fn parse_outcome(s: &str) -> Outcome {
    match s {
        "NO" => Outcome::No,
        _ => Outcome::Yes,
    }
}

fn parse_position_side(s: &str) -> PositionSide {
    match s {
        "short" => PositionSide::Short,
        _ => PositionSide::Long,
    }
}

/// Persists a newly created order row. Called once per `Order` by the
/// Order Manager before it is ever submitted to the exchange.
pub async fn insert_order(db: &SqlitePool, order: &Order) -> Result<()> {
    let id = order.id.to_string();
    let signal_id = order.signal_id.to_string();
    let side = order.side.to_string();
    let order_type = order.order_type.to_string();
    let status = format!("{:?}", order.status).to_lowercase();

    sqlx::query!(
        r#"
        INSERT INTO orders
            (id, exchange_order_id, signal_id, market_id, token_id, side,
             size_shares, price, order_type, status, filled_shares,
             avg_fill_price, fee_paid, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#,
        id,
        order.exchange_order_id,
        signal_id,
        order.market_id,
        order.token_id,
        side,
        order.size_shares,
        order.price,
        order_type,
        status,
        order.filled_shares,
        order.avg_fill_price,
        order.fee_paid,
        order.created_at,
        order.updated_at,
    )
    .execute(db)
    .await?;

    Ok(())
}

/// Updates an order's sizing, status, and fill state in place. Idempotent —
/// calling with the same terminal status twice is harmless.
///
/// `size_shares`/`price` are included because the Order Manager computes
/// them fresh against a live price immediately before submission, after the
/// row was first inserted with placeholder values by the Risk Manager.
pub async fn update_order(db: &SqlitePool, order: &Order) -> Result<()> {
    let id = order.id.to_string();
    let status = format!("{:?}", order.status).to_lowercase();
    let now = Utc::now();

    sqlx::query!(
        r#"
        UPDATE orders
        SET exchange_order_id = ?2, status = ?3, size_shares = ?4, price = ?5,
            filled_shares = ?6, avg_fill_price = ?7, fee_paid = ?8, updated_at = ?9
        WHERE id = ?1
        "#,
        id,
        order.exchange_order_id,
        status,
        order.size_shares,
        order.price,
        order.filled_shares,
        order.avg_fill_price,
        order.fee_paid,
        now,
    )
    .execute(db)
    .await?;

    Ok(())
}

/// Records one exchange fill event. `INSERT OR IGNORE` on the primary key
/// makes replaying the same fill (e.g. after a reconnect) a no-op rather
/// than double-counting P&L. `trade_id` must be the exchange's own
/// identifier for the fill, never one minted locally — that is the only way
/// a redelivered fill dedupes instead of inserting a second row.
pub async fn record_fill(
    db: &SqlitePool,
    trade_id: &str,
    order_id: &str,
    exchange_order_id: Option<&str>,
    market_id: &str,
    token_id: &str,
    side: OrderSide,
    price: f64,
    shares: f64,
    fee: f64,
) -> Result<()> {
    let side_s = side.to_string();
    let now = Utc::now();

    sqlx::query!(
        r#"
        INSERT OR IGNORE INTO trade_fills
            (id, order_id, exchange_order_id, market_id, token_id, side, price, shares, fee, filled_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        trade_id,
        order_id,
        exchange_order_id,
        market_id,
        token_id,
        side_s,
        price,
        shares,
        fee,
        now,
    )
    .execute(db)
    .await?;

    Ok(())
}

/// Inserts a new open position along with its take-profit ladder, in a
/// single transaction — a crash between the two inserts must never leave a
/// position with a partial TP ladder.
pub async fn insert_position(db: &SqlitePool, position: &Position) -> Result<()> {
    let mut tx = db.begin().await?;

    let id = position.id.to_string();
    let outcome = position.outcome.to_string();
    let side = format!("{:?}", position.side).to_lowercase();
    let status = format!("{:?}", position.status).to_lowercase();
    let strategy = position.strategy.to_string();

    sqlx::query!(
        r#"
        INSERT INTO positions
            (id, market_id, token_id, outcome, side, entry_price, shares,
             entry_shares, entry_fee, exit_fee, realized_pnl, status, strategy,
             source_wallet, sl_price, trail_pct, trail_anchor, opened_at, closed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
        "#,
        id,
        position.market_id,
        position.token_id,
        outcome,
        side,
        position.entry_price,
        position.shares,
        position.entry_shares,
        position.entry_fee,
        position.exit_fee,
        position.realized_pnl,
        status,
        strategy,
        position.source_wallet,
        position.sl_price,
        position.trail_pct,
        position.trail_anchor,
        position.opened_at,
        position.closed_at,
    )
    .execute(&mut *tx)
    .await?;

    for (idx, level) in position.tp_levels.iter().enumerate() {
        let idx = idx as i64;
        let fired = level.fired as i64;
        sqlx::query!(
            r#"
            INSERT INTO position_tp_levels (position_id, level_index, trigger_price, fraction_to_sell, fired)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            id,
            idx,
            level.trigger_price,
            level.fraction_to_sell,
            fired,
        )
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Updates a position's live fields (shares remaining, trailing anchor,
/// status, realized P&L) and the `fired` flag on each TP level.
pub async fn update_position(db: &SqlitePool, position: &Position) -> Result<()> {
    let mut tx = db.begin().await?;

    let id = position.id.to_string();
    let status = format!("{:?}", position.status).to_lowercase();

    sqlx::query!(
        r#"
        UPDATE positions
        SET shares = ?2, realized_pnl = ?3, exit_fee = ?4, status = ?5,
            trail_pct = ?6, trail_anchor = ?7, closed_at = ?8
        WHERE id = ?1
        "#,
        id,
        position.shares,
        position.realized_pnl,
        position.exit_fee,
        status,
        position.trail_pct,
        position.trail_anchor,
        position.closed_at,
    )
    .execute(&mut *tx)
    .await?;

    for (idx, level) in position.tp_levels.iter().enumerate() {
        let idx = idx as i64;
        let fired = level.fired as i64;
        sqlx::query!(
            r#"
            UPDATE position_tp_levels SET fired = ?3
            WHERE position_id = ?1 AND level_index = ?2
            "#,
            id,
            idx,
            fired,
        )
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

struct PositionRow {
    id: String,
    market_id: String,
    token_id: String,
    outcome: String,
    side: String,
    entry_price: f64,
    shares: f64,
    entry_shares: f64,
    entry_fee: f64,
    exit_fee: f64,
    realized_pnl: f64,
    status: String,
    strategy: String,
    source_wallet: Option<String>,
    sl_price: Option<f64>,
    trail_pct: Option<f64>,
    trail_anchor: Option<f64>,
    opened_at: chrono::DateTime<Utc>,
    closed_at: Option<chrono::DateTime<Utc>>,
}

async fn load_tp_levels(db: &SqlitePool, position_id: &str) -> Result<Vec<TpLevel>> {
    let rows = sqlx::query!(
        r#"SELECT trigger_price, fraction_to_sell, fired FROM position_tp_levels
           WHERE position_id = ?1 ORDER BY level_index ASC"#,
        position_id,
    )
    .fetch_all(db)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| TpLevel {
            trigger_price: r.trigger_price,
            fraction_to_sell: r.fraction_to_sell,
            fired: r.fired != 0,
        })
        .collect())
}

fn hydrate(row: PositionRow, tp_levels: Vec<TpLevel>) -> Position {
    Position {
        id: row.id.parse().unwrap_or_default(),
        market_id: row.market_id,
        token_id: row.token_id,
        outcome: parse_outcome(&row.outcome),
        side: parse_position_side(&row.side),
        entry_price: row.entry_price,
        shares: row.shares,
        entry_shares: row.entry_shares,
        entry_fee: row.entry_fee,
        exit_fee: row.exit_fee,
        realized_pnl: row.realized_pnl,
        status: parse_position_status(&row.status),
        strategy: parse_strategy(&row.strategy),
        source_wallet: row.source_wallet,
        tp_levels,
        sl_price: row.sl_price,
        trail_pct: row.trail_pct,
        trail_anchor: row.trail_anchor,
        opened_at: row.opened_at,
        closed_at: row.closed_at,
    }
}

/// All positions not yet fully closed (`open` or `closing`). The Position
/// Manager reloads this set once at startup to rebuild its working memory.
pub async fn open_positions(db: &SqlitePool) -> Result<Vec<Position>> {
    let rows = sqlx::query_as!(
        PositionRow,
        r#"
        SELECT id, market_id, token_id, outcome, side, entry_price, shares,
               entry_shares, entry_fee, exit_fee, realized_pnl, status, strategy,
               source_wallet, sl_price, trail_pct, trail_anchor, opened_at, closed_at
        FROM positions WHERE status IN ('open', 'closing')
        "#
    )
    .fetch_all(db)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let levels = load_tp_levels(db, &row.id).await?;
        out.push(hydrate(row, levels));
    }
    Ok(out)
}

/// Reads the persisted kill-switch singleton. Called once at startup — the
/// in-memory value is authoritative afterward until `set_kill_switch` is
/// called again, which updates both.
pub async fn risk_state(db: &SqlitePool) -> Result<RiskState> {
    let row = sqlx::query!(
        r#"SELECT kill_switch_active, activated_at, reason FROM risk_state WHERE id = 0"#
    )
    .fetch_one(db)
    .await?;

    Ok(RiskState {
        kill_switch_active: row.kill_switch_active != 0,
        activated_at: row.activated_at,
        reason: row.reason,
    })
}

/// Activates or clears the kill switch. This is the only mutation path for
/// `risk_state` — callers must not cache `kill_switch_active` across calls.
pub async fn set_kill_switch(db: &SqlitePool, active: bool, reason: Option<&str>) -> Result<()> {
    let active_i = active as i64;
    let activated_at = if active { Some(Utc::now()) } else { None };

    sqlx::query!(
        r#"UPDATE risk_state SET kill_switch_active = ?1, activated_at = ?2, reason = ?3 WHERE id = 0"#,
        active_i,
        activated_at,
        reason,
    )
    .execute(db)
    .await?;

    Ok(())
}

/// Adds to today's realized P&L accumulator (UTC day boundary), creating
/// the row if this is the first realized trade of the day.
pub async fn add_realized_pnl_today(db: &SqlitePool, delta_usd: f64) -> Result<()> {
    let day = Utc::now().format("%Y-%m-%d").to_string();

    sqlx::query!(
        r#"
        INSERT INTO daily_pnl (day, realized_pnl_usd) VALUES (?1, ?2)
        ON CONFLICT(day) DO UPDATE SET realized_pnl_usd = realized_pnl_usd + ?2
        "#,
        day,
        delta_usd,
    )
    .execute(db)
    .await?;

    Ok(())
}

/// Today's accumulated realized P&L, used by the Risk Gate's daily loss
/// limit check.
pub async fn realized_pnl_today(db: &SqlitePool) -> Result<f64> {
    let day = Utc::now().format("%Y-%m-%d").to_string();

    let row = sqlx::query!(
        r#"SELECT realized_pnl_usd FROM daily_pnl WHERE day = ?1"#,
        day,
    )
    .fetch_optional(db)
    .await?;

    Ok(row.map(|r| r.realized_pnl_usd).unwrap_or(0.0))
}

/// Appends a line to the risk event audit log — distinct from the
/// broadcast `RiskEvent` channel, this is the durable record.
pub async fn log_risk_event(db: &SqlitePool, kind: &str, detail: &str) -> Result<()> {
    let now = Utc::now();
    sqlx::query!(
        r#"INSERT INTO risk_events (kind, detail, occurred_at) VALUES (?1, ?2, ?3)"#,
        kind,
        detail,
        now,
    )
    .execute(db)
    .await?;
    Ok(())
}

/// Upserts the latest snapshot of a tracked wallet's holding, returning the
/// previous snapshot (if any) so the caller can diff for new/increased
/// positions.
pub async fn upsert_whale_position(
    db: &SqlitePool,
    pos: &WhalePosition,
) -> Result<Option<WhalePosition>> {
    let previous = sqlx::query!(
        r#"SELECT shares, avg_price, last_seen_at FROM whale_positions
           WHERE wallet_addr = ?1 AND market_id = ?2 AND token_id = ?3"#,
        pos.wallet_addr,
        pos.market_id,
        pos.token_id,
    )
    .fetch_optional(db)
    .await?
    .map(|r| WhalePosition {
        wallet_addr: pos.wallet_addr.clone(),
        market_id: pos.market_id.clone(),
        token_id: pos.token_id.clone(),
        shares: r.shares,
        avg_price: r.avg_price,
        last_seen_at: r.last_seen_at,
    });

    sqlx::query!(
        r#"
        INSERT INTO whale_positions (wallet_addr, market_id, token_id, shares, avg_price, last_seen_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(wallet_addr, market_id, token_id)
        DO UPDATE SET shares = ?4, avg_price = ?5, last_seen_at = ?6
        "#,
        pos.wallet_addr,
        pos.market_id,
        pos.token_id,
        pos.shares,
        pos.avg_price,
        pos.last_seen_at,
    )
    .execute(db)
    .await?;

    Ok(previous)
}

/// Sum of `size_usd` across every currently-resting stink bid, used to
/// enforce the strategy's portfolio-wide allocation cap before placing a
/// new one.
pub async fn total_stink_notional(db: &SqlitePool) -> Result<f64> {
    let row = sqlx::query!(r#"SELECT COALESCE(SUM(size_usd), 0.0) AS "total!: f64" FROM stink_orders"#)
        .fetch_one(db)
        .await?;
    Ok(row.total)
}

/// Returns the single resting stink order for `(market_id, token_id)`, if any.
pub async fn stink_order(
    db: &SqlitePool,
    market_id: &str,
    token_id: &str,
) -> Result<Option<StinkOrder>> {
    let row = sqlx::query!(
        r#"SELECT exchange_order_id, price, size_usd, placed_at FROM stink_orders
           WHERE market_id = ?1 AND token_id = ?2"#,
        market_id,
        token_id,
    )
    .fetch_optional(db)
    .await?;

    Ok(row.map(|r| StinkOrder {
        market_id: market_id.to_string(),
        token_id: token_id.to_string(),
        exchange_order_id: r.exchange_order_id,
        price: r.price,
        size_usd: r.size_usd,
        placed_at: r.placed_at,
    }))
}

pub async fn upsert_stink_order(db: &SqlitePool, order: &StinkOrder) -> Result<()> {
    sqlx::query!(
        r#"
        INSERT INTO stink_orders (market_id, token_id, exchange_order_id, price, size_usd, placed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(market_id, token_id)
        DO UPDATE SET exchange_order_id = ?3, price = ?4, size_usd = ?5, placed_at = ?6
        "#,
        order.market_id,
        order.token_id,
        order.exchange_order_id,
        order.price,
        order.size_usd,
        order.placed_at,
    )
    .execute(db)
    .await?;
    Ok(())
}

pub async fn delete_stink_order(db: &SqlitePool, market_id: &str, token_id: &str) -> Result<()> {
    sqlx::query!(
        r#"DELETE FROM stink_orders WHERE market_id = ?1 AND token_id = ?2"#,
        market_id,
        token_id,
    )
    .execute(db)
    .await?;
    Ok(())
}

struct OrderRow {
    id: String,
    exchange_order_id: Option<String>,
    signal_id: String,
    market_id: String,
    token_id: String,
    side: String,
    size_shares: f64,
    price: f64,
    order_type: String,
    status: String,
    filled_shares: f64,
    avg_fill_price: f64,
    fee_paid: f64,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl From<OrderRow> for Order {
    fn from(row: OrderRow) -> Self {
        Order {
            id: row.id.parse().unwrap_or_default(),
            exchange_order_id: row.exchange_order_id,
            signal_id: row.signal_id.parse().unwrap_or_default(),
            market_id: row.market_id,
            token_id: row.token_id,
            side: parse_side(&row.side),
            size_shares: row.size_shares,
            price: row.price,
            order_type: parse_order_type(&row.order_type),
            status: parse_order_status(&row.status),
            filled_shares: row.filled_shares,
            avg_fill_price: row.avg_fill_price,
            fee_paid: row.fee_paid,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Orders for one market, most recent first, for the dashboard's trade
/// history view.
pub async fn orders_for_market(
    db: &SqlitePool,
    market_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<Order>> {
    let rows = sqlx::query_as!(
        OrderRow,
        r#"
        SELECT id, exchange_order_id, signal_id, market_id, token_id, side,
               size_shares, price, order_type, status, filled_shares,
               avg_fill_price, fee_paid, created_at, updated_at
        FROM orders WHERE market_id = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3
        "#,
        market_id,
        limit,
        offset,
    )
    .fetch_all(db)
    .await?;

    Ok(rows.into_iter().map(Order::from).collect())
}

/// All orders, most recent first, paginated for the dashboard.
pub async fn recent_orders(db: &SqlitePool, limit: i64, offset: i64) -> Result<Vec<Order>> {
    let rows = sqlx::query_as!(
        OrderRow,
        r#"
        SELECT id, exchange_order_id, signal_id, market_id, token_id, side,
               size_shares, price, order_type, status, filled_shares,
               avg_fill_price, fee_paid, created_at, updated_at
        FROM orders ORDER BY created_at DESC LIMIT ?1 OFFSET ?2
        "#,
        limit,
        offset,
    )
    .fetch_all(db)
    .await?;

    Ok(rows.into_iter().map(Order::from).collect())
}

/// Positions closed or resolved within the lookback window, oldest first,
/// for the equity-curve / win-rate calculation in `/api/performance`.
pub async fn closed_positions_since(
    db: &SqlitePool,
    since: chrono::DateTime<Utc>,
) -> Result<Vec<Position>> {
    let rows = sqlx::query_as!(
        PositionRow,
        r#"
        SELECT id, market_id, token_id, outcome, side, entry_price, shares,
               entry_shares, entry_fee, exit_fee, realized_pnl, status, strategy,
               source_wallet, sl_price, trail_pct, trail_anchor, opened_at, closed_at
        FROM positions
        WHERE status IN ('closed', 'resolved') AND closed_at >= ?1
        ORDER BY closed_at ASC
        "#,
        since,
    )
    .fetch_all(db)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let levels = load_tp_levels(db, &row.id).await?;
        out.push(hydrate(row, levels));
    }
    Ok(out)
}
