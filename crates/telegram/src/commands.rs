use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Timelike;
use sqlx::SqlitePool;
use teloxide::{dispatching::UpdateHandler, prelude::*, utils::command::BotCommands};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

use common::{EngineCommand, EngineState, RiskEvent, StrategyKind, TradingMode};
use risk::KillSwitch;

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// How long an identical alert payload is suppressed for after being sent.
const ALERT_DEDUP_WINDOW: Duration = Duration::from_secs(300);

/// Suppresses repeat alerts with the same text within `ALERT_DEDUP_WINDOW`.
/// Health-degradation spam during a flapping connection is the main case
/// this exists for.
#[derive(Default)]
struct AlertDedup {
    last_sent: HashMap<String, Instant>,
}

impl AlertDedup {
    fn allow(&mut self, key: &str) -> bool {
        let now = Instant::now();
        match self.last_sent.get(key) {
            Some(last) if now.duration_since(*last) < ALERT_DEDUP_WINDOW => false,
            _ => {
                self.last_sent.insert(key.to_string(), now);
                true
            }
        }
    }
}

/// Dependencies injected into every handler via `dptree`.
#[derive(Clone)]
pub struct BotDeps {
    pub command_tx: mpsc::Sender<EngineCommand>,
    pub engine_state: Arc<RwLock<EngineState>>,
    pub trading_mode: TradingMode,
    pub allowed_user_ids: Arc<Vec<i64>>,
    pub db: SqlitePool,
    pub kill: Arc<KillSwitch>,
    /// Confirmation token the operator must echo back to `/kill` to arm it.
    pub kill_confirmation_token: Arc<String>,
}

/// Commands exposed to the operator over the out-of-band chat channel.
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Trading bot commands:")]
pub enum Command {
    #[command(description = "Show engine status")]
    Status,
    #[command(description = "Show today's realized PnL and open position count")]
    Pnl,
    #[command(description = "Activate the kill switch — requires the confirmation token")]
    Kill(String),
    #[command(description = "Pause a strategy (copy, arb, stink)")]
    Pause(String),
    #[command(description = "Resume a paused strategy")]
    Resume(String),
}

/// Start the Telegram bot in long-polling mode.
pub async fn start_bot(token: String, deps: BotDeps) {
    let bot = Bot::new(token);
    let deps = Arc::new(deps);

    info!("Telegram control surface starting (long-polling)");

    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![deps])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

fn schema() -> UpdateHandler<Box<dyn std::error::Error + Send + Sync>> {
    use dptree::case;

    let command_handler = teloxide::filter_command::<Command, _>()
        .branch(case![Command::Status].endpoint(handle_status))
        .branch(case![Command::Pnl].endpoint(handle_pnl))
        .branch(case![Command::Kill(token)].endpoint(handle_kill))
        .branch(case![Command::Pause(strategy)].endpoint(handle_pause))
        .branch(case![Command::Resume(strategy)].endpoint(handle_resume));

    Update::filter_message()
        .filter_map(|msg: Message| msg.from().map(|u| u.id))
        .filter_async(auth_filter)
        .branch(command_handler)
}

/// Silently drop messages from users not on the allow-list.
async fn auth_filter(user_id: UserId, deps: Arc<BotDeps>) -> bool {
    let uid = user_id.0 as i64;
    let allowed = deps.allowed_user_ids.contains(&uid);
    if !allowed {
        warn!(user_id = uid, "unauthorized Telegram access attempt");
    }
    allowed
}

async fn handle_status(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    let state = *deps.engine_state.read().await;
    let mode = deps.trading_mode;
    let killed = deps.kill.is_active().await;
    let text = format!(
        "Engine: {state}\n\
         Mode: {mode}\n\
         Kill switch: {}",
        if killed { "ACTIVE" } else { "clear" }
    );
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

async fn handle_pnl(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    let realized_today = common::store::realized_pnl_today(&deps.db).await.unwrap_or(0.0);
    let open = common::store::open_positions(&deps.db).await.unwrap_or_default();

    let text = format!(
        "Realized PnL today: ${realized_today:.2}\n\
         Open positions: {}",
        open.len()
    );
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

async fn handle_kill(bot: Bot, msg: Message, deps: Arc<BotDeps>, token: String) -> HandlerResult {
    if token.trim() != deps.kill_confirmation_token.as_str() {
        bot.send_message(msg.chat.id, "Wrong confirmation token. Kill switch not activated.")
            .await?;
        return Ok(());
    }

    if let Err(e) = deps.kill.activate("manual kill via Telegram".to_string()).await {
        bot.send_message(msg.chat.id, format!("Failed to activate kill switch: {e}")).await?;
        return Ok(());
    }

    bot.send_message(msg.chat.id, "Kill switch activated. All resting orders cancelled.")
        .await?;
    Ok(())
}

async fn handle_pause(bot: Bot, msg: Message, deps: Arc<BotDeps>, strategy: String) -> HandlerResult {
    match parse_strategy(&strategy) {
        Some(kind) => {
            let _ = deps.command_tx.send(EngineCommand::Pause(kind)).await;
            bot.send_message(msg.chat.id, format!("Paused {kind}.")).await?;
        }
        None => {
            bot.send_message(msg.chat.id, format!("Unknown strategy '{strategy}'. Use copy, arb, or stink."))
                .await?;
        }
    }
    Ok(())
}

async fn handle_resume(bot: Bot, msg: Message, deps: Arc<BotDeps>, strategy: String) -> HandlerResult {
    match parse_strategy(&strategy) {
        Some(kind) => {
            let state = *deps.engine_state.read().await;
            if state == EngineState::Halted {
                bot.send_message(msg.chat.id, "Engine is halted by the kill switch; resume has no effect.")
                    .await?;
                return Ok(());
            }
            let _ = deps.command_tx.send(EngineCommand::Resume(kind)).await;
            bot.send_message(msg.chat.id, format!("Resumed {kind}.")).await?;
        }
        None => {
            bot.send_message(msg.chat.id, format!("Unknown strategy '{strategy}'. Use copy, arb, or stink."))
                .await?;
        }
    }
    Ok(())
}

fn parse_strategy(s: &str) -> Option<StrategyKind> {
    match s.trim().to_lowercase().as_str() {
        "copy" => Some(StrategyKind::Copy),
        "arb" => Some(StrategyKind::Arb),
        "stink" => Some(StrategyKind::Stink),
        _ => None,
    }
}

/// Forwards `RiskEvent`s from the engine onto the configured chat IDs as
/// plain-text alerts, deduplicating identical payloads within a window.
/// Intended to run as its own `tokio::spawn`ed task for the lifetime of
/// the process.
pub async fn run_alert_forwarder(
    bot: Bot,
    chat_ids: Vec<ChatId>,
    mut risk_event_rx: mpsc::Receiver<RiskEvent>,
) {
    let dedup = Mutex::new(AlertDedup::default());

    while let Some(event) = risk_event_rx.recv().await {
        let text = match &event {
            RiskEvent::PositionOpened { market_id, strategy, entry_price, shares, .. } => format!(
                "Position opened [{strategy}] {market_id}: {shares:.2} shares @ {entry_price:.4}"
            ),
            RiskEvent::PositionClosed { market_id, realized_pnl, .. } => format!(
                "Position closed {market_id}: realized PnL ${realized_pnl:.2}"
            ),
            RiskEvent::OrderFailed { market_id, error, .. } => {
                format!("Order failed on {market_id}: {error}")
            }
            RiskEvent::KillActivated { reason } => format!("Kill switch activated: {reason}"),
            RiskEvent::RiskWarning { message } => format!("Risk warning: {message}"),
            RiskEvent::HealthDegraded { component, detail } => {
                format!("Health degraded [{component}]: {detail}")
            }
            RiskEvent::SignalRejected { market_id, reason, .. } => {
                format!("Signal rejected on {market_id}: {reason}")
            }
        };

        let mut dedup = dedup.lock().await;
        if !dedup.allow(&text) {
            continue;
        }
        drop(dedup);

        for &chat_id in &chat_ids {
            if let Err(e) = bot.send_message(chat_id, &text).await {
                warn!(?chat_id, error = %e, "failed to send Telegram alert");
            }
        }
    }
}

/// Fires a daily summary once per UTC calendar day at `summary_hour_utc`,
/// comparing against the last UTC date the summary ran to survive process
/// restarts mid-day without re-sending.
pub async fn run_daily_summary(
    bot: Bot,
    chat_ids: Vec<ChatId>,
    db: SqlitePool,
    summary_hour_utc: u32,
) {
    let mut last_sent_date: Option<chrono::NaiveDate> = None;
    let mut ticker = tokio::time::interval(Duration::from_secs(60));

    loop {
        ticker.tick().await;
        let now = chrono::Utc::now();
        if now.hour() != summary_hour_utc {
            continue;
        }
        if last_sent_date == Some(now.date_naive()) {
            continue;
        }

        let realized_today = common::store::realized_pnl_today(&db).await.unwrap_or(0.0);
        let open = common::store::open_positions(&db).await.unwrap_or_default();
        let text = format!(
            "Daily summary ({})\nRealized PnL: ${realized_today:.2}\nOpen positions: {}",
            now.date_naive(),
            open.len()
        );

        for &chat_id in &chat_ids {
            if let Err(e) = bot.send_message(chat_id, &text).await {
                warn!(?chat_id, error = %e, "failed to send daily summary");
            }
        }

        last_sent_date = Some(now.date_naive());
    }
}
