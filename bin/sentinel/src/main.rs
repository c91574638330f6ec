use std::collections::HashSet;
use std::sync::Arc;

use clap::Parser;
use secrecy::ExposeSecret;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{Config, ExchangeClient, PortfolioSnapshot, Position, TradingMode};
use engine::{ClobClient, ClobRateLimiter, Engine, OrderManager, PositionManager, RateLimiterConfig};
use paper::PaperClient;
use risk::{KillSwitch, RiskConfig, RiskManager};
use strategy::arb::ArbStrategy;
use strategy::copy::CopyStrategy;
use strategy::stink::StinkStrategy;
use strategy::{run_strategy, StrategyFileConfig};
use telegram_ctrl::commands::{run_alert_forwarder, run_daily_summary, BotDeps};

const INITIAL_PAPER_BALANCE_USD: f64 = 10_000.0;

#[derive(Parser)]
#[command(name = "sentinel", about = "Automated Polymarket trading bot")]
struct Cli {
    /// Force live trading regardless of TRADING_MODE in the environment.
    #[arg(long)]
    live: bool,

    /// Print current engine/kill-switch status from the database and exit.
    #[arg(long)]
    status: bool,

    /// Activate the kill switch and exit. Works in paper mode too.
    #[arg(long)]
    kill: bool,

    /// Tracing log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let cfg = Config::from_env();
    let trading_mode = if cli.live { TradingMode::Live } else { cfg.trading_mode };
    info!(mode = %trading_mode, "Sentinel starting");

    let db = match common::store::connect(&cfg.database_url).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "failed to connect to database");
            std::process::exit(1);
        }
    };
    if let Err(e) = sqlx::migrate!("../../migrations").run(&db).await {
        error!(error = %e, "database migration failed");
        std::process::exit(1);
    }

    if cli.status {
        run_status(&db).await;
        return;
    }
    if cli.kill {
        run_kill(&cfg, &db, trading_mode).await;
        return;
    }

    if let Err(e) = run(cfg, trading_mode, db).await {
        error!(error = %e, "startup failed");
        std::process::exit(1);
    }

    info!("shutdown signal received, exiting");
}

fn init_logging(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// `--status`: read-only summary, no engine spun up.
async fn run_status(db: &SqlitePool) {
    let risk_state = common::store::risk_state(db).await.unwrap_or_default();
    let open = common::store::open_positions(db).await.unwrap_or_default();
    let realized_today = common::store::realized_pnl_today(db).await.unwrap_or(0.0);

    println!(
        "Kill switch: {}",
        if risk_state.kill_switch_active { "ACTIVE" } else { "clear" }
    );
    println!("Open positions: {}", open.len());
    println!("Realized PnL today: ${realized_today:.2}");
}

fn build_live_client(cfg: &Config) -> ClobClient {
    let limiter = Arc::new(ClobRateLimiter::new(RateLimiterConfig::default()));
    ClobClient::new(
        cfg.clob_base_url.clone(),
        cfg.clob_api_key.clone(),
        cfg.clob_api_secret.clone(),
        cfg.clob_api_passphrase.clone(),
        cfg.wallet_address.clone(),
        limiter,
    )
}

/// `--kill`: activates the kill switch directly against the database and
/// the configured exchange client, independent of a running engine process.
async fn run_kill(cfg: &Config, db: &SqlitePool, trading_mode: TradingMode) {
    let client: Arc<dyn ExchangeClient> = match trading_mode {
        TradingMode::Live => Arc::new(build_live_client(cfg)),
        TradingMode::Paper => Arc::new(PaperClient::new(INITIAL_PAPER_BALANCE_USD, cfg.paper_slippage_bps)),
    };
    let engine_state = Arc::new(RwLock::new(common::EngineState::Running));
    let (risk_event_tx, _rx) = mpsc::channel(8);

    let kill = match KillSwitch::load(db.clone(), client, engine_state, risk_event_tx).await {
        Ok(k) => k,
        Err(e) => {
            error!(error = %e, "failed to load kill switch");
            std::process::exit(1);
        }
    };

    if let Err(e) = kill.activate("manual kill via CLI".to_string()).await {
        error!(error = %e, "failed to activate kill switch");
        std::process::exit(1);
    }
    println!("Kill switch activated.");
}

async fn run(cfg: Config, trading_mode: TradingMode, db: SqlitePool) -> common::Result<()> {
    let strategy_file = StrategyFileConfig::load(&cfg.strategy_config_path);
    let risk_cfg = if std::path::Path::new(&cfg.risk_config_path).exists() {
        RiskConfig::load(&cfg.risk_config_path)
    } else {
        RiskConfig::default()
    };

    // Market universe: configured arb + stink markets, deduplicated. Read
    // through a dedicated public CLOB client — market/orderbook data is
    // public regardless of trading mode, so paper mode mirrors the real
    // market set rather than inventing its own.
    let market_reader = build_live_client(&cfg);
    let market_ids: Vec<String> = {
        let mut seen = HashSet::new();
        strategy_file
            .arb
            .markets
            .iter()
            .chain(strategy_file.stink.markets.iter())
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect()
    };

    let mut markets = Vec::new();
    for market_id in &market_ids {
        match market_reader.market(market_id).await {
            Ok(m) => markets.push(m),
            Err(e) => warn!(market_id, error = %e, "failed to fetch market info at startup"),
        }
    }

    let token_ids: Vec<String> = markets
        .iter()
        .flat_map(|m| vec![m.yes_token_id.clone(), m.no_token_id.clone()])
        .collect();

    // ── Engine (price-stream lifecycle + pause/resume state) ──────────────
    let (engine, engine_handle) = Engine::new(cfg.clob_ws_url.clone(), token_ids);

    // ── Exchange client used for order flow ────────────────────────────────
    let exchange_client: Arc<dyn ExchangeClient> = match trading_mode {
        TradingMode::Live => Arc::new(build_live_client(&cfg)),
        TradingMode::Paper => {
            let paper = Arc::new(PaperClient::new(INITIAL_PAPER_BALANCE_USD, cfg.paper_slippage_bps));
            for market in &markets {
                paper.register_market(market.clone()).await;
            }

            // Mirror the broadcast price stream into the paper client's
            // synthetic orderbook. Only covers tokens known at startup —
            // copy trading's dynamically-discovered wallet tokens have no
            // live price feed in paper mode.
            let mut price_rx = engine_handle.subscribe_prices();
            let paper_prices = paper.clone();
            tokio::spawn(async move {
                loop {
                    match price_rx.recv().await {
                        Ok(event) => paper_prices.update_price(&event.token_id, event.price).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            paper
        }
    };

    // ── Shared state ────────────────────────────────────────────────────────
    let engine_state = engine_handle.state_handle();
    let paused_strategies = engine_handle.paused_strategies_handle();
    let open_positions: Arc<RwLock<Vec<Position>>> = Arc::new(RwLock::new(Vec::new()));
    let portfolio: Arc<RwLock<Option<PortfolioSnapshot>>> = Arc::new(RwLock::new(None));
    let strategy_ready = Arc::new(RwLock::new(HashSet::new()));

    // ── Channels ─────────────────────────────────────────────────────────────
    let (signal_tx, signal_rx) = mpsc::channel(128);
    let (exit_tx, exit_rx) = mpsc::channel(128);
    let (order_tx, order_rx) = mpsc::channel(128);
    let (approved_signal_tx, approved_signal_rx) = mpsc::channel(128);
    let (risk_event_tx, risk_event_rx) = mpsc::channel(64);
    let (position_fill_tx, position_fill_rx) = mpsc::channel(64);

    // ── Kill switch ──────────────────────────────────────────────────────────
    let kill = Arc::new(
        KillSwitch::load(db.clone(), exchange_client.clone(), engine_state.clone(), risk_event_tx.clone())
            .await?,
    );

    // ── Position manager ─────────────────────────────────────────────────────
    let position_manager = PositionManager::load(
        db.clone(),
        exchange_client.clone(),
        engine_handle.subscribe_prices(),
        position_fill_rx,
        exit_tx.clone(),
        risk_event_tx.clone(),
        open_positions.clone(),
        portfolio.clone(),
    )
    .await?;

    // ── Risk manager ─────────────────────────────────────────────────────────
    let risk_manager = RiskManager::new(
        risk_cfg,
        db.clone(),
        signal_rx,
        exit_rx,
        order_tx,
        approved_signal_tx,
        risk_event_tx.clone(),
        kill.clone(),
        portfolio.clone(),
        open_positions.clone(),
    );

    // ── Order manager ────────────────────────────────────────────────────────
    let order_manager = OrderManager::new(
        order_rx,
        risk_event_tx.clone(),
        position_fill_tx,
        exchange_client.clone(),
        db.clone(),
    );

    // ── Strategies ───────────────────────────────────────────────────────────
    let mut enabled_strategies = Vec::new();

    if strategy_file.copy.enabled {
        let strategy = CopyStrategy::new(
            exchange_client.clone(),
            db.clone(),
            strategy_file.copy.clone(),
            open_positions.clone(),
        );
        enabled_strategies.push(common::StrategyKind::Copy);
        tokio::spawn(run_strategy(
            Box::new(strategy),
            signal_tx.clone(),
            engine_state.clone(),
            paused_strategies.clone(),
            strategy_ready.clone(),
        ));
    }
    if strategy_file.arb.enabled {
        let strategy = ArbStrategy::new(exchange_client.clone(), strategy_file.arb.clone());
        enabled_strategies.push(common::StrategyKind::Arb);
        tokio::spawn(run_strategy(
            Box::new(strategy),
            signal_tx.clone(),
            engine_state.clone(),
            paused_strategies.clone(),
            strategy_ready.clone(),
        ));
    }
    if strategy_file.stink.enabled {
        let strategy = StinkStrategy::new(exchange_client.clone(), db.clone(), strategy_file.stink.clone());
        enabled_strategies.push(common::StrategyKind::Stink);
        tokio::spawn(run_strategy(
            Box::new(strategy),
            signal_tx.clone(),
            engine_state.clone(),
            paused_strategies.clone(),
            strategy_ready.clone(),
        ));
    }

    // ── Telegram control surface ─────────────────────────────────────────────
    let command_forward = {
        let handle = engine_handle.clone();
        let (tx, mut rx) = mpsc::channel::<common::EngineCommand>(32);
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                handle.send(cmd).await;
            }
        });
        tx
    };

    let bot_deps = BotDeps {
        command_tx: command_forward,
        engine_state: engine_state.clone(),
        trading_mode,
        allowed_user_ids: Arc::new(cfg.telegram_allowed_user_ids.clone()),
        db: db.clone(),
        kill: kill.clone(),
        kill_confirmation_token: Arc::new(cfg.kill_confirmation_token_exposed().to_string()),
    };

    let telegram_token = cfg.telegram_token.expose_secret().to_string();
    let telegram_bot = teloxide::Bot::new(telegram_token.clone());
    let chat_ids: Vec<teloxide::types::ChatId> = cfg
        .telegram_allowed_user_ids
        .iter()
        .map(|&id| teloxide::types::ChatId(id))
        .collect();

    tokio::spawn(run_alert_forwarder(telegram_bot.clone(), chat_ids.clone(), risk_event_rx));
    tokio::spawn(run_daily_summary(telegram_bot, chat_ids, db.clone(), cfg.daily_summary_hour_utc));
    tokio::spawn(telegram_ctrl::start_bot(telegram_token, bot_deps));

    // ── Portfolio snapshotter ────────────────────────────────────────────────
    {
        let client = exchange_client.clone();
        let db = db.clone();
        let portfolio = portfolio.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let (cash, positions) = tokio::join!(client.balance_usd(), client.positions());
                let cash_usd = match cash {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "failed to refresh balance for portfolio snapshot");
                        continue;
                    }
                };
                let positions_value_usd: f64 = positions
                    .unwrap_or_default()
                    .iter()
                    .map(|p| p.shares * p.avg_price)
                    .sum();
                let realized_today = common::store::realized_pnl_today(&db).await.unwrap_or(0.0);

                *portfolio.write().await = Some(PortfolioSnapshot {
                    cash_usd,
                    positions_value_usd,
                    total_usd: cash_usd + positions_value_usd,
                    unrealized_pnl_usd: 0.0,
                    realized_pnl_today_usd: realized_today,
                    as_of: chrono::Utc::now(),
                });
            }
        });
    }

    // ── Dashboard API ────────────────────────────────────────────────────────
    let initial_balance = exchange_client.balance_usd().await.unwrap_or(INITIAL_PAPER_BALANCE_USD);
    let (log_tx, _) = tokio::sync::broadcast::channel::<String>(1024);
    let api_state = api::AppState {
        db: db.clone(),
        engine_state: engine_state.clone(),
        trading_mode,
        dashboard_token: cfg.dashboard_token_exposed().to_string(),
        initial_balance,
        log_tx,
        log_buffer: api::LogBuffer::new(500),
        ws_connected: Arc::new(std::sync::atomic::AtomicBool::new(engine_handle.ws_connected())),
        adapter_connected: Arc::new(std::sync::atomic::AtomicBool::new(true)),
        enabled_strategies: enabled_strategies.clone(),
        strategy_ready: strategy_ready.clone(),
        kill: kill.clone(),
    };

    // ── Spawn the remaining long-running tasks ───────────────────────────────
    tokio::spawn(engine.run());
    tokio::spawn(position_manager.run());
    tokio::spawn(risk_manager.run());
    tokio::spawn(order_manager.run(approved_signal_rx));
    tokio::spawn(api::serve(api_state, cfg.dashboard_port));

    info!(strategies = ?enabled_strategies, "all subsystems started");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| common::Error::Other(e.to_string()))?;
    Ok(())
}
