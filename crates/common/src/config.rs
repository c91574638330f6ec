use secrecy::{ExposeSecret, SecretString};

use crate::TradingMode;

/// All configuration loaded from environment variables at startup.
/// Missing required variables cause an immediate panic with a clear message
/// — this is intentional fail-fast behavior, there is no sensible default
/// for a missing API key or wallet key.
#[derive(Clone)]
pub struct Config {
    // CLOB credentials (L2 auth — API key/secret/passphrase derived from
    // the L1 wallet signature at setup time, stored directly here).
    pub clob_api_key: String,
    pub clob_api_secret: SecretString,
    pub clob_api_passphrase: SecretString,
    pub clob_base_url: String,
    pub clob_ws_url: String,

    // Wallet used to sign orders / read on-chain balances.
    pub wallet_address: String,
    pub wallet_private_key: SecretString,

    // Telegram control surface
    pub telegram_token: SecretString,
    pub telegram_allowed_user_ids: Vec<i64>,

    // Dashboard
    pub dashboard_token: SecretString,
    pub dashboard_port: u16,

    // Trading
    pub trading_mode: TradingMode,
    pub paper_slippage_bps: f64,

    // Database
    pub database_url: String,

    // Strategy / risk config file paths
    pub strategy_config_path: String,
    pub risk_config_path: String,

    // Tracked wallets for the copy-trading strategy, comma-separated in env.
    pub tracked_wallets: Vec<String>,

    // Kill-switch confirmation token required on the `kill` chat command.
    pub kill_confirmation_token: SecretString,

    // UTC hour (0-23) the Telegram daily summary fires at.
    pub daily_summary_hour_utc: u32,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("clob_api_key", &self.clob_api_key)
            .field("clob_api_secret", &"[redacted]")
            .field("clob_api_passphrase", &"[redacted]")
            .field("clob_base_url", &self.clob_base_url)
            .field("clob_ws_url", &self.clob_ws_url)
            .field("wallet_address", &self.wallet_address)
            .field("wallet_private_key", &"[redacted]")
            .field("telegram_token", &"[redacted]")
            .field("telegram_allowed_user_ids", &self.telegram_allowed_user_ids)
            .field("dashboard_token", &"[redacted]")
            .field("dashboard_port", &self.dashboard_port)
            .field("trading_mode", &self.trading_mode)
            .field("paper_slippage_bps", &self.paper_slippage_bps)
            .field("database_url", &self.database_url)
            .field("strategy_config_path", &self.strategy_config_path)
            .field("risk_config_path", &self.risk_config_path)
            .field("tracked_wallets", &self.tracked_wallets)
            .field("kill_confirmation_token", &"[redacted]")
            .field("daily_summary_hour_utc", &self.daily_summary_hour_utc)
            .finish()
    }
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present. Panics on any missing required variable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let trading_mode = match required_env("TRADING_MODE").to_lowercase().as_str() {
            "paper" => TradingMode::Paper,
            "live" => TradingMode::Live,
            other => panic!("ERROR: TRADING_MODE must be 'paper' or 'live', got: '{other}'"),
        };

        let telegram_allowed_user_ids = required_env("TELEGRAM_ALLOWED_USER_IDS")
            .split(',')
            .map(|s| {
                s.trim().parse::<i64>().unwrap_or_else(|_| {
                    panic!(
                        "TELEGRAM_ALLOWED_USER_IDS contains non-numeric ID: '{}'",
                        s.trim()
                    )
                })
            })
            .collect();

        let tracked_wallets = optional_env("TRACKED_WALLETS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Config {
            clob_api_key: required_env("CLOB_API_KEY"),
            clob_api_secret: SecretString::from(required_env("CLOB_API_SECRET")),
            clob_api_passphrase: SecretString::from(required_env("CLOB_API_PASSPHRASE")),
            clob_base_url: optional_env("CLOB_BASE_URL")
                .unwrap_or_else(|| "https://clob.polymarket.com".to_string()),
            clob_ws_url: optional_env("CLOB_WS_URL")
                .unwrap_or_else(|| "wss://ws-subscriptions-clob.polymarket.com/ws/".to_string()),
            wallet_address: required_env("WALLET_ADDRESS"),
            wallet_private_key: SecretString::from(required_env("WALLET_PRIVATE_KEY")),
            telegram_token: SecretString::from(required_env("TELEGRAM_TOKEN")),
            telegram_allowed_user_ids,
            dashboard_token: SecretString::from(required_env("DASHBOARD_TOKEN")),
            dashboard_port: optional_env("DASHBOARD_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            trading_mode,
            paper_slippage_bps: optional_env("PAPER_SLIPPAGE_BPS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10.0),
            database_url: required_env("DATABASE_URL"),
            strategy_config_path: optional_env("STRATEGY_CONFIG_PATH")
                .unwrap_or_else(|| "config/strategies.toml".to_string()),
            risk_config_path: optional_env("RISK_CONFIG_PATH")
                .unwrap_or_else(|| "config/risk.toml".to_string()),
            tracked_wallets,
            kill_confirmation_token: SecretString::from(required_env("KILL_CONFIRMATION_TOKEN")),
            daily_summary_hour_utc: optional_env("DAILY_SUMMARY_HOUR_UTC")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }

    /// Exposes the dashboard bearer token for comparison against an
    /// incoming `Authorization` header. Only call at the point of
    /// comparison; never store the exposed value.
    pub fn dashboard_token_exposed(&self) -> &str {
        self.dashboard_token.expose_secret()
    }

    /// Exposes the kill-switch confirmation token for comparison against
    /// an operator-supplied `/kill <token>` chat command.
    pub fn kill_confirmation_token_exposed(&self) -> &str {
        self.kill_confirmation_token.expose_secret()
    }
}

fn required_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| {
        panic!("Required environment variable '{key}' is not set. Check your .env file.")
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}
