use serde::{Deserialize, Serialize};

/// How whale holding size is translated into the bot's own order size.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SizingFactor {
    /// Always trade a fixed USD notional regardless of whale size.
    FixedUsd { amount: f64 },
    /// Trade a percentage of the bot's own portfolio value.
    PctPortfolio { pct: f64 },
    /// Trade a percentage of the whale's own position USD value.
    PctWhale { pct: f64 },
}

impl SizingFactor {
    pub fn size_usd(&self, whale_usd_value: f64, portfolio_usd: f64) -> f64 {
        match self {
            SizingFactor::FixedUsd { amount } => *amount,
            SizingFactor::PctPortfolio { pct } => portfolio_usd * pct,
            SizingFactor::PctWhale { pct } => whale_usd_value * pct,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackedWalletConfig {
    pub addr: String,
    pub name: String,
    pub max_allocation_usd: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CopyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_copy_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_conviction_usd")]
    pub conviction_usd: f64,
    #[serde(default = "default_slippage_pct")]
    pub slippage_pct: f64,
    pub sizing: SizingFactor,
    #[serde(default)]
    pub wallets: Vec<TrackedWalletConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArbConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_arb_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_margin")]
    pub margin: f64,
    #[serde(default = "default_taker_fee_rate")]
    pub taker_fee_rate: f64,
    #[serde(default)]
    pub markets: Vec<String>,
    #[serde(default = "default_leg_size_usd")]
    pub leg_size_usd: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StinkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_stink_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_discount")]
    pub discount: f64,
    #[serde(default = "default_stink_size_usd")]
    pub size_usd: f64,
    #[serde(default = "default_allocation_cap_pct")]
    pub allocation_cap_pct: f64,
    #[serde(default)]
    pub markets: Vec<String>,
}

/// Top-level strategy config file (TOML), loaded from `STRATEGY_CONFIG_PATH`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyFileConfig {
    pub copy: CopyConfig,
    pub arb: ArbConfig,
    pub stink: StinkConfig,
}

impl StrategyFileConfig {
    /// Load from a TOML file. Exits the process on error — a malformed
    /// strategy config has no sensible fallback.
    pub fn load(path: &str) -> Self {
        let content = std::fs::read_to_string(path)
            .unwrap_or_else(|e| panic!("failed to read strategy config at '{path}': {e}"));
        toml::from_str(&content)
            .unwrap_or_else(|e| panic!("failed to parse strategy config at '{path}': {e}"))
    }
}

fn default_true() -> bool {
    true
}
fn default_copy_poll_secs() -> u64 {
    60
}
fn default_arb_poll_secs() -> u64 {
    10
}
fn default_stink_poll_secs() -> u64 {
    300
}
fn default_conviction_usd() -> f64 {
    500.0
}
fn default_slippage_pct() -> f64 {
    0.05
}
fn default_margin() -> f64 {
    0.05
}
fn default_taker_fee_rate() -> f64 {
    0.02
}
fn default_leg_size_usd() -> f64 {
    50.0
}
fn default_discount() -> f64 {
    0.80
}
fn default_stink_size_usd() -> f64 {
    25.0
}
fn default_allocation_cap_pct() -> f64 {
    0.20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_usd_ignores_whale_and_portfolio_size() {
        let factor = SizingFactor::FixedUsd { amount: 250.0 };
        assert_eq!(factor.size_usd(10_000.0, 5_000.0), 250.0);
    }

    #[test]
    fn pct_portfolio_scales_with_own_balance() {
        let factor = SizingFactor::PctPortfolio { pct: 0.02 };
        assert_eq!(factor.size_usd(100_000.0, 5_000.0), 100.0);
    }

    #[test]
    fn pct_whale_scales_with_observed_position() {
        let factor = SizingFactor::PctWhale { pct: 0.1 };
        assert_eq!(factor.size_usd(2_000.0, 5_000.0), 200.0);
    }
}
