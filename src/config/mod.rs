//! Configuration management for the bracket guard.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::bracket::RetryPolicy;
use crate::risk::{BaseRiskSettings, MarginStopConfig, MarketRegime, RiskMode};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Base risk settings and defaults for resolution
    #[serde(default)]
    pub risk: RiskSettings,
    /// Margin P&L stop/take-profit thresholds
    #[serde(default)]
    pub margin_stop: MarginStopConfig,
    /// Reconciliation loop parameters
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    /// Cascade cancellation retry policy
    #[serde(default)]
    pub cancellation: CancellationConfig,
    /// SQLite storage
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSettings {
    /// Strategy base settings before regime/budget adjustment
    #[serde(default)]
    pub base: BaseRiskSettings,
    /// Conservative/aggressive sub-mode
    #[serde(default)]
    pub mode: RiskMode,
    /// Regime assumed when no classifier output is available
    #[serde(default)]
    pub regime: MarketRegime,
    /// Account leverage (>= 1)
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Account the brackets belong to
    #[serde(default = "default_account")]
    pub account: String,
    /// Seconds between reconciliation passes
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Seconds a member order may stay unresolvable before the group is orphaned
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Symbols polled concurrently per pass (exchange rate limit)
    #[serde(default = "default_max_concurrent_symbols")]
    pub max_concurrent_symbols: usize,
    /// Timeout for every exchange call, in milliseconds
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationConfig {
    /// Cancel attempts per sibling before escalating to orphaned
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

// Default value functions
fn default_leverage() -> Decimal {
    Decimal::new(3, 0) // 3x
}

fn default_account() -> String {
    "default".to_string()
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_grace_period_secs() -> u64 {
    120
}

fn default_max_concurrent_symbols() -> usize {
    4
}

fn default_call_timeout_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/brackets.db")
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("bracket-guard").required(false))
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("BRACKET"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.risk.leverage >= Decimal::ONE,
            "leverage must be at least 1"
        );

        anyhow::ensure!(
            self.margin_stop.stop_loss_pct >= Decimal::ZERO
                && self.margin_stop.take_profit_pct >= Decimal::ZERO,
            "margin stop thresholds must be non-negative"
        );

        anyhow::ensure!(
            self.reconciliation.poll_interval_secs > 0,
            "poll_interval_secs must be positive"
        );

        anyhow::ensure!(
            self.reconciliation.max_concurrent_symbols > 0,
            "max_concurrent_symbols must be positive"
        );

        anyhow::ensure!(
            self.reconciliation.call_timeout_ms > 0,
            "call_timeout_ms must be positive"
        );

        anyhow::ensure!(
            self.cancellation.max_attempts >= 1,
            "cancellation max_attempts must be at least 1"
        );

        anyhow::ensure!(
            self.cancellation.initial_backoff_ms <= self.cancellation.max_backoff_ms,
            "initial_backoff_ms must not exceed max_backoff_ms"
        );

        anyhow::ensure!(
            !self.reconciliation.account.is_empty(),
            "reconciliation account must not be empty"
        );

        Ok(())
    }
}

impl ReconciliationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl CancellationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.backoff_multiplier,
        }
    }
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            base: BaseRiskSettings::default(),
            mode: RiskMode::default(),
            regime: MarketRegime::default(),
            leverage: default_leverage(),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            account: default_account(),
            poll_interval_secs: default_poll_interval_secs(),
            grace_period_secs: default_grace_period_secs(),
            max_concurrent_symbols: default_max_concurrent_symbols(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_ok!(config.validate());
        assert_eq!(config.reconciliation.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.margin_stop.stop_loss_pct, dec!(35));
    }

    #[test]
    fn test_invalid_leverage_rejected() {
        let mut config = Config::default();
        config.risk.leverage = dec!(0.5);
        assert_err!(config.validate());
    }

    #[test]
    fn test_backoff_order_enforced() {
        let mut config = Config::default();
        config.cancellation.initial_backoff_ms = 10_000;
        assert_err!(config.validate());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: Config = config::Config::builder()
            .add_source(config::File::from_str(
                "[reconciliation]\npoll_interval_secs = 3\n\n[risk]\nmode = \"conservative\"\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(parsed.reconciliation.poll_interval_secs, 3);
        assert_eq!(parsed.reconciliation.grace_period_secs, 120);
        assert_eq!(parsed.risk.mode, RiskMode::Conservative);
        assert_eq!(parsed.risk.base.max_daily_loss, dec!(0.03));
        assert_eq!(parsed.cancellation.retry_policy().max_attempts, 5);
    }
}
