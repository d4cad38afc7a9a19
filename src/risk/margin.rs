//! Margin P&L thresholds for leveraged positions.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BracketError, Result};
use crate::model::PositionDirection;

/// User-configured margin stop/take-profit thresholds, in percent of posted margin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarginStopConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Stop when leveraged loss reaches this percentage (35 = -35%)
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
    /// Take profit when leveraged gain reaches this percentage; 0 disables
    #[serde(default)]
    pub take_profit_pct: Decimal,
}

fn default_enabled() -> bool {
    true
}

fn default_stop_loss_pct() -> Decimal {
    dec!(35)
}

impl Default for MarginStopConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: Decimal::ZERO,
        }
    }
}

/// Which threshold was crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarginTrigger {
    StopLoss,
    TakeProfit,
}

/// Leveraged P&L evaluation against [`MarginStopConfig`].
pub struct MarginThresholdEvaluator {
    config: MarginStopConfig,
}

impl MarginThresholdEvaluator {
    pub fn new(config: MarginStopConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MarginStopConfig {
        &self.config
    }

    /// Return on posted margin, in percent.
    ///
    /// Long: `(current - entry) / entry * leverage * 100`
    /// Short: `(entry - current) / entry * leverage * 100`
    pub fn leveraged_pnl_percent(
        avg_entry_price: Decimal,
        current_price: Decimal,
        direction: PositionDirection,
        leverage: Decimal,
    ) -> Result<Decimal> {
        if avg_entry_price <= Decimal::ZERO {
            return Err(BracketError::InvalidInput(format!(
                "average entry price must be positive, got {avg_entry_price}"
            )));
        }
        if leverage < Decimal::ONE {
            return Err(BracketError::InvalidInput(format!(
                "leverage must be at least 1, got {leverage}"
            )));
        }

        let move_fraction = match direction {
            PositionDirection::Long => (current_price - avg_entry_price) / avg_entry_price,
            PositionDirection::Short => (avg_entry_price - current_price) / avg_entry_price,
        };

        Ok(move_fraction * leverage * dec!(100))
    }

    /// Evaluate a position against the configured thresholds.
    ///
    /// Returns `None` when disabled or when neither threshold is crossed.
    /// The stop is checked first.
    pub fn evaluate(
        &self,
        avg_entry_price: Decimal,
        current_price: Decimal,
        direction: PositionDirection,
        leverage: Decimal,
    ) -> Result<Option<MarginTrigger>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let pnl = Self::leveraged_pnl_percent(avg_entry_price, current_price, direction, leverage)?;

        debug!(
            entry = %avg_entry_price,
            current = %current_price,
            direction = %direction,
            leverage = %leverage,
            pnl_pct = %pnl.round_dp(4),
            "Evaluated margin P&L"
        );

        if should_trigger_stop(pnl, self.config.stop_loss_pct) {
            return Ok(Some(MarginTrigger::StopLoss));
        }
        if should_trigger_take_profit(pnl, self.config.take_profit_pct) {
            return Ok(Some(MarginTrigger::TakeProfit));
        }
        Ok(None)
    }
}

/// True when the leveraged loss has reached the stop threshold.
///
/// A threshold of 35 triggers at `pnl <= -35`. Non-positive thresholds never trigger.
pub fn should_trigger_stop(pnl_percent: Decimal, stop_threshold_percent: Decimal) -> bool {
    stop_threshold_percent > Decimal::ZERO && pnl_percent <= -stop_threshold_percent
}

/// True when the leveraged gain has reached the take-profit threshold.
pub fn should_trigger_take_profit(pnl_percent: Decimal, take_profit_percent: Decimal) -> bool {
    take_profit_percent > Decimal::ZERO && pnl_percent >= take_profit_percent
}
