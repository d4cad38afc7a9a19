//! Dynamic risk profile resolution.
//!
//! Turns a strategy's base risk settings into the effective [`RiskConfig`]
//! for the current market regime, daily loss budget, realized volatility and
//! risk mode. Adjustments are multiplicative and applied in a fixed order:
//! regime, daily-loss budget, volatility, mode, then hard clamps.

use chrono::Duration;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{BracketError, Result};

// Hard output bounds
pub const DAILY_LOSS_BOUNDS: (Decimal, Decimal) = (dec!(0.005), dec!(0.10));
pub const POSITION_SIZE_BOUNDS: (Decimal, Decimal) = (dec!(0.005), dec!(0.20));
pub const STOP_MULTIPLIER_BOUNDS: (Decimal, Decimal) = (dec!(1.1), dec!(3.0));
pub const TAKE_PROFIT_MULTIPLIER_BOUNDS: (Decimal, Decimal) = (dec!(1.5), dec!(5.0));
pub const MAX_HOLD_HOURS_BOUNDS: (Decimal, Decimal) = (dec!(1), dec!(168));

const HIGH_VOLATILITY_THRESHOLD: Decimal = dec!(0.08);
const LOW_VOLATILITY_THRESHOLD: Decimal = dec!(0.03);
const MIN_BUDGET_SCALE: Decimal = dec!(0.3);

/// Market environment classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    HighVolatility,
    StrongTrend,
    Oscillation,
    Sideways,
    #[default]
    Normal,
}

/// Per-regime multiplier table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeMultipliers {
    pub max_daily_loss: Decimal,
    pub max_position_size: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub max_hold: Decimal,
}

impl RegimeMultipliers {
    const NEUTRAL: Self = Self {
        max_daily_loss: Decimal::ONE,
        max_position_size: Decimal::ONE,
        stop_loss: Decimal::ONE,
        take_profit: Decimal::ONE,
        max_hold: Decimal::ONE,
    };
}

impl MarketRegime {
    /// Multipliers applied to the base settings in this regime.
    pub fn multipliers(&self) -> RegimeMultipliers {
        let n = RegimeMultipliers::NEUTRAL;
        match self {
            MarketRegime::HighVolatility => RegimeMultipliers {
                max_daily_loss: dec!(0.7),
                max_position_size: dec!(0.8),
                stop_loss: dec!(0.9),
                max_hold: dec!(0.8),
                ..n
            },
            MarketRegime::StrongTrend => RegimeMultipliers {
                max_position_size: dec!(0.9),
                stop_loss: dec!(1.2),
                take_profit: dec!(1.1),
                ..n
            },
            MarketRegime::Oscillation => RegimeMultipliers {
                max_position_size: dec!(1.1),
                stop_loss: dec!(0.9),
                max_hold: dec!(1.2),
                ..n
            },
            MarketRegime::Sideways => RegimeMultipliers {
                max_position_size: dec!(0.9),
                max_hold: dec!(1.3),
                ..n
            },
            MarketRegime::Normal => n,
        }
    }

    /// Widening applied to the stop distance in this regime.
    pub fn stop_distance_amplifier(&self) -> Decimal {
        match self {
            MarketRegime::HighVolatility => dec!(1.2),
            MarketRegime::StrongTrend => dec!(1.5),
            MarketRegime::Oscillation | MarketRegime::Sideways | MarketRegime::Normal => {
                Decimal::ONE
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::HighVolatility => "high_volatility",
            MarketRegime::StrongTrend => "strong_trend",
            MarketRegime::Oscillation => "oscillation",
            MarketRegime::Sideways => "sideways",
            MarketRegime::Normal => "normal",
        }
    }
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketRegime {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "high_volatility" => Ok(MarketRegime::HighVolatility),
            "strong_trend" => Ok(MarketRegime::StrongTrend),
            "oscillation" => Ok(MarketRegime::Oscillation),
            "sideways" => Ok(MarketRegime::Sideways),
            "normal" | "default" => Ok(MarketRegime::Normal),
            other => Err(format!("unknown market regime: {other}")),
        }
    }
}

/// Conservative/aggressive risk sub-mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskMode {
    #[default]
    Normal,
    Conservative,
    Aggressive,
}

impl RiskMode {
    /// (position, stop, hold) multipliers.
    fn multipliers(&self) -> (Decimal, Decimal, Decimal) {
        match self {
            RiskMode::Normal => (Decimal::ONE, Decimal::ONE, Decimal::ONE),
            RiskMode::Conservative => (dec!(0.8), dec!(0.9), dec!(1.2)),
            RiskMode::Aggressive => (dec!(1.2), dec!(1.1), dec!(0.8)),
        }
    }
}

impl FromStr for RiskMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "normal" => Ok(RiskMode::Normal),
            "conservative" => Ok(RiskMode::Conservative),
            "aggressive" => Ok(RiskMode::Aggressive),
            other => Err(format!("unknown risk mode: {other}")),
        }
    }
}

/// Strategy-level base risk settings, as fractions of account equity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaseRiskSettings {
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: Decimal,
    #[serde(default = "default_max_position_size")]
    pub max_position_size: Decimal,
    #[serde(default = "default_stop_loss_multiplier")]
    pub stop_loss_multiplier: Decimal,
    #[serde(default = "default_take_profit_multiplier")]
    pub take_profit_multiplier: Decimal,
    #[serde(default = "default_max_hold_hours")]
    pub max_hold_hours: Decimal,
}

fn default_max_daily_loss() -> Decimal {
    dec!(0.03)
}

fn default_max_position_size() -> Decimal {
    dec!(0.05)
}

fn default_stop_loss_multiplier() -> Decimal {
    dec!(1.5)
}

fn default_take_profit_multiplier() -> Decimal {
    dec!(2.0)
}

fn default_max_hold_hours() -> Decimal {
    dec!(24)
}

impl Default for BaseRiskSettings {
    fn default() -> Self {
        Self {
            max_daily_loss: default_max_daily_loss(),
            max_position_size: default_max_position_size(),
            stop_loss_multiplier: default_stop_loss_multiplier(),
            take_profit_multiplier: default_take_profit_multiplier(),
            max_hold_hours: default_max_hold_hours(),
        }
    }
}

impl BaseRiskSettings {
    /// Replace every non-positive field with its default.
    fn sanitized(&self) -> Self {
        fn pick(value: Decimal, fallback: fn() -> Decimal) -> Decimal {
            if value > Decimal::ZERO {
                value
            } else {
                fallback()
            }
        }

        Self {
            max_daily_loss: pick(self.max_daily_loss, default_max_daily_loss),
            max_position_size: pick(self.max_position_size, default_max_position_size),
            stop_loss_multiplier: pick(self.stop_loss_multiplier, default_stop_loss_multiplier),
            take_profit_multiplier: pick(
                self.take_profit_multiplier,
                default_take_profit_multiplier,
            ),
            max_hold_hours: pick(self.max_hold_hours, default_max_hold_hours),
        }
    }
}

/// Everything the resolver needs for one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskInputs {
    pub base: BaseRiskSettings,
    pub leverage: Decimal,
    pub regime: MarketRegime,
    /// Realized volatility as a fraction (0.05 = 5%)
    pub volatility: Option<Decimal>,
    /// Loss already taken today, as a fraction of equity
    pub current_daily_loss: Option<Decimal>,
    pub mode: RiskMode,
}

impl RiskInputs {
    pub fn new(base: BaseRiskSettings, leverage: Decimal, regime: MarketRegime) -> Self {
        Self {
            base,
            leverage,
            regime,
            volatility: None,
            current_daily_loss: None,
            mode: RiskMode::Normal,
        }
    }

    pub fn with_volatility(mut self, volatility: Decimal) -> Self {
        self.volatility = Some(volatility);
        self
    }

    pub fn with_daily_loss(mut self, loss: Decimal) -> Self {
        self.current_daily_loss = Some(loss);
        self
    }

    pub fn with_mode(mut self, mode: RiskMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Effective risk parameters for one evaluation.
///
/// Not authoritative state; a copy is snapshotted onto the entry order when a
/// bracket is created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_daily_loss: Decimal,
    /// Zero when `trading_halted`
    pub max_position_size: Decimal,
    pub stop_loss_multiplier: Decimal,
    pub take_profit_multiplier: Decimal,
    pub max_hold_hours: Decimal,
    pub regime: MarketRegime,
    /// Daily loss budget exhausted; no new positions today
    pub trading_halted: bool,
}

impl RiskConfig {
    pub fn max_hold_duration(&self) -> Duration {
        let minutes = (self.max_hold_hours * dec!(60)).trunc();
        Duration::minutes(minutes.to_i64().unwrap_or(i64::MAX))
    }
}

/// Pure resolver from [`RiskInputs`] to [`RiskConfig`].
pub struct RiskProfileResolver;

impl RiskProfileResolver {
    /// Resolve the effective risk configuration.
    ///
    /// Deterministic: identical inputs always produce identical output.
    pub fn resolve(inputs: &RiskInputs) -> Result<RiskConfig> {
        if inputs.leverage < Decimal::ONE {
            return Err(BracketError::InvalidInput(format!(
                "leverage must be at least 1, got {}",
                inputs.leverage
            )));
        }
        if let Some(vol) = inputs.volatility {
            if vol < Decimal::ZERO {
                return Err(BracketError::InvalidInput(format!(
                    "volatility must be non-negative, got {vol}"
                )));
            }
        }

        let base = inputs.base.sanitized();
        let mut daily_loss = base.max_daily_loss;
        let mut position = base.max_position_size;
        let mut stop = base.stop_loss_multiplier;
        let mut take_profit = base.take_profit_multiplier;
        let mut hold = base.max_hold_hours;
        let mut halted = false;

        // Saturating arithmetic: out-of-range inputs end at the clamps below
        // Regime
        let m = inputs.regime.multipliers();
        daily_loss = daily_loss.saturating_mul(m.max_daily_loss);
        position = position.saturating_mul(m.max_position_size);
        stop = stop.saturating_mul(m.stop_loss);
        take_profit = take_profit.saturating_mul(m.take_profit);
        hold = hold.saturating_mul(m.max_hold);

        // Daily loss budget
        if let Some(current) = inputs.current_daily_loss.filter(|l| !l.is_zero()) {
            let remaining = daily_loss.saturating_sub(current);
            if remaining <= Decimal::ZERO {
                position = Decimal::ZERO;
                halted = true;
            } else {
                let scale = remaining.checked_div(daily_loss).unwrap_or(Decimal::MAX);
                position = position.saturating_mul(scale.max(MIN_BUDGET_SCALE));
                stop = stop.saturating_mul(dec!(0.9));
            }
        }

        // Volatility fine-tuning
        if let Some(vol) = inputs.volatility {
            if vol > HIGH_VOLATILITY_THRESHOLD {
                position = position.saturating_mul(dec!(0.8));
                stop = stop.saturating_mul(dec!(0.9));
            } else if vol < LOW_VOLATILITY_THRESHOLD {
                position = position.saturating_mul(dec!(1.1));
                stop = stop.saturating_mul(dec!(1.1));
            }
        }

        // Mode
        let (mode_position, mode_stop, mode_hold) = inputs.mode.multipliers();
        position = position.saturating_mul(mode_position);
        stop = stop.saturating_mul(mode_stop);
        hold = hold.saturating_mul(mode_hold);

        let clamp = |v: Decimal, (lo, hi): (Decimal, Decimal)| v.clamp(lo, hi);

        Ok(RiskConfig {
            max_daily_loss: clamp(daily_loss, DAILY_LOSS_BOUNDS),
            max_position_size: if halted {
                Decimal::ZERO
            } else {
                clamp(position, POSITION_SIZE_BOUNDS)
            },
            stop_loss_multiplier: clamp(stop, STOP_MULTIPLIER_BOUNDS),
            take_profit_multiplier: clamp(take_profit, TAKE_PROFIT_MULTIPLIER_BOUNDS),
            max_hold_hours: clamp(hold, MAX_HOLD_HOURS_BOUNDS),
            regime: inputs.regime,
            trading_halted: halted,
        })
    }
}
