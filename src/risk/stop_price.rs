//! Stop-loss and take-profit trigger price calculation.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use super::profile::RiskConfig;
use crate::error::{BracketError, Result};
use crate::model::PositionDirection;

/// Volatility floor used for distance calculation (2%).
pub const MIN_BASE_VOLATILITY: Decimal = dec!(0.02);
/// Minimum stop/take-profit distance as a fraction of entry price (0.5%).
pub const MIN_DISTANCE_FRACTION: Decimal = dec!(0.005);

/// TP/SL trigger prices for one bracket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BracketLevels {
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
}

/// Computes trigger prices from entry price, direction and [`RiskConfig`].
pub struct StopLossPriceCalculator;

impl StopLossPriceCalculator {
    /// Stop-loss trigger price.
    ///
    /// Distance is `entry * max(volatility, 2%) * stop_multiplier`, widened by
    /// the regime amplifier and never tighter than 0.5% of entry.
    pub fn compute_stop_loss(
        entry_price: Decimal,
        direction: PositionDirection,
        risk: &RiskConfig,
        market_volatility: Decimal,
    ) -> Result<Decimal> {
        let distance = Self::distance(
            entry_price,
            market_volatility,
            risk.stop_loss_multiplier,
            risk.regime.stop_distance_amplifier(),
        )?;

        let stop = match direction {
            PositionDirection::Long => entry_price - distance,
            PositionDirection::Short => entry_price + distance,
        };

        if stop <= Decimal::ZERO {
            return Err(BracketError::InvalidInput(format!(
                "stop distance {distance} exceeds entry price {entry_price}"
            )));
        }
        Ok(stop)
    }

    /// Take-profit trigger price: same formula with the take-profit
    /// multiplier and no regime amplification.
    pub fn compute_take_profit(
        entry_price: Decimal,
        direction: PositionDirection,
        risk: &RiskConfig,
        market_volatility: Decimal,
    ) -> Result<Decimal> {
        let distance = Self::distance(
            entry_price,
            market_volatility,
            risk.take_profit_multiplier,
            Decimal::ONE,
        )?;

        let target = match direction {
            PositionDirection::Long => entry_price + distance,
            PositionDirection::Short => entry_price - distance,
        };

        if target <= Decimal::ZERO {
            return Err(BracketError::InvalidInput(format!(
                "take-profit distance {distance} exceeds entry price {entry_price}"
            )));
        }
        Ok(target)
    }

    /// Both trigger prices at once.
    pub fn compute_levels(
        entry_price: Decimal,
        direction: PositionDirection,
        risk: &RiskConfig,
        market_volatility: Decimal,
    ) -> Result<BracketLevels> {
        Ok(BracketLevels {
            stop_loss: Self::compute_stop_loss(entry_price, direction, risk, market_volatility)?,
            take_profit: Self::compute_take_profit(
                entry_price,
                direction,
                risk,
                market_volatility,
            )?,
        })
    }

    fn distance(
        entry_price: Decimal,
        market_volatility: Decimal,
        multiplier: Decimal,
        amplifier: Decimal,
    ) -> Result<Decimal> {
        if entry_price <= Decimal::ZERO {
            return Err(BracketError::InvalidInput(format!(
                "entry price must be positive, got {entry_price}"
            )));
        }
        if market_volatility < Decimal::ZERO {
            return Err(BracketError::InvalidInput(format!(
                "market volatility must be non-negative, got {market_volatility}"
            )));
        }

        let base_volatility = market_volatility.max(MIN_BASE_VOLATILITY);
        let distance = entry_price * base_volatility * multiplier * amplifier;
        Ok(distance.max(entry_price * MIN_DISTANCE_FRACTION))
    }
}
