//! Risk computation for bracket orders.
//!
//! All calculators here are pure and stateless:
//! - Dynamic risk profile resolution by market regime and loss budget
//! - Stop-loss / take-profit trigger prices
//! - Leveraged (margin) P&L thresholds

mod margin;
mod profile;
mod stop_price;

pub use margin::{
    should_trigger_stop, should_trigger_take_profit, MarginStopConfig, MarginThresholdEvaluator,
    MarginTrigger,
};
pub use profile::{
    BaseRiskSettings, MarketRegime, RegimeMultipliers, RiskConfig, RiskInputs, RiskMode,
    RiskProfileResolver, DAILY_LOSS_BOUNDS, MAX_HOLD_HOURS_BOUNDS, POSITION_SIZE_BOUNDS,
    STOP_MULTIPLIER_BOUNDS, TAKE_PROFIT_MULTIPLIER_BOUNDS,
};
pub use stop_price::{
    BracketLevels, StopLossPriceCalculator, MIN_BASE_VOLATILITY, MIN_DISTANCE_FRACTION,
};
