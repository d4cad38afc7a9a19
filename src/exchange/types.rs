//! Venue-neutral request and report types for the exchange capability.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{OrderSide, OrderStatus};

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    StopMarket,
    TakeProfitMarket,
}

/// Order state as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeOrderState {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl ExchangeOrderState {
    /// Whether the order can still execute on the exchange.
    pub fn is_open(&self) -> bool {
        matches!(self, ExchangeOrderState::New | ExchangeOrderState::PartiallyFilled)
    }

    /// Local status corresponding to this exchange state.
    pub fn to_local(&self) -> OrderStatus {
        match self {
            ExchangeOrderState::New => OrderStatus::Submitted,
            ExchangeOrderState::PartiallyFilled => OrderStatus::PartiallyFilled,
            ExchangeOrderState::Filled => OrderStatus::Filled,
            ExchangeOrderState::Canceled | ExchangeOrderState::Expired => OrderStatus::Cancelled,
            ExchangeOrderState::Rejected => OrderStatus::Rejected,
        }
    }
}

/// New order request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Limit price for limit orders, trigger price for conditional orders
    pub price: Option<Decimal>,
    pub reduce_only: bool,
    pub client_order_id: String,
}

/// Exchange acknowledgement of a placed order.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub exchange_order_id: String,
    pub status: ExchangeOrderState,
    pub filled_quantity: Decimal,
    pub avg_price: Option<Decimal>,
}

/// Current exchange view of one order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderReport {
    pub symbol: String,
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub status: ExchangeOrderState,
    pub filled_quantity: Decimal,
    pub avg_price: Option<Decimal>,
}

/// Current exchange view of a position.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub symbol: String,
    /// Signed size: positive = long, negative = short, zero = flat
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    /// Authoritative current price for margin P&L
    pub mark_price: Decimal,
}

impl PositionSnapshot {
    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }
}

/// Errors raised by an exchange capability.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("exchange call timed out after {0} ms")]
    Timeout(u64),
    #[error("rate limited by exchange")]
    RateLimited,
    #[error("transient exchange error: {0}")]
    Transient(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("unknown order {0}")]
    UnknownOrder(String),
}

impl ExchangeError {
    /// Timeouts, rate limits and transport failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout(_) | ExchangeError::RateLimited | ExchangeError::Transient(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_state_mapping() {
        assert!(ExchangeOrderState::New.is_open());
        assert!(!ExchangeOrderState::Filled.is_open());
        assert_eq!(ExchangeOrderState::Expired.to_local(), OrderStatus::Cancelled);
        assert_eq!(ExchangeOrderState::New.to_local(), OrderStatus::Submitted);
    }

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::Timeout(5000).is_transient());
        assert!(ExchangeError::RateLimited.is_transient());
        assert!(!ExchangeError::Rejected("reduce only".into()).is_transient());
        assert!(!ExchangeError::UnknownOrder("x".into()).is_transient());
    }
}
