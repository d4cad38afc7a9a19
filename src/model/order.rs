//! Order records tracked locally for every bracket member.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::risk::RiskConfig;

/// Locally assigned, stable order identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of the position a bracket protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionDirection {
    Long,
    Short,
}

impl PositionDirection {
    /// Side used to open a position in this direction.
    pub fn open_side(&self) -> OrderSide {
        match self {
            PositionDirection::Long => OrderSide::LongOpen,
            PositionDirection::Short => OrderSide::ShortOpen,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionDirection::Long => "long",
            PositionDirection::Short => "short",
        }
    }
}

impl fmt::Display for PositionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(PositionDirection::Long),
            "short" => Ok(PositionDirection::Short),
            other => Err(format!("unknown position direction: {other}")),
        }
    }
}

/// Order side as seen by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    LongOpen,
    ShortOpen,
    /// Reduce-only close of an existing position
    ReduceOnlyClose,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::LongOpen => "long_open",
            OrderSide::ShortOpen => "short_open",
            OrderSide::ReduceOnlyClose => "reduce_only_close",
        }
    }

    pub fn is_reduce_only(&self) -> bool {
        matches!(self, OrderSide::ReduceOnlyClose)
    }
}

impl FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long_open" => Ok(OrderSide::LongOpen),
            "short_open" => Ok(OrderSide::ShortOpen),
            "reduce_only_close" => Ok(OrderSide::ReduceOnlyClose),
            other => Err(format!("unknown order side: {other}")),
        }
    }
}

/// Role an order plays inside its bracket group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderRole {
    Entry,
    TakeProfit,
    StopLoss,
    Scaling,
    /// Market close spawned by a synthetic (margin-threshold) trigger
    Close,
}

impl OrderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderRole::Entry => "entry",
            OrderRole::TakeProfit => "take_profit",
            OrderRole::StopLoss => "stop_loss",
            OrderRole::Scaling => "scaling",
            OrderRole::Close => "close",
        }
    }

    /// Take-profit and stop-loss orders are the conditional members of a bracket.
    pub fn is_conditional(&self) -> bool {
        matches!(self, OrderRole::TakeProfit | OrderRole::StopLoss)
    }

    /// Roles whose fills reduce the position opened by the entry.
    pub fn is_closing(&self) -> bool {
        matches!(
            self,
            OrderRole::TakeProfit | OrderRole::StopLoss | OrderRole::Close
        )
    }
}

impl fmt::Display for OrderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(OrderRole::Entry),
            "take_profit" => Ok(OrderRole::TakeProfit),
            "stop_loss" => Ok(OrderRole::StopLoss),
            "scaling" => Ok(OrderRole::Scaling),
            "close" => Ok(OrderRole::Close),
            other => Err(format!("unknown order role: {other}")),
        }
    }
}

/// Local order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    /// Cancel request claimed by exactly one canceller, awaiting verification
    Cancelling,
    Filled,
    Cancelled,
    Rejected,
    Orphaned,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Submitted => "submitted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Cancelling => "cancelling",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Orphaned => "orphaned",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Orphaned
        )
    }

    /// Statuses that may still be resting or working on the exchange.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Submitted | OrderStatus::PartiallyFilled
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "submitted" => Ok(OrderStatus::Submitted),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "cancelling" => Ok(OrderStatus::Cancelling),
            "filled" => Ok(OrderStatus::Filled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "rejected" => Ok(OrderStatus::Rejected),
            "orphaned" => Ok(OrderStatus::Orphaned),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// One exchange order request and its locally tracked result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: String,
    pub account: String,
    pub side: OrderSide,
    pub role: OrderRole,
    pub quantity: Decimal,
    /// Limit or trigger price; `None` for market orders
    pub price: Option<Decimal>,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    pub exchange_order_id: Option<String>,
    pub client_order_id: String,
    pub parent: Option<OrderId>,
    pub children: Vec<OrderId>,
    /// Risk parameters in force when the bracket was created
    pub risk_snapshot: Option<RiskConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Quantity still expected to execute.
    pub fn remaining_quantity(&self) -> Decimal {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }
}
