//! Bracket group linkage and the client order id convention.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::order::{OrderId, OrderRole, PositionDirection};

/// Exchange limit on client order id length in the observed deployment.
pub const MAX_CLIENT_ORDER_ID_LEN: usize = 36;

/// Shared identifier of one bracket group: `<entryOrderId>-<unixSeconds>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(String);

impl GroupId {
    /// Derive a group id from the entry order id and creation time.
    pub fn new(entry_order: OrderId, created_at: DateTime<Utc>) -> Self {
        Self(format!("{}-{}", entry_order.0, created_at.timestamp()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Client order id for a member of this group.
    pub fn client_order_id(&self, role: OrderRole) -> String {
        let suffix = match role {
            OrderRole::Entry => "entry",
            OrderRole::TakeProfit => "tp",
            OrderRole::StopLoss => "sl",
            OrderRole::Close => "close",
            OrderRole::Scaling => "sc",
        };
        format!("{}-{}", self.0, suffix)
    }

    /// Client order id for the `sequence`-th close attempt of this group.
    ///
    /// The first attempt keeps the plain `-close` suffix.
    pub fn close_client_order_id(&self, sequence: u32) -> String {
        if sequence <= 1 {
            self.client_order_id(OrderRole::Close)
        } else {
            format!("{}-close{}", self.0, sequence)
        }
    }

    /// Client order id for the `sequence`-th scaling order of this group.
    pub fn scaling_client_order_id(&self, sequence: u32) -> String {
        format!("{}-sc{}", self.0, sequence)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GroupId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Split a client order id back into its group id and role.
///
/// Returns `None` for ids that do not follow the `<groupId>-<suffix>` layout.
pub fn parse_client_id(client_order_id: &str) -> Option<(GroupId, OrderRole)> {
    let (group, suffix) = client_order_id.rsplit_once('-')?;
    if group.is_empty() || !group.contains('-') {
        return None;
    }

    let role = match suffix {
        "entry" => OrderRole::Entry,
        "tp" => OrderRole::TakeProfit,
        "sl" => OrderRole::StopLoss,
        s if s.starts_with("close") && s[5..].chars().all(|c| c.is_ascii_digit()) => {
            OrderRole::Close
        }
        s if s.starts_with("sc") && s[2..].chars().all(|c| c.is_ascii_digit()) => {
            OrderRole::Scaling
        }
        _ => return None,
    };

    Some((GroupId(group.to_string()), role))
}

/// Status of a bracket group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BracketStatus {
    Active,
    Closed,
    /// Terminal; requires operator review
    Orphaned,
    Cancelled,
}

impl BracketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BracketStatus::Active => "active",
            BracketStatus::Closed => "closed",
            BracketStatus::Orphaned => "orphaned",
            BracketStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BracketStatus::Active)
    }
}

impl fmt::Display for BracketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BracketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(BracketStatus::Active),
            "closed" => Ok(BracketStatus::Closed),
            "orphaned" => Ok(BracketStatus::Orphaned),
            "cancelled" => Ok(BracketStatus::Cancelled),
            other => Err(format!("unknown bracket status: {other}")),
        }
    }
}

/// Why a bracket group left the `active` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    TakeProfitFilled,
    StopLossFilled,
    ExternalFullClose,
    SyntheticStop,
    SyntheticTakeProfit,
    EntryCancelled,
    Manual,
    /// Members could no longer be correlated with exchange state
    Orphaned,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TakeProfitFilled => "take_profit_filled",
            CloseReason::StopLossFilled => "stop_loss_filled",
            CloseReason::ExternalFullClose => "external_full_close",
            CloseReason::SyntheticStop => "synthetic_stop",
            CloseReason::SyntheticTakeProfit => "synthetic_take_profit",
            CloseReason::EntryCancelled => "entry_cancelled",
            CloseReason::Manual => "manual",
            CloseReason::Orphaned => "orphaned",
        }
    }

    /// Group status a terminal transition with this reason lands in.
    pub fn terminal_status(&self) -> BracketStatus {
        match self {
            CloseReason::EntryCancelled => BracketStatus::Cancelled,
            CloseReason::Orphaned => BracketStatus::Orphaned,
            _ => BracketStatus::Closed,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloseReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "take_profit_filled" => Ok(CloseReason::TakeProfitFilled),
            "stop_loss_filled" => Ok(CloseReason::StopLossFilled),
            "external_full_close" => Ok(CloseReason::ExternalFullClose),
            "synthetic_stop" => Ok(CloseReason::SyntheticStop),
            "synthetic_take_profit" => Ok(CloseReason::SyntheticTakeProfit),
            "entry_cancelled" => Ok(CloseReason::EntryCancelled),
            "manual" => Ok(CloseReason::Manual),
            "orphaned" => Ok(CloseReason::Orphaned),
            other => Err(format!("unknown close reason: {other}")),
        }
    }
}

/// Group relationship between one entry order and its TP/SL orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketLink {
    pub group_id: GroupId,
    pub symbol: String,
    pub account: String,
    pub direction: PositionDirection,
    pub entry_order: OrderId,
    pub entry_client_id: String,
    pub take_profit_order: Option<OrderId>,
    pub take_profit_client_id: Option<String>,
    pub stop_loss_order: Option<OrderId>,
    pub stop_loss_client_id: Option<String>,
    pub status: BracketStatus,
    pub close_reason: Option<CloseReason>,
    /// Free-form operator note (orphan cause, manual close origin)
    pub status_note: Option<String>,
    /// Position size seen on the previous reconciliation pass
    pub last_observed_quantity: Option<Decimal>,
    /// First time a member order could not be resolved on the exchange
    pub unresolved_since: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BracketLink {
    pub fn is_active(&self) -> bool {
        self.status == BracketStatus::Active
    }

    /// Attached conditional order for `role`, if any.
    pub fn conditional(&self, role: OrderRole) -> Option<OrderId> {
        match role {
            OrderRole::TakeProfit => self.take_profit_order,
            OrderRole::StopLoss => self.stop_loss_order,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_group_id_and_client_ids() {
        let created = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let group = GroupId::new(OrderId(42), created);

        assert_eq!(group.as_str(), "42-1700000000");
        assert_eq!(group.client_order_id(OrderRole::Entry), "42-1700000000-entry");
        assert_eq!(group.client_order_id(OrderRole::TakeProfit), "42-1700000000-tp");
        assert_eq!(group.client_order_id(OrderRole::StopLoss), "42-1700000000-sl");
        assert_eq!(group.scaling_client_order_id(3), "42-1700000000-sc3");
        assert_eq!(group.close_client_order_id(1), "42-1700000000-close");
        assert_eq!(group.close_client_order_id(2), "42-1700000000-close2");
    }

    #[test]
    fn test_client_id_fits_exchange_limit_for_large_ids() {
        let created = Utc.timestamp_opt(9_999_999_999, 0).unwrap();
        // 19-digit id + '-' + 10-digit timestamp + "-entry" = 36
        let group = GroupId::new(OrderId(1_000_000_000_000_000_000), created);
        assert!(group.client_order_id(OrderRole::Entry).len() <= MAX_CLIENT_ORDER_ID_LEN);
    }

    #[test]
    fn test_parse_client_id() {
        let (group, role) = parse_client_id("7-1700000000-sl").unwrap();
        assert_eq!(group.as_str(), "7-1700000000");
        assert_eq!(role, OrderRole::StopLoss);

        let (_, role) = parse_client_id("7-1700000000-sc12").unwrap();
        assert_eq!(role, OrderRole::Scaling);

        let (group, role) = parse_client_id("7-1700000000-close3").unwrap();
        assert_eq!(group.as_str(), "7-1700000000");
        assert_eq!(role, OrderRole::Close);

        assert!(parse_client_id("manual-order").is_none());
        assert!(parse_client_id("7-1700000000-xx").is_none());
        assert!(parse_client_id("nodash").is_none());
    }

    #[test]
    fn test_close_reason_terminal_status() {
        assert_eq!(CloseReason::TakeProfitFilled.terminal_status(), BracketStatus::Closed);
        assert_eq!(CloseReason::EntryCancelled.terminal_status(), BracketStatus::Cancelled);
        assert_eq!(CloseReason::Orphaned.terminal_status(), BracketStatus::Orphaned);
    }
}
