//! Operator-visible alerts.
//!
//! Alerts are emitted as single-line JSON on the `bracket_alert` log target so
//! they can be routed separately from regular logs.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

use crate::model::{GroupId, OrderRole};

static ALERT_SEQ: AtomicU64 = AtomicU64::new(1);

/// What happened.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertKind {
    /// Retries exhausted; the order was escalated to orphaned
    OrderOrphaned {
        group_id: GroupId,
        client_order_id: String,
        role: OrderRole,
        action: String,
        attempts: u32,
        last_error: String,
    },
    /// Group members could not be correlated with the exchange
    GroupOrphaned {
        group_id: GroupId,
        symbol: String,
        reason: String,
    },
    /// Position closed outside this system
    ExternalFullClose {
        group_id: GroupId,
        symbol: String,
        previous_quantity: Decimal,
    },
    /// Position reduced outside this system
    ExternalPartialClose {
        group_id: GroupId,
        symbol: String,
        previous_quantity: Decimal,
        current_quantity: Decimal,
    },
    /// A sibling filled while we were cancelling it
    SiblingFilledDuringCancel {
        group_id: GroupId,
        client_order_id: String,
    },
    /// Write-through to the store failed; memory state remains authoritative
    PersistenceFailure { operation: String, error: String },
}

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// An alert requiring operator attention.
#[derive(Debug, Clone, Serialize)]
pub struct OperatorAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub suggested_action: String,
}

impl OperatorAlert {
    pub fn new(
        kind: AlertKind,
        severity: AlertSeverity,
        message: impl Into<String>,
        suggested_action: impl Into<String>,
    ) -> Self {
        let timestamp = Utc::now();
        let seq = ALERT_SEQ.fetch_add(1, Ordering::Relaxed);

        Self {
            alert_id: format!("bracket-{}-{:06}", timestamp.timestamp(), seq),
            timestamp,
            kind,
            severity,
            message: message.into(),
            suggested_action: suggested_action.into(),
        }
    }

    pub fn order_orphaned(
        group_id: &GroupId,
        client_order_id: &str,
        role: OrderRole,
        action: &str,
        attempts: u32,
        last_error: &str,
    ) -> Self {
        Self::new(
            AlertKind::OrderOrphaned {
                group_id: group_id.clone(),
                client_order_id: client_order_id.to_string(),
                role,
                action: action.to_string(),
                attempts,
                last_error: last_error.to_string(),
            },
            AlertSeverity::Critical,
            format!("{action} of {client_order_id} failed after {attempts} attempts"),
            "Verify the order on the exchange and cancel it manually if still open",
        )
    }

    pub fn group_orphaned(group_id: &GroupId, symbol: &str, reason: &str) -> Self {
        Self::new(
            AlertKind::GroupOrphaned {
                group_id: group_id.clone(),
                symbol: symbol.to_string(),
                reason: reason.to_string(),
            },
            AlertSeverity::Critical,
            format!("Bracket {group_id} on {symbol} orphaned: {reason}"),
            "Review position and open orders manually; no automatic recovery",
        )
    }

    pub fn external_full_close(group_id: &GroupId, symbol: &str, previous: Decimal) -> Self {
        Self::new(
            AlertKind::ExternalFullClose {
                group_id: group_id.clone(),
                symbol: symbol.to_string(),
                previous_quantity: previous,
            },
            AlertSeverity::Warning,
            format!("Position on {symbol} closed externally (was {previous})"),
            "Conditional orders are being cancelled automatically",
        )
    }

    pub fn external_partial_close(
        group_id: &GroupId,
        symbol: &str,
        previous: Decimal,
        current: Decimal,
    ) -> Self {
        Self::new(
            AlertKind::ExternalPartialClose {
                group_id: group_id.clone(),
                symbol: symbol.to_string(),
                previous_quantity: previous,
                current_quantity: current,
            },
            AlertSeverity::Info,
            format!("Position on {symbol} reduced externally from {previous} to {current}"),
            "No action taken; bracket remains active",
        )
    }

    pub fn sibling_filled(group_id: &GroupId, client_order_id: &str) -> Self {
        Self::new(
            AlertKind::SiblingFilledDuringCancel {
                group_id: group_id.clone(),
                client_order_id: client_order_id.to_string(),
            },
            AlertSeverity::Error,
            format!("{client_order_id} filled while being cancelled"),
            "Check for an unintended position on the exchange",
        )
    }

    pub fn persistence_failure(operation: &str, error: &str) -> Self {
        Self::new(
            AlertKind::PersistenceFailure {
                operation: operation.to_string(),
                error: error.to_string(),
            },
            AlertSeverity::Error,
            format!("Persisting {operation} failed: {error}"),
            "Check database health; state will be lost on restart",
        )
    }

    /// Emit alert as structured log.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            AlertSeverity::Info => info!(target: "bracket_alert", "BRACKET_ALERT: {}", json),
            AlertSeverity::Warning => warn!(target: "bracket_alert", "BRACKET_ALERT: {}", json),
            AlertSeverity::Error | AlertSeverity::Critical => {
                error!(target: "bracket_alert", severity = self.severity.as_str(), "BRACKET_ALERT: {}", json)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderId;
    use rust_decimal_macros::dec;

    #[test]
    fn test_alert_ids_are_unique() {
        let group = GroupId::new(OrderId(1), Utc::now());
        let a = OperatorAlert::group_orphaned(&group, "BTCUSDT", "unresolved");
        let b = OperatorAlert::group_orphaned(&group, "BTCUSDT", "unresolved");
        assert_ne!(a.alert_id, b.alert_id);
        assert_eq!(a.severity, AlertSeverity::Critical);
    }

    #[test]
    fn test_alert_serializes_with_tagged_kind() {
        let group = GroupId::from("7-1700000000");
        let alert = OperatorAlert::external_full_close(&group, "ETHUSDT", dec!(1.5));
        let json = serde_json::to_value(&alert).unwrap();

        assert_eq!(json["kind"]["type"], "external_full_close");
        assert_eq!(json["kind"]["group_id"], "7-1700000000");
        assert_eq!(json["severity"], "Warning");
        alert.emit();
    }

    #[test]
    fn test_order_orphaned_message() {
        let group = GroupId::from("7-1700000000");
        let alert = OperatorAlert::order_orphaned(
            &group,
            "7-1700000000-sl",
            OrderRole::StopLoss,
            "cancel",
            5,
            "timeout",
        );
        assert!(alert.message.contains("after 5 attempts"));
        assert!(matches!(alert.kind, AlertKind::OrderOrphaned { attempts: 5, .. }));
    }
}
