//! Audit records for position changes made outside the bot.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::bracket::GroupId;

/// Kind of out-of-band change detected on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    ExternalPartialClose,
    ExternalFullClose,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::ExternalPartialClose => "external_partial_close",
            OperationType::ExternalFullClose => "external_full_close",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "external_partial_close" => Ok(OperationType::ExternalPartialClose),
            "external_full_close" => Ok(OperationType::ExternalFullClose),
            other => Err(format!("unknown operation type: {other}")),
        }
    }
}

/// Handling state of an external operation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Detected,
    Handled,
    Ignored,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Detected => "detected",
            OperationStatus::Handled => "handled",
            OperationStatus::Ignored => "ignored",
        }
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "detected" => Ok(OperationStatus::Detected),
            "handled" => Ok(OperationStatus::Handled),
            "ignored" => Ok(OperationStatus::Ignored),
            other => Err(format!("unknown operation status: {other}")),
        }
    }
}

/// A detected out-of-band change to a bracket's position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalOperation {
    pub id: u64,
    pub group_id: Option<GroupId>,
    pub symbol: String,
    pub operation_type: OperationType,
    pub old_amount: Decimal,
    pub new_amount: Decimal,
    /// 0-1: how certain the detector is that the bot did not cause the change
    pub confidence: Decimal,
    pub status: OperationStatus,
    pub detected_at: DateTime<Utc>,
}
