//! # Bracket Guard
//!
//! Bracket-order lifecycle management with leverage-aware risk calculation.
//!
//! ## Architecture
//!
//! - `model`: Orders, bracket links, external operations and the client id convention
//! - `risk`: Risk profile resolution, TP/SL price calculation, margin P&L thresholds
//! - `bracket`: Registry, placement, cascade cancellation, reconciliation, synthetic stops
//! - `exchange`: Exchange capability trait and the in-memory paper venue
//! - `persistence`: SQLite-backed store for groups, orders and external operations
//! - `alert`: Operator-visible alerts
//! - `config`: Configuration management and validation

pub mod alert;
pub mod bracket;
pub mod config;
pub mod error;
pub mod exchange;
pub mod model;
pub mod persistence;
pub mod risk;

pub use config::Config;
pub use error::{BracketError, Result};
