//! Exchange capability seam.
//!
//! The bracket components only ever talk to an exchange through
//! [`ExchangeCapability`]:
//! - Order placement (entry, reduce-only TP/SL, synthetic closes)
//! - Cancellation by client order id
//! - Position and open-order polling for reconciliation
//!
//! [`MockExchange`] is an in-memory paper venue used by the `run` command
//! and by tests.

pub mod mock;
mod traits;
mod types;

pub use mock::{MockCall, MockExchange};
pub use traits::ExchangeCapability;
#[cfg(test)]
pub use traits::MockExchangeCapability;
pub use types::*;
