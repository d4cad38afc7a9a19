//! Bracket order lifecycle.
//!
//! - Registry: group membership and status transitions
//! - Placement: entry plus reduce-only TP/SL, manual closes
//! - Cascade: at-most-once cancellation of siblings when a group closes
//! - Reconciler: polling comparison against exchange truth
//! - Service: start/stop lifecycle for the reconciliation loop
//! - Synthetic: margin P&L stops evaluated off-exchange

mod cascade;
mod placement;
mod reconciler;
mod registry;
mod retry;
mod service;
mod synthetic;

#[cfg(test)]
mod testkit;

pub use cascade::{CascadeCanceller, CascadeOutcome, MemberOutcome};
pub use placement::{BracketOrderRequest, BracketPlacer, PlacedBracket};
pub use reconciler::{OrderReconciler, ReconcileReport};
pub use registry::{BracketLinkRegistry, EntryRequest, GroupSnapshot};
pub use retry::{with_timeout, RetryPolicy};
pub use service::{PassSummary, ReconcilerService};
pub use synthetic::SyntheticStopMonitor;
