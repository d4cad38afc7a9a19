//! Persistence for bracket groups, member orders and external operations.
//!
//! The registry writes through to a [`BracketStore`] so active brackets
//! survive restarts. In-memory state stays authoritative while running.

mod sqlite;

use anyhow::Result;

use crate::model::{BracketLink, BracketStatus, ExternalOperation, GroupId, OperationStatus, Order};

pub use sqlite::SqliteStore;

/// A bracket group together with all of its member orders.
pub type GroupRecord = (BracketLink, Vec<Order>);

/// Storage for orders, bracket links and external operations.
pub trait BracketStore: Send + Sync {
    /// Insert or replace an order.
    fn save_order(&self, order: &Order) -> Result<()>;

    /// Insert or replace a bracket link.
    fn save_group(&self, link: &BracketLink) -> Result<()>;

    fn record_external_operation(&self, operation: &ExternalOperation) -> Result<()>;

    fn update_external_operation_status(&self, id: u64, status: OperationStatus) -> Result<()>;

    /// Read a group and every member order in one transaction.
    fn load_group_with_orders(&self, group_id: &GroupId) -> Result<Option<GroupRecord>>;

    /// Persist `updated` only if the stored status still equals `expected`.
    ///
    /// Returns whether the row changed.
    fn compare_and_set_group_status(
        &self,
        expected: BracketStatus,
        updated: &BracketLink,
    ) -> Result<bool>;

    /// All active groups with their member orders.
    fn load_active_groups(&self) -> Result<Vec<GroupRecord>>;

    /// Most recent groups, newest first.
    fn list_groups(&self, limit: usize) -> Result<Vec<BracketLink>>;

    /// Most recent external operations, newest first.
    fn list_external_operations(&self, limit: usize) -> Result<Vec<ExternalOperation>>;

    /// Highest order id ever stored (0 when empty).
    fn max_order_id(&self) -> Result<u64>;

    /// Highest external operation id ever stored (0 when empty).
    fn max_external_operation_id(&self) -> Result<u64>;
}
