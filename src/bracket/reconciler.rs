//! Reconciliation of local bracket state against the exchange.
//!
//! One pass polls every symbol that has an active bracket, bounded by a
//! semaphore so the exchange rate limit is respected. A slow or failing
//! symbol only affects its own groups.

use chrono::Utc;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::cascade::CascadeCanceller;
use super::registry::{BracketLinkRegistry, GroupSnapshot};
use super::retry::with_timeout;
use crate::alert::OperatorAlert;
use crate::config::ReconciliationConfig;
use crate::error::Result;
use crate::exchange::{ExchangeCapability, ExchangeError, OrderReport, PositionSnapshot};
use crate::model::{
    CloseReason, OperationStatus, OperationType, OrderRole, OrderStatus, PositionDirection,
};

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub groups_checked: usize,
    pub symbols_failed: usize,
    pub fills_detected: usize,
    pub external_full_closes: usize,
    pub external_partial_closes: usize,
    pub groups_closed: usize,
    pub groups_orphaned: usize,
}

impl ReconcileReport {
    fn merge(&mut self, other: ReconcileReport) {
        self.groups_checked += other.groups_checked;
        self.symbols_failed += other.symbols_failed;
        self.fills_detected += other.fills_detected;
        self.external_full_closes += other.external_full_closes;
        self.external_partial_closes += other.external_partial_closes;
        self.groups_closed += other.groups_closed;
        self.groups_orphaned += other.groups_orphaned;
    }

    /// Whether the pass changed anything.
    pub fn is_quiet(&self) -> bool {
        self.fills_detected == 0
            && self.external_full_closes == 0
            && self.external_partial_closes == 0
            && self.groups_closed == 0
            && self.groups_orphaned == 0
    }
}

/// Exchange view of one symbol, fetched once per pass.
struct SymbolView {
    position: PositionSnapshot,
    /// Report per live member client id; `None` when the exchange has no record
    members: HashMap<String, Option<OrderReport>>,
}

/// Compares local brackets with exchange truth and acts on divergences.
pub struct OrderReconciler {
    registry: Arc<BracketLinkRegistry>,
    exchange: Arc<dyn ExchangeCapability>,
    cascade: Arc<CascadeCanceller>,
    grace_period: chrono::Duration,
    call_timeout: Duration,
    max_concurrent_symbols: usize,
}

impl OrderReconciler {
    pub fn new(
        registry: Arc<BracketLinkRegistry>,
        exchange: Arc<dyn ExchangeCapability>,
        cascade: Arc<CascadeCanceller>,
        config: &ReconciliationConfig,
    ) -> Self {
        Self {
            registry,
            exchange,
            cascade,
            grace_period: chrono::Duration::from_std(config.grace_period())
                .unwrap_or(chrono::Duration::MAX),
            call_timeout: config.call_timeout(),
            max_concurrent_symbols: config.max_concurrent_symbols.max(1),
        }
    }

    /// Run one full reconciliation pass over all active groups.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut by_symbol: BTreeMap<String, Vec<GroupSnapshot>> = BTreeMap::new();
        for group in self.registry.active_groups().await {
            by_symbol
                .entry(group.link.symbol.clone())
                .or_default()
                .push(group);
        }

        let mut report = ReconcileReport::default();
        if by_symbol.is_empty() {
            return report;
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_symbols));
        let passes = by_symbol.into_iter().map(|(symbol, groups)| {
            let semaphore = semaphore.clone();
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return ReconcileReport::default();
                };
                self.reconcile_symbol(&symbol, groups).await
            }
        });

        for partial in join_all(passes).await {
            report.merge(partial);
        }

        if report.is_quiet() {
            debug!(?report, "Reconciliation pass complete");
        } else {
            info!(?report, "Reconciliation pass complete");
        }
        report
    }

    async fn reconcile_symbol(&self, symbol: &str, groups: Vec<GroupSnapshot>) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let view = match self.fetch_symbol(symbol, &groups).await {
            Ok(view) => view,
            Err(e) => {
                warn!(%symbol, groups = groups.len(), error = %e, "Skipping symbol this pass");
                report.symbols_failed += 1;
                return report;
            }
        };

        for group in groups {
            report.groups_checked += 1;
            let group_id = group.link.group_id.clone();
            if let Err(e) = self.reconcile_group(group, &view, &mut report).await {
                warn!(group_id = %group_id, %symbol, error = %e, "Group reconciliation failed");
            }
        }
        report
    }

    async fn fetch_symbol(
        &self,
        symbol: &str,
        groups: &[GroupSnapshot],
    ) -> std::result::Result<SymbolView, ExchangeError> {
        let (position, open_orders) = tokio::try_join!(
            with_timeout(self.call_timeout, self.exchange.get_position(symbol)),
            with_timeout(self.call_timeout, self.exchange.get_open_orders(symbol)),
        )?;

        let mut open: HashMap<String, OrderReport> = open_orders
            .into_iter()
            .map(|r| (r.client_order_id.clone(), r))
            .collect();

        let mut members = HashMap::new();
        for order in groups
            .iter()
            .flat_map(|g| g.orders.iter())
            .filter(|o| o.status.is_live())
        {
            let report = match open.remove(&order.client_order_id) {
                Some(report) => Some(report),
                None => {
                    with_timeout(
                        self.call_timeout,
                        self.exchange.get_order(symbol, &order.client_order_id),
                    )
                    .await?
                }
            };
            members.insert(order.client_order_id.clone(), report);
        }

        Ok(SymbolView { position, members })
    }

    async fn reconcile_group(
        &self,
        group: GroupSnapshot,
        view: &SymbolView,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let group_id = group.link.group_id.clone();
        let mut unresolved = Vec::new();

        for order in group.orders.iter().filter(|o| o.status.is_live()) {
            match view.members.get(&order.client_order_id) {
                Some(Some(exchange)) => {
                    let changed = self
                        .registry
                        .apply_exchange_state(
                            order.id,
                            exchange.status,
                            exchange.filled_quantity,
                            exchange.avg_price,
                            Some(&exchange.exchange_order_id),
                        )
                        .await?;
                    if changed == Some(OrderStatus::Filled) && order.role.is_conditional() {
                        report.fills_detected += 1;
                        info!(
                            group_id = %group_id,
                            client_order_id = %order.client_order_id,
                            role = %order.role,
                            "Conditional order fill detected"
                        );
                    }
                }
                _ => unresolved.push(order.client_order_id.clone()),
            }
        }

        let Some(group) = self.registry.group_snapshot(&group_id).await else {
            return Ok(());
        };
        if !group.link.is_active() {
            return Ok(());
        }

        // Entry never filled and is gone: nothing to protect
        if let Some(entry) = group.entry() {
            if matches!(entry.status, OrderStatus::Cancelled | OrderStatus::Rejected)
                && entry.filled_quantity.is_zero()
            {
                return self
                    .close(&group, CloseReason::EntryCancelled, report)
                    .await;
            }
        }

        for (role, reason) in [
            (OrderRole::TakeProfit, CloseReason::TakeProfitFilled),
            (OrderRole::StopLoss, CloseReason::StopLossFilled),
        ] {
            if group
                .conditional(role)
                .is_some_and(|o| o.status == OrderStatus::Filled)
            {
                return self.close(&group, reason, report).await;
            }
        }

        if self.check_unresolved(&group, &unresolved, report).await? {
            return Ok(());
        }

        self.check_position(&group, &view.position, report).await
    }

    async fn close(
        &self,
        group: &GroupSnapshot,
        reason: CloseReason,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let outcome = self
            .cascade
            .on_group_terminal(&group.link.group_id, reason)
            .await?;
        if outcome.transitioned {
            report.groups_closed += 1;
        }
        Ok(())
    }

    /// Track members the exchange has no record of; orphan after the grace period.
    ///
    /// Returns `true` if the group was orphaned.
    async fn check_unresolved(
        &self,
        group: &GroupSnapshot,
        unresolved: &[String],
        report: &mut ReconcileReport,
    ) -> Result<bool> {
        let group_id = &group.link.group_id;

        if unresolved.is_empty() {
            if group.link.unresolved_since.is_some() {
                self.registry.set_unresolved_since(group_id, None).await?;
            }
            return Ok(false);
        }

        let now = Utc::now();
        let Some(since) = group.link.unresolved_since else {
            debug!(group_id = %group_id, ?unresolved, "Members not found on exchange, starting grace period");
            self.registry.set_unresolved_since(group_id, Some(now)).await?;
            return Ok(false);
        };

        if now - since < self.grace_period {
            return Ok(false);
        }

        let reason = format!(
            "members unresolved on exchange since {}: {}",
            since.to_rfc3339(),
            unresolved.join(", ")
        );
        if self.registry.mark_orphaned(group_id, &reason).await? {
            warn!(group_id = %group_id, symbol = %group.link.symbol, %reason, "Bracket group orphaned");
            OperatorAlert::group_orphaned(group_id, &group.link.symbol, &reason).emit();
            report.groups_orphaned += 1;
        }
        Ok(true)
    }

    async fn check_position(
        &self,
        group: &GroupSnapshot,
        position: &PositionSnapshot,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let expected = group.expected_position();
        if expected.is_zero() {
            // Entry still resting or not yet submitted
            return Ok(());
        }

        let link = &group.link;
        let observed = directional_quantity(position.quantity, link.direction);

        if observed.is_zero() {
            let operation = self
                .registry
                .record_external_operation(
                    Some(&link.group_id),
                    &link.symbol,
                    OperationType::ExternalFullClose,
                    expected,
                    Decimal::ZERO,
                    external_confidence(group),
                )
                .await;
            warn!(
                group_id = %link.group_id,
                symbol = %link.symbol,
                expected = %expected,
                "Position closed outside the bracket"
            );
            OperatorAlert::external_full_close(&link.group_id, &link.symbol, expected).emit();
            report.external_full_closes += 1;

            self.close(group, CloseReason::ExternalFullClose, report)
                .await?;
            self.registry
                .set_operation_status(operation.id, OperationStatus::Handled)
                .await?;
            return Ok(());
        }

        let previous = link.last_observed_quantity.unwrap_or(expected);
        if observed < expected && observed < previous {
            self.registry
                .record_external_operation(
                    Some(&link.group_id),
                    &link.symbol,
                    OperationType::ExternalPartialClose,
                    previous,
                    observed,
                    external_confidence(group),
                )
                .await;
            warn!(
                group_id = %link.group_id,
                symbol = %link.symbol,
                previous = %previous,
                observed = %observed,
                "Position reduced outside the bracket"
            );
            OperatorAlert::external_partial_close(&link.group_id, &link.symbol, previous, observed)
                .emit();
            report.external_partial_closes += 1;
        }

        self.registry
            .set_observed_quantity(&link.group_id, observed)
            .await
    }
}

/// Position size on the bracket's side; an opposite-side position counts as flat.
fn directional_quantity(signed: Decimal, direction: PositionDirection) -> Decimal {
    match direction {
        PositionDirection::Long => signed.max(Decimal::ZERO),
        PositionDirection::Short => (-signed).max(Decimal::ZERO),
    }
}

/// How sure we are that a size change was not caused by our own orders.
fn external_confidence(group: &GroupSnapshot) -> Decimal {
    let own_close_in_flight = group.with_role(OrderRole::Close).any(|o| {
        o.status.is_live() || o.status == OrderStatus::Cancelling
    });
    if own_close_in_flight {
        dec!(0.5)
    } else {
        dec!(0.9)
    }
}
