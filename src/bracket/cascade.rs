//! Cascade cancellation of bracket siblings.
//!
//! When a group reaches a terminal state every member still live on the
//! exchange is cancelled. Two guards make this safe under concurrent
//! triggers (reconciler pass, synthetic monitor, manual close):
//! - the group `active -> terminal` transition has a single winner, and
//!   only that caller cascades;
//! - each member is claimed `live -> cancelling` before any cancel request
//!   is sent, so a sibling is never cancelled twice.
//!
//! Cancellation is verified by re-querying the order; an accepted cancel
//! request alone never marks an order cancelled.

use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::registry::{BracketLinkRegistry, GroupSnapshot};
use super::retry::{with_timeout, RetryPolicy};
use crate::alert::OperatorAlert;
use crate::error::Result;
use crate::exchange::{ExchangeCapability, ExchangeError, ExchangeOrderState};
use crate::model::{BracketLink, CloseReason, GroupId, Order, OrderId, OrderStatus};

/// How one member order ended up after a cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberOutcome {
    /// Confirmed cancelled (or unknown) on the exchange
    Cancelled,
    /// Filled before the cancel took effect
    Filled,
    /// Retries exhausted; escalated for operator review
    Orphaned,
    /// Another caller already owns this order's cancellation
    Skipped,
}

/// Result of [`CascadeCanceller::on_group_terminal`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CascadeOutcome {
    /// Whether this call performed the group's terminal transition
    pub transitioned: bool,
    pub members: Vec<(OrderId, MemberOutcome)>,
}

impl CascadeOutcome {
    pub fn count(&self, outcome: MemberOutcome) -> usize {
        self.members.iter().filter(|(_, o)| *o == outcome).count()
    }
}

/// Cancels the remaining members of a group once it closes.
pub struct CascadeCanceller {
    registry: Arc<BracketLinkRegistry>,
    exchange: Arc<dyn ExchangeCapability>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl CascadeCanceller {
    pub fn new(
        registry: Arc<BracketLinkRegistry>,
        exchange: Arc<dyn ExchangeCapability>,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            exchange,
            retry,
            call_timeout,
        }
    }

    /// Close the group with `reason` and cancel its live members.
    ///
    /// Idempotent: if the group is already terminal this returns an outcome
    /// with `transitioned == false` and touches nothing. Orphaned groups are
    /// transitioned but never acted on further.
    pub async fn on_group_terminal(
        &self,
        group_id: &GroupId,
        reason: CloseReason,
    ) -> Result<CascadeOutcome> {
        let won = if reason == CloseReason::Orphaned {
            self.registry
                .mark_orphaned(group_id, "closed as orphaned")
                .await?
        } else {
            self.registry.mark_closed(group_id, reason).await?
        };

        if !won {
            debug!(group_id = %group_id, reason = %reason, "Cascade already handled elsewhere");
            return Ok(CascadeOutcome::default());
        }
        if reason == CloseReason::Orphaned {
            return Ok(CascadeOutcome {
                transitioned: true,
                members: Vec::new(),
            });
        }

        let Some(snapshot) = self.registry.group_snapshot(group_id).await else {
            return Ok(CascadeOutcome {
                transitioned: true,
                members: Vec::new(),
            });
        };

        let members = self.cancel_live_members(&snapshot).await;

        info!(
            group_id = %group_id,
            reason = %reason,
            cancelled = members.iter().filter(|(_, o)| *o == MemberOutcome::Cancelled).count(),
            orphaned = members.iter().filter(|(_, o)| *o == MemberOutcome::Orphaned).count(),
            "Cascade cancellation finished"
        );

        Ok(CascadeOutcome {
            transitioned: true,
            members,
        })
    }

    async fn cancel_live_members(&self, snapshot: &GroupSnapshot) -> Vec<(OrderId, MemberOutcome)> {
        let live: Vec<&Order> = snapshot
            .orders
            .iter()
            .filter(|o| o.status.is_live())
            .collect();

        let results = join_all(
            live.iter()
                .map(|order| self.cancel_member(&snapshot.link, order)),
        )
        .await;

        live.iter()
            .zip(results)
            .filter_map(|(order, result)| match result {
                Ok(outcome) => Some((order.id, outcome)),
                Err(e) => {
                    error!(
                        group_id = %snapshot.link.group_id,
                        client_order_id = %order.client_order_id,
                        error = %e,
                        "Cascade cancel failed"
                    );
                    None
                }
            })
            .collect()
    }

    /// Cancel one member, verifying the result with the exchange.
    async fn cancel_member(&self, link: &BracketLink, order: &Order) -> Result<MemberOutcome> {
        if !self.registry.claim_for_cancel(order.id).await? {
            debug!(client_order_id = %order.client_order_id, "Cancel already claimed");
            return Ok(MemberOutcome::Skipped);
        }

        let attempts = self.retry.max_attempts.max(1);
        let mut last_error: Option<ExchangeError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay_for(attempt - 1)).await;
            }

            match with_timeout(
                self.call_timeout,
                self.exchange
                    .cancel_order(&order.symbol, &order.client_order_id),
            )
            .await
            {
                Ok(_) | Err(ExchangeError::UnknownOrder(_)) => {}
                Err(e) => {
                    warn!(
                        group_id = %link.group_id,
                        client_order_id = %order.client_order_id,
                        role = %order.role,
                        attempt = attempt + 1,
                        error = %e,
                        "Cancel request failed"
                    );
                    last_error = Some(e);
                }
            }

            let report = match with_timeout(
                self.call_timeout,
                self.exchange.get_order(&order.symbol, &order.client_order_id),
            )
            .await
            {
                Ok(report) => report,
                Err(e) => {
                    warn!(
                        client_order_id = %order.client_order_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Could not verify cancel"
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            let Some(report) = report else {
                self.registry
                    .compare_and_set_order_status(
                        order.id,
                        OrderStatus::Cancelling,
                        OrderStatus::Cancelled,
                    )
                    .await?;
                debug!(client_order_id = %order.client_order_id, "Order unknown to exchange, treated as cancelled");
                return Ok(MemberOutcome::Cancelled);
            };

            if report.status.is_open() {
                last_error.get_or_insert_with(|| {
                    ExchangeError::Transient(format!("order still {:?} after cancel", report.status))
                });
                continue;
            }

            self.registry
                .apply_exchange_state(
                    order.id,
                    report.status,
                    report.filled_quantity,
                    report.avg_price,
                    Some(&report.exchange_order_id),
                )
                .await?;

            if report.status == ExchangeOrderState::Filled {
                warn!(
                    group_id = %link.group_id,
                    client_order_id = %order.client_order_id,
                    role = %order.role,
                    filled = %report.filled_quantity,
                    "Sibling filled while cancelling"
                );
                OperatorAlert::sibling_filled(&link.group_id, &order.client_order_id).emit();
                return Ok(MemberOutcome::Filled);
            }

            debug!(client_order_id = %order.client_order_id, status = ?report.status, "Cancel confirmed");
            return Ok(MemberOutcome::Cancelled);
        }

        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unverified".to_string());
        error!(
            group_id = %link.group_id,
            client_order_id = %order.client_order_id,
            role = %order.role,
            action = "cancel",
            attempts,
            last_error = %last_error,
            "Cancel retries exhausted, escalating order to orphaned"
        );
        self.registry.escalate_orphaned(order.id).await?;
        OperatorAlert::order_orphaned(
            &link.group_id,
            &order.client_order_id,
            order.role,
            "cancel",
            attempts,
            &last_error,
        )
        .emit();

        Ok(MemberOutcome::Orphaned)
    }
}
