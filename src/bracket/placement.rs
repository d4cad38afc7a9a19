//! Bracket placement and position closing.
//!
//! Opening a bracket:
//! 1. Resolve the effective [`RiskConfig`] and refuse if trading is halted
//! 2. Register the group (the risk snapshot rides on the entry order)
//! 3. Place the entry, then reduce-only TP and SL around the fill or limit price
//!
//! Placement retries transient failures. Because a timed-out place may still
//! have landed, every failure is checked against the exchange by client id
//! before being reported.

use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::cascade::CascadeCanceller;
use super::registry::{BracketLinkRegistry, EntryRequest};
use super::retry::{with_timeout, RetryPolicy};
use crate::alert::OperatorAlert;
use crate::error::{BracketError, Result};
use crate::exchange::{ExchangeCapability, ExchangeError, OrderType, PlaceOrderRequest};
use crate::model::{
    BracketStatus, CloseReason, GroupId, Order, OrderRole, OrderStatus, PositionDirection,
};
use crate::risk::{BracketLevels, RiskConfig, RiskInputs, RiskProfileResolver, StopLossPriceCalculator};

/// Strategy request for a new bracket.
#[derive(Debug, Clone)]
pub struct BracketOrderRequest {
    pub symbol: String,
    pub direction: PositionDirection,
    pub quantity: Decimal,
    /// Limit price; `None` for a market entry
    pub limit_price: Option<Decimal>,
    /// Inputs for risk resolution; `volatility` also drives TP/SL distance
    pub risk: RiskInputs,
}

/// Outcome of [`BracketPlacer::open_bracket`].
#[derive(Debug, Clone, Serialize)]
pub struct PlacedBracket {
    pub group_id: GroupId,
    pub risk: RiskConfig,
    pub levels: BracketLevels,
    pub entry: OrderStatus,
    pub take_profit: Option<OrderStatus>,
    pub stop_loss: Option<OrderStatus>,
}

impl PlacedBracket {
    /// Both protective orders are working on the exchange.
    pub fn is_protected(&self) -> bool {
        let working = |s: Option<OrderStatus>| {
            matches!(s, Some(OrderStatus::Submitted | OrderStatus::PartiallyFilled))
        };
        working(self.take_profit) && working(self.stop_loss)
    }
}

/// Places bracket orders and position closes through the exchange capability.
pub struct BracketPlacer {
    registry: Arc<BracketLinkRegistry>,
    exchange: Arc<dyn ExchangeCapability>,
    cascade: Arc<CascadeCanceller>,
    retry: RetryPolicy,
    call_timeout: Duration,
    account: String,
}

impl BracketPlacer {
    pub fn new(
        registry: Arc<BracketLinkRegistry>,
        exchange: Arc<dyn ExchangeCapability>,
        cascade: Arc<CascadeCanceller>,
        retry: RetryPolicy,
        call_timeout: Duration,
        account: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            exchange,
            cascade,
            retry,
            call_timeout,
            account: account.into(),
        }
    }

    /// Open a new bracket: entry plus reduce-only TP and SL.
    ///
    /// Fails before touching the exchange on bad input, a halted risk budget
    /// or a duplicate active bracket. A rejected entry cancels the group.
    /// TP/SL placement failures are reported in the result, not as errors,
    /// since the entry is already live at that point.
    pub async fn open_bracket(&self, request: BracketOrderRequest) -> Result<PlacedBracket> {
        let risk = RiskProfileResolver::resolve(&request.risk)?;
        if risk.trading_halted {
            warn!(symbol = %request.symbol, "Bracket refused, daily loss budget exhausted");
            return Err(BracketError::TradingHalted {
                symbol: request.symbol,
            });
        }

        let volatility = request.risk.volatility.unwrap_or(Decimal::ZERO);
        if let Some(limit) = request.limit_price {
            // Validate levels before anything is registered
            StopLossPriceCalculator::compute_levels(limit, request.direction, &risk, volatility)?;
        }

        let link = self
            .registry
            .create_group(EntryRequest {
                symbol: request.symbol.clone(),
                account: self.account.clone(),
                direction: request.direction,
                quantity: request.quantity,
                price: request.limit_price,
                risk_snapshot: Some(risk),
            })
            .await?;
        let group_id = link.group_id.clone();

        let entry = self
            .registry
            .order(link.entry_order)
            .await
            .ok_or(BracketError::UnknownOrder(link.entry_order))?;
        let entry_type = if entry.price.is_some() {
            OrderType::Limit
        } else {
            OrderType::Market
        };

        let entry_status = match self.place_member(&group_id, &entry, entry_type).await {
            Ok(status) => status,
            Err(e) => {
                self.abandon_entry(&group_id, &link.symbol, &e).await;
                return Err(e);
            }
        };

        let entry = self
            .registry
            .order(link.entry_order)
            .await
            .ok_or(BracketError::UnknownOrder(link.entry_order))?;

        if matches!(entry_status, OrderStatus::Cancelled | OrderStatus::Rejected)
            && entry.filled_quantity.is_zero()
        {
            self.cascade
                .on_group_terminal(&group_id, CloseReason::EntryCancelled)
                .await?;
            return Err(BracketError::Exchange(ExchangeError::Rejected(format!(
                "entry {} ended {entry_status} without a fill",
                entry.client_order_id
            ))));
        }

        let reference_price = entry
            .avg_fill_price
            .or(entry.price)
            .ok_or_else(|| {
                BracketError::InvalidInput(format!(
                    "no fill or limit price for entry {}",
                    entry.client_order_id
                ))
            })?;
        let levels = StopLossPriceCalculator::compute_levels(
            reference_price,
            request.direction,
            &risk,
            volatility,
        )?;
        let protected_quantity = if entry.filled_quantity.is_zero() {
            entry.quantity
        } else {
            entry.filled_quantity
        };

        let take_profit = self
            .attach_and_place(
                &group_id,
                OrderRole::TakeProfit,
                protected_quantity,
                levels.take_profit,
                OrderType::TakeProfitMarket,
            )
            .await;
        let stop_loss = self
            .attach_and_place(
                &group_id,
                OrderRole::StopLoss,
                protected_quantity,
                levels.stop_loss,
                OrderType::StopMarket,
            )
            .await;

        info!(
            group_id = %group_id,
            symbol = %request.symbol,
            direction = %request.direction,
            entry = %entry_status,
            reference_price = %reference_price,
            take_profit = %levels.take_profit,
            stop_loss = %levels.stop_loss,
            "Bracket opened"
        );

        Ok(PlacedBracket {
            group_id,
            risk,
            levels,
            entry: entry_status,
            take_profit,
            stop_loss,
        })
    }

    /// Close an active bracket with a reduce-only market order, then cancel
    /// the remaining members.
    ///
    /// Orphaned groups are refused; they need operator review.
    pub async fn close_bracket(&self, group_id: &GroupId, reason: CloseReason) -> Result<()> {
        let snapshot = self
            .registry
            .group_snapshot(group_id)
            .await
            .ok_or_else(|| BracketError::UnknownGroup(group_id.clone()))?;

        match snapshot.link.status {
            BracketStatus::Active => {}
            BracketStatus::Orphaned => return Err(BracketError::OrphanedBracket(group_id.clone())),
            _ => return Ok(()),
        }

        let quantity = snapshot.expected_position();
        if quantity > Decimal::ZERO {
            let close = self.registry.attach_close(group_id, quantity).await?;
            let status = match self.place_member(group_id, &close, OrderType::Market).await {
                Ok(status) => status,
                Err(e) => {
                    error!(
                        group_id = %group_id,
                        client_order_id = %close.client_order_id,
                        action = "close",
                        reason = %reason,
                        error = %e,
                        "Close order not placed"
                    );
                    if matches!(e, BracketError::RetriesExhausted { .. })
                        && self
                            .registry
                            .mark_orphaned(group_id, "close placement unconfirmed")
                            .await?
                    {
                        OperatorAlert::group_orphaned(
                            group_id,
                            &snapshot.link.symbol,
                            "close order placement could not be confirmed",
                        )
                        .emit();
                    }
                    return Err(e);
                }
            };
            info!(
                group_id = %group_id,
                client_order_id = %close.client_order_id,
                quantity = %quantity,
                status = %status,
                reason = %reason,
                "Close order placed"
            );
        }

        self.cascade.on_group_terminal(group_id, reason).await?;
        Ok(())
    }

    async fn attach_and_place(
        &self,
        group_id: &GroupId,
        role: OrderRole,
        quantity: Decimal,
        trigger_price: Decimal,
        order_type: OrderType,
    ) -> Option<OrderStatus> {
        let order = match self
            .registry
            .attach_conditional(group_id, role, quantity, trigger_price)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                warn!(group_id = %group_id, role = %role, error = %e, "Could not attach conditional");
                return None;
            }
        };

        match self.place_member(group_id, &order, order_type).await {
            Ok(status) => Some(status),
            Err(e) => {
                error!(
                    group_id = %group_id,
                    client_order_id = %order.client_order_id,
                    role = %role,
                    action = "place",
                    error = %e,
                    "Protective order not placed"
                );
                self.registry.order(order.id).await.map(|o| o.status)
            }
        }
    }

    /// Place one member order and fold the result into the registry.
    async fn place_member(
        &self,
        group_id: &GroupId,
        order: &Order,
        order_type: OrderType,
    ) -> Result<OrderStatus> {
        let request = PlaceOrderRequest {
            symbol: order.symbol.clone(),
            side: order.side,
            order_type,
            quantity: order.quantity,
            price: order.price,
            reduce_only: order.side.is_reduce_only(),
            client_order_id: order.client_order_id.clone(),
        };

        let placed = self
            .retry
            .run("place", &order.client_order_id, self.call_timeout, || {
                self.exchange.place_order(&request)
            })
            .await;

        match placed {
            Ok(placed) => {
                self.registry
                    .apply_exchange_state(
                        order.id,
                        placed.status,
                        placed.filled_quantity,
                        placed.avg_price,
                        Some(&placed.exchange_order_id),
                    )
                    .await?;
            }
            Err(e) => {
                // An attempt that timed out may have landed anyway
                if let Ok(Some(report)) = with_timeout(
                    self.call_timeout,
                    self.exchange.get_order(&order.symbol, &order.client_order_id),
                )
                .await
                {
                    warn!(
                        client_order_id = %order.client_order_id,
                        error = %e,
                        "Place reported failure but order exists on exchange"
                    );
                    self.registry
                        .apply_exchange_state(
                            order.id,
                            report.status,
                            report.filled_quantity,
                            report.avg_price,
                            Some(&report.exchange_order_id),
                        )
                        .await?;
                } else {
                    self.fail_member(group_id, order, &e).await?;
                    return Err(e);
                }
            }
        }

        let current = self
            .registry
            .order(order.id)
            .await
            .ok_or(BracketError::UnknownOrder(order.id))?;
        if current.status == OrderStatus::Cancelled {
            self.cancel_late_placement(&current).await;
        }
        Ok(current.status)
    }

    async fn fail_member(&self, group_id: &GroupId, order: &Order, error: &BracketError) -> Result<()> {
        match error {
            BracketError::RetriesExhausted {
                attempts, source, ..
            } => {
                self.registry.escalate_orphaned(order.id).await?;
                OperatorAlert::order_orphaned(
                    group_id,
                    &order.client_order_id,
                    order.role,
                    "place",
                    *attempts,
                    &source.to_string(),
                )
                .emit();
            }
            _ => {
                self.registry
                    .compare_and_set_order_status(order.id, OrderStatus::Pending, OrderStatus::Rejected)
                    .await?;
            }
        }
        Ok(())
    }

    /// The group was closed while this order was being placed; make sure it
    /// does not keep working on the exchange.
    async fn cancel_late_placement(&self, order: &Order) {
        let still_open = matches!(
            with_timeout(
                self.call_timeout,
                self.exchange.get_order(&order.symbol, &order.client_order_id),
            )
            .await,
            Ok(Some(ref report)) if report.status.is_open()
        );
        if !still_open {
            return;
        }

        warn!(client_order_id = %order.client_order_id, "Order landed after its group closed, cancelling");
        if let Err(e) = self
            .retry
            .run("cancel", &order.client_order_id, self.call_timeout, || {
                self.exchange
                    .cancel_order(&order.symbol, &order.client_order_id)
            })
            .await
        {
            error!(client_order_id = %order.client_order_id, error = %e, "Late cancel failed");
            if let Some(link) = self.registry.lookup_by_client_id(&order.client_order_id).await {
                OperatorAlert::order_orphaned(
                    &link.group_id,
                    &order.client_order_id,
                    order.role,
                    "cancel",
                    self.retry.max_attempts,
                    &e.to_string(),
                )
                .emit();
            }
        }
    }

    async fn abandon_entry(&self, group_id: &GroupId, symbol: &str, error: &BracketError) {
        let outcome = match error {
            BracketError::RetriesExhausted { .. } => {
                self.registry
                    .mark_orphaned(group_id, "entry placement unconfirmed")
                    .await
                    .map(|won| {
                        if won {
                            OperatorAlert::group_orphaned(
                                group_id,
                                symbol,
                                "entry placement could not be confirmed",
                            )
                            .emit();
                        }
                    })
            }
            _ => self
                .cascade
                .on_group_terminal(group_id, CloseReason::EntryCancelled)
                .await
                .map(|_| ()),
        };
        if let Err(e) = outcome {
            error!(group_id = %group_id, error = %e, "Failed to retire group after entry failure");
        }
    }
}
