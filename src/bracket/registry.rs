//! Bracket group registry.
//!
//! Single source of truth for which orders belong to which bracket group.
//! Every mutation of group or order status goes through the compare-and-set
//! style methods here; callers never write fields directly.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::alert::OperatorAlert;
use crate::error::{BracketError, Result};
use crate::exchange::ExchangeOrderState;
use crate::model::{
    parse_client_id, BracketLink, BracketStatus, CloseReason, ExternalOperation, GroupId,
    OperationStatus, OperationType, Order, OrderId, OrderRole, OrderSide, OrderStatus,
    PositionDirection, MAX_CLIENT_ORDER_ID_LEN,
};
use crate::persistence::BracketStore;
use crate::risk::RiskConfig;

/// Request to open a new bracket group.
#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub symbol: String,
    pub account: String,
    pub direction: PositionDirection,
    pub quantity: Decimal,
    /// Limit price; `None` for a market entry
    pub price: Option<Decimal>,
    pub risk_snapshot: Option<RiskConfig>,
}

/// Consistent copy of a group and its member orders.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub link: BracketLink,
    pub orders: Vec<Order>,
}

impl GroupSnapshot {
    pub fn order(&self, id: OrderId) -> Option<&Order> {
        self.orders.iter().find(|o| o.id == id)
    }

    pub fn entry(&self) -> Option<&Order> {
        self.order(self.link.entry_order)
    }

    /// Attached take-profit or stop-loss order.
    pub fn conditional(&self, role: OrderRole) -> Option<&Order> {
        self.link.conditional(role).and_then(|id| self.order(id))
    }

    pub fn with_role(&self, role: OrderRole) -> impl Iterator<Item = &Order> {
        self.orders.iter().filter(move |o| o.role == role)
    }

    /// Quantity closed by this system's own reduce-only orders.
    pub fn closing_filled_quantity(&self) -> Decimal {
        self.orders
            .iter()
            .filter(|o| o.role.is_closing())
            .map(|o| o.filled_quantity)
            .sum()
    }

    /// Position size this bracket expects on the exchange.
    pub fn expected_position(&self) -> Decimal {
        let opened: Decimal = self
            .orders
            .iter()
            .filter(|o| matches!(o.role, OrderRole::Entry | OrderRole::Scaling))
            .map(|o| o.filled_quantity)
            .sum();
        (opened - self.closing_filled_quantity()).max(Decimal::ZERO)
    }
}

#[derive(Default)]
struct RegistryState {
    orders: HashMap<OrderId, Order>,
    groups: HashMap<GroupId, BracketLink>,
    by_client_id: HashMap<String, OrderId>,
    /// (symbol, account) -> active group
    active: HashMap<(String, String), GroupId>,
    operations: Vec<ExternalOperation>,
}

impl RegistryState {
    fn snapshot(&self, group_id: &GroupId) -> Option<GroupSnapshot> {
        let link = self.groups.get(group_id)?.clone();
        let mut orders = Vec::new();
        if let Some(entry) = self.orders.get(&link.entry_order) {
            orders.push(entry.clone());
            orders.extend(
                entry
                    .children
                    .iter()
                    .filter_map(|id| self.orders.get(id))
                    .cloned(),
            );
        }
        Some(GroupSnapshot { link, orders })
    }

    fn insert_order(&mut self, order: Order) {
        self.by_client_id
            .insert(order.client_order_id.clone(), order.id);
        self.orders.insert(order.id, order);
    }
}

fn ensure_client_id_len(client_order_id: &str) -> Result<()> {
    if client_order_id.len() > MAX_CLIENT_ORDER_ID_LEN {
        return Err(BracketError::ClientIdTooLong {
            client_order_id: client_order_id.to_string(),
            limit: MAX_CLIENT_ORDER_ID_LEN,
        });
    }
    Ok(())
}

/// In-memory registry with optional write-through persistence.
pub struct BracketLinkRegistry {
    state: RwLock<RegistryState>,
    next_order_id: AtomicU64,
    next_operation_id: AtomicU64,
    store: Option<Arc<dyn BracketStore>>,
}

impl Default for BracketLinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BracketLinkRegistry {
    /// Registry without persistence.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            next_order_id: AtomicU64::new(1),
            next_operation_id: AtomicU64::new(1),
            store: None,
        }
    }

    /// Rebuild the registry from a store, resuming id allocation after the
    /// highest persisted ids. All writes go through to the store afterwards.
    pub fn restore(store: Arc<dyn BracketStore>) -> anyhow::Result<Self> {
        let records = store.load_active_groups()?;
        let max_order_id = store.max_order_id()?;
        let max_operation_id = store.max_external_operation_id()?;

        let mut state = RegistryState::default();
        for (link, orders) in records {
            let key = (link.symbol.clone(), link.account.clone());
            if let Some(existing) = state.active.get(&key) {
                warn!(
                    group_id = %link.group_id,
                    existing = %existing,
                    symbol = %link.symbol,
                    "Multiple active brackets persisted for one symbol"
                );
            } else {
                state.active.insert(key, link.group_id.clone());
            }
            for order in orders {
                state.insert_order(order);
            }
            state.groups.insert(link.group_id.clone(), link);
        }

        info!(
            active_groups = state.groups.len(),
            next_order_id = max_order_id + 1,
            "Restored bracket registry"
        );

        Ok(Self {
            state: RwLock::new(state),
            next_order_id: AtomicU64::new(max_order_id + 1),
            next_operation_id: AtomicU64::new(max_operation_id + 1),
            store: Some(store),
        })
    }

    #[cfg(test)]
    fn starting_at(first_order_id: u64) -> Self {
        let registry = Self::new();
        registry
            .next_order_id
            .store(first_order_id, Ordering::SeqCst);
        registry
    }

    fn allocate_order_id(&self) -> OrderId {
        OrderId(self.next_order_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Write through to the store on the blocking pool.
    ///
    /// Callers keep the state lock across the write so the store sees
    /// mutations in the same order as memory.
    async fn persist<F>(&self, operation: &'static str, write: F)
    where
        F: FnOnce(&dyn BracketStore) -> anyhow::Result<()> + Send + 'static,
    {
        let Some(store) = self.store.clone() else {
            return;
        };
        let result = tokio::task::spawn_blocking(move || write(store.as_ref()))
            .await
            .unwrap_or_else(|e| Err(anyhow::anyhow!("store task failed: {e}")));
        if let Err(e) = result {
            error!(operation, error = %e, "Failed to persist bracket state");
            OperatorAlert::persistence_failure(operation, &format!("{e:#}")).emit();
        }
    }

    /// Open a new bracket group around an entry order.
    ///
    /// Fails with [`BracketError::DuplicateActiveBracket`] if the symbol
    /// already has an active group on this account.
    pub async fn create_group(&self, request: EntryRequest) -> Result<BracketLink> {
        if request.symbol.is_empty() {
            return Err(BracketError::InvalidInput("symbol must not be empty".into()));
        }
        if request.quantity <= Decimal::ZERO {
            return Err(BracketError::InvalidInput(format!(
                "entry quantity must be positive, got {}",
                request.quantity
            )));
        }
        if let Some(price) = request.price.filter(|p| *p <= Decimal::ZERO) {
            return Err(BracketError::InvalidInput(format!(
                "entry price must be positive, got {price}"
            )));
        }

        let mut state = self.state.write().await;
        let key = (request.symbol.clone(), request.account.clone());
        if let Some(existing) = state.active.get(&key) {
            return Err(BracketError::DuplicateActiveBracket {
                symbol: request.symbol,
                account: request.account,
                group_id: existing.clone(),
            });
        }

        let now = Utc::now();
        let entry_id = self.allocate_order_id();
        let group_id = GroupId::new(entry_id, now);
        let client_order_id = group_id.client_order_id(OrderRole::Entry);
        ensure_client_id_len(&client_order_id)?;

        let entry = Order {
            id: entry_id,
            symbol: request.symbol.clone(),
            account: request.account.clone(),
            side: request.direction.open_side(),
            role: OrderRole::Entry,
            quantity: request.quantity,
            price: request.price,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            status: OrderStatus::Pending,
            exchange_order_id: None,
            client_order_id: client_order_id.clone(),
            parent: None,
            children: Vec::new(),
            risk_snapshot: request.risk_snapshot,
            created_at: now,
            updated_at: now,
        };

        let link = BracketLink {
            group_id: group_id.clone(),
            symbol: request.symbol,
            account: request.account,
            direction: request.direction,
            entry_order: entry_id,
            entry_client_id: client_order_id,
            take_profit_order: None,
            take_profit_client_id: None,
            stop_loss_order: None,
            stop_loss_client_id: None,
            status: BracketStatus::Active,
            close_reason: None,
            status_note: None,
            last_observed_quantity: None,
            unresolved_since: None,
            created_at: now,
            updated_at: now,
        };

        let (entry_record, link_record) = (entry.clone(), link.clone());
        self.persist("create_group", move |store| {
            store.save_order(&entry_record)?;
            store.save_group(&link_record)
        })
        .await;

        state.insert_order(entry);
        state.groups.insert(group_id.clone(), link.clone());
        state.active.insert(key, group_id.clone());

        info!(
            group_id = %group_id,
            symbol = %link.symbol,
            account = %link.account,
            direction = %link.direction,
            "Bracket group created"
        );
        Ok(link)
    }

    /// Attach a take-profit or stop-loss order to an active group.
    pub async fn attach_conditional(
        &self,
        group_id: &GroupId,
        role: OrderRole,
        quantity: Decimal,
        trigger_price: Decimal,
    ) -> Result<Order> {
        if !role.is_conditional() {
            return Err(BracketError::InvalidConditionalRole(role));
        }
        if trigger_price <= Decimal::ZERO {
            return Err(BracketError::InvalidInput(format!(
                "trigger price must be positive, got {trigger_price}"
            )));
        }

        let mut state = self.state.write().await;
        let link = state
            .groups
            .get(group_id)
            .filter(|l| l.is_active())
            .ok_or_else(|| BracketError::UnknownGroup(group_id.clone()))?;
        if link.conditional(role).is_some() {
            return Err(BracketError::RoleAlreadyAttached {
                group_id: group_id.clone(),
                role,
            });
        }

        let client_order_id = group_id.client_order_id(role);
        ensure_client_id_len(&client_order_id)?;
        let order = self.child_order(
            link,
            role,
            OrderSide::ReduceOnlyClose,
            quantity,
            Some(trigger_price),
            client_order_id,
        )?;

        self.link_child(&mut state, group_id, &order, |link| match role {
            OrderRole::TakeProfit => {
                link.take_profit_order = Some(order.id);
                link.take_profit_client_id = Some(order.client_order_id.clone());
            }
            _ => {
                link.stop_loss_order = Some(order.id);
                link.stop_loss_client_id = Some(order.client_order_id.clone());
            }
        })
        .await;

        debug!(
            group_id = %group_id,
            role = %role,
            client_order_id = %order.client_order_id,
            trigger_price = %trigger_price,
            "Conditional order attached"
        );
        Ok(order)
    }

    /// Attach a reduce-only market close to an active group.
    ///
    /// At most one close order is in flight per group. A close that was
    /// rejected or cancelled may be followed by another attempt, which gets
    /// the next `-close<n>` client id. An orphaned close blocks further
    /// attempts.
    pub async fn attach_close(&self, group_id: &GroupId, quantity: Decimal) -> Result<Order> {
        let mut state = self.state.write().await;
        let link = state
            .groups
            .get(group_id)
            .filter(|l| l.is_active())
            .ok_or_else(|| BracketError::UnknownGroup(group_id.clone()))?;

        let previous: Vec<OrderStatus> = state
            .orders
            .get(&link.entry_order)
            .map(|entry| {
                entry
                    .children
                    .iter()
                    .filter_map(|id| state.orders.get(id))
                    .filter(|o| o.role == OrderRole::Close)
                    .map(|o| o.status)
                    .collect()
            })
            .unwrap_or_default();
        let retryable = |status: &OrderStatus| {
            matches!(
                status,
                OrderStatus::Rejected | OrderStatus::Cancelled | OrderStatus::Filled
            )
        };
        if !previous.iter().all(retryable) {
            return Err(BracketError::RoleAlreadyAttached {
                group_id: group_id.clone(),
                role: OrderRole::Close,
            });
        }

        let client_order_id = group_id.close_client_order_id(previous.len() as u32 + 1);
        ensure_client_id_len(&client_order_id)?;
        let order = self.child_order(
            link,
            OrderRole::Close,
            OrderSide::ReduceOnlyClose,
            quantity,
            None,
            client_order_id,
        )?;

        self.link_child(&mut state, group_id, &order, |_| {}).await;
        Ok(order)
    }

    /// Attach an order that adds to the bracket's position.
    pub async fn attach_scaling(
        &self,
        group_id: &GroupId,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<Order> {
        let mut state = self.state.write().await;
        let link = state
            .groups
            .get(group_id)
            .filter(|l| l.is_active())
            .ok_or_else(|| BracketError::UnknownGroup(group_id.clone()))?;

        let sequence = state
            .orders
            .get(&link.entry_order)
            .map(|entry| {
                entry
                    .children
                    .iter()
                    .filter_map(|id| state.orders.get(id))
                    .filter(|o| o.role == OrderRole::Scaling)
                    .count()
            })
            .unwrap_or(0) as u32
            + 1;

        let client_order_id = group_id.scaling_client_order_id(sequence);
        ensure_client_id_len(&client_order_id)?;
        let order = self.child_order(
            link,
            OrderRole::Scaling,
            link.direction.open_side(),
            quantity,
            price,
            client_order_id,
        )?;

        self.link_child(&mut state, group_id, &order, |_| {}).await;
        Ok(order)
    }

    fn child_order(
        &self,
        link: &BracketLink,
        role: OrderRole,
        side: OrderSide,
        quantity: Decimal,
        price: Option<Decimal>,
        client_order_id: String,
    ) -> Result<Order> {
        if quantity <= Decimal::ZERO {
            return Err(BracketError::InvalidInput(format!(
                "{role} quantity must be positive, got {quantity}"
            )));
        }

        let now = Utc::now();
        Ok(Order {
            id: self.allocate_order_id(),
            symbol: link.symbol.clone(),
            account: link.account.clone(),
            side,
            role,
            quantity,
            price,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            status: OrderStatus::Pending,
            exchange_order_id: None,
            client_order_id,
            parent: Some(link.entry_order),
            children: Vec::new(),
            risk_snapshot: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn link_child<F>(
        &self,
        state: &mut RegistryState,
        group_id: &GroupId,
        order: &Order,
        update_link: F,
    ) where
        F: FnOnce(&mut BracketLink),
    {
        let now = Utc::now();
        let Some(link) = state.groups.get_mut(group_id) else {
            return;
        };
        update_link(link);
        link.updated_at = now;
        let link = link.clone();

        let entry = state.orders.get_mut(&link.entry_order).map(|entry| {
            entry.children.push(order.id);
            entry.updated_at = now;
            entry.clone()
        });

        let order_record = order.clone();
        self.persist("attach_order", move |store| {
            store.save_order(&order_record)?;
            if let Some(entry) = &entry {
                store.save_order(entry)?;
            }
            store.save_group(&link)
        })
        .await;

        state.insert_order(order.clone());
    }

    /// Resolve the group an arbitrary order belongs to.
    pub async fn lookup_by_client_id(&self, client_order_id: &str) -> Option<BracketLink> {
        let state = self.state.read().await;
        let group_id = match state.by_client_id.get(client_order_id) {
            Some(id) => {
                let order = state.orders.get(id)?;
                parse_client_id(&order.client_order_id)?.0
            }
            None => parse_client_id(client_order_id)?.0,
        };
        state.groups.get(&group_id).cloned()
    }

    pub async fn order(&self, order_id: OrderId) -> Option<Order> {
        self.state.read().await.orders.get(&order_id).cloned()
    }

    pub async fn order_by_client_id(&self, client_order_id: &str) -> Option<Order> {
        let state = self.state.read().await;
        state
            .by_client_id
            .get(client_order_id)
            .and_then(|id| state.orders.get(id))
            .cloned()
    }

    pub async fn group(&self, group_id: &GroupId) -> Option<BracketLink> {
        self.state.read().await.groups.get(group_id).cloned()
    }

    /// Group plus member orders, read under one lock.
    pub async fn group_snapshot(&self, group_id: &GroupId) -> Option<GroupSnapshot> {
        self.state.read().await.snapshot(group_id)
    }

    pub async fn active_groups(&self) -> Vec<GroupSnapshot> {
        let state = self.state.read().await;
        let mut groups: Vec<GroupSnapshot> = state
            .active
            .values()
            .filter_map(|id| state.snapshot(id))
            .collect();
        groups.sort_by(|a, b| a.link.created_at.cmp(&b.link.created_at));
        groups
    }

    pub async fn active_group_for(&self, symbol: &str, account: &str) -> Option<GroupId> {
        self.state
            .read()
            .await
            .active
            .get(&(symbol.to_string(), account.to_string()))
            .cloned()
    }

    /// Transition an active group to the terminal status for `reason`.
    ///
    /// Returns `true` only for the caller that performed the transition.
    /// Already-terminal groups are a no-op.
    pub async fn mark_closed(&self, group_id: &GroupId, reason: CloseReason) -> Result<bool> {
        self.transition_group(group_id, reason, None).await
    }

    /// Transition an active group to `orphaned`; requires operator review.
    pub async fn mark_orphaned(&self, group_id: &GroupId, note: &str) -> Result<bool> {
        self.transition_group(group_id, CloseReason::Orphaned, Some(note.to_string()))
            .await
    }

    async fn transition_group(
        &self,
        group_id: &GroupId,
        reason: CloseReason,
        note: Option<String>,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let link = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| BracketError::UnknownGroup(group_id.clone()))?;

        if !link.is_active() {
            debug!(
                group_id = %group_id,
                status = %link.status,
                reason = %reason,
                "Group already terminal, ignoring transition"
            );
            return Ok(false);
        }

        link.status = reason.terminal_status();
        link.close_reason = Some(reason);
        link.status_note = note;
        link.updated_at = Utc::now();
        let updated = link.clone();

        let key = (updated.symbol.clone(), updated.account.clone());
        if state.active.get(&key) == Some(group_id) {
            state.active.remove(&key);
        }

        let record = updated.clone();
        self.persist("group_status", move |store| {
            if !store.compare_and_set_group_status(BracketStatus::Active, &record)? {
                warn!(group_id = %record.group_id, "Stored group was not active, overwriting");
                store.save_group(&record)?;
            }
            Ok(())
        })
        .await;

        info!(
            group_id = %group_id,
            status = %updated.status,
            reason = %reason,
            "Bracket group transitioned"
        );
        Ok(true)
    }

    async fn update_order<F>(&self, order_id: OrderId, update: F) -> Result<bool>
    where
        F: FnOnce(&mut Order) -> bool,
    {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or(BracketError::UnknownOrder(order_id))?;

        if !update(order) {
            return Ok(false);
        }
        order.updated_at = Utc::now();
        let snapshot = order.clone();
        self.persist("order", move |store| store.save_order(&snapshot))
            .await;
        Ok(true)
    }

    /// Claim a live order for cancellation (`live -> cancelling`).
    ///
    /// Only the caller that wins the claim may send the cancel request.
    pub async fn claim_for_cancel(&self, order_id: OrderId) -> Result<bool> {
        self.update_order(order_id, |order| {
            if order.status.is_live() {
                order.status = OrderStatus::Cancelling;
                true
            } else {
                false
            }
        })
        .await
    }

    /// Set `new` only if the order is currently `expected`.
    pub async fn compare_and_set_order_status(
        &self,
        order_id: OrderId,
        expected: OrderStatus,
        new: OrderStatus,
    ) -> Result<bool> {
        self.update_order(order_id, |order| {
            if order.status == expected {
                order.status = new;
                true
            } else {
                false
            }
        })
        .await
    }

    /// Escalate any non-terminal order to `orphaned`.
    pub async fn escalate_orphaned(&self, order_id: OrderId) -> Result<bool> {
        self.update_order(order_id, |order| {
            if order.status.is_terminal() {
                false
            } else {
                order.status = OrderStatus::Orphaned;
                true
            }
        })
        .await
    }

    /// Fold an exchange view of the order into local state.
    ///
    /// Returns the new status if this call changed it. Terminal orders are
    /// never changed, and an in-flight cancel stays `cancelling` until the
    /// exchange reports a final state.
    pub async fn apply_exchange_state(
        &self,
        order_id: OrderId,
        exchange_state: ExchangeOrderState,
        filled_quantity: Decimal,
        avg_price: Option<Decimal>,
        exchange_order_id: Option<&str>,
    ) -> Result<Option<OrderStatus>> {
        let mut transition = None;
        self.update_order(order_id, |order| {
            if order.status.is_terminal() {
                return false;
            }

            let mut changed = false;
            if let Some(id) = exchange_order_id {
                if order.exchange_order_id.as_deref() != Some(id) {
                    order.exchange_order_id = Some(id.to_string());
                    changed = true;
                }
            }
            if filled_quantity > order.filled_quantity {
                order.filled_quantity = filled_quantity;
                order.avg_fill_price = avg_price.or(order.avg_fill_price);
                changed = true;
            }

            let next = match exchange_state.to_local() {
                OrderStatus::Submitted | OrderStatus::PartiallyFilled
                    if order.status == OrderStatus::Cancelling =>
                {
                    OrderStatus::Cancelling
                }
                other => other,
            };
            if next != order.status {
                order.status = next;
                transition = Some(next);
                changed = true;
            }
            changed
        })
        .await?;
        Ok(transition)
    }

    /// Record the quantity seen on the exchange for this group.
    pub async fn set_observed_quantity(&self, group_id: &GroupId, quantity: Decimal) -> Result<()> {
        self.update_group(group_id, |link| {
            if link.last_observed_quantity == Some(quantity) {
                return false;
            }
            link.last_observed_quantity = Some(quantity);
            true
        })
        .await
    }

    /// Start (`Some`) or clear (`None`) the unresolved-member clock.
    pub async fn set_unresolved_since(
        &self,
        group_id: &GroupId,
        since: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.update_group(group_id, |link| {
            if link.unresolved_since == since {
                return false;
            }
            link.unresolved_since = since;
            true
        })
        .await
    }

    async fn update_group<F>(&self, group_id: &GroupId, update: F) -> Result<()>
    where
        F: FnOnce(&mut BracketLink) -> bool,
    {
        let mut state = self.state.write().await;
        let link = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| BracketError::UnknownGroup(group_id.clone()))?;
        if update(link) {
            link.updated_at = Utc::now();
            let snapshot = link.clone();
            self.persist("group", move |store| store.save_group(&snapshot))
                .await;
        }
        Ok(())
    }

    /// Record a detected out-of-band position change.
    pub async fn record_external_operation(
        &self,
        group_id: Option<&GroupId>,
        symbol: &str,
        operation_type: OperationType,
        old_amount: Decimal,
        new_amount: Decimal,
        confidence: Decimal,
    ) -> ExternalOperation {
        let operation = ExternalOperation {
            id: self.next_operation_id.fetch_add(1, Ordering::SeqCst),
            group_id: group_id.cloned(),
            symbol: symbol.to_string(),
            operation_type,
            old_amount,
            new_amount,
            confidence,
            status: OperationStatus::Detected,
            detected_at: Utc::now(),
        };

        let mut state = self.state.write().await;
        let record = operation.clone();
        self.persist("external_operation", move |store| {
            store.record_external_operation(&record)
        })
        .await;
        state.operations.push(operation.clone());

        info!(
            operation_id = operation.id,
            group_id = ?operation.group_id.as_ref().map(|g| g.as_str()),
            symbol = %symbol,
            operation_type = %operation_type,
            old_amount = %old_amount,
            new_amount = %new_amount,
            confidence = %confidence,
            "External operation recorded"
        );
        operation
    }

    pub async fn set_operation_status(&self, id: u64, status: OperationStatus) -> Result<()> {
        let mut state = self.state.write().await;
        let operation = state
            .operations
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or_else(|| BracketError::InvalidInput(format!("unknown external operation {id}")))?;
        operation.status = status;
        self.persist("external_operation_status", move |store| {
            store.update_external_operation_status(id, status)
        })
        .await;
        Ok(())
    }

    pub async fn external_operations(&self) -> Vec<ExternalOperation> {
        self.state.read().await.operations.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteStore;
    use rust_decimal_macros::dec;

    fn entry(symbol: &str) -> EntryRequest {
        EntryRequest {
            symbol: symbol.to_string(),
            account: "main".to_string(),
            direction: PositionDirection::Long,
            quantity: dec!(0.5),
            price: None,
            risk_snapshot: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_active_bracket_then_reopen_after_close() {
        let registry = BracketLinkRegistry::new();
        let link = registry.create_group(entry("BTCUSDT")).await.unwrap();

        let err = registry.create_group(entry("BTCUSDT")).await.unwrap_err();
        assert!(matches!(
            err,
            BracketError::DuplicateActiveBracket { ref group_id, .. } if *group_id == link.group_id
        ));

        assert!(registry
            .mark_closed(&link.group_id, CloseReason::Manual)
            .await
            .unwrap());
        let reopened = registry.create_group(entry("BTCUSDT")).await.unwrap();
        assert_ne!(reopened.group_id, link.group_id);
    }

    #[tokio::test]
    async fn test_same_symbol_on_other_account_is_independent() {
        let registry = BracketLinkRegistry::new();
        registry.create_group(entry("BTCUSDT")).await.unwrap();

        let mut other = entry("BTCUSDT");
        other.account = "sub".to_string();
        assert!(registry.create_group(other).await.is_ok());
    }

    #[tokio::test]
    async fn test_attach_conditional_rules() {
        let registry = BracketLinkRegistry::new();
        let link = registry.create_group(entry("ETHUSDT")).await.unwrap();

        let tp = registry
            .attach_conditional(&link.group_id, OrderRole::TakeProfit, dec!(0.5), dec!(3300))
            .await
            .unwrap();
        assert_eq!(tp.client_order_id, format!("{}-tp", link.group_id));
        assert_eq!(tp.side, OrderSide::ReduceOnlyClose);
        assert_eq!(tp.parent, Some(link.entry_order));

        let err = registry
            .attach_conditional(&link.group_id, OrderRole::TakeProfit, dec!(0.5), dec!(3400))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BracketError::RoleAlreadyAttached { role: OrderRole::TakeProfit, .. }
        ));

        let err = registry
            .attach_conditional(&link.group_id, OrderRole::Entry, dec!(0.5), dec!(3400))
            .await
            .unwrap_err();
        assert!(matches!(err, BracketError::InvalidConditionalRole(OrderRole::Entry)));

        let err = registry
            .attach_conditional(
                &GroupId::from("999-1700000000"),
                OrderRole::StopLoss,
                dec!(0.5),
                dec!(2900),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BracketError::UnknownGroup(_)));

        registry
            .attach_conditional(&link.group_id, OrderRole::StopLoss, dec!(0.5), dec!(2900))
            .await
            .unwrap();
        let snapshot = registry.group_snapshot(&link.group_id).await.unwrap();
        assert_eq!(snapshot.orders.len(), 3);
        assert_eq!(snapshot.entry().unwrap().children.len(), 2);
        assert!(snapshot.conditional(OrderRole::StopLoss).is_some());
    }

    #[tokio::test]
    async fn test_attach_to_closed_group_fails() {
        let registry = BracketLinkRegistry::new();
        let link = registry.create_group(entry("ETHUSDT")).await.unwrap();
        registry
            .mark_closed(&link.group_id, CloseReason::Manual)
            .await
            .unwrap();

        let err = registry
            .attach_conditional(&link.group_id, OrderRole::StopLoss, dec!(0.5), dec!(2900))
            .await
            .unwrap_err();
        assert!(matches!(err, BracketError::UnknownGroup(_)));
    }

    #[tokio::test]
    async fn test_lookup_by_client_id() {
        let registry = BracketLinkRegistry::new();
        let link = registry.create_group(entry("SOLUSDT")).await.unwrap();
        let sl = registry
            .attach_conditional(&link.group_id, OrderRole::StopLoss, dec!(0.5), dec!(90))
            .await
            .unwrap();

        let found = registry
            .lookup_by_client_id(&sl.client_order_id)
            .await
            .unwrap();
        assert_eq!(found.group_id, link.group_id);
        assert!(registry.lookup_by_client_id("1-2-tp").await.is_none());
        assert!(registry.lookup_by_client_id("garbage").await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_mark_closed_has_single_winner() {
        let registry = Arc::new(BracketLinkRegistry::new());
        let link = registry.create_group(entry("BTCUSDT")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            let group_id = link.group_id.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    registry
                        .mark_closed(&group_id, CloseReason::ExternalFullClose)
                        .await
                } else {
                    registry.mark_orphaned(&group_id, "race").await
                }
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(!registry.group(&link.group_id).await.unwrap().is_active());
    }

    #[tokio::test]
    async fn test_mark_unknown_group_is_error() {
        let registry = BracketLinkRegistry::new();
        let err = registry
            .mark_closed(&GroupId::from("1-1"), CloseReason::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, BracketError::UnknownGroup(_)));
    }

    #[tokio::test]
    async fn test_cancel_claim_is_exclusive() {
        let registry = BracketLinkRegistry::new();
        let link = registry.create_group(entry("BTCUSDT")).await.unwrap();
        let sl = registry
            .attach_conditional(&link.group_id, OrderRole::StopLoss, dec!(0.5), dec!(47000))
            .await
            .unwrap();

        assert!(registry.claim_for_cancel(sl.id).await.unwrap());
        assert!(!registry.claim_for_cancel(sl.id).await.unwrap());
        assert!(registry
            .compare_and_set_order_status(sl.id, OrderStatus::Cancelling, OrderStatus::Cancelled)
            .await
            .unwrap());
        assert!(!registry.escalate_orphaned(sl.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_exchange_state() {
        let registry = BracketLinkRegistry::new();
        let link = registry.create_group(entry("BTCUSDT")).await.unwrap();

        let status = registry
            .apply_exchange_state(
                link.entry_order,
                ExchangeOrderState::Filled,
                dec!(0.5),
                Some(dec!(50000)),
                Some("ex-1"),
            )
            .await
            .unwrap();
        assert_eq!(status, Some(OrderStatus::Filled));

        // Terminal orders are never changed again
        let status = registry
            .apply_exchange_state(
                link.entry_order,
                ExchangeOrderState::Canceled,
                dec!(0.5),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(status, None);

        let snapshot = registry.group_snapshot(&link.group_id).await.unwrap();
        assert_eq!(snapshot.expected_position(), dec!(0.5));
        assert_eq!(
            snapshot.entry().unwrap().exchange_order_id.as_deref(),
            Some("ex-1")
        );
    }

    #[tokio::test]
    async fn test_cancelling_order_stays_cancelling_while_open() {
        let registry = BracketLinkRegistry::new();
        let link = registry.create_group(entry("BTCUSDT")).await.unwrap();
        let tp = registry
            .attach_conditional(&link.group_id, OrderRole::TakeProfit, dec!(0.5), dec!(52000))
            .await
            .unwrap();
        registry.claim_for_cancel(tp.id).await.unwrap();

        let status = registry
            .apply_exchange_state(tp.id, ExchangeOrderState::New, Decimal::ZERO, None, None)
            .await
            .unwrap();
        assert_eq!(status, None);
        assert_eq!(
            registry.order(tp.id).await.unwrap().status,
            OrderStatus::Cancelling
        );
    }

    #[tokio::test]
    async fn test_client_id_length_limit() {
        let registry = BracketLinkRegistry::starting_at(u64::MAX - 10);
        let err = registry.create_group(entry("BTCUSDT")).await.unwrap_err();
        assert!(matches!(err, BracketError::ClientIdTooLong { limit: 36, .. }));
    }

    #[tokio::test]
    async fn test_close_and_scaling_orders() {
        let registry = BracketLinkRegistry::new();
        let link = registry.create_group(entry("BTCUSDT")).await.unwrap();

        let first = registry
            .attach_scaling(&link.group_id, dec!(0.1), Some(dec!(49000)))
            .await
            .unwrap();
        let second = registry
            .attach_scaling(&link.group_id, dec!(0.1), None)
            .await
            .unwrap();
        assert!(first.client_order_id.ends_with("-sc1"));
        assert!(second.client_order_id.ends_with("-sc2"));
        assert_eq!(first.side, OrderSide::LongOpen);

        let close = registry.attach_close(&link.group_id, dec!(0.7)).await.unwrap();
        assert!(close.client_order_id.ends_with("-close"));
        assert!(matches!(
            registry.attach_close(&link.group_id, dec!(0.7)).await,
            Err(BracketError::RoleAlreadyAttached { role: OrderRole::Close, .. })
        ));
    }

    #[tokio::test]
    async fn test_rejected_close_allows_another_attempt() {
        let registry = BracketLinkRegistry::new();
        let link = registry.create_group(entry("BTCUSDT")).await.unwrap();

        let first = registry.attach_close(&link.group_id, dec!(0.5)).await.unwrap();
        assert!(registry
            .compare_and_set_order_status(first.id, OrderStatus::Pending, OrderStatus::Rejected)
            .await
            .unwrap());

        let second = registry.attach_close(&link.group_id, dec!(0.5)).await.unwrap();
        assert!(second.client_order_id.ends_with("-close2"));
        let found = registry.lookup_by_client_id(&second.client_order_id).await.unwrap();
        assert_eq!(found.group_id, link.group_id);

        // Orphaned attempts need review before anything else is sent
        registry.escalate_orphaned(second.id).await.unwrap();
        assert!(matches!(
            registry.attach_close(&link.group_id, dec!(0.5)).await,
            Err(BracketError::RoleAlreadyAttached { role: OrderRole::Close, .. })
        ));
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let store: Arc<dyn BracketStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let (open_id, closed_id) = {
            let registry = BracketLinkRegistry::restore(store.clone()).unwrap();
            let open = registry.create_group(entry("BTCUSDT")).await.unwrap();
            registry
                .attach_conditional(&open.group_id, OrderRole::StopLoss, dec!(0.5), dec!(47000))
                .await
                .unwrap();
            let closed = registry.create_group(entry("ETHUSDT")).await.unwrap();
            registry
                .mark_closed(&closed.group_id, CloseReason::Manual)
                .await
                .unwrap();
            registry
                .record_external_operation(
                    Some(&open.group_id),
                    "BTCUSDT",
                    OperationType::ExternalPartialClose,
                    dec!(0.5),
                    dec!(0.3),
                    dec!(0.8),
                )
                .await;
            (open.group_id, closed.group_id)
        };

        let registry = BracketLinkRegistry::restore(store.clone()).unwrap();
        let active = registry.active_groups().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].link.group_id, open_id);
        assert_eq!(active[0].orders.len(), 2);
        assert!(registry.group(&closed_id).await.is_none());

        // Ids continue after the persisted ones and the symbol stays locked
        assert!(registry.create_group(entry("BTCUSDT")).await.is_err());
        let next = registry.create_group(entry("SOLUSDT")).await.unwrap();
        assert_eq!(next.entry_order, OrderId(4));
        let op = registry
            .record_external_operation(
                None,
                "SOLUSDT",
                OperationType::ExternalFullClose,
                dec!(1),
                Decimal::ZERO,
                dec!(0.9),
            )
            .await;
        assert_eq!(op.id, 2);
    }

    /// Store whose group writes take a while, like a slow disk.
    struct SlowStore {
        inner: SqliteStore,
        delay: std::time::Duration,
    }

    impl BracketStore for SlowStore {
        fn save_order(&self, order: &Order) -> anyhow::Result<()> {
            self.inner.save_order(order)
        }
        fn save_group(&self, link: &BracketLink) -> anyhow::Result<()> {
            std::thread::sleep(self.delay);
            self.inner.save_group(link)
        }
        fn record_external_operation(&self, operation: &ExternalOperation) -> anyhow::Result<()> {
            self.inner.record_external_operation(operation)
        }
        fn update_external_operation_status(
            &self,
            id: u64,
            status: OperationStatus,
        ) -> anyhow::Result<()> {
            self.inner.update_external_operation_status(id, status)
        }
        fn load_group_with_orders(
            &self,
            group_id: &GroupId,
        ) -> anyhow::Result<Option<crate::persistence::GroupRecord>> {
            self.inner.load_group_with_orders(group_id)
        }
        fn compare_and_set_group_status(
            &self,
            expected: BracketStatus,
            updated: &BracketLink,
        ) -> anyhow::Result<bool> {
            self.inner.compare_and_set_group_status(expected, updated)
        }
        fn load_active_groups(&self) -> anyhow::Result<Vec<crate::persistence::GroupRecord>> {
            self.inner.load_active_groups()
        }
        fn list_groups(&self, limit: usize) -> anyhow::Result<Vec<BracketLink>> {
            self.inner.list_groups(limit)
        }
        fn list_external_operations(&self, limit: usize) -> anyhow::Result<Vec<ExternalOperation>> {
            self.inner.list_external_operations(limit)
        }
        fn max_order_id(&self) -> anyhow::Result<u64> {
            self.inner.max_order_id()
        }
        fn max_external_operation_id(&self) -> anyhow::Result<u64> {
            self.inner.max_external_operation_id()
        }
    }

    #[tokio::test]
    async fn test_store_writes_do_not_block_the_runtime() {
        let store: Arc<dyn BracketStore> = Arc::new(SlowStore {
            inner: SqliteStore::in_memory().unwrap(),
            delay: std::time::Duration::from_millis(300),
        });
        let registry = BracketLinkRegistry::restore(store.clone()).unwrap();

        // Single-threaded runtime: the timer only fires if the write is off-thread
        let (created, ticked) = tokio::join!(
            async {
                let link = registry.create_group(entry("BTCUSDT")).await.unwrap();
                (link, std::time::Instant::now())
            },
            async {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                std::time::Instant::now()
            }
        );

        let (link, finished) = created;
        assert!(ticked < finished);
        let (stored, orders) = store.load_group_with_orders(&link.group_id).unwrap().unwrap();
        assert_eq!(stored.status, BracketStatus::Active);
        assert_eq!(orders.len(), 1);
    }
}
