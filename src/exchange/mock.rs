//! In-memory paper venue for paper trading and tests.

use super::traits::ExchangeCapability;
use super::types::*;
use crate::model::OrderSide;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Simulated position state.
#[derive(Debug, Clone, Default)]
pub struct MockPosition {
    /// Signed quantity (negative = short)
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
}

#[derive(Debug, Clone)]
struct MockOrder {
    report: OrderReport,
    side: OrderSide,
    order_type: OrderType,
    quantity: Decimal,
    price: Option<Decimal>,
}

/// Exchange calls that can have failures injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    Place,
    Cancel,
    GetPosition,
    GetOpenOrders,
    GetOrder,
}

/// Mock exchange state.
#[derive(Debug, Default)]
pub struct MockExchangeState {
    orders: HashMap<String, MockOrder>,
    positions: HashMap<String, MockPosition>,
    cancel_requests: HashMap<String, u32>,
    pub order_count: u64,
}

/// Mock client that simulates an exchange account.
pub struct MockExchange {
    state: Arc<RwLock<MockExchangeState>>,
    order_id_counter: AtomicU64,
    /// Simulated mark prices
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
    /// Queued failures per call kind, consumed one per call
    failures: Arc<RwLock<HashMap<MockCall, VecDeque<ExchangeError>>>>,
    /// Symbols whose every call fails
    broken_symbols: Arc<RwLock<HashMap<String, ExchangeError>>>,
    /// Artificial latency added to every call
    latency: Option<Duration>,
    /// Position requests currently waiting on latency, and the high mark
    positions_in_flight: AtomicUsize,
    peak_positions_in_flight: AtomicUsize,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    /// Create an empty mock exchange.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockExchangeState::default())),
            order_id_counter: AtomicU64::new(1),
            prices: Arc::new(RwLock::new(HashMap::new())),
            failures: Arc::new(RwLock::new(HashMap::new())),
            broken_symbols: Arc::new(RwLock::new(HashMap::new())),
            latency: None,
            positions_in_flight: AtomicUsize::new(0),
            peak_positions_in_flight: AtomicUsize::new(0),
        }
    }

    /// Add latency to every call (useful to force interleaving in tests).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Highest number of `get_position` calls seen in flight at once.
    pub fn peak_position_requests(&self) -> usize {
        self.peak_positions_in_flight.load(Ordering::SeqCst)
    }

    /// Update the simulated mark price for a symbol.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    /// Queue an error for the next call of the given kind.
    pub async fn fail_next(&self, call: MockCall, error: ExchangeError) {
        self.failures
            .write()
            .await
            .entry(call)
            .or_default()
            .push_back(error);
    }

    /// Make every call touching `symbol` fail until cleared.
    pub async fn break_symbol(&self, symbol: &str, error: ExchangeError) {
        self.broken_symbols
            .write()
            .await
            .insert(symbol.to_string(), error);
    }

    /// Restore normal behaviour for a broken symbol.
    pub async fn repair_symbol(&self, symbol: &str) {
        self.broken_symbols.write().await.remove(symbol);
    }

    /// Number of cancel requests received for a client order id.
    pub async fn cancel_requests(&self, client_order_id: &str) -> u32 {
        self.state
            .read()
            .await
            .cancel_requests
            .get(client_order_id)
            .copied()
            .unwrap_or(0)
    }

    /// Current exchange-side state of an order.
    pub async fn order_state(&self, client_order_id: &str) -> Option<ExchangeOrderState> {
        self.state
            .read()
            .await
            .orders
            .get(client_order_id)
            .map(|o| o.report.status)
    }

    /// Current simulated position.
    pub async fn position(&self, symbol: &str) -> MockPosition {
        self.state
            .read()
            .await
            .positions
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    /// Execute a resting order (e.g. a TP/SL trigger) at its price.
    pub async fn trigger_order(&self, client_order_id: &str) -> Result<(), ExchangeError> {
        let prices = self.prices.read().await;
        let mut state = self.state.write().await;

        let order = state
            .orders
            .get(client_order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::UnknownOrder(client_order_id.to_string()))?;

        if !order.report.status.is_open() {
            return Err(ExchangeError::Rejected(format!(
                "order {client_order_id} is not open"
            )));
        }

        let price = order
            .price
            .or_else(|| prices.get(&order.report.symbol).copied())
            .unwrap_or(dec!(1));
        let filled = apply_fill(&mut state, &order.report.symbol, order.side, order.quantity, price);

        if let Some(o) = state.orders.get_mut(client_order_id) {
            o.report.status = ExchangeOrderState::Filled;
            o.report.filled_quantity = filled;
            o.report.avg_price = Some(price);
        }

        info!(client_order_id, %price, %filled, "Mock order triggered");
        Ok(())
    }

    /// Reduce a position without any order (manual close in the exchange UI).
    pub async fn external_reduce(&self, symbol: &str, quantity: Decimal) {
        let mut state = self.state.write().await;
        let position = state.positions.entry(symbol.to_string()).or_default();
        let reduce = quantity.min(position.quantity.abs());

        if position.quantity > Decimal::ZERO {
            position.quantity -= reduce;
        } else {
            position.quantity += reduce;
        }
        if position.quantity.is_zero() {
            position.avg_entry_price = Decimal::ZERO;
        }

        info!(%symbol, %reduce, remaining = %position.quantity, "Mock external reduce");
    }

    /// Close the whole position without any order.
    pub async fn external_flatten(&self, symbol: &str) {
        let qty = self.position(symbol).await.quantity.abs();
        self.external_reduce(symbol, qty).await;
    }

    /// Forget an order entirely, as if the exchange had purged it.
    pub async fn forget_order(&self, client_order_id: &str) {
        self.state.write().await.orders.remove(client_order_id);
    }

    fn next_order_id(&self) -> u64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn simulate(&self, call: MockCall, symbol: &str) -> Result<(), ExchangeError> {
        let tracked = call == MockCall::GetPosition;
        if tracked {
            let now = self.positions_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_positions_in_flight.fetch_max(now, Ordering::SeqCst);
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if tracked {
            self.positions_in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        if let Some(error) = self.broken_symbols.read().await.get(symbol) {
            return Err(error.clone());
        }

        if let Some(error) = self
            .failures
            .write()
            .await
            .get_mut(&call)
            .and_then(|q| q.pop_front())
        {
            debug!(?call, %symbol, %error, "Mock injected failure");
            return Err(error);
        }

        Ok(())
    }
}

/// Apply a fill to the position book, returning the executed quantity.
fn apply_fill(
    state: &mut MockExchangeState,
    symbol: &str,
    side: OrderSide,
    quantity: Decimal,
    price: Decimal,
) -> Decimal {
    let position = state.positions.entry(symbol.to_string()).or_default();

    let signed = match side {
        OrderSide::LongOpen => quantity,
        OrderSide::ShortOpen => -quantity,
        OrderSide::ReduceOnlyClose => {
            let reduce = quantity.min(position.quantity.abs());
            let signed = if position.quantity > Decimal::ZERO {
                -reduce
            } else {
                reduce
            };
            position.quantity += signed;
            if position.quantity.is_zero() {
                position.avg_entry_price = Decimal::ZERO;
            }
            return reduce;
        }
    };

    let new_qty = position.quantity + signed;
    if !new_qty.is_zero() {
        position.avg_entry_price = (position.avg_entry_price * position.quantity.abs()
            + price * quantity)
            / new_qty.abs();
    }
    position.quantity = new_qty;
    quantity
}

#[async_trait]
impl ExchangeCapability for MockExchange {
    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<PlacedOrder, ExchangeError> {
        self.simulate(MockCall::Place, &request.symbol).await?;

        let prices = self.prices.read().await;
        let mut state = self.state.write().await;

        if state.orders.contains_key(&request.client_order_id) {
            return Err(ExchangeError::Rejected(format!(
                "duplicate client order id {}",
                request.client_order_id
            )));
        }

        let exchange_order_id = self.next_order_id().to_string();
        state.order_count += 1;

        let mut report = OrderReport {
            symbol: request.symbol.clone(),
            client_order_id: request.client_order_id.clone(),
            exchange_order_id: exchange_order_id.clone(),
            status: ExchangeOrderState::New,
            filled_quantity: Decimal::ZERO,
            avg_price: None,
        };

        if request.order_type == OrderType::Market {
            let price = prices
                .get(&request.symbol)
                .copied()
                .or(request.price)
                .unwrap_or(dec!(1));
            let filled = apply_fill(
                &mut state,
                &request.symbol,
                request.side,
                request.quantity,
                price,
            );
            report.status = ExchangeOrderState::Filled;
            report.filled_quantity = filled;
            report.avg_price = Some(price);
        }

        info!(
            exchange_order_id = %exchange_order_id,
            client_order_id = %request.client_order_id,
            symbol = %request.symbol,
            side = ?request.side,
            order_type = ?request.order_type,
            quantity = %request.quantity,
            status = ?report.status,
            "Mock order accepted"
        );

        let placed = PlacedOrder {
            exchange_order_id,
            status: report.status,
            filled_quantity: report.filled_quantity,
            avg_price: report.avg_price,
        };

        state.orders.insert(
            request.client_order_id.clone(),
            MockOrder {
                report,
                side: request.side,
                order_type: request.order_type,
                quantity: request.quantity,
                price: request.price,
            },
        );

        Ok(placed)
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<ExchangeOrderState, ExchangeError> {
        {
            let mut state = self.state.write().await;
            *state
                .cancel_requests
                .entry(client_order_id.to_string())
                .or_insert(0) += 1;
        }

        self.simulate(MockCall::Cancel, symbol).await?;

        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(client_order_id)
            .ok_or_else(|| ExchangeError::UnknownOrder(client_order_id.to_string()))?;

        if !order.report.status.is_open() {
            return Err(ExchangeError::UnknownOrder(client_order_id.to_string()));
        }

        order.report.status = ExchangeOrderState::Canceled;
        debug!(%symbol, client_order_id, order_type = ?order.order_type, "Mock order cancelled");
        Ok(ExchangeOrderState::Canceled)
    }

    async fn get_position(&self, symbol: &str) -> Result<PositionSnapshot, ExchangeError> {
        self.simulate(MockCall::GetPosition, symbol).await?;

        let position = self.position(symbol).await;
        let mark_price = self
            .prices
            .read()
            .await
            .get(symbol)
            .copied()
            .unwrap_or(position.avg_entry_price);

        Ok(PositionSnapshot {
            symbol: symbol.to_string(),
            quantity: position.quantity,
            avg_entry_price: position.avg_entry_price,
            mark_price,
        })
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OrderReport>, ExchangeError> {
        self.simulate(MockCall::GetOpenOrders, symbol).await?;

        Ok(self
            .state
            .read()
            .await
            .orders
            .values()
            .filter(|o| o.report.symbol == symbol && o.report.status.is_open())
            .map(|o| o.report.clone())
            .collect())
    }

    async fn get_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderReport>, ExchangeError> {
        self.simulate(MockCall::GetOrder, symbol).await?;

        Ok(self
            .state
            .read()
            .await
            .orders
            .get(client_order_id)
            .map(|o| o.report.clone()))
    }
}
