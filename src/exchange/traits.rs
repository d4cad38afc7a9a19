//! Exchange capability consumed by the bracket lifecycle components.
//!
//! Connectivity (signing, transport, wire formats) lives behind this trait.
//! Implementations are expected to be poll-friendly; every call made through
//! it by this crate is wrapped in a bounded timeout.

use async_trait::async_trait;

use super::types::{
    ExchangeError, ExchangeOrderState, OrderReport, PlaceOrderRequest, PlacedOrder,
    PositionSnapshot,
};

/// Order placement, cancellation and state queries for one trading account.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeCapability: Send + Sync {
    /// Place an order, returning the exchange id and initial state.
    async fn place_order(&self, request: &PlaceOrderRequest) -> Result<PlacedOrder, ExchangeError>;

    /// Request cancellation of an order by its client order id.
    ///
    /// A successful return only means the request was accepted; callers must
    /// re-query the order before treating it as cancelled.
    async fn cancel_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<ExchangeOrderState, ExchangeError>;

    /// Current position for a symbol.
    async fn get_position(&self, symbol: &str) -> Result<PositionSnapshot, ExchangeError>;

    /// All open orders for a symbol.
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OrderReport>, ExchangeError>;

    /// Look up a single order, open or closed. `None` if the exchange has no record.
    async fn get_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderReport>, ExchangeError>;
}
