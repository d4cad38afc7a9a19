//! Shared fixtures for lifecycle tests.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use super::registry::{BracketLinkRegistry, EntryRequest};
use crate::exchange::{ExchangeCapability, MockExchange, OrderType, PlaceOrderRequest};
use crate::model::{BracketLink, Order, OrderRole, PositionDirection};

pub(crate) const ACCOUNT: &str = "main";

/// Place an order on the mock venue and fold the ack into the registry.
pub(crate) async fn submit(
    registry: &BracketLinkRegistry,
    exchange: &MockExchange,
    order: &Order,
    order_type: OrderType,
) {
    let placed = exchange
        .place_order(&PlaceOrderRequest {
            symbol: order.symbol.clone(),
            side: order.side,
            order_type,
            quantity: order.quantity,
            price: order.price,
            reduce_only: order.side.is_reduce_only(),
            client_order_id: order.client_order_id.clone(),
        })
        .await
        .unwrap();

    registry
        .apply_exchange_state(
            order.id,
            placed.status,
            placed.filled_quantity,
            placed.avg_price,
            Some(&placed.exchange_order_id),
        )
        .await
        .unwrap();
}

/// Open a long bracket with a filled market entry and resting TP (+10%) / SL (-5%).
pub(crate) async fn open_filled_bracket(
    registry: &Arc<BracketLinkRegistry>,
    exchange: &Arc<MockExchange>,
    symbol: &str,
    quantity: Decimal,
    entry_price: Decimal,
) -> BracketLink {
    exchange.set_price(symbol, entry_price).await;

    let link = registry
        .create_group(EntryRequest {
            symbol: symbol.to_string(),
            account: ACCOUNT.to_string(),
            direction: PositionDirection::Long,
            quantity,
            price: None,
            risk_snapshot: None,
        })
        .await
        .unwrap();

    let entry = registry.order(link.entry_order).await.unwrap();
    submit(registry, exchange, &entry, OrderType::Market).await;

    let tp = registry
        .attach_conditional(
            &link.group_id,
            OrderRole::TakeProfit,
            quantity,
            entry_price * dec!(1.10),
        )
        .await
        .unwrap();
    submit(registry, exchange, &tp, OrderType::TakeProfitMarket).await;

    let sl = registry
        .attach_conditional(
            &link.group_id,
            OrderRole::StopLoss,
            quantity,
            entry_price * dec!(0.95),
        )
        .await
        .unwrap();
    submit(registry, exchange, &sl, OrderType::StopMarket).await;

    registry.group(&link.group_id).await.unwrap()
}
