//! Bracket order domain model.
//!
//! Orders and bracket groups reference each other through stable numeric
//! [`OrderId`]s and [`GroupId`]s rather than pointers, so the whole model
//! serializes cleanly and survives partial persistence failures.

mod bracket;
mod external;
mod order;

pub use bracket::{
    parse_client_id, BracketLink, BracketStatus, CloseReason, GroupId, MAX_CLIENT_ORDER_ID_LEN,
};
pub use external::{ExternalOperation, OperationStatus, OperationType};
pub use order::{Order, OrderId, OrderRole, OrderSide, OrderStatus, PositionDirection};
