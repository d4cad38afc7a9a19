//! Error taxonomy for bracket lifecycle operations.

use thiserror::Error;

use crate::exchange::ExchangeError;
use crate::model::{GroupId, OrderId, OrderRole};

/// Errors surfaced by the registry, risk calculators and lifecycle services.
#[derive(Debug, Error)]
pub enum BracketError {
    /// A second bracket was requested while one is still active for the symbol.
    #[error("active bracket {group_id} already exists for {symbol} on account {account}")]
    DuplicateActiveBracket {
        symbol: String,
        account: String,
        group_id: GroupId,
    },

    #[error("bracket group {0} is unknown or no longer active")]
    UnknownGroup(GroupId),

    #[error("{role} order already attached to bracket group {group_id}")]
    RoleAlreadyAttached { group_id: GroupId, role: OrderRole },

    #[error("{0} orders cannot be attached as bracket conditionals")]
    InvalidConditionalRole(OrderRole),

    #[error("unknown order {0}")]
    UnknownOrder(OrderId),

    #[error("client order id {client_order_id} exceeds the {limit}-character exchange limit")]
    ClientIdTooLong {
        client_order_id: String,
        limit: usize,
    },

    /// Bad input to a pure computation (zero leverage, non-positive price...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Daily loss budget exhausted; no new brackets until it resets.
    #[error("trading halted for {symbol}: daily loss budget exhausted")]
    TradingHalted { symbol: String },

    #[error("bracket group {0} is orphaned and requires operator review")]
    OrphanedBracket(GroupId),

    #[error("{action} failed for {client_order_id} after {attempts} attempts: {source}")]
    RetriesExhausted {
        action: &'static str,
        client_order_id: String,
        attempts: u32,
        #[source]
        source: ExchangeError,
    },

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

pub type Result<T> = std::result::Result<T, BracketError>;
