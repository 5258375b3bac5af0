use thiserror::Error;

use crate::models::{OrderId, OrderStatus, OrderType, Price, Quantity, Side, Symbol};

/// Order-level validation and state machine errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderError {
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(Quantity),

    #[error("Invalid price: {0}")]
    InvalidPrice(Price),

    #[error("Market orders cannot carry a limit price")]
    MarketOrderWithPrice,

    #[error("Limit orders must have a price")]
    MissingLimitPrice,

    #[error("Stop orders must have a stop price")]
    MissingStopPrice,

    #[error("Fill of {requested} exceeds remaining {remaining} on order {order_id}")]
    Overfill {
        order_id: OrderId,
        requested: Quantity,
        remaining: Quantity,
    },

    #[error("Order {order_id} cannot move from {from} to {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },
}

/// Errors raised by a single order book
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BookError {
    #[error("Symbol mismatch: expected {expected}, got {actual}")]
    SymbolMismatch { expected: Symbol, actual: Symbol },

    #[error("Order type {0} cannot rest in the book")]
    UnsupportedOrderType(OrderType),

    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("Invalid fill quantity: {0}")]
    InvalidQuantity(Quantity),

    #[error("Order {0} has nothing left to rest")]
    NotRestable(OrderId),

    #[error("No {0} liquidity in the book")]
    EmptyBook(Side),

    #[error(transparent)]
    Order(#[from] OrderError),
}

/// Errors surfaced by the matching engine and the trading engine around it
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Book(#[from] BookError),

    #[error("Order already in the book: {0}")]
    DuplicateOrder(OrderId),

    #[error("Symbol not found: {0}")]
    UnknownSymbol(Symbol),

    #[error("Symbol already exists: {0}")]
    SymbolAlreadyListed(Symbol),

    #[error("Unsupported order type: {0}")]
    UnsupportedOrderType(OrderType),

    #[error("Order {order_id} is {status} and cannot be placed")]
    NotPlaceable {
        order_id: OrderId,
        status: OrderStatus,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Wallet(#[from] WalletError),
}

impl EngineError {
    /// An empty side is "no data", not a failure.
    pub fn is_empty_book(&self) -> bool {
        matches!(self, EngineError::Book(BookError::EmptyBook(_)))
    }
}

/// Persistence collaborator errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Settlement collaborator errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WalletError {
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        requested: Quantity,
        available: Quantity,
    },

    #[error("Cannot derive assets from symbol: {0}")]
    InvalidSymbol(Symbol),

    #[error("Wallet service unavailable: {0}")]
    Unavailable(String),
}
