pub mod order_repository;
pub mod trade_repository;

pub use order_repository::{InMemoryOrderRepository, OrderRepositoryTrait};
pub use trade_repository::{InMemoryTradeRepository, TradeRepositoryTrait};
