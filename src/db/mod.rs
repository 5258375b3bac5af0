// Persistence seams around the matching engine
pub mod repositories;

pub use repositories::{
    InMemoryOrderRepository, InMemoryTradeRepository, OrderRepositoryTrait, TradeRepositoryTrait,
};
