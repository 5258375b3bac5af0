pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod trading_engine;
pub mod utils;
pub mod wallet;

pub use error::{BookError, EngineError, OrderError};
pub use trading_engine::{MatchingEngine, MatchingEngineManager, OrderBook, TradingEngine};
