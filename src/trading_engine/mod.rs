pub mod matching_engine;
pub mod order_book;
pub mod price_index;
pub mod price_level;

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::db::{OrderRepositoryTrait, TradeRepositoryTrait};
use crate::error::EngineError;
use crate::models::{NewOrder, Order, OrderId, SettlementStatus, Symbol, Trade};
use crate::utils::describe_order;
use crate::wallet::WalletClient;

pub use matching_engine::{
    MarketRemainderPolicy, MatchResult, MatchingConfig, MatchingEngine, MatchingEngineManager,
};
pub use order_book::{Depth, OrderBook, OrderBookEvent, OrderBookSnapshot, OrderBookStats};
pub use price_index::PriceLevelIndex;
pub use price_level::{LevelSummary, PriceLevel};

/// What the caller gets back for a placed order
#[derive(Debug, Clone, Serialize)]
pub struct OrderReceipt {
    pub order: Order,
    pub trades: Vec<Trade>,
    pub rested: bool,
}

/// Service layer around the matching engines.
///
/// Reserves balances, persists orders and trades, and settles each trade.
/// The books themselves never wait on any of these. Calls for one symbol
/// take turns, so order and trade records reach the repositories and the
/// wallet in the same sequence the book produced them.
pub struct TradingEngine {
    engines: Arc<MatchingEngineManager>,
    orders: Arc<dyn OrderRepositoryTrait>,
    trades: Arc<dyn TradeRepositoryTrait>,
    wallet: Arc<dyn WalletClient>,
    turns: Mutex<HashMap<Symbol, Arc<tokio::sync::Mutex<()>>>>,
}

impl TradingEngine {
    pub fn new(
        engines: Arc<MatchingEngineManager>,
        orders: Arc<dyn OrderRepositoryTrait>,
        trades: Arc<dyn TradeRepositoryTrait>,
        wallet: Arc<dyn WalletClient>,
    ) -> Self {
        TradingEngine {
            engines,
            orders,
            trades,
            wallet,
            turns: Mutex::new(HashMap::new()),
        }
    }

    pub fn engines(&self) -> &Arc<MatchingEngineManager> {
        &self.engines
    }

    pub async fn place_order(&self, request: NewOrder) -> Result<OrderReceipt, EngineError> {
        let order = request.into_order();
        order.validate()?;
        let engine = self.engines.get_engine(&order.symbol)?;
        let turn = self.turn(&order.symbol);
        let _turn = turn.lock().await;

        self.wallet.reserve(&order).await?;
        self.orders.create(&order).await?;

        let shared = order.into_shared();
        let result = match engine.place_order(&shared) {
            Ok(result) => result,
            Err(e) => {
                let rejected = {
                    let mut order = shared.write();
                    if order.reject().is_err() {
                        warn!("Order {} could not be marked rejected", order.id);
                    }
                    order.clone()
                };
                self.orders.update(&rejected).await?;
                self.wallet.release(&rejected).await?;
                return Err(e);
            }
        };

        let mut trades = Vec::with_capacity(result.trades.len());
        for mut trade in result.trades {
            self.trades.create(&trade).await?;
            trade.settlement = match self.wallet.settle_trade(&trade).await {
                Ok(()) => SettlementStatus::Settled,
                Err(e) => {
                    warn!("Settlement of trade {} failed: {}", trade.id, e);
                    SettlementStatus::Failed
                }
            };
            self.trades.update_settlement(trade.id, trade.settlement).await?;
            trades.push(trade);
        }

        for maker in &result.maker_updates {
            self.orders.update(maker).await?;
            if !maker.is_open() {
                self.wallet.release(maker).await?;
            }
        }
        for stale in &result.evicted {
            self.orders.update(stale).await?;
            self.wallet.release(stale).await?;
        }

        let order = shared.read().clone();
        self.orders.update(&order).await?;
        if !result.rested {
            self.wallet.release(&order).await?;
        }

        info!(
            "Order {}: {} trades, status {}",
            describe_order(&order),
            trades.len(),
            order.status
        );
        Ok(OrderReceipt {
            order,
            trades,
            rested: result.rested,
        })
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: OrderId) -> Result<Order, EngineError> {
        let turn = self.turn(symbol);
        let _turn = turn.lock().await;
        let order = self.engines.cancel_order(symbol, &order_id)?;
        self.orders.update(&order).await?;
        self.wallet.release(&order).await?;
        Ok(order)
    }

    /// Put every open order from the repository back into its book.
    /// Returns how many orders were restored.
    pub async fn restore_books(&self) -> Result<usize, EngineError> {
        let mut restored = 0;
        for symbol in self.engines.symbols() {
            let engine = self.engines.get_engine(&symbol)?;
            for order in self.orders.find_open_by_symbol(&symbol).await? {
                engine.add_order(order.into_shared())?;
                restored += 1;
            }
        }
        info!("Restored {} open orders", restored);
        Ok(restored)
    }

    fn turn(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.turns
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }
}
