// src/db/repositories/trade_repository.rs
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::RepositoryError;
use crate::models::{OrderId, SettlementStatus, Trade, TradeId};

#[async_trait]
pub trait TradeRepositoryTrait: Send + Sync {
    async fn create(&self, trade: &Trade) -> Result<Trade, RepositoryError>;
    async fn find_by_id(&self, id: TradeId) -> Result<Option<Trade>, RepositoryError>;
    async fn find_by_order_id(&self, order_id: OrderId) -> Result<Vec<Trade>, RepositoryError>;
    /// Newest first
    async fn find_by_symbol(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>, RepositoryError>;
    async fn update_settlement(
        &self,
        id: TradeId,
        settlement: SettlementStatus,
    ) -> Result<Trade, RepositoryError>;
}

/// Append-only trade store kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryTradeRepository {
    trades: RwLock<Vec<Trade>>,
}

impl InMemoryTradeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.trades.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.read().is_empty()
    }
}

#[async_trait]
impl TradeRepositoryTrait for InMemoryTradeRepository {
    async fn create(&self, trade: &Trade) -> Result<Trade, RepositoryError> {
        let mut trades = self.trades.write();
        if trades.iter().any(|t| t.id == trade.id) {
            return Err(RepositoryError::AlreadyExists(trade.id.to_string()));
        }
        trades.push(trade.clone());
        Ok(trade.clone())
    }

    async fn find_by_id(&self, id: TradeId) -> Result<Option<Trade>, RepositoryError> {
        Ok(self.trades.read().iter().find(|t| t.id == id).cloned())
    }

    async fn find_by_order_id(&self, order_id: OrderId) -> Result<Vec<Trade>, RepositoryError> {
        Ok(self
            .trades
            .read()
            .iter()
            .filter(|t| t.buyer_order_id == order_id || t.seller_order_id == order_id)
            .cloned()
            .collect())
    }

    async fn find_by_symbol(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>, RepositoryError> {
        Ok(self
            .trades
            .read()
            .iter()
            .rev()
            .filter(|t| t.symbol == symbol)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_settlement(
        &self,
        id: TradeId,
        settlement: SettlementStatus,
    ) -> Result<Trade, RepositoryError> {
        let mut trades = self.trades.write();
        let trade = trades
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        trade.settlement = settlement;
        Ok(trade.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Order, Side, TimeInForce};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn trade(symbol: &str) -> Trade {
        let maker = Order::limit(Uuid::new_v4(), symbol, Side::Sell, dec!(100), dec!(1), TimeInForce::Gtc);
        let taker = Order::market(Uuid::new_v4(), symbol, Side::Buy, dec!(1));
        Trade::between(&maker, &taker, dec!(100), dec!(1))
    }

    #[tokio::test]
    async fn test_find_by_symbol_newest_first() {
        let repo = InMemoryTradeRepository::new();
        let first = trade("BTC-USDT");
        let second = trade("BTC-USDT");
        repo.create(&first).await.unwrap();
        repo.create(&trade("ETH-USDT")).await.unwrap();
        repo.create(&second).await.unwrap();

        let found = repo.find_by_symbol("BTC-USDT", 10).await.unwrap();
        assert_eq!(found.iter().map(|t| t.id).collect::<Vec<_>>(), vec![second.id, first.id]);
        assert_eq!(repo.find_by_symbol("BTC-USDT", 1).await.unwrap().len(), 1);
        assert_eq!(repo.find_by_order_id(first.buyer_order_id).await.unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn test_update_settlement() {
        let repo = InMemoryTradeRepository::new();
        let trade = trade("BTC-USDT");
        repo.create(&trade).await.unwrap();

        let settled = repo.update_settlement(trade.id, SettlementStatus::Settled).await.unwrap();
        assert_eq!(settled.settlement, SettlementStatus::Settled);
        assert!(matches!(
            repo.update_settlement(Uuid::new_v4(), SettlementStatus::Failed).await,
            Err(RepositoryError::NotFound(_))
        ));
    }
}
