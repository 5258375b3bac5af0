// src/db/repositories/order_repository.rs
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::error::RepositoryError;
use crate::models::{Order, OrderId, OrderStatus};

#[async_trait]
pub trait OrderRepositoryTrait: Send + Sync {
    async fn create(&self, order: &Order) -> Result<Order, RepositoryError>;
    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, RepositoryError>;
    /// Orders that may rest in a book, oldest first
    async fn find_open_by_symbol(&self, symbol: &str) -> Result<Vec<Order>, RepositoryError>;
    async fn update(&self, order: &Order) -> Result<Order, RepositoryError>;
    async fn update_status(&self, id: OrderId, status: OrderStatus) -> Result<Order, RepositoryError>;
}

/// Order store kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryOrderRepository {
    orders: RwLock<HashMap<OrderId, Order>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.read().is_empty()
    }
}

#[async_trait]
impl OrderRepositoryTrait for InMemoryOrderRepository {
    async fn create(&self, order: &Order) -> Result<Order, RepositoryError> {
        let mut orders = self.orders.write();
        if orders.contains_key(&order.id) {
            return Err(RepositoryError::AlreadyExists(order.id.to_string()));
        }
        orders.insert(order.id, order.clone());
        Ok(order.clone())
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        Ok(self.orders.read().get(&id).cloned())
    }

    async fn find_open_by_symbol(&self, symbol: &str) -> Result<Vec<Order>, RepositoryError> {
        let mut open: Vec<Order> = self
            .orders
            .read()
            .values()
            .filter(|o| o.symbol == symbol && o.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|o| o.created_at);
        Ok(open)
    }

    async fn update(&self, order: &Order) -> Result<Order, RepositoryError> {
        let mut orders = self.orders.write();
        let stored = orders
            .get_mut(&order.id)
            .ok_or_else(|| RepositoryError::NotFound(order.id.to_string()))?;
        *stored = order.clone();
        Ok(order.clone())
    }

    async fn update_status(&self, id: OrderId, status: OrderStatus) -> Result<Order, RepositoryError> {
        let mut orders = self.orders.write();
        let stored = orders
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        stored.status = status;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }
}
