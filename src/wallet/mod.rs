// src/wallet/mod.rs

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::WalletError;
use crate::models::{Order, OrderId, Side, Trade, UserId};

pub type AssetId = String;

/// Settlement collaborator used around the matching engine.
///
/// Reservations are made before an order reaches a book, consumed trade by
/// trade, and whatever is left is released once the order stops resting.
#[async_trait]
pub trait WalletClient: Send + Sync {
    async fn reserve(&self, order: &Order) -> Result<(), WalletError>;
    async fn settle_trade(&self, trade: &Trade) -> Result<(), WalletError>;
    async fn release(&self, order: &Order) -> Result<(), WalletError>;
}

/// Split a trading pair like `BTC-USDT` into base and quote assets.
pub fn split_symbol(symbol: &str) -> Result<(AssetId, AssetId), WalletError> {
    let mut parts = symbol.split(|c: char| c == '-' || c == '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(base), Some(quote), None) if !base.is_empty() && !quote.is_empty() => {
            Ok((base.to_uppercase(), quote.to_uppercase()))
        }
        _ => Err(WalletError::InvalidSymbol(symbol.to_string())),
    }
}

/// Balance of one asset for one user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Balance {
    pub total: Decimal,
    pub available: Decimal,
    pub reserved: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Default for Balance {
    fn default() -> Self {
        Balance {
            total: Decimal::ZERO,
            available: Decimal::ZERO,
            reserved: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }
}

impl Balance {
    pub fn credit(&mut self, amount: Decimal) {
        self.total += amount;
        self.available += amount;
        self.updated_at = Utc::now();
    }

    pub fn debit(&mut self, amount: Decimal) -> Result<(), WalletError> {
        if self.available < amount {
            return Err(WalletError::InsufficientBalance {
                requested: amount,
                available: self.available,
            });
        }

        self.total -= amount;
        self.available -= amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn reserve(&mut self, amount: Decimal) -> Result<(), WalletError> {
        if self.available < amount {
            return Err(WalletError::InsufficientBalance {
                requested: amount,
                available: self.available,
            });
        }

        self.available -= amount;
        self.reserved += amount;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn release_reservation(&mut self, amount: Decimal) {
        self.reserved -= amount;
        self.available += amount;
        self.updated_at = Utc::now();
    }

    /// Reserved funds leave the account
    pub fn settle_reservation(&mut self, amount: Decimal) {
        self.reserved -= amount;
        self.total -= amount;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone)]
struct Reservation {
    user_id: UserId,
    asset: AssetId,
    amount: Decimal,
}

#[derive(Debug, Default)]
struct Ledger {
    balances: HashMap<(UserId, AssetId), Balance>,
    reservations: HashMap<OrderId, Reservation>,
}

impl Ledger {
    fn balance_mut(&mut self, user_id: UserId, asset: &str) -> &mut Balance {
        self.balances.entry((user_id, asset.to_string())).or_default()
    }

    fn available(&self, user_id: UserId, asset: &str) -> Decimal {
        self.balances
            .get(&(user_id, asset.to_string()))
            .map(|b| b.available)
            .unwrap_or_default()
    }

    /// Check that `amount` can be drawn for `order_id`, from its reservation
    /// first and from available funds for whatever is not reserved.
    fn can_draw(&self, order_id: &OrderId, user_id: UserId, asset: &str, amount: Decimal) -> Result<(), WalletError> {
        let reserved = self
            .reservations
            .get(order_id)
            .map(|r| r.amount)
            .unwrap_or_default();
        let shortfall = (amount - reserved).max(Decimal::ZERO);
        let available = self.available(user_id, asset);
        if shortfall > available {
            return Err(WalletError::InsufficientBalance {
                requested: shortfall,
                available,
            });
        }
        Ok(())
    }

    fn draw(&mut self, order_id: &OrderId, user_id: UserId, asset: &str, amount: Decimal) -> Result<(), WalletError> {
        let from_reservation = match self.reservations.get_mut(order_id) {
            Some(reservation) => {
                let taken = amount.min(reservation.amount);
                reservation.amount -= taken;
                taken
            }
            None => Decimal::ZERO,
        };
        let balance = self.balance_mut(user_id, asset);
        balance.settle_reservation(from_reservation);
        balance.debit(amount - from_reservation)
    }
}

/// In-process wallet keeping balances and reservations in memory
#[derive(Debug, Default)]
pub struct InMemoryWallet {
    ledger: Mutex<Ledger>,
    /// Accept any reservation by crediting the shortfall first
    unlimited: bool,
}

impl InMemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A wallet that never refuses a reservation, for replays and tests
    pub fn unlimited() -> Self {
        InMemoryWallet {
            ledger: Mutex::new(Ledger::default()),
            unlimited: true,
        }
    }

    pub fn deposit(&self, user_id: UserId, asset: &str, amount: Decimal) {
        self.ledger.lock().balance_mut(user_id, asset).credit(amount);
    }

    pub fn balance(&self, user_id: UserId, asset: &str) -> Balance {
        self.ledger
            .lock()
            .balances
            .get(&(user_id, asset.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Amount still held for an order
    pub fn reserved_for(&self, order_id: &OrderId) -> Option<Decimal> {
        self.ledger.lock().reservations.get(order_id).map(|r| r.amount)
    }
}

#[async_trait]
impl WalletClient for InMemoryWallet {
    async fn reserve(&self, order: &Order) -> Result<(), WalletError> {
        let (base, quote) = split_symbol(&order.symbol)?;
        let (asset, amount) = match (order.side, order.price) {
            (Side::Sell, _) => (base, order.remaining_quantity()),
            (Side::Buy, Some(price)) => (quote, price * order.remaining_quantity()),
            // Market buys pay from available funds as they fill
            (Side::Buy, None) => (quote, Decimal::ZERO),
        };

        let mut ledger = self.ledger.lock();
        let balance = ledger.balance_mut(order.user_id, &asset);
        if self.unlimited && balance.available < amount {
            let shortfall = amount - balance.available;
            balance.credit(shortfall);
        }
        balance.reserve(amount)?;
        ledger.reservations.insert(
            order.id,
            Reservation {
                user_id: order.user_id,
                asset,
                amount,
            },
        );
        debug!("Reserved {} for order {}", amount, order.id);
        Ok(())
    }

    async fn settle_trade(&self, trade: &Trade) -> Result<(), WalletError> {
        let (base, quote) = split_symbol(&trade.symbol)?;
        let notional = trade.notional();

        let mut ledger = self.ledger.lock();
        if self.unlimited {
            let reserved = ledger
                .reservations
                .get(&trade.buyer_order_id)
                .map(|r| r.amount)
                .unwrap_or_default();
            let available = ledger.available(trade.buyer_user_id, &quote);
            let shortfall = (notional - reserved - available).max(Decimal::ZERO);
            ledger.balance_mut(trade.buyer_user_id, &quote).credit(shortfall);
        }
        ledger.can_draw(&trade.buyer_order_id, trade.buyer_user_id, &quote, notional)?;
        ledger.can_draw(&trade.seller_order_id, trade.seller_user_id, &base, trade.quantity)?;

        ledger.draw(&trade.buyer_order_id, trade.buyer_user_id, &quote, notional)?;
        ledger.draw(&trade.seller_order_id, trade.seller_user_id, &base, trade.quantity)?;
        ledger.balance_mut(trade.buyer_user_id, &base).credit(trade.quantity);
        ledger.balance_mut(trade.seller_user_id, &quote).credit(notional);

        debug!("Settled trade {}", trade.id);
        Ok(())
    }

    async fn release(&self, order: &Order) -> Result<(), WalletError> {
        let mut ledger = self.ledger.lock();
        if let Some(reservation) = ledger.reservations.remove(&order.id) {
            ledger
                .balance_mut(reservation.user_id, &reservation.asset)
                .release_reservation(reservation.amount);
            debug!("Released {} for order {}", reservation.amount, order.id);
        }
        Ok(())
    }
}
