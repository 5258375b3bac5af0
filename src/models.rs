use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrderError;

// Define core types
pub type OrderId = Uuid;
pub type TradeId = Uuid;
pub type UserId = Uuid;
pub type Symbol = String;
pub type Price = Decimal;
pub type Quantity = Decimal;

/// An order shared between the book and the service layer.
///
/// Fills applied by the book are visible to every holder of the handle.
pub type SharedOrder = Arc<RwLock<Order>>;

/// Side of the order (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            _ => Err(format!("Invalid order side: {}", s)),
        }
    }
}

/// Type of order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::Stop => write!(f, "STOP"),
        }
    }
}

impl OrderType {
    /// Only limit orders may wait in a book
    pub fn can_rest(self) -> bool {
        self == OrderType::Limit
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "market" => Ok(OrderType::Market),
            "limit" => Ok(OrderType::Limit),
            "stop" => Ok(OrderType::Stop),
            _ => Err(format!("Invalid order type: {}", s)),
        }
    }
}

/// Time in force options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Rest in the book until filled or cancelled
    #[default]
    Gtc,
    /// Fill what is available now, drop the rest
    Ioc,
    /// Fill the whole quantity now or nothing at all
    Fok,
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeInForce::Gtc => write!(f, "GTC"),
            TimeInForce::Ioc => write!(f, "IOC"),
            TimeInForce::Fok => write!(f, "FOK"),
        }
    }
}

impl FromStr for TimeInForce {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "good_till_cancel" | "gtc" => Ok(TimeInForce::Gtc),
            "immediate_or_cancel" | "ioc" => Ok(TimeInForce::Ioc),
            "fill_or_kill" | "fok" => Ok(TimeInForce::Fok),
            _ => Err(format!("Invalid time in force: {}", s)),
        }
    }
}

/// Status of an order
///
/// Moves forward only: `Pending -> Open -> PartiallyFilled -> Filled`, with
/// `Cancelled` and `Rejected` as the other terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "PENDING"),
            OrderStatus::Open => write!(f, "OPEN"),
            OrderStatus::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Cancelled => write!(f, "CANCELLED"),
            OrderStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Representation of an order in the system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Price>,
    pub stop_price: Option<Price>,
    pub quantity: Quantity,
    pub filled_quantity: Quantity,
    pub status: OrderStatus,
    pub time_in_force: TimeInForce,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: UserId,
        symbol: impl Into<Symbol>,
        side: Side,
        order_type: OrderType,
        price: Option<Price>,
        stop_price: Option<Price>,
        quantity: Quantity,
        time_in_force: TimeInForce,
    ) -> Self {
        let now = Utc::now();

        Order {
            id: Uuid::new_v4(),
            user_id,
            symbol: symbol.into(),
            side,
            order_type,
            price,
            stop_price,
            quantity,
            filled_quantity: Decimal::ZERO,
            status: OrderStatus::Pending,
            time_in_force,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn limit(
        user_id: UserId,
        symbol: impl Into<Symbol>,
        side: Side,
        price: Price,
        quantity: Quantity,
        time_in_force: TimeInForce,
    ) -> Self {
        Self::new(
            user_id,
            symbol,
            side,
            OrderType::Limit,
            Some(price),
            None,
            quantity,
            time_in_force,
        )
    }

    pub fn market(user_id: UserId, symbol: impl Into<Symbol>, side: Side, quantity: Quantity) -> Self {
        Self::new(
            user_id,
            symbol,
            side,
            OrderType::Market,
            None,
            None,
            quantity,
            TimeInForce::Ioc,
        )
    }

    /// Wrap the order into a handle the book can share.
    pub fn into_shared(self) -> SharedOrder {
        Arc::new(RwLock::new(self))
    }

    pub fn remaining_quantity(&self) -> Quantity {
        self.quantity - self.filled_quantity
    }

    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Open orders are the ones the book may hold: OPEN or PARTIALLY_FILLED
    /// with quantity left.
    pub fn is_open(&self) -> bool {
        matches!(self.status, OrderStatus::Open | OrderStatus::PartiallyFilled)
            && self.remaining_quantity() > Decimal::ZERO
    }

    /// Domain validation, run before an order may touch any book.
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.quantity <= Decimal::ZERO {
            return Err(OrderError::InvalidQuantity(self.quantity));
        }
        if self.filled_quantity < Decimal::ZERO || self.filled_quantity > self.quantity {
            return Err(OrderError::InvalidQuantity(self.filled_quantity));
        }

        match self.order_type {
            OrderType::Market => {
                if self.price.is_some() {
                    return Err(OrderError::MarketOrderWithPrice);
                }
            }
            OrderType::Limit => match self.price {
                Some(price) if price > Decimal::ZERO => {}
                Some(price) => return Err(OrderError::InvalidPrice(price)),
                None => return Err(OrderError::MissingLimitPrice),
            },
            OrderType::Stop => match self.stop_price {
                Some(stop) if stop > Decimal::ZERO => {}
                Some(stop) => return Err(OrderError::InvalidPrice(stop)),
                None => return Err(OrderError::MissingStopPrice),
            },
        }

        if let Some(price) = self.price {
            if price <= Decimal::ZERO {
                return Err(OrderError::InvalidPrice(price));
            }
        }

        Ok(())
    }

    /// PENDING -> OPEN. Calling it on an already open order is a no-op.
    pub fn open(&mut self) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::Pending => self.transition(OrderStatus::Open),
            OrderStatus::Open | OrderStatus::PartiallyFilled => Ok(()),
            _ => Err(self.invalid_transition(OrderStatus::Open)),
        }
    }

    /// Apply an execution of `quantity` to the order.
    ///
    /// Fails without touching the order if the fill is not positive, the order
    /// is terminal, or the fill would exceed the original quantity.
    pub fn apply_fill(&mut self, quantity: Quantity) -> Result<(), OrderError> {
        if quantity <= Decimal::ZERO {
            return Err(OrderError::InvalidQuantity(quantity));
        }
        if self.is_terminal() {
            return Err(self.invalid_transition(OrderStatus::PartiallyFilled));
        }
        let remaining = self.remaining_quantity();
        if quantity > remaining {
            return Err(OrderError::Overfill {
                order_id: self.id,
                requested: quantity,
                remaining,
            });
        }

        self.filled_quantity += quantity;
        let next = if self.remaining_quantity().is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.transition(next)
    }

    pub fn cancel(&mut self) -> Result<(), OrderError> {
        if self.is_terminal() {
            return Err(self.invalid_transition(OrderStatus::Cancelled));
        }
        self.transition(OrderStatus::Cancelled)
    }

    /// Rejection is only possible before anything was executed.
    pub fn reject(&mut self) -> Result<(), OrderError> {
        if self.is_terminal() || self.filled_quantity > Decimal::ZERO {
            return Err(self.invalid_transition(OrderStatus::Rejected));
        }
        self.transition(OrderStatus::Rejected)
    }

    fn transition(&mut self, to: OrderStatus) -> Result<(), OrderError> {
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn invalid_transition(&self, to: OrderStatus) -> OrderError {
        OrderError::InvalidTransition {
            order_id: self.id,
            from: self.status,
            to,
        }
    }
}

/// Order request as submitted by a client, before an id is assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    pub user_id: UserId,
    pub symbol: Symbol,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub stop_price: Option<Price>,
    pub quantity: Quantity,
    #[serde(default)]
    pub time_in_force: TimeInForce,
}

impl NewOrder {
    pub fn into_order(self) -> Order {
        Order::new(
            self.user_id,
            self.symbol,
            self.side,
            self.order_type,
            self.price,
            self.stop_price,
            self.quantity,
            self.time_in_force,
        )
    }
}

/// Settlement state of a trade, owned by the settlement collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SettlementStatus {
    #[default]
    Pending,
    Settled,
    Failed,
}

/// Representation of a trade in the system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub symbol: Symbol,
    pub buyer_order_id: OrderId,
    pub seller_order_id: OrderId,
    pub buyer_user_id: UserId,
    pub seller_user_id: UserId,
    /// Always the maker's price
    pub price: Price,
    pub quantity: Quantity,
    pub is_buyer_maker: bool,
    pub executed_at: DateTime<Utc>,
    pub settlement: SettlementStatus,
}

impl Trade {
    /// Build the trade between a resting `maker` and the incoming `taker`.
    pub fn between(maker: &Order, taker: &Order, price: Price, quantity: Quantity) -> Self {
        let (buyer, seller) = match maker.side {
            Side::Buy => (maker, taker),
            Side::Sell => (taker, maker),
        };

        Trade {
            id: Uuid::new_v4(),
            symbol: maker.symbol.clone(),
            buyer_order_id: buyer.id,
            seller_order_id: seller.id,
            buyer_user_id: buyer.user_id,
            seller_user_id: seller.user_id,
            price,
            quantity,
            is_buyer_maker: maker.side == Side::Buy,
            executed_at: Utc::now(),
            settlement: SettlementStatus::Pending,
        }
    }

    pub fn maker_order_id(&self) -> OrderId {
        if self.is_buyer_maker {
            self.buyer_order_id
        } else {
            self.seller_order_id
        }
    }

    pub fn taker_order_id(&self) -> OrderId {
        if self.is_buyer_maker {
            self.seller_order_id
        } else {
            self.buyer_order_id
        }
    }

    /// Quote-currency value of the trade
    pub fn notional(&self) -> Decimal {
        self.price * self.quantity
    }
}
