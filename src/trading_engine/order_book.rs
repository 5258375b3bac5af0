// src/trading_engine/order_book.rs

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam::queue::SegQueue;
use log::debug;
use rust_decimal::Decimal;
use serde::Serialize;

use super::price_index::PriceLevelIndex;
use super::price_level::{LevelSummary, PriceLevel};
use crate::error::BookError;
use crate::models::{Order, OrderId, Price, Quantity, SharedOrder, Side, Symbol, Trade};

/// Order book activity counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderBookStats {
    /// Orders that came to rest in the book
    pub orders_added: usize,
    /// Orders that left the book, filled or cancelled
    pub orders_removed: usize,
    /// The total number of trades executed
    pub trades_executed: usize,
    /// The total volume traded
    pub volume_traded: Decimal,
}

/// Event type for order book notifications
#[derive(Debug, Clone)]
pub enum OrderBookEvent {
    /// An order came to rest in the book
    OrderAdded(OrderId),
    /// An order left the book
    OrderRemoved(OrderId),
    /// A resting order was (partially) executed
    OrderFilled { order_id: OrderId, quantity: Quantity },
    /// A trade was executed
    TradeExecuted(Trade),
    /// The best bid changed
    BestBidChanged(Option<Price>),
    /// The best ask changed
    BestAskChanged(Option<Price>),
}

/// Where a resting order lives: its level and its slot in that level's queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OrderLocation {
    side: Side,
    price: Price,
    slot: usize,
}

/// Top-n aggregated levels per side
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Depth {
    pub symbol: Symbol,
    pub bids: Vec<LevelSummary>,
    pub asks: Vec<LevelSummary>,
}

/// Full per-level listing of both sides
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBookSnapshot {
    pub symbol: Symbol,
    pub bids: Vec<LevelSummary>,
    pub asks: Vec<LevelSummary>,
    pub order_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// Resting liquidity for one trading pair.
///
/// Not synchronised by itself: the matching engine owns it behind a single
/// lock so that every method here runs as one critical section.
#[derive(Debug)]
pub struct OrderBook {
    symbol: Symbol,
    bids: PriceLevelIndex,
    asks: PriceLevelIndex,
    orders: HashMap<OrderId, OrderLocation>,
    updated_at: DateTime<Utc>,
    stats: OrderBookStats,
    // Event queue for publishing order book events
    events: Arc<SegQueue<OrderBookEvent>>,
}

impl OrderBook {
    pub fn new(symbol: impl Into<Symbol>) -> Self {
        OrderBook {
            symbol: symbol.into(),
            bids: PriceLevelIndex::new(Side::Buy),
            asks: PriceLevelIndex::new(Side::Sell),
            orders: HashMap::new(),
            updated_at: Utc::now(),
            stats: OrderBookStats::default(),
            events: Arc::new(SegQueue::new()),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Get a clone of the current order book statistics
    pub fn stats(&self) -> OrderBookStats {
        self.stats.clone()
    }

    /// Get an event queue for subscribing to order book events
    pub fn subscribe(&self) -> Arc<SegQueue<OrderBookEvent>> {
        self.events.clone()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Number of resting orders
    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    /// Number of price levels on both sides
    pub fn price_level_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    pub fn contains(&self, order_id: &OrderId) -> bool {
        self.orders.contains_key(order_id)
    }

    /// Rest an order at the tail of its price level.
    ///
    /// Adding an id that is already in the book changes nothing. The caller
    /// must not hold a lock on `order`.
    pub fn add_order(&mut self, order: SharedOrder) -> Result<(), BookError> {
        let (order_id, side, price) = {
            let order = order.read();

            if order.symbol != self.symbol {
                return Err(BookError::SymbolMismatch {
                    expected: self.symbol.clone(),
                    actual: order.symbol.clone(),
                });
            }
            if !order.order_type.can_rest() {
                return Err(BookError::UnsupportedOrderType(order.order_type));
            }
            let Some(price) = order.price else {
                return Err(BookError::UnsupportedOrderType(order.order_type));
            };
            if self.orders.contains_key(&order.id) {
                debug!("{}: order {} already resting, add ignored", self.symbol, order.id);
                return Ok(());
            }
            if !order.is_open() {
                return Err(BookError::NotRestable(order.id));
            }

            (order.id, order.side, price)
        };

        let previous_best = self.side(side).best_price();
        let slot = self.side_mut(side).get_or_create(price).push_back(order);
        self.orders.insert(order_id, OrderLocation { side, price, slot });

        self.stats.orders_added += 1;
        self.events.push(OrderBookEvent::OrderAdded(order_id));
        self.publish_best_change(side, previous_best);
        self.touch();

        debug!("{}: order {} resting {} @ {}", self.symbol, order_id, side, price);
        Ok(())
    }

    /// Take an order out of the book, dropping its level if it was the last one.
    pub fn remove_order(&mut self, order_id: &OrderId) -> Result<SharedOrder, BookError> {
        let location = self
            .orders
            .get(order_id)
            .copied()
            .ok_or(BookError::OrderNotFound(*order_id))?;

        let previous_best = self.side(location.side).best_price();
        let index = self.side_mut(location.side);
        let level = index
            .get_mut(&location.price)
            .ok_or(BookError::OrderNotFound(*order_id))?;
        let order = level
            .remove(location.slot, order_id)
            .ok_or(BookError::OrderNotFound(*order_id))?;
        if level.is_empty() {
            index.remove(&location.price);
        }
        self.orders.remove(order_id);

        self.stats.orders_removed += 1;
        self.events.push(OrderBookEvent::OrderRemoved(*order_id));
        self.publish_best_change(location.side, previous_best);
        self.touch();

        debug!("{}: order {} removed", self.symbol, order_id);
        Ok(order)
    }

    /// Execute `quantity` of a resting order.
    ///
    /// The level aggregate drops by exactly what the order lost; a filled
    /// order leaves the book. Returns the order's remaining quantity. On error
    /// neither the book nor the order changes.
    pub fn apply_fill(
        &mut self,
        order_id: &OrderId,
        quantity: Quantity,
    ) -> Result<Quantity, BookError> {
        if quantity <= Decimal::ZERO {
            return Err(BookError::InvalidQuantity(quantity));
        }
        let location = self
            .orders
            .get(order_id)
            .copied()
            .ok_or(BookError::OrderNotFound(*order_id))?;

        let level = self
            .side_mut(location.side)
            .get_mut(&location.price)
            .ok_or(BookError::OrderNotFound(*order_id))?;
        let order = level
            .handle(location.slot, order_id)
            .cloned()
            .ok_or(BookError::OrderNotFound(*order_id))?;

        let (before, after) = {
            let mut order = order.write();
            let before = order.remaining_quantity();
            order.apply_fill(quantity)?;
            (before, order.remaining_quantity())
        };
        level.reduce(location.slot, before - after);

        self.events.push(OrderBookEvent::OrderFilled {
            order_id: *order_id,
            quantity,
        });
        self.touch();

        if after.is_zero() {
            self.remove_order(order_id)?;
        }
        Ok(after)
    }

    /// Count a trade produced against this book.
    pub fn record_trade(&mut self, trade: &Trade) {
        self.stats.trades_executed += 1;
        self.stats.volume_traded += trade.quantity;
        self.events.push(OrderBookEvent::TradeExecuted(trade.clone()));
    }

    pub fn best_bid(&self) -> Result<&PriceLevel, BookError> {
        self.bids.best().ok_or(BookError::EmptyBook(Side::Buy))
    }

    pub fn best_ask(&self) -> Result<&PriceLevel, BookError> {
        self.asks.best().ok_or(BookError::EmptyBook(Side::Sell))
    }

    /// Best level on `side`
    pub fn best(&self, side: Side) -> Option<&PriceLevel> {
        self.side(side).best()
    }

    /// Best ask minus best bid
    pub fn spread(&self) -> Result<Decimal, BookError> {
        let bid = self.best_bid()?.price();
        let ask = self.best_ask()?.price();
        Ok(ask - bid)
    }

    /// (best bid + best ask) / 2
    pub fn mid_price(&self) -> Result<Decimal, BookError> {
        let bid = self.best_bid()?.price();
        let ask = self.best_ask()?.price();
        Ok((bid + ask) / Decimal::TWO)
    }

    pub fn depth(&self, levels: usize) -> Depth {
        Depth {
            symbol: self.symbol.clone(),
            bids: self.bids.top_n(levels).into_iter().map(PriceLevel::summary).collect(),
            asks: self.asks.top_n(levels).into_iter().map(PriceLevel::summary).collect(),
        }
    }

    pub fn snapshot(&self) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: self.symbol.clone(),
            bids: self.bids.iter().map(PriceLevel::summary).collect(),
            asks: self.asks.iter().map(PriceLevel::summary).collect(),
            order_count: self.orders.len(),
            updated_at: self.updated_at,
        }
    }

    /// Copies of the orders queued at a price, in time priority
    pub fn orders_at(&self, side: Side, price: Price) -> Vec<Order> {
        self.side(side)
            .get(&price)
            .map(PriceLevel::snapshot_orders)
            .unwrap_or_default()
    }

    /// Copy of a resting order
    pub fn order(&self, order_id: &OrderId) -> Option<Order> {
        let location = self.orders.get(order_id)?;
        let level = self.side(location.side).get(&location.price)?;
        level
            .handle(location.slot, order_id)
            .map(|order| order.read().clone())
    }

    /// Opposing liquidity an order on `taker_side` could reach.
    ///
    /// Walks levels marketable against `limit` (any level when `None`) and
    /// stops as soon as `needed` is covered.
    pub fn available_liquidity(
        &self,
        taker_side: Side,
        limit: Option<Price>,
        needed: Quantity,
    ) -> Quantity {
        let mut available = Decimal::ZERO;
        for level in self.side(taker_side.opposite()).iter() {
            if !is_marketable(taker_side, limit, level.price()) {
                break;
            }
            available += level.total_quantity();
            if available >= needed {
                break;
            }
        }
        available
    }

    /// Verify every structural invariant of the book.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut located = 0;
        for index in [&self.bids, &self.asks] {
            index.check_invariants()?;
            for level in index.iter() {
                if level.is_empty() {
                    return Err(format!("empty level {} kept", level.price()));
                }
                level.check_links()?;
                if level.total_quantity() != level.recomputed_quantity() {
                    return Err(format!(
                        "level {} aggregates {} but holds {}",
                        level.price(),
                        level.total_quantity(),
                        level.recomputed_quantity()
                    ));
                }
                for (slot, order_id) in level.slots() {
                    let expected = OrderLocation {
                        side: index.side(),
                        price: level.price(),
                        slot,
                    };
                    if self.orders.get(&order_id) != Some(&expected) {
                        return Err(format!("order {} not indexed at its slot", order_id));
                    }
                    located += 1;
                }
                for order in level.snapshot_orders() {
                    if order.side != index.side() || !order.order_type.can_rest() {
                        return Err(format!("order {} cannot rest on this side", order.id));
                    }
                }
            }
        }
        if located != self.orders.len() {
            return Err(format!(
                "{} orders indexed, {} found in levels",
                self.orders.len(),
                located
            ));
        }
        Ok(())
    }

    fn side(&self, side: Side) -> &PriceLevelIndex {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut PriceLevelIndex {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    fn publish_best_change(&self, side: Side, previous: Option<Price>) {
        let current = self.side(side).best_price();
        if current != previous {
            self.events.push(match side {
                Side::Buy => OrderBookEvent::BestBidChanged(current),
                Side::Sell => OrderBookEvent::BestAskChanged(current),
            });
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Can an order on `taker_side` with `limit` trade at `resting_price`?
/// A missing limit (market order) crosses every price.
pub fn is_marketable(taker_side: Side, limit: Option<Price>, resting_price: Price) -> bool {
    match (taker_side, limit) {
        (_, None) => true,
        (Side::Buy, Some(limit)) => limit >= resting_price,
        (Side::Sell, Some(limit)) => limit <= resting_price,
    }
}
