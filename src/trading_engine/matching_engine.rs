// src/trading_engine/matching_engine.rs

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order_book::{
    is_marketable, Depth, OrderBook, OrderBookEvent, OrderBookSnapshot, OrderBookStats,
};
use super::price_level::LevelSummary;
use crate::error::{BookError, EngineError, OrderError};
use crate::models::{
    Order, OrderId, OrderStatus, OrderType, Price, Quantity, SharedOrder, Side, Symbol,
    TimeInForce, Trade,
};

/// What happens to the unfilled part of a market order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRemainderPolicy {
    /// The order keeps its PARTIALLY_FILLED status and is done
    #[default]
    LeavePartiallyFilled,
    /// The order is moved to CANCELLED with its fills kept
    Cancel,
}

impl fmt::Display for MarketRemainderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketRemainderPolicy::LeavePartiallyFilled => write!(f, "leave_partially_filled"),
            MarketRemainderPolicy::Cancel => write!(f, "cancel"),
        }
    }
}

impl FromStr for MarketRemainderPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "leave_partially_filled" | "leave" => Ok(MarketRemainderPolicy::LeavePartiallyFilled),
            "cancel" => Ok(MarketRemainderPolicy::Cancel),
            _ => Err(format!("Invalid market remainder policy: {}", s)),
        }
    }
}

/// Per-engine settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchingConfig {
    pub market_remainder: MarketRemainderPolicy,
    pub trade_history_limit: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        MatchingConfig {
            market_remainder: MarketRemainderPolicy::default(),
            trade_history_limit: 1000,
        }
    }
}

/// Outcome of placing one order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub order_id: OrderId,
    /// Trades in execution order
    pub trades: Vec<Trade>,
    /// Status of the incoming order when the call returned
    pub status: OrderStatus,
    pub filled_quantity: Quantity,
    pub remaining_quantity: Quantity,
    /// Whether the remainder now rests in the book
    pub rested: bool,
    /// State of every resting order touched, after its fill
    pub maker_updates: Vec<Order>,
    /// Resting orders found closed outside the book and dropped from it
    pub evicted: Vec<Order>,
}

impl MatchResult {
    /// Unfilled quantity that neither executed nor rests
    pub fn unfilled_dropped(&self) -> Quantity {
        if self.rested {
            Decimal::ZERO
        } else {
            self.remaining_quantity
        }
    }
}

/// The matching engine for a single trading pair
pub struct MatchingEngine {
    symbol: Symbol,
    order_book: RwLock<OrderBook>,
    config: MatchingConfig,
    trade_history: Mutex<VecDeque<Trade>>,
}

impl MatchingEngine {
    pub fn new(symbol: impl Into<Symbol>, config: MatchingConfig) -> Self {
        let symbol = symbol.into();
        MatchingEngine {
            order_book: RwLock::new(OrderBook::new(symbol.clone())),
            symbol,
            config,
            trade_history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn config(&self) -> MatchingConfig {
        self.config
    }

    /// Match an incoming order against the book under price-time priority.
    ///
    /// The whole pass runs under the book's write lock and the incoming
    /// order's write lock. The order is mutated in place, so every holder of
    /// the handle sees its fills. Validation failures leave both the order and
    /// the book untouched, and once a fill has happened the call always
    /// returns `Ok` with every trade it made.
    pub fn place_order(&self, order: &SharedOrder) -> Result<MatchResult, EngineError> {
        let mut book = self.order_book.write();
        let mut taker = order.write();

        taker.validate()?;
        if taker.symbol != self.symbol {
            return Err(BookError::SymbolMismatch {
                expected: self.symbol.clone(),
                actual: taker.symbol.clone(),
            }
            .into());
        }
        if taker.order_type == OrderType::Stop {
            return Err(EngineError::UnsupportedOrderType(taker.order_type));
        }
        if book.contains(&taker.id) {
            return Err(EngineError::DuplicateOrder(taker.id));
        }
        if !matches!(taker.status, OrderStatus::Pending | OrderStatus::Open) {
            return Err(EngineError::NotPlaceable {
                order_id: taker.id,
                status: taker.status,
            });
        }
        taker.open()?;

        let order_id = taker.id;
        let side = taker.side;
        let limit = match taker.order_type {
            OrderType::Market => None,
            _ => taker.price,
        };

        if taker.time_in_force == TimeInForce::Fok {
            let needed = taker.remaining_quantity();
            let available = book.available_liquidity(side, limit, needed);
            if available < needed {
                taker.cancel()?;
                info!(
                    "{}: FOK order {} killed, needed {} but only {} available",
                    self.symbol, order_id, needed, available
                );
                return Ok(Self::result(&taker, Vec::new(), Vec::new(), Vec::new(), false));
            }
        }

        let mut trades = Vec::new();
        let mut maker_updates = Vec::new();
        let mut evicted = Vec::new();

        while taker.remaining_quantity() > Decimal::ZERO {
            let Some(level) = book.best(side.opposite()) else {
                break;
            };
            let price = level.price();
            if !is_marketable(side, limit, price) {
                break;
            }
            let Some(maker) = level.front().cloned() else {
                break;
            };

            let (maker_id, trade) = {
                let maker = maker.read();
                if !maker.is_open() {
                    (maker.id, None)
                } else {
                    let quantity = taker.remaining_quantity().min(maker.remaining_quantity());
                    (maker.id, Some(Trade::between(&maker, &taker, price, quantity)))
                }
            };

            // a maker closed through its own handle can no longer trade
            let Some(trade) = trade else {
                self.evict(&mut book, &maker_id, &mut evicted);
                continue;
            };
            if let Err(e) = book.apply_fill(&maker_id, trade.quantity) {
                warn!("{}: maker {} refused fill: {}", self.symbol, maker_id, e);
                self.evict(&mut book, &maker_id, &mut evicted);
                continue;
            }
            book.record_trade(&trade);
            maker_updates.push(maker.read().clone());

            debug!(
                "{}: trade {} {} @ {} maker {} taker {}",
                self.symbol, trade.id, trade.quantity, trade.price, maker_id, order_id
            );
            let taker_filled = taker.apply_fill(trade.quantity);
            trades.push(trade);
            if let Err(e) = taker_filled {
                error!("{}: order {} refused its own fill: {}", self.symbol, order_id, e);
                break;
            }
        }

        let remaining = taker.remaining_quantity();
        let mut rest = false;
        if remaining > Decimal::ZERO && taker.is_open() {
            match (taker.order_type, taker.time_in_force) {
                (OrderType::Market, _) => {
                    if trades.is_empty() {
                        self.close(&mut taker, Order::reject);
                    } else if self.config.market_remainder == MarketRemainderPolicy::Cancel {
                        self.close(&mut taker, Order::cancel);
                    }
                    info!(
                        "{}: market order {} left {} unfilled",
                        self.symbol, order_id, remaining
                    );
                }
                (_, TimeInForce::Gtc) => rest = true,
                (_, time_in_force @ (TimeInForce::Ioc | TimeInForce::Fok)) => {
                    self.close(&mut taker, Order::cancel);
                    info!(
                        "{}: {} order {} dropped remainder {}",
                        self.symbol, time_in_force, order_id, remaining
                    );
                }
            }
        }

        let mut result = Self::result(&taker, trades, maker_updates, evicted, false);
        drop(taker);
        if rest {
            match book.add_order(order.clone()) {
                Ok(()) => result.rested = true,
                Err(e) => warn!("{}: order {} could not rest: {}", self.symbol, order_id, e),
            }
        }
        drop(book);

        self.record_trades(&result.trades);
        Ok(result)
    }

    /// Pull a resting order out of the book and mark it CANCELLED.
    pub fn cancel_order(&self, order_id: &OrderId) -> Result<Order, EngineError> {
        let mut book = self.order_book.write();
        let order = book.remove_order(order_id)?;
        let mut order = order.write();
        order.cancel()?;
        info!("{}: order {} cancelled", self.symbol, order_id);
        Ok(order.clone())
    }

    /// Rest an order without matching it.
    pub fn add_order(&self, order: SharedOrder) -> Result<(), EngineError> {
        self.order_book.write().add_order(order)?;
        Ok(())
    }

    pub fn remove_order(&self, order_id: &OrderId) -> Result<SharedOrder, EngineError> {
        Ok(self.order_book.write().remove_order(order_id)?)
    }

    pub fn apply_fill(&self, order_id: &OrderId, quantity: Quantity) -> Result<Quantity, EngineError> {
        Ok(self.order_book.write().apply_fill(order_id, quantity)?)
    }

    pub fn best_bid(&self) -> Result<LevelSummary, EngineError> {
        Ok(self.order_book.read().best_bid()?.summary())
    }

    pub fn best_ask(&self) -> Result<LevelSummary, EngineError> {
        Ok(self.order_book.read().best_ask()?.summary())
    }

    pub fn spread(&self) -> Result<Decimal, EngineError> {
        Ok(self.order_book.read().spread()?)
    }

    pub fn mid_price(&self) -> Result<Decimal, EngineError> {
        Ok(self.order_book.read().mid_price()?)
    }

    pub fn depth(&self, levels: usize) -> Depth {
        self.order_book.read().depth(levels)
    }

    pub fn snapshot(&self) -> OrderBookSnapshot {
        self.order_book.read().snapshot()
    }

    pub fn orders_at(&self, side: Side, price: Price) -> Vec<Order> {
        self.order_book.read().orders_at(side, price)
    }

    pub fn order(&self, order_id: &OrderId) -> Option<Order> {
        self.order_book.read().order(order_id)
    }

    pub fn order_count(&self) -> usize {
        self.order_book.read().order_count()
    }

    pub fn stats(&self) -> OrderBookStats {
        self.order_book.read().stats()
    }

    pub fn subscribe(&self) -> Arc<SegQueue<OrderBookEvent>> {
        self.order_book.read().subscribe()
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        self.order_book.read().check_invariants()
    }

    /// Most recent trades, newest first
    pub fn recent_trades(&self, limit: usize) -> Vec<Trade> {
        let history = self.trade_history.lock();
        history.iter().rev().take(limit).cloned().collect()
    }

    fn record_trades(&self, trades: &[Trade]) {
        if trades.is_empty() || self.config.trade_history_limit == 0 {
            return;
        }
        let mut history = self.trade_history.lock();
        history.extend(trades.iter().cloned());
        while history.len() > self.config.trade_history_limit {
            history.pop_front();
        }
    }

    fn result(
        order: &Order,
        trades: Vec<Trade>,
        maker_updates: Vec<Order>,
        evicted: Vec<Order>,
        rested: bool,
    ) -> MatchResult {
        MatchResult {
            order_id: order.id,
            trades,
            status: order.status,
            filled_quantity: order.filled_quantity,
            remaining_quantity: order.remaining_quantity(),
            rested,
            maker_updates,
            evicted,
        }
    }

    /// Drop a resting order that can no longer trade.
    fn evict(&self, book: &mut OrderBook, order_id: &OrderId, evicted: &mut Vec<Order>) {
        match book.remove_order(order_id) {
            Ok(order) => {
                let order = order.read().clone();
                warn!(
                    "{}: evicted order {} left in the book as {}",
                    self.symbol, order_id, order.status
                );
                evicted.push(order);
            }
            Err(e) => error!("{}: could not evict order {}: {}", self.symbol, order_id, e),
        }
    }

    fn close(&self, order: &mut Order, transition: fn(&mut Order) -> Result<(), OrderError>) {
        if let Err(e) = transition(order) {
            error!("{}: order {} could not be closed: {}", self.symbol, order.id, e);
        }
    }
}

/// Manager for multiple trading pairs.
///
/// The registry lock only guards listing and creating engines; each engine
/// serialises its own book.
pub struct MatchingEngineManager {
    engines: RwLock<HashMap<Symbol, Arc<MatchingEngine>>>,
    config: MatchingConfig,
}

impl MatchingEngineManager {
    pub fn new(config: MatchingConfig) -> Self {
        MatchingEngineManager {
            engines: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn add_symbol(&self, symbol: impl Into<Symbol>) -> Result<Arc<MatchingEngine>, EngineError> {
        let symbol = symbol.into();
        let mut engines = self.engines.write();
        if engines.contains_key(&symbol) {
            return Err(EngineError::SymbolAlreadyListed(symbol));
        }

        let engine = Arc::new(MatchingEngine::new(symbol.clone(), self.config));
        engines.insert(symbol.clone(), engine.clone());
        info!("Listed {}", symbol);
        Ok(engine)
    }

    pub fn get_engine(&self, symbol: &str) -> Result<Arc<MatchingEngine>, EngineError> {
        self.engines
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSymbol(symbol.to_string()))
    }

    /// Listed symbols in name order
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<_> = self.engines.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Route an order to the engine for its symbol.
    pub fn place_order(&self, order: &SharedOrder) -> Result<MatchResult, EngineError> {
        let symbol = order.read().symbol.clone();
        self.get_engine(&symbol)?.place_order(order)
    }

    pub fn cancel_order(&self, symbol: &str, order_id: &OrderId) -> Result<Order, EngineError> {
        self.get_engine(symbol)?.cancel_order(order_id)
    }
}

impl Default for MatchingEngineManager {
    fn default() -> Self {
        Self::new(MatchingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrderError;
    use rust_decimal_macros::dec;
    use std::thread;
    use uuid::Uuid;

    fn engine() -> MatchingEngine {
        MatchingEngine::new("BTC-USDT", MatchingConfig::default())
    }

    fn limit(side: Side, price: Decimal, quantity: Decimal, tif: TimeInForce) -> SharedOrder {
        Order::limit(Uuid::new_v4(), "BTC-USDT", side, price, quantity, tif).into_shared()
    }

    fn gtc(side: Side, price: Decimal, quantity: Decimal) -> SharedOrder {
        limit(side, price, quantity, TimeInForce::Gtc)
    }

    fn market(side: Side, quantity: Decimal) -> SharedOrder {
        Order::market(Uuid::new_v4(), "BTC-USDT", side, quantity).into_shared()
    }

    #[test]
    fn test_single_level_full_fill() {
        let engine = engine();
        let sell = gtc(Side::Sell, dec!(50000), dec!(1.0));
        engine.place_order(&sell).unwrap();

        let buy = market(Side::Buy, dec!(1.0));
        let result = engine.place_order(&buy).unwrap();

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].price, dec!(50000));
        assert_eq!(result.trades[0].quantity, dec!(1.0));
        assert!(!result.trades[0].is_buyer_maker);
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(buy.read().status, OrderStatus::Filled);
        assert_eq!(sell.read().status, OrderStatus::Filled);
        assert!(engine.best_ask().unwrap_err().is_empty_book());
        engine.check_invariants().unwrap();
    }

    #[test]
    fn test_multi_level_consumption() {
        let engine = engine();
        let first = gtc(Side::Sell, dec!(50000), dec!(0.5));
        let second = gtc(Side::Sell, dec!(50100), dec!(0.5));
        engine.place_order(&first).unwrap();
        engine.place_order(&second).unwrap();

        let result = engine.place_order(&market(Side::Buy, dec!(1.0))).unwrap();

        let prices: Vec<_> = result.trades.iter().map(|t| t.price).collect();
        assert_eq!(prices, vec![dec!(50000), dec!(50100)]);
        let total: Decimal = result.trades.iter().map(|t| t.quantity).sum();
        assert_eq!(total, dec!(1.0));
        assert_eq!(result.maker_updates.len(), 2);
        assert!(result.maker_updates.iter().all(Order::is_filled));
        assert_eq!(engine.order_count(), 0);
        assert!(engine.depth(10).asks.is_empty());
    }

    #[test]
    fn test_resting_remainder() {
        let engine = engine();
        let sell = gtc(Side::Sell, dec!(51000), dec!(1.5));

        let result = engine.place_order(&sell).unwrap();

        assert!(result.trades.is_empty());
        assert!(result.rested);
        assert_eq!(result.status, OrderStatus::Open);
        let depth = engine.depth(5);
        assert_eq!(depth.asks.len(), 1);
        assert_eq!(depth.asks[0].price, dec!(51000));
        assert_eq!(depth.asks[0].quantity, dec!(1.5));
    }

    #[test]
    fn test_trade_at_maker_price() {
        let engine = engine();
        let seller = Uuid::new_v4();
        let buyer = Uuid::new_v4();
        let sell = Order::limit(seller, "BTC-USDT", Side::Sell, dec!(49900), dec!(1.0), TimeInForce::Gtc)
            .into_shared();
        let buy = Order::limit(buyer, "BTC-USDT", Side::Buy, dec!(50000), dec!(2.0), TimeInForce::Gtc)
            .into_shared();

        engine.place_order(&sell).unwrap();
        let result = engine.place_order(&buy).unwrap();

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.price, dec!(49900));
        assert_eq!(trade.quantity, dec!(1.0));
        assert_eq!(trade.seller_user_id, seller);
        assert_eq!(trade.buyer_user_id, buyer);
        assert_eq!(result.remaining_quantity, dec!(1.0));
        assert_eq!(result.status, OrderStatus::PartiallyFilled);
        assert!(result.rested);
        assert_eq!(engine.best_bid().unwrap().price, dec!(50000));
        assert_eq!(engine.best_bid().unwrap().quantity, dec!(1.0));
    }

    #[test]
    fn test_fifo_within_level() {
        let engine = engine();
        let makers: Vec<_> = (0..3).map(|_| gtc(Side::Buy, dec!(100), dec!(1))).collect();
        for maker in &makers {
            engine.place_order(maker).unwrap();
        }

        let result = engine
            .place_order(&limit(Side::Sell, dec!(100), dec!(1.5), TimeInForce::Ioc))
            .unwrap();

        assert_eq!(result.trades[0].buyer_order_id, makers[0].read().id);
        assert_eq!(result.trades[1].buyer_order_id, makers[1].read().id);
        assert!(result.trades.iter().all(|t| t.is_buyer_maker));
        assert_eq!(makers[1].read().remaining_quantity(), dec!(0.5));
        let queued: Vec<_> = engine
            .orders_at(Side::Buy, dec!(100))
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(queued, vec![makers[1].read().id, makers[2].read().id]);
    }

    #[test]
    fn test_limit_does_not_cross_worse_prices() {
        let engine = engine();
        engine.place_order(&gtc(Side::Sell, dec!(101), dec!(1))).unwrap();

        let result = engine.place_order(&gtc(Side::Buy, dec!(100), dec!(1))).unwrap();

        assert!(result.trades.is_empty());
        assert_eq!(engine.spread().unwrap(), dec!(1));
    }

    #[test]
    fn test_ioc_drops_remainder() {
        let engine = engine();
        engine.place_order(&gtc(Side::Sell, dec!(100), dec!(1))).unwrap();

        let ioc = limit(Side::Buy, dec!(100), dec!(3), TimeInForce::Ioc);
        let result = engine.place_order(&ioc).unwrap();

        assert_eq!(result.filled_quantity, dec!(1));
        assert_eq!(result.status, OrderStatus::Cancelled);
        assert!(!result.rested);
        assert_eq!(result.unfilled_dropped(), dec!(2));
        assert_eq!(engine.order_count(), 0);
    }

    #[test]
    fn test_fok_kills_without_fills() {
        let engine = engine();
        let maker = gtc(Side::Sell, dec!(100), dec!(1));
        engine.place_order(&maker).unwrap();
        engine.place_order(&gtc(Side::Sell, dec!(102), dec!(5))).unwrap();

        let fok = limit(Side::Buy, dec!(101), dec!(2), TimeInForce::Fok);
        let result = engine.place_order(&fok).unwrap();

        assert!(result.trades.is_empty());
        assert_eq!(result.status, OrderStatus::Cancelled);
        assert_eq!(maker.read().filled_quantity, Decimal::ZERO);
        assert_eq!(engine.best_ask().unwrap().quantity, dec!(1));
    }

    #[test]
    fn test_fok_fills_across_levels() {
        let engine = engine();
        engine.place_order(&gtc(Side::Sell, dec!(100), dec!(1))).unwrap();
        engine.place_order(&gtc(Side::Sell, dec!(101), dec!(1))).unwrap();

        let fok = limit(Side::Buy, dec!(101), dec!(2), TimeInForce::Fok);
        let result = engine.place_order(&fok).unwrap();

        assert_eq!(result.trades.len(), 2);
        assert_eq!(result.status, OrderStatus::Filled);
    }

    #[test]
    fn test_market_remainder_policies() {
        let leave = engine();
        leave.place_order(&gtc(Side::Buy, dec!(100), dec!(1))).unwrap();
        let result = leave.place_order(&market(Side::Sell, dec!(3))).unwrap();
        assert_eq!(result.status, OrderStatus::PartiallyFilled);
        assert!(!result.rested);
        assert_eq!(result.unfilled_dropped(), dec!(2));
        assert_eq!(leave.order_count(), 0);

        let cancel = MatchingEngine::new(
            "BTC-USDT",
            MatchingConfig {
                market_remainder: MarketRemainderPolicy::Cancel,
                ..MatchingConfig::default()
            },
        );
        cancel.place_order(&gtc(Side::Buy, dec!(100), dec!(1))).unwrap();
        let result = cancel.place_order(&market(Side::Sell, dec!(3))).unwrap();
        assert_eq!(result.status, OrderStatus::Cancelled);
        assert_eq!(result.filled_quantity, dec!(1));
    }

    #[test]
    fn test_market_order_on_empty_book_is_rejected() {
        let engine = engine();
        let buy = market(Side::Buy, dec!(1));

        let result = engine.place_order(&buy).unwrap();

        assert!(result.trades.is_empty());
        assert_eq!(result.status, OrderStatus::Rejected);
        assert_eq!(engine.order_count(), 0);
    }

    #[test]
    fn test_invalid_orders_never_touch_the_book() {
        let engine = engine();
        engine.place_order(&gtc(Side::Sell, dec!(100), dec!(1))).unwrap();

        let zero = gtc(Side::Buy, dec!(100), dec!(0));
        assert!(matches!(
            engine.place_order(&zero),
            Err(EngineError::Order(OrderError::InvalidQuantity(_)))
        ));
        assert_eq!(zero.read().status, OrderStatus::Pending);

        let eth = Order::limit(Uuid::new_v4(), "ETH-USDT", Side::Buy, dec!(100), dec!(1), TimeInForce::Gtc)
            .into_shared();
        assert!(matches!(
            engine.place_order(&eth),
            Err(EngineError::Book(BookError::SymbolMismatch { .. }))
        ));

        let stop = Order::new(
            Uuid::new_v4(),
            "BTC-USDT",
            Side::Buy,
            OrderType::Stop,
            None,
            Some(dec!(120)),
            dec!(1),
            TimeInForce::Gtc,
        )
        .into_shared();
        assert!(matches!(
            engine.place_order(&stop),
            Err(EngineError::UnsupportedOrderType(OrderType::Stop))
        ));

        assert_eq!(engine.best_ask().unwrap().quantity, dec!(1));
        assert_eq!(engine.stats().trades_executed, 0);
    }

    #[test]
    fn test_duplicate_and_terminal_placement() {
        let engine = engine();
        let sell = gtc(Side::Sell, dec!(100), dec!(1));
        engine.place_order(&sell).unwrap();

        let id = sell.read().id;
        assert!(matches!(engine.place_order(&sell), Err(EngineError::DuplicateOrder(d)) if d == id));

        engine.cancel_order(&id).unwrap();
        assert!(matches!(
            engine.place_order(&sell),
            Err(EngineError::NotPlaceable { status: OrderStatus::Cancelled, .. })
        ));
    }

    #[test]
    fn test_cancel_order() {
        let engine = engine();
        let buy = gtc(Side::Buy, dec!(50000), dec!(2.0));
        engine.place_order(&buy).unwrap();
        let id = buy.read().id;
        engine.apply_fill(&id, dec!(0.5)).unwrap();

        let cancelled = engine.cancel_order(&id).unwrap();

        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.filled_quantity, dec!(0.5));
        assert_eq!(buy.read().status, OrderStatus::Cancelled);
        assert!(engine.best_bid().is_err());
        assert!(matches!(
            engine.cancel_order(&id),
            Err(EngineError::Book(BookError::OrderNotFound(_)))
        ));
    }

    #[test]
    fn test_maker_closed_through_its_handle_is_skipped() {
        let engine = engine();
        let first = gtc(Side::Sell, dec!(100), dec!(1));
        let closed = gtc(Side::Sell, dec!(101), dec!(1));
        let third = gtc(Side::Sell, dec!(102), dec!(1));
        for order in [&first, &closed, &third] {
            engine.place_order(order).unwrap();
        }
        closed.write().cancel().unwrap();

        let buy = market(Side::Buy, dec!(2));
        let result = engine.place_order(&buy).unwrap();

        let prices: Vec<_> = result.trades.iter().map(|t| t.price).collect();
        assert_eq!(prices, vec![dec!(100), dec!(102)]);
        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.evicted.len(), 1);
        assert_eq!(result.evicted[0].id, closed.read().id);
        assert_eq!(result.evicted[0].status, OrderStatus::Cancelled);
        assert_eq!(closed.read().filled_quantity, Decimal::ZERO);

        assert_eq!(engine.order_count(), 0);
        assert_eq!(engine.recent_trades(10).len(), 2);
        assert_eq!(engine.stats().trades_executed, 2);
        engine.check_invariants().unwrap();
    }

    #[test]
    fn test_closed_maker_alone_leaves_market_order_rejected() {
        let engine = engine();
        let sell = gtc(Side::Sell, dec!(100), dec!(1));
        engine.place_order(&sell).unwrap();
        sell.write().cancel().unwrap();

        let buy = market(Side::Buy, dec!(1));
        let result = engine.place_order(&buy).unwrap();

        assert!(result.trades.is_empty());
        assert_eq!(result.status, OrderStatus::Rejected);
        assert_eq!(result.evicted.len(), 1);
        assert!(engine.best_ask().is_err());
        engine.check_invariants().unwrap();
    }

    #[test]
    fn test_self_cross_is_allowed() {
        let engine = engine();
        let user = Uuid::new_v4();
        let sell = Order::limit(user, "BTC-USDT", Side::Sell, dec!(100), dec!(1), TimeInForce::Gtc).into_shared();
        let buy = Order::limit(user, "BTC-USDT", Side::Buy, dec!(100), dec!(1), TimeInForce::Gtc).into_shared();

        engine.place_order(&sell).unwrap();
        let result = engine.place_order(&buy).unwrap();

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].buyer_user_id, result.trades[0].seller_user_id);
    }

    #[test]
    fn test_recent_trades_are_bounded() {
        let engine = MatchingEngine::new(
            "BTC-USDT",
            MatchingConfig {
                trade_history_limit: 3,
                ..MatchingConfig::default()
            },
        );
        for i in 0..5 {
            engine.place_order(&gtc(Side::Sell, Decimal::from(100 + i), dec!(1))).unwrap();
        }
        engine.place_order(&market(Side::Buy, dec!(5))).unwrap();

        let recent = engine.recent_trades(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].price, dec!(104));
        assert_eq!(recent[2].price, dec!(102));
        assert_eq!(engine.recent_trades(1).len(), 1);
        assert_eq!(engine.stats().trades_executed, 5);
        assert_eq!(engine.stats().volume_traded, dec!(5));
    }

    #[test]
    fn test_manager_routes_by_symbol() {
        let manager = MatchingEngineManager::default();
        manager.add_symbol("BTC-USDT").unwrap();
        manager.add_symbol("ETH-USDT").unwrap();
        assert!(matches!(
            manager.add_symbol("BTC-USDT"),
            Err(EngineError::SymbolAlreadyListed(_))
        ));
        assert_eq!(manager.symbols(), vec!["BTC-USDT".to_string(), "ETH-USDT".to_string()]);

        let eth = Order::limit(Uuid::new_v4(), "ETH-USDT", Side::Sell, dec!(3000), dec!(1), TimeInForce::Gtc)
            .into_shared();
        manager.place_order(&eth).unwrap();
        assert_eq!(manager.get_engine("ETH-USDT").unwrap().order_count(), 1);
        assert_eq!(manager.get_engine("BTC-USDT").unwrap().order_count(), 0);

        let id = eth.read().id;
        assert!(manager.cancel_order("BTC-USDT", &id).is_err());
        manager.cancel_order("ETH-USDT", &id).unwrap();

        let doge = Order::limit(Uuid::new_v4(), "DOGE-USDT", Side::Buy, dec!(0.1), dec!(10), TimeInForce::Gtc)
            .into_shared();
        assert!(matches!(manager.place_order(&doge), Err(EngineError::UnknownSymbol(_))));
    }

    #[test]
    fn test_concurrent_placement_keeps_book_consistent() {
        let engine = Arc::new(engine());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let engine = engine.clone();
                thread::spawn(move || {
                    let mut placed = Vec::new();
                    for i in 0..200u32 {
                        let side = if (i + worker) % 2 == 0 { Side::Buy } else { Side::Sell };
                        let price = Decimal::from(95 + (i * 7 + worker) % 10);
                        let order = gtc(side, price, Decimal::new(((i % 5) + 1) as i64, 1));
                        engine.place_order(&order).unwrap();
                        placed.push(order);
                    }
                    placed
                })
            })
            .collect();

        let orders: Vec<SharedOrder> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        engine.check_invariants().unwrap();
        let filled: Decimal = orders.iter().map(|o| o.read().filled_quantity).sum();
        let stats = engine.stats();
        assert_eq!(filled, stats.volume_traded * Decimal::TWO);

        let resting = orders.iter().filter(|o| o.read().is_open()).count();
        assert_eq!(resting, engine.order_count());
        if let (Ok(bid), Ok(ask)) = (engine.best_bid(), engine.best_ask()) {
            assert!(bid.price < ask.price);
        }
    }
}
