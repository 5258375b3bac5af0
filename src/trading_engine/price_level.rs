// src/trading_engine/price_level.rs

use std::iter;

use rust_decimal::Decimal;
use serde::Serialize;
use slab::Slab;

use crate::models::{Order, OrderId, Price, Quantity, SharedOrder};

/// Entry in the price level queue.
///
/// `counted` is the share of the level aggregate this entry accounts for.
#[derive(Debug, Clone)]
struct LevelEntry {
    order_id: OrderId,
    order: SharedOrder,
    counted: Quantity,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A single price point holding resting orders in arrival order.
///
/// The queue is a doubly linked list threaded through a slab, so an order
/// can be unlinked by its slot in O(1) wherever it sits. `total_quantity`
/// always equals the sum of what each entry counts, which the owning book
/// keeps in step with fills through [`PriceLevel::reduce`].
#[derive(Debug, Clone)]
pub struct PriceLevel {
    price: Price,
    entries: Slab<LevelEntry>,
    head: Option<usize>,
    tail: Option<usize>,
    total_quantity: Quantity,
}

/// Aggregated view of a level, safe to hand out of the book lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LevelSummary {
    pub price: Price,
    pub quantity: Quantity,
    pub order_count: usize,
}

impl PriceLevel {
    pub fn new(price: Price) -> Self {
        PriceLevel {
            price,
            entries: Slab::new(),
            head: None,
            tail: None,
            total_quantity: Decimal::ZERO,
        }
    }

    pub fn price(&self) -> Price {
        self.price
    }

    /// Total remaining quantity at this price
    pub fn total_quantity(&self) -> Quantity {
        self.total_quantity
    }

    pub fn order_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn summary(&self) -> LevelSummary {
        LevelSummary {
            price: self.price,
            quantity: self.total_quantity,
            order_count: self.entries.len(),
        }
    }

    /// Append an order at the tail of the queue (time priority) and return
    /// its slot.
    ///
    /// The caller must not hold a lock on `order`.
    pub(crate) fn push_back(&mut self, order: SharedOrder) -> usize {
        let (order_id, remaining) = {
            let guard = order.read();
            (guard.id, guard.remaining_quantity())
        };
        let slot = self.entries.insert(LevelEntry {
            order_id,
            order,
            counted: remaining,
            prev: self.tail,
            next: None,
        });
        match self.tail.and_then(|tail| self.entries.get_mut(tail)) {
            Some(tail) => tail.next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.total_quantity += remaining;
        slot
    }

    /// Unlink the order in `slot`, keeping the others in order.
    ///
    /// Whatever the entry still counts leaves the aggregate with it. Returns
    /// `None` when the slot does not hold `order_id`.
    pub(crate) fn remove(&mut self, slot: usize, order_id: &OrderId) -> Option<SharedOrder> {
        if self.entries.get(slot)?.order_id != *order_id {
            return None;
        }
        let entry = self.entries.remove(slot);
        match entry.prev.and_then(|prev| self.entries.get_mut(prev)) {
            Some(prev) => prev.next = entry.next,
            None => self.head = entry.next,
        }
        match entry.next.and_then(|next| self.entries.get_mut(next)) {
            Some(next) => next.prev = entry.prev,
            None => self.tail = entry.prev,
        }
        self.total_quantity -= entry.counted;
        Some(entry.order)
    }

    /// Subtract executed volume of the order in `slot` from the aggregate.
    pub(crate) fn reduce(&mut self, slot: usize, quantity: Quantity) {
        if let Some(entry) = self.entries.get_mut(slot) {
            entry.counted -= quantity;
            self.total_quantity -= quantity;
        }
    }

    /// Oldest order at this price
    pub(crate) fn front(&self) -> Option<&SharedOrder> {
        self.head
            .and_then(|slot| self.entries.get(slot))
            .map(|entry| &entry.order)
    }

    /// Shared handle of the order in `slot`
    pub(crate) fn handle(&self, slot: usize, order_id: &OrderId) -> Option<&SharedOrder> {
        self.entries
            .get(slot)
            .filter(|entry| &entry.order_id == order_id)
            .map(|entry| &entry.order)
    }

    /// Queue position of an order, 0 being next in line
    pub fn position(&self, order_id: &OrderId) -> Option<usize> {
        self.queue().position(|(_, entry)| &entry.order_id == order_id)
    }

    pub fn order_ids(&self) -> impl Iterator<Item = OrderId> + '_ {
        self.queue().map(|(_, entry)| entry.order_id)
    }

    /// Slots and ids in time priority
    pub(crate) fn slots(&self) -> impl Iterator<Item = (usize, OrderId)> + '_ {
        self.queue().map(|(slot, entry)| (slot, entry.order_id))
    }

    /// Copies of the queued orders in time priority
    pub fn snapshot_orders(&self) -> Vec<Order> {
        self.queue().map(|(_, entry)| entry.order.read().clone()).collect()
    }

    /// Recompute the aggregate from the live orders. Used by invariant checks.
    pub fn recomputed_quantity(&self) -> Quantity {
        self.queue()
            .map(|(_, entry)| entry.order.read().remaining_quantity())
            .sum()
    }

    /// Check that the links visit every entry exactly once in both directions.
    pub fn check_links(&self) -> Result<(), String> {
        let mut previous = None;
        let mut visited = 0;
        for (slot, entry) in self.queue() {
            if entry.prev != previous {
                return Err(format!("level {} slot {} has a broken back link", self.price, slot));
            }
            previous = Some(slot);
            visited += 1;
            if visited > self.entries.len() {
                return Err(format!("level {} queue has a cycle", self.price));
            }
        }
        if visited != self.entries.len() || previous != self.tail {
            return Err(format!(
                "level {} links {} of {} entries",
                self.price,
                visited,
                self.entries.len()
            ));
        }
        Ok(())
    }

    fn queue(&self) -> impl Iterator<Item = (usize, &LevelEntry)> + '_ {
        let first = self
            .head
            .and_then(|slot| self.entries.get(slot).map(|entry| (slot, entry)));
        iter::successors(first, move |(_, entry)| {
            entry
                .next
                .and_then(|slot| self.entries.get(slot).map(|next| (slot, next)))
        })
    }
}
