// src/trading_engine/price_index.rs

//! One side of one book: price levels kept in an AVL tree.
//!
//! Nodes live in a [`Slab`] and link to each other by slab handle, so
//! rotations only rewrite handles. A side map from price to handle makes
//! repeat lookups O(1), and the best level is cached as a handle that is
//! recomputed whenever the tree changes shape around it.

use std::cmp::Ordering;
use std::collections::HashMap;

use slab::Slab;

use super::price_level::PriceLevel;
use crate::models::{Price, Side};

type Handle = usize;

#[derive(Debug)]
struct Node {
    level: PriceLevel,
    left: Option<Handle>,
    right: Option<Handle>,
    height: i32,
}

/// Price levels for one side of a book.
///
/// Best is the highest price for bids and the lowest for asks.
#[derive(Debug)]
pub struct PriceLevelIndex {
    side: Side,
    nodes: Slab<Node>,
    root: Option<Handle>,
    by_price: HashMap<Price, Handle>,
    best: Option<Handle>,
}

impl PriceLevelIndex {
    pub fn new(side: Side) -> Self {
        PriceLevelIndex {
            side,
            nodes: Slab::new(),
            root: None,
            by_price: HashMap::new(),
            best: None,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Number of price levels
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn contains(&self, price: &Price) -> bool {
        self.by_price.contains_key(price)
    }

    pub fn get(&self, price: &Price) -> Option<&PriceLevel> {
        self.by_price.get(price).map(|&h| &self.nodes[h].level)
    }

    pub fn get_mut(&mut self, price: &Price) -> Option<&mut PriceLevel> {
        let handle = *self.by_price.get(price)?;
        Some(&mut self.nodes[handle].level)
    }

    /// Level for `price`, inserting an empty one if the price is new.
    pub fn get_or_create(&mut self, price: Price) -> &mut PriceLevel {
        if let Some(&handle) = self.by_price.get(&price) {
            return &mut self.nodes[handle].level;
        }

        let handle = self.nodes.insert(Node {
            level: PriceLevel::new(price),
            left: None,
            right: None,
            height: 1,
        });
        let root = self.root;
        self.root = Some(self.insert_at(root, handle));
        self.by_price.insert(price, handle);

        let is_new_best = match self.best {
            None => true,
            Some(best) => self.is_better(price, self.nodes[best].level.price()),
        };
        if is_new_best {
            self.best = Some(handle);
        }

        &mut self.nodes[handle].level
    }

    /// Drop the level at `price`.
    ///
    /// Only empty levels are removed; returns false if the price is absent
    /// or still has orders.
    pub fn remove(&mut self, price: &Price) -> bool {
        let Some(&handle) = self.by_price.get(price) else {
            return false;
        };
        if !self.nodes[handle].level.is_empty() {
            return false;
        }

        let root = self.root;
        self.root = self.remove_at(root, price);
        self.by_price.remove(price);
        self.nodes.remove(handle);

        if self.best == Some(handle) {
            self.best = self.root.map(|root| self.extreme(root));
        }
        true
    }

    /// Best level in O(1)
    pub fn best(&self) -> Option<&PriceLevel> {
        self.best.map(|h| &self.nodes[h].level)
    }

    pub fn best_price(&self) -> Option<Price> {
        self.best().map(PriceLevel::price)
    }

    /// Levels from best to worst
    pub fn iter(&self) -> Iter<'_> {
        let mut iter = Iter {
            index: self,
            stack: Vec::new(),
        };
        iter.descend(self.root);
        iter
    }

    /// The `n` best levels, best first
    pub fn top_n(&self, n: usize) -> Vec<&PriceLevel> {
        self.iter().take(n).collect()
    }

    /// Every level, best first
    pub fn all(&self) -> Vec<&PriceLevel> {
        self.iter().collect()
    }

    fn is_better(&self, candidate: Price, current: Price) -> bool {
        match self.side {
            Side::Buy => candidate > current,
            Side::Sell => candidate < current,
        }
    }

    /// Child to walk first when going best to worst
    fn near(&self, handle: Handle) -> Option<Handle> {
        match self.side {
            Side::Buy => self.nodes[handle].right,
            Side::Sell => self.nodes[handle].left,
        }
    }

    fn far(&self, handle: Handle) -> Option<Handle> {
        match self.side {
            Side::Buy => self.nodes[handle].left,
            Side::Sell => self.nodes[handle].right,
        }
    }

    /// Best node of the subtree under `handle`
    fn extreme(&self, mut handle: Handle) -> Handle {
        while let Some(next) = self.near(handle) {
            handle = next;
        }
        handle
    }

    fn height(&self, node: Option<Handle>) -> i32 {
        node.map_or(0, |h| self.nodes[h].height)
    }

    fn update_height(&mut self, handle: Handle) {
        let left = self.height(self.nodes[handle].left);
        let right = self.height(self.nodes[handle].right);
        self.nodes[handle].height = 1 + left.max(right);
    }

    fn balance_factor(&self, handle: Handle) -> i32 {
        self.height(self.nodes[handle].left) - self.height(self.nodes[handle].right)
    }

    fn rotate_right(&mut self, y: Handle) -> Handle {
        let Some(x) = self.nodes[y].left else {
            return y;
        };
        self.nodes[y].left = self.nodes[x].right;
        self.nodes[x].right = Some(y);
        self.update_height(y);
        self.update_height(x);
        x
    }

    fn rotate_left(&mut self, x: Handle) -> Handle {
        let Some(y) = self.nodes[x].right else {
            return x;
        };
        self.nodes[x].right = self.nodes[y].left;
        self.nodes[y].left = Some(x);
        self.update_height(x);
        self.update_height(y);
        y
    }

    /// Restore the AVL property at `handle`, returning the subtree's new root.
    fn rebalance(&mut self, handle: Handle) -> Handle {
        self.update_height(handle);
        let balance = self.balance_factor(handle);

        if balance > 1 {
            if let Some(left) = self.nodes[handle].left {
                if self.balance_factor(left) < 0 {
                    let rotated = self.rotate_left(left);
                    self.nodes[handle].left = Some(rotated);
                }
            }
            return self.rotate_right(handle);
        }
        if balance < -1 {
            if let Some(right) = self.nodes[handle].right {
                if self.balance_factor(right) > 0 {
                    let rotated = self.rotate_right(right);
                    self.nodes[handle].right = Some(rotated);
                }
            }
            return self.rotate_left(handle);
        }
        handle
    }

    fn insert_at(&mut self, node: Option<Handle>, new: Handle) -> Handle {
        let Some(current) = node else {
            return new;
        };

        let price = self.nodes[new].level.price();
        match price.cmp(&self.nodes[current].level.price()) {
            Ordering::Less => {
                let left = self.nodes[current].left;
                let subtree = self.insert_at(left, new);
                self.nodes[current].left = Some(subtree);
            }
            Ordering::Greater => {
                let right = self.nodes[current].right;
                let subtree = self.insert_at(right, new);
                self.nodes[current].right = Some(subtree);
            }
            // equal prices share one level; get_or_create never gets here
            Ordering::Equal => return current,
        }
        self.rebalance(current)
    }

    fn remove_at(&mut self, node: Option<Handle>, price: &Price) -> Option<Handle> {
        let current = node?;

        match price.cmp(&self.nodes[current].level.price()) {
            Ordering::Less => {
                let left = self.nodes[current].left;
                self.nodes[current].left = self.remove_at(left, price);
            }
            Ordering::Greater => {
                let right = self.nodes[current].right;
                self.nodes[current].right = self.remove_at(right, price);
            }
            Ordering::Equal => {
                let (left, right) = (self.nodes[current].left, self.nodes[current].right);
                return match (left, right) {
                    (None, child) | (child, None) => child,
                    (Some(left), Some(right)) => {
                        // the in-order successor takes this node's place
                        let (rest, successor) = self.detach_min(right);
                        self.nodes[successor].left = Some(left);
                        self.nodes[successor].right = rest;
                        Some(self.rebalance(successor))
                    }
                };
            }
        }
        Some(self.rebalance(current))
    }

    /// Unlink the lowest node under `handle`: (remaining subtree, detached node)
    fn detach_min(&mut self, handle: Handle) -> (Option<Handle>, Handle) {
        match self.nodes[handle].left {
            None => (self.nodes[handle].right, handle),
            Some(left) => {
                let (rest, min) = self.detach_min(left);
                self.nodes[handle].left = rest;
                (Some(self.rebalance(handle)), min)
            }
        }
    }

    /// Check ordering, heights, balance, the price map and the cached best.
    ///
    /// Returns a description of the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut visited = 0;
        self.check_subtree(self.root, None, None, &mut visited)?;
        if visited != self.nodes.len() || visited != self.by_price.len() {
            return Err(format!(
                "tree holds {} nodes, slab {}, price map {}",
                visited,
                self.nodes.len(),
                self.by_price.len()
            ));
        }

        let expected_best = self.root.map(|root| self.extreme(root));
        if self.best != expected_best {
            return Err(format!(
                "cached best {:?} differs from tree best {:?}",
                self.best.map(|h| self.nodes[h].level.price()),
                expected_best.map(|h| self.nodes[h].level.price())
            ));
        }
        Ok(())
    }

    fn check_subtree(
        &self,
        node: Option<Handle>,
        low: Option<Price>,
        high: Option<Price>,
        visited: &mut usize,
    ) -> Result<i32, String> {
        let Some(handle) = node else {
            return Ok(0);
        };
        let Some(node) = self.nodes.get(handle) else {
            return Err(format!("dangling handle {}", handle));
        };
        *visited += 1;

        let price = node.level.price();
        if low.map_or(false, |low| price <= low) || high.map_or(false, |high| price >= high) {
            return Err(format!("price {} out of order", price));
        }
        if self.by_price.get(&price) != Some(&handle) {
            return Err(format!("price map does not point at level {}", price));
        }

        let left = self.check_subtree(node.left, low, Some(price), visited)?;
        let right = self.check_subtree(node.right, Some(price), high, visited)?;
        if (left - right).abs() > 1 {
            return Err(format!("level {} unbalanced: {} vs {}", price, left, right));
        }
        let height = 1 + left.max(right);
        if height != node.height {
            return Err(format!(
                "level {} caches height {} but is {}",
                price, node.height, height
            ));
        }
        Ok(height)
    }
}

/// Best-to-worst traversal over a [`PriceLevelIndex`]
pub struct Iter<'a> {
    index: &'a PriceLevelIndex,
    stack: Vec<Handle>,
}

impl<'a> Iter<'a> {
    fn descend(&mut self, mut node: Option<Handle>) {
        while let Some(handle) = node {
            self.stack.push(handle);
            node = self.index.near(handle);
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a PriceLevel;

    fn next(&mut self) -> Option<Self::Item> {
        let handle = self.stack.pop()?;
        let index = self.index;
        self.descend(index.far(handle));
        Some(&index.nodes[handle].level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn prices(index: &PriceLevelIndex) -> Vec<Price> {
        index.iter().map(PriceLevel::price).collect()
    }

    #[test]
    fn test_get_or_create_never_duplicates() {
        let mut asks = PriceLevelIndex::new(Side::Sell);
        asks.get_or_create(dec!(50000));
        asks.get_or_create(dec!(50000.00));
        asks.get_or_create(dec!(50100));

        assert_eq!(asks.len(), 2);
        assert!(asks.contains(&dec!(50000)));
        asks.check_invariants().unwrap();
    }

    #[test]
    fn test_best_ask_is_lowest_and_bid_is_highest() {
        let mut asks = PriceLevelIndex::new(Side::Sell);
        let mut bids = PriceLevelIndex::new(Side::Buy);
        for price in [dec!(101), dec!(99), dec!(103), dec!(100)] {
            asks.get_or_create(price);
            bids.get_or_create(price);
        }

        assert_eq!(asks.best_price(), Some(dec!(99)));
        assert_eq!(bids.best_price(), Some(dec!(103)));
        assert_eq!(prices(&asks), vec![dec!(99), dec!(100), dec!(101), dec!(103)]);
        assert_eq!(prices(&bids), vec![dec!(103), dec!(101), dec!(100), dec!(99)]);
    }

    #[test]
    fn test_remove_recomputes_best() {
        let mut bids = PriceLevelIndex::new(Side::Buy);
        for price in [dec!(100), dec!(102), dec!(101)] {
            bids.get_or_create(price);
        }

        assert!(bids.remove(&dec!(102)));
        assert_eq!(bids.best_price(), Some(dec!(101)));
        assert!(!bids.remove(&dec!(102)));

        assert!(bids.remove(&dec!(100)));
        assert_eq!(bids.best_price(), Some(dec!(101)));
        assert!(bids.remove(&dec!(101)));
        assert!(bids.best().is_none());
        assert!(bids.is_empty());
        bids.check_invariants().unwrap();
    }

    #[test]
    fn test_top_n_limits_levels() {
        let mut asks = PriceLevelIndex::new(Side::Sell);
        for price in 1..=10 {
            asks.get_or_create(Decimal::from(price));
        }

        let top: Vec<_> = asks.top_n(3).into_iter().map(PriceLevel::price).collect();
        assert_eq!(top, vec![dec!(1), dec!(2), dec!(3)]);
        assert_eq!(asks.top_n(50).len(), 10);
        assert_eq!(asks.all().len(), 10);
    }

    #[test]
    fn test_balanced_under_sorted_inserts() {
        let mut ascending = PriceLevelIndex::new(Side::Sell);
        let mut descending = PriceLevelIndex::new(Side::Buy);
        for price in 0..1024 {
            ascending.get_or_create(Decimal::from(price));
            descending.get_or_create(Decimal::from(1024 - price));
            ascending.check_invariants().unwrap();
            descending.check_invariants().unwrap();
        }

        // a perfectly fed AVL tree of 1024 keys stays within 1.44 log2(n)
        assert!(ascending.height(ascending.root) <= 14);
        assert!(descending.height(descending.root) <= 14);

        for price in (0..1024).step_by(2) {
            assert!(ascending.remove(&Decimal::from(price)));
            ascending.check_invariants().unwrap();
        }
        assert_eq!(ascending.best_price(), Some(dec!(1)));
    }

    #[test]
    fn test_non_empty_level_is_kept() {
        use crate::models::{Order, TimeInForce};
        use uuid::Uuid;

        let mut asks = PriceLevelIndex::new(Side::Sell);
        let order = Order::limit(
            Uuid::new_v4(),
            "BTC-USDT",
            Side::Sell,
            dec!(50000),
            dec!(1),
            TimeInForce::Gtc,
        );
        asks.get_or_create(dec!(50000)).push_back(order.into_shared());

        assert!(!asks.remove(&dec!(50000)));
        assert_eq!(asks.len(), 1);
    }

    proptest! {
        #[test]
        fn avl_invariants_hold_under_random_operations(
            ops in prop::collection::vec((any::<bool>(), 0u32..200), 1..400)
        ) {
            let mut bids = PriceLevelIndex::new(Side::Buy);
            let mut asks = PriceLevelIndex::new(Side::Sell);
            let mut model = std::collections::BTreeSet::new();

            for (insert, tick) in ops {
                let price = Decimal::new(tick as i64, 1);
                if insert {
                    bids.get_or_create(price);
                    asks.get_or_create(price);
                    model.insert(price);
                } else {
                    let expected = model.remove(&price);
                    prop_assert_eq!(bids.remove(&price), expected);
                    prop_assert_eq!(asks.remove(&price), expected);
                }

                prop_assert!(bids.check_invariants().is_ok(), "{:?}", bids.check_invariants());
                prop_assert!(asks.check_invariants().is_ok(), "{:?}", asks.check_invariants());
                prop_assert_eq!(bids.best_price(), model.iter().next_back().copied());
                prop_assert_eq!(asks.best_price(), model.iter().next().copied());
            }

            let ascending: Vec<_> = model.iter().copied().collect();
            let descending: Vec<_> = model.iter().rev().copied().collect();
            prop_assert_eq!(prices(&asks), ascending);
            prop_assert_eq!(prices(&bids), descending);
        }
    }
}
