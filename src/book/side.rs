use std::collections::BTreeMap;

use rust_decimal::Decimal;
use slab::Slab;

use crate::book::level::PriceLevel;
use crate::book::node::OrderNode;
use crate::book::Side;

/// One side of a book: an ordered map of price to FIFO level, plus aggregate
/// volume and order count for fast snapshots.
///
/// Best price is the maximum key for bids and the minimum for asks. Empty
/// levels are deleted eagerly, so every key maps to a non-empty level.
#[derive(Debug)]
pub struct BookSide {
    side: Side,
    levels: BTreeMap<Decimal, PriceLevel>,
    pub volume: Decimal,
    pub order_count: usize,
}

impl BookSide {
    pub fn new(side: Side) -> Self {
        Self { side, levels: BTreeMap::new(), volume: Decimal::ZERO, order_count: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn best_price(&self) -> Option<Decimal> {
        match self.side {
            Side::Bid => self.levels.keys().next_back().copied(),
            Side::Ask => self.levels.keys().next().copied(),
        }
    }

    /// Head (oldest) order of the level at `price`.
    pub fn head_of(&self, price: Decimal) -> Option<usize> {
        self.levels.get(&price).and_then(|level| level.head)
    }

    pub fn level(&self, price: Decimal) -> Option<&PriceLevel> {
        self.levels.get(&price)
    }

    /// Find-or-create the level at the order's price and append.
    pub fn insert(&mut self, key: usize, orders: &mut Slab<OrderNode>) {
        let (price, quantity) = {
            let order = &orders[key].order;
            (order.price, order.quantity)
        };
        self.levels
            .entry(price)
            .or_insert_with(|| PriceLevel::new(price))
            .push_back(key, orders);
        self.volume += quantity;
        self.order_count += 1;
    }

    /// Unlink an order from its level, deleting the level if it empties.
    /// Returns the removed remaining quantity.
    pub fn remove(&mut self, key: usize, orders: &mut Slab<OrderNode>) -> Decimal {
        let price = orders[key].order.price;
        let level = self
            .levels
            .get_mut(&price)
            .expect("indexed order must have a level");
        let quantity = level.remove(key, orders);
        if level.is_empty() {
            self.levels.remove(&price);
        }
        self.volume -= quantity;
        self.order_count -= 1;
        quantity
    }

    /// Account for a partial fill at `price`.
    pub fn reduce(&mut self, price: Decimal, delta: Decimal) {
        if let Some(level) = self.levels.get_mut(&price) {
            level.reduce(delta);
        }
        self.volume -= delta;
    }

    /// Per-level `(price, volume)` rows, best price first.
    pub fn depth(&self, limit: Option<usize>) -> Vec<(Decimal, Decimal)> {
        let cap = limit.unwrap_or(usize::MAX);
        match self.side {
            Side::Bid => self
                .levels
                .iter()
                .rev()
                .take(cap)
                .map(|(price, level)| (*price, level.volume))
                .collect(),
            Side::Ask => self
                .levels
                .iter()
                .take(cap)
                .map(|(price, level)| (*price, level.volume))
                .collect(),
        }
    }
}
