use rust_decimal::Decimal;
use slab::Slab;

use crate::book::node::OrderNode;

/// FIFO queue of resting orders at a single price.
///
/// `volume` always equals the sum of member quantities; matching consumes
/// from `head`, new orders append at `tail`.
#[derive(Debug, Clone)]
pub struct PriceLevel {
    pub price: Decimal,
    pub volume: Decimal,
    pub head: Option<usize>,
    pub tail: Option<usize>,
    pub len: usize,
}

impl PriceLevel {
    pub fn new(price: Decimal) -> Self {
        Self { price, volume: Decimal::ZERO, head: None, tail: None, len: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append at the tail, preserving time priority within the level.
    pub fn push_back(&mut self, key: usize, orders: &mut Slab<OrderNode>) {
        let quantity = {
            let node = &mut orders[key];
            node.prev = self.tail;
            node.next = None;
            node.order.quantity
        };
        if let Some(tail_key) = self.tail {
            orders[tail_key].next = Some(key);
        } else {
            self.head = Some(key);
        }
        self.tail = Some(key);
        self.len += 1;
        self.volume += quantity;
    }

    /// Unlink a node anywhere in the queue; returns its remaining quantity.
    pub fn remove(&mut self, key: usize, orders: &mut Slab<OrderNode>) -> Decimal {
        let (quantity, prev, next) = {
            let node = &orders[key];
            (node.order.quantity, node.prev, node.next)
        };
        match prev {
            Some(prev_key) => orders[prev_key].next = next,
            None => self.head = next,
        }
        match next {
            Some(next_key) => orders[next_key].prev = prev,
            None => self.tail = prev,
        }
        let node = &mut orders[key];
        node.prev = None;
        node.next = None;
        self.len -= 1;
        self.volume -= quantity;
        quantity
    }

    /// Account for a partial fill of a member order.
    pub fn reduce(&mut self, delta: Decimal) {
        self.volume -= delta;
    }
}
