//! Price-time-priority limit order book and matching engine.
//!
//! Storage is a slab arena of order nodes; each side keeps a `BTreeMap` of
//! price levels whose queues are doubly-linked lists of slab keys, and a
//! global `order_id -> key` index gives O(log n) cancel. Matching performs no
//! I/O and never suspends: admission, matching, and tape append happen inside
//! one critical section owned by the caller.

pub mod level;
pub mod node;
pub mod side;

use std::collections::{HashMap, VecDeque};

use alloy::primitives::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use slab::Slab;

use crate::book::node::OrderNode;
use crate::book::side::BookSide;

/// Trades retained in the in-memory tape per book. The durable tape is the
/// activity log; this bounds resident memory for busy symbols.
const MAX_TAPE: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Bid => "bid",
            Side::Ask => "ask",
        }
    }

    pub fn parse(raw: &str) -> Option<Side> {
        match raw.to_ascii_lowercase().as_str() {
            "bid" | "buy" => Some(Side::Bid),
            "ask" | "sell" => Some(Side::Ask),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn parse(raw: &str) -> Option<OrderType> {
        match raw.to_ascii_lowercase().as_str() {
            "limit" => Some(OrderType::Limit),
            "market" => Some(OrderType::Market),
            _ => None,
        }
    }
}

/// A resting or incoming order. `quantity` is the remaining base quantity
/// and strictly positive for every order reachable through the index.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub order_id: u64,
    pub account: Address,
    pub base_asset: String,
    pub quote_asset: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Decimal,
    pub quantity: Decimal,
    pub from_network: String,
    pub to_network: String,
    pub receive_wallet: Address,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeParty {
    pub account: Address,
    pub side: Side,
    pub order_id: u64,
    pub receive_wallet: Address,
    pub from_network: String,
    pub to_network: String,
}

impl TradeParty {
    fn of(order: &Order) -> Self {
        Self {
            account: order.account,
            side: order.side,
            order_id: order.order_id,
            receive_wallet: order.receive_wallet,
            from_network: order.from_network.clone(),
            to_network: order.to_network.clone(),
        }
    }
}

/// One executed match. Price is always the maker's price; records are
/// appended to the tape in match order and never rewritten.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub trade_id: u64,
    pub symbol: String,
    pub timestamp: i64,
    pub price: Decimal,
    pub quantity: Decimal,
    #[serde(rename = "maker_party")]
    pub maker: TradeParty,
    #[serde(rename = "taker_party")]
    pub taker: TradeParty,
}

#[derive(Debug)]
pub struct LimitResult {
    /// The admitted order with its assigned id and remaining quantity.
    pub order: Order,
    pub trades: Vec<TradeRecord>,
    /// Whether a non-zero remainder was rested on the book.
    pub rested: bool,
}

#[derive(Debug)]
pub struct MarketResult {
    pub order_id: u64,
    pub trades: Vec<TradeRecord>,
    pub unfilled: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug)]
pub struct Book {
    symbol: String,
    orders: Slab<OrderNode>,
    bids: BookSide,
    asks: BookSide,
    index: HashMap<u64, usize>,
    tape: VecDeque<TradeRecord>,
    next_order_id: u64,
    next_trade_id: u64,
}

impl Book {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            orders: Slab::new(),
            bids: BookSide::new(Side::Bid),
            asks: BookSide::new(Side::Ask),
            index: HashMap::new(),
            tape: VecDeque::new(),
            next_order_id: 1,
            next_trade_id: 1,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn order_count(&self) -> usize {
        self.index.len()
    }

    /// Admit a limit order: match against the opposite side while it crosses,
    /// then rest any remainder at its own price.
    pub fn process_limit(&mut self, mut order: Order) -> LimitResult {
        order.order_id = self.next_order_id;
        self.next_order_id += 1;
        order.order_type = OrderType::Limit;

        let limit_price = order.price;
        let trades = self.match_incoming(&mut order, Some(limit_price));

        let rested = !order.quantity.is_zero();
        if rested {
            let key = self.orders.insert(OrderNode::new(order.clone()));
            match order.side {
                Side::Bid => self.bids.insert(key, &mut self.orders),
                Side::Ask => self.asks.insert(key, &mut self.orders),
            }
            self.index.insert(order.order_id, key);
        }
        LimitResult { order, trades, rested }
    }

    /// Admit a market order: no price gate, never rests. Any quantity left
    /// when the opposite side empties is returned as `unfilled`.
    pub fn process_market(&mut self, mut order: Order) -> MarketResult {
        order.order_id = self.next_order_id;
        self.next_order_id += 1;
        order.order_type = OrderType::Market;

        let trades = self.match_incoming(&mut order, None);
        MarketResult { order_id: order.order_id, trades, unfilled: order.quantity }
    }

    fn match_incoming(&mut self, taker: &mut Order, limit: Option<Decimal>) -> Vec<TradeRecord> {
        let mut trades = Vec::new();
        loop {
            if taker.quantity.is_zero() {
                break;
            }
            let opposite = match taker.side {
                Side::Bid => &self.asks,
                Side::Ask => &self.bids,
            };
            let Some(best_price) = opposite.best_price() else { break };
            if let Some(limit_price) = limit {
                let crosses = match taker.side {
                    Side::Bid => best_price <= limit_price,
                    Side::Ask => best_price >= limit_price,
                };
                if !crosses {
                    break;
                }
            }
            let head_key = opposite
                .head_of(best_price)
                .expect("non-empty level has a head");

            let maker_quantity = self.orders[head_key].order.quantity;
            if taker.quantity < maker_quantity {
                // Partial fill of the maker; the maker stays at the head.
                let fill = taker.quantity;
                self.orders[head_key].order.quantity -= fill;
                match taker.side {
                    Side::Bid => self.asks.reduce(best_price, fill),
                    Side::Ask => self.bids.reduce(best_price, fill),
                }
                let maker = self.orders[head_key].order.clone();
                taker.quantity = Decimal::ZERO;
                trades.push(self.record_trade(best_price, fill, &maker, taker));
            } else {
                // Maker fully consumed; remove it and keep walking.
                let maker = self.remove_key(head_key);
                taker.quantity -= maker_quantity;
                trades.push(self.record_trade(best_price, maker_quantity, &maker, taker));
            }
        }
        trades
    }

    fn record_trade(
        &mut self,
        price: Decimal,
        quantity: Decimal,
        maker: &Order,
        taker: &Order,
    ) -> TradeRecord {
        let record = TradeRecord {
            trade_id: self.next_trade_id,
            symbol: self.symbol.clone(),
            timestamp: taker.timestamp,
            price,
            quantity,
            maker: TradeParty::of(maker),
            taker: TradeParty::of(taker),
        };
        self.next_trade_id += 1;
        self.tape.push_back(record.clone());
        while self.tape.len() > MAX_TAPE {
            self.tape.pop_front();
        }
        record
    }

    /// Remove an order by slab key from its level, the index, and the arena.
    fn remove_key(&mut self, key: usize) -> Order {
        let side = self.orders[key].order.side;
        match side {
            Side::Bid => self.bids.remove(key, &mut self.orders),
            Side::Ask => self.asks.remove(key, &mut self.orders),
        };
        let node = self.orders.remove(key);
        self.index.remove(&node.order.order_id);
        node.order
    }

    /// Cancel by id. Returns the removed order, or `None` if the id is not
    /// resting on this book.
    pub fn cancel(&mut self, order_id: u64) -> Option<Order> {
        let key = *self.index.get(&order_id)?;
        Some(self.remove_key(key))
    }

    pub fn get_order(&self, order_id: u64) -> Option<&Order> {
        let key = *self.index.get(&order_id)?;
        Some(&self.orders[key].order)
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.best_price()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.best_price()
    }

    /// Top-of-book `(price, level volume)` for one side.
    pub fn best_level(&self, side: Side) -> Option<(Decimal, Decimal)> {
        let tree = match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        };
        let price = tree.best_price()?;
        tree.level(price).map(|level| (price, level.volume))
    }

    /// Oldest order at the best price on one side.
    pub fn best_resting(&self, side: Side) -> Option<&Order> {
        let tree = match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        };
        let price = tree.best_price()?;
        let key = tree.head_of(price)?;
        Some(&self.orders[key].order)
    }

    /// Quote cost of filling `quantity` for a taker on `taker_side` against
    /// current depth, walking opposite levels best-first. Returns the summed
    /// `price * taken` cost and the fillable quantity, which falls short of
    /// `quantity` when the opposite side runs out of liquidity.
    pub fn sweep_cost(&self, taker_side: Side, quantity: Decimal) -> (Decimal, Decimal) {
        let tree = match taker_side {
            Side::Bid => &self.asks,
            Side::Ask => &self.bids,
        };
        let mut remaining = quantity;
        let mut cost = Decimal::ZERO;
        for (price, volume) in tree.depth(None) {
            if remaining.is_zero() {
                break;
            }
            let take = remaining.min(volume);
            cost += price * take;
            remaining -= take;
        }
        (cost, quantity - remaining)
    }

    /// Aggregated depth, bids descending and asks ascending by price.
    pub fn snapshot(&self, depth: Option<usize>) -> BookSnapshot {
        BookSnapshot { bids: self.bids.depth(depth), asks: self.asks.depth(depth) }
    }

    /// Last `limit` tape entries in chronological order.
    pub fn tape(&self, limit: usize) -> Vec<TradeRecord> {
        let skip = self.tape.len().saturating_sub(limit);
        self.tape.iter().skip(skip).cloned().collect()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        use rust_decimal::Decimal;
        for (tree, side) in [(&self.bids, Side::Bid), (&self.asks, Side::Ask)] {
            let mut volume = Decimal::ZERO;
            let mut count = 0usize;
            for (price, level_volume) in tree.depth(None) {
                let level = tree.level(price).unwrap();
                assert!(!level.is_empty(), "empty level left in tree");
                let mut walked = Decimal::ZERO;
                let mut cursor = level.head;
                while let Some(key) = cursor {
                    let node = &self.orders[key];
                    assert_eq!(node.order.side, side);
                    assert_eq!(node.order.price, price);
                    assert!(node.order.quantity > Decimal::ZERO);
                    assert_eq!(self.index.get(&node.order.order_id), Some(&key));
                    walked += node.order.quantity;
                    count += 1;
                    cursor = node.next;
                }
                assert_eq!(walked, level_volume, "level volume out of sync");
                volume += level_volume;
            }
            assert_eq!(volume, tree.volume, "aggregate volume out of sync");
        }
        if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) {
            assert!(bid < ask, "book left crossed: bid {bid} >= ask {ask}");
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    pub fn order(id: u64, side: Side, price: &str, quantity: &str) -> Order {
        Order {
            order_id: 0,
            account: Address::repeat_byte(id as u8),
            base_asset: "HBAR".into(),
            quote_asset: "USDT".into(),
            side,
            order_type: OrderType::Limit,
            price: price.parse().unwrap(),
            quantity: quantity.parse().unwrap(),
            from_network: "hedera".into(),
            to_network: "hedera".into(),
            receive_wallet: Address::repeat_byte(0x10 + id as u8),
            timestamp: 1_700_000_000_000 + id as i64,
        }
    }

    pub fn ask(id: u64, price: &str, quantity: &str) -> Order {
        order(id, Side::Ask, price, quantity)
    }

    pub fn bid(id: u64, price: &str, quantity: &str) -> Order {
        order(id, Side::Bid, price, quantity)
    }
}
