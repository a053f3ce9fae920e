//! Per-symbol book lookup, split by venue.
//!
//! Every symbol owns two independent books: one for orders settling on a
//! single chain and one for cross-chain orders. Books are created lazily on
//! first use; each book is guarded by its own lock and the registry itself is
//! a concurrent map, so cross-book operations never hold two book locks.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::book::Book;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    SameChain,
    CrossChain,
}

impl Venue {
    /// Admission routes by the order's networks: equal networks settle on one
    /// chain, unequal networks go to the cross-chain book.
    pub fn of(from_network: &str, to_network: &str) -> Venue {
        if from_network == to_network {
            Venue::SameChain
        } else {
            Venue::CrossChain
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Venue::SameChain => "same_chain",
            Venue::CrossChain => "cross_chain",
        }
    }
}

#[derive(Debug)]
pub struct SymbolBooks {
    pub same_chain: Mutex<Book>,
    pub cross_chain: Mutex<Book>,
}

impl SymbolBooks {
    fn new(symbol: &str) -> Self {
        Self {
            same_chain: Mutex::new(Book::new(symbol)),
            cross_chain: Mutex::new(Book::new(symbol)),
        }
    }

    pub fn venue(&self, venue: Venue) -> &Mutex<Book> {
        match venue {
            Venue::SameChain => &self.same_chain,
            Venue::CrossChain => &self.cross_chain,
        }
    }
}

#[derive(Debug, Default)]
pub struct BookRegistry {
    books: DashMap<String, Arc<SymbolBooks>>,
}

impl BookRegistry {
    pub fn new() -> Self {
        Self { books: DashMap::new() }
    }

    pub fn get_or_create(&self, symbol: &str) -> Arc<SymbolBooks> {
        self.books
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(SymbolBooks::new(symbol)))
            .clone()
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<SymbolBooks>> {
        self.books.get(symbol).map(|entry| entry.clone())
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self.books.iter().map(|e| e.key().clone()).collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_routing() {
        assert_eq!(Venue::of("hedera", "hedera"), Venue::SameChain);
        assert_eq!(Venue::of("hedera", "polygon"), Venue::CrossChain);
    }

    #[tokio::test]
    async fn books_are_created_once_per_symbol() {
        let registry = BookRegistry::new();
        let first = registry.get_or_create("HBAR_USDT");
        let second = registry.get_or_create("HBAR_USDT");
        assert!(Arc::ptr_eq(&first, &second));

        // The two venues are distinct books with independent id counters.
        let same = first.same_chain.lock().await;
        let cross = first.cross_chain.lock().await;
        assert_eq!(same.symbol(), cross.symbol());
        assert_eq!(registry.symbols(), vec!["HBAR_USDT".to_string()]);
    }
}
