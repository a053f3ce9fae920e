//! Cross-chain spot exchange core.
//!
//! The crate splits into two halves that share one set of invariants:
//!
//! - an in-memory, price-time-priority limit order book per symbol and venue
//!   ([`book`], [`registry`]), and
//! - an escrow-backed settlement orchestrator that drives every matched trade
//!   to a terminal state on one or two EVM chains ([`settlement`], [`chain`]).
//!
//! The HTTP surface lives in the binary (`main.rs`); everything it calls is
//! exposed here so the settlement flow can be exercised end-to-end in tests.

pub mod activity;
pub mod book;
pub mod chain;
pub mod config;
pub mod error;
pub mod escrow;
pub mod pricing;
pub mod registry;
pub mod settlement;
pub mod state;
pub mod tasks;

pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
