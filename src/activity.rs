//! Append-only activity tape: order placements, cancellations and executed
//! trades, mirrored to a bounded in-memory deque and a JSONL file. The file
//! is the only state that survives a restart.

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use log::error;
use serde_json::Value;

use crate::book::TradeRecord;
use crate::registry::Venue;

const MEMORY_CAP: usize = 1_000;

#[derive(Debug)]
pub struct ActivityLog {
    entries: Mutex<VecDeque<Value>>,
    path: PathBuf,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { entries: Mutex::new(VecDeque::new()), path: path.into() }
    }

    pub fn record(&self, entry: Value) {
        {
            let mut entries = self.entries.lock().expect("activity log poisoned");
            entries.push_back(entry.clone());
            while entries.len() > MEMORY_CAP {
                entries.pop_front();
            }
        }
        if let Err(e) = self.append_file(&entry) {
            error!("[activity] file_append_failed path={:?} error={}", self.path, e);
        }
    }

    fn append_file(&self, entry: &Value) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{entry}")
    }

    /// Replay the file and return the last `limit` entries, optionally
    /// filtered by symbol and venue. Unreadable lines are skipped.
    pub fn history(&self, symbol: Option<&str>, venue: Option<Venue>, limit: usize) -> Vec<Value> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        let mut items: Vec<Value> = raw
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() {
                    return None;
                }
                serde_json::from_str::<Value>(line).ok()
            })
            .filter(|entry| {
                matches!(
                    entry.get("type").and_then(Value::as_str),
                    Some("order_placed" | "order_cancelled" | "trade_executed")
                )
            })
            .filter(|entry| {
                symbol.is_none_or(|s| entry.get("symbol").and_then(Value::as_str) == Some(s))
            })
            .filter(|entry| {
                venue.is_none_or(|v| entry.get("venue").and_then(Value::as_str) == Some(v.as_str()))
            })
            .collect();
        if limit > 0 && items.len() > limit {
            items.drain(..items.len() - limit);
        }
        items
    }
}

pub fn order_placed(
    symbol: &str,
    venue: Venue,
    order_id: u64,
    account: &str,
    side: &str,
    price: &str,
    quantity: &str,
    timestamp: i64,
) -> Value {
    serde_json::json!({
        "type": "order_placed",
        "symbol": symbol,
        "venue": venue.as_str(),
        "orderId": order_id,
        "account": account,
        "side": side,
        "price": price,
        "quantity": quantity,
        "timestamp": timestamp,
    })
}

pub fn order_cancelled(symbol: &str, venue: Venue, order_id: u64, side: &str, timestamp: i64) -> Value {
    serde_json::json!({
        "type": "order_cancelled",
        "symbol": symbol,
        "venue": venue.as_str(),
        "orderId": order_id,
        "side": side,
        "timestamp": timestamp,
    })
}

pub fn trade_executed(trade: &TradeRecord, venue: Venue) -> Value {
    serde_json::json!({
        "type": "trade_executed",
        "symbol": trade.symbol,
        "venue": venue.as_str(),
        "tradeId": trade.trade_id,
        "price": trade.price.to_string(),
        "quantity": trade.quantity.to_string(),
        "makerOrderId": trade.maker.order_id,
        "takerOrderId": trade.taker.order_id,
        "timestamp": trade.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_filters_by_symbol_and_venue() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActivityLog::new(dir.path().join("activity.jsonl"));

        log.record(order_placed("HBAR_USDT", Venue::SameChain, 1, "0xa", "ask", "1", "10", 1));
        log.record(order_placed("HBAR_USDT", Venue::CrossChain, 2, "0xb", "bid", "1", "10", 2));
        log.record(order_placed("ETH_USDT", Venue::SameChain, 3, "0xc", "bid", "1", "10", 3));
        // Non-activity entries are ignored on read.
        log.record(serde_json::json!({"type": "noise"}));

        let all = log.history(None, None, 100);
        assert_eq!(all.len(), 3);
        let hbar_same = log.history(Some("HBAR_USDT"), Some(Venue::SameChain), 100);
        assert_eq!(hbar_same.len(), 1);
        assert_eq!(hbar_same[0]["orderId"], 1);
        let cross = log.history(None, Some(Venue::CrossChain), 100);
        assert_eq!(cross.len(), 1);
        assert_eq!(cross[0]["orderId"], 2);
    }

    #[test]
    fn history_returns_last_n() {
        let dir = tempfile::tempdir().unwrap();
        let log = ActivityLog::new(dir.path().join("activity.jsonl"));
        for id in 1..=10u64 {
            log.record(order_placed("HBAR_USDT", Venue::SameChain, id, "0xa", "ask", "1", "1", id as i64));
        }
        let tail = log.history(None, None, 3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0]["orderId"], 8);
        assert_eq!(tail[2]["orderId"], 10);
    }

    #[test]
    fn missing_file_yields_empty_history() {
        let log = ActivityLog::new("/nonexistent/path/activity.jsonl");
        assert!(log.history(None, None, 10).is_empty());
    }
}
