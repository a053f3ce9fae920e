use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::activity::ActivityLog;
use crate::chain::ChainMap;
use crate::config::AppConfig;
use crate::registry::BookRegistry;
use crate::settlement::{Orchestrator, SettlementJob, SettlementState};

pub const SETTLE_QUEUE_CAP: usize = 10_000;

pub struct PerfCounters {
    pub orders_received: AtomicU64,
    pub orders_rejected: AtomicU64,
    pub orders_cancelled: AtomicU64,
    pub trades_matched: AtomicU64,
    pub settle_dispatched: AtomicU64,
    pub settle_settled: AtomicU64,
    pub settle_refunded: AtomicU64,
    pub settle_abandoned: AtomicU64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self {
            orders_received: AtomicU64::new(0),
            orders_rejected: AtomicU64::new(0),
            orders_cancelled: AtomicU64::new(0),
            trades_matched: AtomicU64::new(0),
            settle_dispatched: AtomicU64::new(0),
            settle_settled: AtomicU64::new(0),
            settle_refunded: AtomicU64::new(0),
            settle_abandoned: AtomicU64::new(0),
        }
    }

    pub fn observe_settlement(&self, state: SettlementState) {
        match state {
            SettlementState::Settled => self.settle_settled.fetch_add(1, Ordering::Relaxed),
            SettlementState::Refunded => self.settle_refunded.fetch_add(1, Ordering::Relaxed),
            SettlementState::Abandoned => self.settle_abandoned.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::json!({
            "orders": {
                "received": self.orders_received.load(Ordering::Relaxed),
                "rejected": self.orders_rejected.load(Ordering::Relaxed),
                "cancelled": self.orders_cancelled.load(Ordering::Relaxed),
            },
            "matcher": {
                "trades": self.trades_matched.load(Ordering::Relaxed),
            },
            "settlement": {
                "dispatched": self.settle_dispatched.load(Ordering::Relaxed),
                "settled": self.settle_settled.load(Ordering::Relaxed),
                "refunded": self.settle_refunded.load(Ordering::Relaxed),
                "abandoned": self.settle_abandoned.load(Ordering::Relaxed),
            },
        })
    }
}

impl Default for PerfCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<AppConfig>,
    pub registry: Arc<BookRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub activity: Arc<ActivityLog>,
    pub settle_tx: mpsc::Sender<SettlementJob>,
    pub http: reqwest::Client,
    pub perf: Arc<PerfCounters>,
}

impl AppState {
    /// Assemble process-wide state; the returned receiver feeds the
    /// settlement worker in `tasks::start_background_tasks`.
    pub fn new(cfg: Arc<AppConfig>, chains: ChainMap) -> (Self, mpsc::Receiver<SettlementJob>) {
        let (settle_tx, settle_rx) = mpsc::channel(SETTLE_QUEUE_CAP);
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        let state = Self {
            registry: Arc::new(BookRegistry::new()),
            orchestrator: Arc::new(Orchestrator::new(cfg.clone(), chains)),
            activity: Arc::new(ActivityLog::new(cfg.activity_log_path.clone())),
            settle_tx,
            http,
            perf: Arc::new(PerfCounters::new()),
            cfg,
        };
        (state, settle_rx)
    }
}
