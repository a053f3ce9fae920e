//! Background workers: the settlement driver and record upkeep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::{mpsc, Semaphore};

use crate::settlement::SettlementJob;
use crate::state::AppState;

const SETTLE_SLOW_WARN_MS: u128 = 30_000;
const RECORD_PRUNE_INTERVAL_SECS: u64 = 60;
const RECORD_TTL_MS: i64 = 3_600_000;

pub fn start_background_tasks(state: AppState, mut settle_rx: mpsc::Receiver<SettlementJob>) {
    // 1) Settlement worker. Jobs fan out up to the configured concurrency;
    //    legs inside one job already run in parallel where possible, and the
    //    chain clients serialize per order id.
    let s_settle = state.clone();
    tokio::spawn(async move {
        let slots = Arc::new(Semaphore::new(s_settle.cfg.settle.max_concurrent.max(1)));
        while let Some(job) = settle_rx.recv().await {
            let Ok(permit) = slots.clone().acquire_owned().await else {
                break;
            };
            let s_job = s_settle.clone();
            tokio::spawn(async move {
                let order_id = job.trade.taker.order_id;
                let started = Instant::now();
                let final_state = s_job.orchestrator.settle(job).await;
                s_job.perf.observe_settlement(final_state);
                let elapsed_ms = started.elapsed().as_millis();
                if elapsed_ms >= SETTLE_SLOW_WARN_MS {
                    warn!(
                        "[settle] slow_settlement order_id={} state={:?} elapsed_ms={}",
                        order_id, final_state, elapsed_ms
                    );
                }
                drop(permit);
            });
        }
        info!("[settle] worker_stopped");
    });

    // 2) Terminal settlement records are kept for an hour for inspection,
    //    then dropped.
    let s_prune = state;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(RECORD_PRUNE_INTERVAL_SECS)).await;
            let pruned = s_prune.orchestrator.prune_terminal(RECORD_TTL_MS);
            if pruned > 0 {
                info!("[settle] records_pruned count={pruned}");
            }
        }
    });
}
