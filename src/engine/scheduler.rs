// ── Membank Engine: Consolidation Scheduler ────────────────────────────────
// One long-lived background task per process. Every tick it discovers banks
// with unconsolidated facts and runs the consolidation worker over each.
// Shutdown is cooperative: the worker checks the flag between facts, and
// `stop` wakes the sleep so shutdown never waits out an interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::atoms::error::EngineResult;
use crate::engine::consolidation::{self, ConsolidationStats};
use crate::engine::ops;

pub struct ConsolidationScheduler {
    pool: PgPool,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl ConsolidationScheduler {
    pub fn new(pool: PgPool, interval_secs: u64) -> Self {
        ConsolidationScheduler {
            pool,
            interval: Duration::from_secs(interval_secs),
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            task: None,
        }
    }

    /// Start the background task. Starting an already-running scheduler is
    /// a no-op.
    pub fn start(&mut self) {
        if let Some(task) = &self.task {
            if !task.is_finished() {
                warn!("[scheduler] Already running");
                return;
            }
        }

        self.shutdown.store(false, Ordering::Relaxed);
        let pool = self.pool.clone();
        let interval = self.interval;
        let shutdown = Arc::clone(&self.shutdown);
        let wake = Arc::clone(&self.wake);

        self.task = Some(tokio::spawn(async move {
            // First pass waits one interval; fresh processes shouldn't
            // consolidate the instant they boot.
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = wake.notified() => {}
                }
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                match run_all_banks(&pool, &shutdown).await {
                    Ok(runs) => {
                        if !runs.is_empty() {
                            info!("[scheduler] Tick consolidated {} bank(s)", runs.len());
                        }
                    }
                    Err(e) => error!("[scheduler] Consolidation tick failed: {e}"),
                }
            }
            info!("[scheduler] Stopped");
        }));

        info!("[scheduler] Started (interval={}s)", self.interval.as_secs());
    }

    /// Stop the background task and wait for it to exit cleanly.
    pub async fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake.notify_waiters();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("[scheduler] Background task ended abnormally: {e}");
            }
        }
    }

    /// Manual trigger: run one full pass over every pending bank now.
    pub async fn trigger(&self) -> EngineResult<Vec<(Uuid, ConsolidationStats)>> {
        info!("[scheduler] Manual consolidation triggered");
        let fresh = AtomicBool::new(false);
        run_all_banks(&self.pool, &fresh).await
    }
}

/// One pass: consolidate every bank with pending facts, each run tracked as
/// a durable async_operations row. A bank-level failure surfaces there with
/// status 'failed' and does not stop the other banks.
pub async fn run_all_banks(
    pool: &PgPool,
    shutdown: &AtomicBool,
) -> EngineResult<Vec<(Uuid, ConsolidationStats)>> {
    let bank_ids = consolidation::banks_with_pending_facts(pool).await?;
    let mut runs = Vec::with_capacity(bank_ids.len());

    for bank_id in bank_ids {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let operation_id =
            ops::start_operation(pool, bank_id, "consolidation_run", "scheduler", json!({}))
                .await?;

        match consolidation::consolidate_bank(pool, bank_id, shutdown).await {
            Ok(stats) => {
                ops::complete_operation(pool, operation_id, stats.to_json()).await?;
                runs.push((bank_id, stats));
            }
            Err(e) => {
                error!("[scheduler] Consolidation failed for bank {}: {e}", bank_id);
                ops::fail_operation(pool, operation_id, &e.to_string()).await;
            }
        }
    }

    Ok(runs)
}
