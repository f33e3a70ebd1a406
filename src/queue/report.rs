//! Delivery outcome aggregation.
//!
//! Workers send a [`DeliveryReport`] for every request that leaves a queue.
//! The reporter task folds them into totals, metrics and a bounded history
//! of permanent failures, and rebroadcasts them to any subscribers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::observability::metrics;
use crate::queue::delivery::{DeliveryOutcome, DeliveryReport};

/// A permanent failure kept for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub delivery_id: Uuid,
    pub webhook_id: String,
    pub attempts: u32,
    pub reason: String,
    pub failed_at_unix: u64,
}

/// Totals since startup.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DeliveryTotals {
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Debug)]
pub struct DeliveryStats {
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    recent_failures: Mutex<VecDeque<FailureRecord>>,
    history: usize,
}

impl DeliveryStats {
    pub fn new(history: usize) -> Self {
        Self {
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            recent_failures: Mutex::new(VecDeque::with_capacity(history)),
            history,
        }
    }

    pub fn totals(&self) -> DeliveryTotals {
        DeliveryTotals {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Most recent permanent failures, newest first.
    pub fn recent_failures(&self) -> Vec<FailureRecord> {
        let guard = self.recent_failures.lock().expect("failure history mutex poisoned");
        guard.iter().rev().cloned().collect()
    }

    fn record(&self, report: &DeliveryReport) {
        match &report.outcome {
            DeliveryOutcome::Delivered { .. } => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            DeliveryOutcome::Dropped => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            DeliveryOutcome::Failed(reason) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                if self.history == 0 {
                    return;
                }
                let record = FailureRecord {
                    delivery_id: report.delivery_id,
                    webhook_id: report.webhook_id.clone(),
                    attempts: report.attempts,
                    reason: reason.to_string(),
                    failed_at_unix: report
                        .finished_at
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs(),
                };
                let mut guard = self.recent_failures.lock().expect("failure history mutex poisoned");
                if guard.len() == self.history {
                    guard.pop_front();
                }
                guard.push_back(record);
            }
        }
    }
}

/// Consume worker reports until every sender is gone.
pub(crate) async fn run_reporter(
    mut rx: mpsc::UnboundedReceiver<DeliveryReport>,
    stats: Arc<DeliveryStats>,
    subscribers: broadcast::Sender<DeliveryReport>,
) {
    while let Some(report) = rx.recv().await {
        stats.record(&report);
        metrics::record_delivery(report.outcome.label(), report.attempts, report.latency);
        let _ = subscribers.send(report);
    }
}
