use axum::{extract::State, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::queue::{DeliveryTotals, FailureRecord, QueueSnapshot};

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub active_queues: usize,
    pub total_backlog: usize,
    pub tracked_buckets: usize,
    pub global_limit_active: bool,
    pub deliveries: DeliveryTotals,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let status = if state.queues.is_closing() {
        "draining"
    } else {
        "operational"
    };

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status,
        uptime_secs: state.started_at.elapsed().as_secs(),
        active_queues: state.queues.active_queues(),
        total_backlog: state.queues.total_backlog(),
        tracked_buckets: state.tracker.bucket_count(),
        global_limit_active: state.tracker.global_resume_at().is_some(),
        deliveries: state.queues.stats().totals(),
    })
}

/// Live queues, deepest first. Only webhook ids are exposed.
pub async fn get_queues(State(state): State<AdminState>) -> Json<Vec<QueueSnapshot>> {
    Json(state.queues.snapshot())
}

/// Most recent permanent failures, newest first.
pub async fn get_failures(State(state): State<AdminState>) -> Json<Vec<FailureRecord>> {
    Json(state.queues.stats().recent_failures())
}
