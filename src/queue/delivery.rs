//! Delivery requests and their terminal outcomes.

use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use axum::body::Bytes;
use axum::http::HeaderValue;
use tokio::time::Instant;
use uuid::Uuid;

use crate::resilience::FailureReason;
use crate::routing::webhook::WebhookTarget;
use crate::upstream::UpstreamRequest;

/// One accepted submission waiting in a webhook's queue.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub id: Uuid,
    pub target: WebhookTarget,
    pub payload: Bytes,
    pub content_type: Option<HeaderValue>,
    pub enqueued_at: Instant,
    pub source: IpAddr,
    /// Upstream calls made so far. Only the worker changes this.
    pub attempts: u32,
}

impl DeliveryRequest {
    pub fn new(
        target: WebhookTarget,
        payload: Bytes,
        content_type: Option<HeaderValue>,
        source: IpAddr,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            payload,
            content_type,
            enqueued_at: Instant::now(),
            source,
            attempts: 0,
        }
    }

    /// Upstream call for the next attempt. The payload is shared, not copied.
    pub fn to_upstream(&self) -> UpstreamRequest {
        UpstreamRequest {
            target: self.target.clone(),
            content_type: self.content_type.clone(),
            body: self.payload.clone(),
        }
    }
}

/// Terminal outcome of a queued delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Upstream accepted the payload.
    Delivered { status: u16 },
    /// Permanent failure.
    Failed(FailureReason),
    /// Discarded unsent (or between retries) during shutdown.
    Dropped,
}

impl DeliveryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered { .. } => "delivered",
            DeliveryOutcome::Failed(_) => "failed",
            DeliveryOutcome::Dropped => "dropped",
        }
    }
}

/// Sent by a worker for every request that leaves its queue.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub delivery_id: Uuid,
    pub webhook_id: String,
    pub attempts: u32,
    pub outcome: DeliveryOutcome,
    /// Time from acceptance to terminal outcome.
    pub latency: Duration,
    pub finished_at: SystemTime,
}

impl DeliveryReport {
    pub fn new(request: &DeliveryRequest, outcome: DeliveryOutcome) -> Self {
        Self {
            delivery_id: request.id,
            webhook_id: request.target.key.id().to_string(),
            attempts: request.attempts,
            outcome,
            latency: request.enqueued_at.elapsed(),
            finished_at: SystemTime::now(),
        }
    }
}
