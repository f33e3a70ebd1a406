//! Sequential per-webhook delivery worker.
//!
//! Each queue owns exactly one worker. It takes the head request, waits for
//! the bucket (and any global limit) to clear, calls the upstream, records
//! the response in the tracker, and either finishes the request or
//! schedules a retry. The next request is not started until the current
//! one is terminal, which gives strict FIFO attempt order per webhook.
//!
//! ```text
//! Pending ──acquire bucket, wait reset──▶ InFlight ──classify──┬─▶ Done(Delivered)
//!    ▲                                                         ├─▶ Done(Failed)
//!    └──────────── timer ◀──────────── Retrying{until} ◀───────┘
//! shutdown while Pending/Retrying ─▶ Done(Dropped)
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::lifecycle::{ShutdownSignal, TaskGuard};
use crate::observability::metrics;
use crate::queue::delivery::{DeliveryOutcome, DeliveryReport, DeliveryRequest};
use crate::ratelimit::{BucketPermit, RateLimitTracker};
use crate::resilience::timeouts::{deadline_after, with_deadline};
use crate::resilience::{RetryBudget, RetryPolicy, Verdict};
use crate::routing::webhook::WebhookKey;
use crate::upstream::Upstream;

/// Shared, read-only context for all workers.
pub(crate) struct WorkerContext {
    pub upstream: Arc<dyn Upstream>,
    pub tracker: Arc<RateLimitTracker>,
    pub policy: RetryPolicy,
    pub upstream_timeout: Duration,
    pub idle_timeout: Duration,
    /// Outcomes flow to the manager's reporter through this channel.
    pub reports: mpsc::UnboundedSender<DeliveryReport>,
}

/// Registry entry for one live queue.
pub(crate) struct QueueHandle {
    pub tx: mpsc::UnboundedSender<DeliveryRequest>,
    /// Undelivered requests, including the one in flight.
    pub depth: Arc<AtomicUsize>,
}

pub(crate) type Registry = DashMap<WebhookKey, QueueHandle>;

/// Per-request delivery state.
enum DeliveryState {
    Pending,
    Retrying { until: Instant },
    Done(DeliveryOutcome),
}

enum Wake {
    Request(Option<DeliveryRequest>),
    Idle,
    Shutdown,
}

pub(crate) struct QueueWorker {
    key: WebhookKey,
    rx: mpsc::UnboundedReceiver<DeliveryRequest>,
    depth: Arc<AtomicUsize>,
    ctx: Arc<WorkerContext>,
    registry: Arc<Registry>,
    shutdown: ShutdownSignal,
    _guard: TaskGuard,
}

impl QueueWorker {
    pub fn new(
        key: WebhookKey,
        rx: mpsc::UnboundedReceiver<DeliveryRequest>,
        depth: Arc<AtomicUsize>,
        ctx: Arc<WorkerContext>,
        registry: Arc<Registry>,
        shutdown: ShutdownSignal,
        guard: TaskGuard,
    ) -> Self {
        Self {
            key,
            rx,
            depth,
            ctx,
            registry,
            shutdown,
            _guard: guard,
        }
    }

    pub async fn run(mut self) {
        tracing::debug!(webhook = %self.key, "Queue worker started");
        metrics::queue_opened();

        loop {
            let wake = tokio::select! {
                biased;
                _ = self.shutdown.recv() => Wake::Shutdown,
                next = self.rx.recv() => Wake::Request(next),
                _ = tokio::time::sleep(self.ctx.idle_timeout) => Wake::Idle,
            };

            match wake {
                Wake::Request(Some(request)) => self.deliver(request).await,
                Wake::Request(None) => break,
                Wake::Idle => {
                    if self.try_evict() {
                        tracing::debug!(webhook = %self.key, "Idle queue evicted");
                        break;
                    }
                }
                Wake::Shutdown => {
                    self.discard_backlog();
                    break;
                }
            }
        }

        metrics::queue_closed();
    }

    /// Remove this queue from the registry if its backlog is empty.
    ///
    /// Enqueue reserves depth while holding the registry entry, so a zero
    /// depth observed here means nothing is in flight towards this worker.
    fn try_evict(&self) -> bool {
        let depth = &self.depth;
        let removed = self
            .registry
            .remove_if(&self.key, |_, handle| {
                Arc::ptr_eq(&handle.depth, depth) && depth.load(Ordering::SeqCst) == 0
            })
            .is_some();
        if removed {
            return true;
        }
        // Not ours any more (replaced or cleared): nothing can reach us.
        !self
            .registry
            .get(&self.key)
            .map_or(false, |handle| Arc::ptr_eq(&handle.depth, depth))
    }

    fn discard_backlog(&mut self) {
        self.rx.close();
        let depth = &self.depth;
        self.registry
            .remove_if(&self.key, |_, handle| Arc::ptr_eq(&handle.depth, depth));

        let mut discarded = 0;
        while let Ok(request) = self.rx.try_recv() {
            discarded += 1;
            self.finish(&request, DeliveryOutcome::Dropped);
        }
        if discarded > 0 {
            tracing::warn!(
                webhook = %self.key,
                discarded,
                "Discarded unsent deliveries during shutdown"
            );
        }
    }

    /// Drive one request to a terminal outcome.
    async fn deliver(&mut self, mut request: DeliveryRequest) {
        let route = request.target.key.route_key();
        let mut budget = RetryBudget::default();
        let mut state = DeliveryState::Pending;

        let outcome = loop {
            state = match state {
                DeliveryState::Pending => match self.wait_for_bucket(&route).await {
                    Some(permit) => self.attempt(&mut request, &route, permit, &mut budget).await,
                    None => DeliveryState::Done(DeliveryOutcome::Dropped),
                },
                DeliveryState::Retrying { until } => {
                    if self.pause_until(until).await {
                        DeliveryState::Pending
                    } else {
                        DeliveryState::Done(DeliveryOutcome::Dropped)
                    }
                }
                DeliveryState::Done(outcome) => break outcome,
            };
        };

        self.finish(&request, outcome);
    }

    /// Acquire the bucket and sleep through any active limit.
    /// Returns `None` if shutdown interrupts the wait.
    async fn wait_for_bucket(&mut self, route: &str) -> Option<BucketPermit> {
        let tracker = Arc::clone(&self.ctx.tracker);
        let permit = tokio::select! {
            permit = tracker.acquire(route) => permit,
            _ = self.shutdown.recv() => return None,
        };

        while let Some(until) = tracker.next_available_at(permit.bucket()) {
            tracing::debug!(
                webhook = %self.key,
                bucket = %permit.bucket(),
                wait = ?until.saturating_duration_since(Instant::now()),
                "Waiting for rate limit reset"
            );
            if !self.pause_until(until).await {
                return None;
            }
        }
        Some(permit)
    }

    /// One upstream call while holding the bucket permit.
    async fn attempt(
        &mut self,
        request: &mut DeliveryRequest,
        route: &str,
        permit: BucketPermit,
        budget: &mut RetryBudget,
    ) -> DeliveryState {
        request.attempts += 1;
        let started = std::time::Instant::now();

        let result = with_deadline(
            self.ctx.upstream_timeout,
            self.ctx.upstream.execute(request.to_upstream()),
        )
        .await;

        if let Ok(response) = &result {
            self.ctx.tracker.record_response(route, response);
        }
        drop(permit);

        let status = result.as_ref().map(|r| r.status.as_u16()).unwrap_or(0);
        metrics::record_upstream_attempt("queued", status, started);

        match self.ctx.policy.classify(&result, *budget) {
            Verdict::Success => DeliveryState::Done(DeliveryOutcome::Delivered { status }),
            Verdict::PermanentFailure(reason) => DeliveryState::Done(DeliveryOutcome::Failed(reason)),
            Verdict::Retry { delay, cause } => {
                budget.charge(&cause);
                tracing::info!(
                    webhook = %self.key,
                    delivery_id = %request.id,
                    attempt = request.attempts,
                    delay = ?delay,
                    cause = ?cause,
                    "Retrying delivery"
                );
                DeliveryState::Retrying {
                    until: deadline_after(Instant::now(), delay),
                }
            }
        }
    }

    /// Sleep until `until`; false if shutdown came first.
    async fn pause_until(&mut self, until: Instant) -> bool {
        tokio::select! {
            _ = tokio::time::sleep_until(until) => true,
            _ = self.shutdown.recv() => false,
        }
    }

    fn finish(&self, request: &DeliveryRequest, outcome: DeliveryOutcome) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
        metrics::backlog_changed(-1.0);

        match &outcome {
            DeliveryOutcome::Delivered { status } => tracing::info!(
                webhook = %self.key,
                delivery_id = %request.id,
                attempts = request.attempts,
                status,
                "Delivered"
            ),
            DeliveryOutcome::Failed(reason) => tracing::error!(
                webhook = %self.key,
                delivery_id = %request.id,
                attempts = request.attempts,
                reason = %reason,
                "Delivery failed permanently"
            ),
            DeliveryOutcome::Dropped => tracing::warn!(
                webhook = %self.key,
                delivery_id = %request.id,
                attempts = request.attempts,
                "Delivery dropped during shutdown"
            ),
        }

        let _ = self.ctx.reports.send(DeliveryReport::new(request, outcome));
    }
}
