//! Queue registry and enqueue admission.
//!
//! # Responsibilities
//! - Create a queue and its worker on the first submission for a webhook
//! - Enforce the per-webhook backlog ceiling
//! - Stop admission and drain workers on shutdown
//!
//! # Design Decisions
//! - Enqueue never waits on delivery; it returns the backlog position
//! - Depth is reserved and the request sent while the registry entry is
//!   held, which serializes enqueue against idle eviction
//! - The ceiling is read from the live (hot-reloadable) limits on each call

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::config::{LimitsConfig, ProxyConfig};
use crate::error::ProxyError;
use crate::lifecycle::{Shutdown, TaskTracker};
use crate::observability::metrics;
use crate::queue::delivery::{DeliveryReport, DeliveryRequest};
use crate::queue::report::{run_reporter, DeliveryStats};
use crate::queue::worker::{QueueHandle, QueueWorker, Registry, WorkerContext};
use crate::ratelimit::RateLimitTracker;
use crate::resilience::RetryPolicy;
use crate::routing::webhook::WebhookKey;
use crate::upstream::Upstream;

/// Queue behaviour fixed at startup.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub policy: RetryPolicy,
    pub upstream_timeout: Duration,
    pub idle_timeout: Duration,
    pub failure_history: usize,
}

impl QueueSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            policy: RetryPolicy::from_config(&config.queue),
            upstream_timeout: Duration::from_secs(config.upstream.timeout_secs),
            idle_timeout: Duration::from_secs(config.queue.idle_timeout_secs),
            failure_history: config.queue.failure_history,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

/// Backlog of one live queue, for the admin API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub webhook_id: String,
    pub depth: usize,
}

/// Owner of every per-webhook queue.
pub struct QueueManager {
    registry: Arc<Registry>,
    ctx: Arc<WorkerContext>,
    limits: Arc<ArcSwap<LimitsConfig>>,
    shutdown: Shutdown,
    workers: TaskTracker,
    closing: AtomicBool,
    stats: Arc<DeliveryStats>,
    subscribers: broadcast::Sender<DeliveryReport>,
}

impl QueueManager {
    /// Create the manager and spawn its reporter. Must run inside a Tokio
    /// runtime.
    pub fn new(
        settings: QueueSettings,
        upstream: Arc<dyn Upstream>,
        tracker: Arc<RateLimitTracker>,
        limits: Arc<ArcSwap<LimitsConfig>>,
    ) -> Self {
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (subscribers, _) = broadcast::channel(256);
        let stats = Arc::new(DeliveryStats::new(settings.failure_history));

        tokio::spawn(run_reporter(report_rx, stats.clone(), subscribers.clone()));

        let ctx = Arc::new(WorkerContext {
            upstream,
            tracker,
            policy: settings.policy,
            upstream_timeout: settings.upstream_timeout,
            idle_timeout: settings.idle_timeout,
            reports: report_tx,
        });

        Self {
            registry: Arc::new(Registry::new()),
            ctx,
            limits,
            shutdown: Shutdown::new(),
            workers: TaskTracker::new(),
            closing: AtomicBool::new(false),
            stats,
            subscribers,
        }
    }

    /// Append a request to its webhook's queue.
    ///
    /// Returns the 1-based backlog position (1 = next to be sent).
    pub fn enqueue(&self, request: DeliveryRequest) -> Result<usize, ProxyError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ProxyError::ShuttingDown);
        }

        let limit = self.limits.load().max_backlog;
        let key = request.target.key.clone();
        let mut handle = self
            .registry
            .entry(key.clone())
            .or_insert_with(|| self.spawn_queue(&key));

        // A worker only leaves a closed handle behind if it stopped without
        // being evicted.
        if handle.tx.is_closed() {
            if self.is_closing() {
                return Err(ProxyError::ShuttingDown);
            }
            let stranded = handle.depth.load(Ordering::SeqCst);
            tracing::error!(webhook = %key, stranded, "Queue worker stopped unexpectedly, restarting");
            metrics::backlog_changed(-(stranded as f64));
            metrics::queue_closed();
            *handle = self.spawn_queue(&key);
        }

        let reserved = handle
            .depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
                (depth < limit).then_some(depth + 1)
            });
        let position = match reserved {
            Ok(previous) => previous + 1,
            Err(_) => {
                drop(handle);
                tracing::warn!(webhook = %key, limit, "Queue full, rejecting submission");
                metrics::record_enqueue_rejected("queue_full");
                return Err(ProxyError::QueueFull { limit });
            }
        };

        if handle.tx.send(request).is_err() {
            // Worker already drained for shutdown.
            handle.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(ProxyError::ShuttingDown);
        }
        drop(handle);

        metrics::backlog_changed(1.0);
        tracing::debug!(webhook = %key, position, "Delivery queued");
        Ok(position)
    }

    /// Called with the registry entry locked.
    fn spawn_queue(&self, key: &WebhookKey) -> QueueHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let worker = QueueWorker::new(
            key.clone(),
            rx,
            depth.clone(),
            self.ctx.clone(),
            self.registry.clone(),
            self.shutdown.subscribe(),
            self.workers.track(),
        );
        tokio::spawn(worker.run());
        QueueHandle { tx, depth }
    }

    /// Undelivered requests for a webhook (0 if it has no queue).
    pub fn depth(&self, key: &WebhookKey) -> usize {
        self.registry
            .get(key)
            .map_or(0, |handle| handle.depth.load(Ordering::SeqCst))
    }

    pub fn active_queues(&self) -> usize {
        self.registry.len()
    }

    pub fn total_backlog(&self) -> usize {
        self.registry
            .iter()
            .map(|entry| entry.depth.load(Ordering::SeqCst))
            .sum()
    }

    pub fn snapshot(&self) -> Vec<QueueSnapshot> {
        let mut queues: Vec<_> = self
            .registry
            .iter()
            .map(|entry| QueueSnapshot {
                webhook_id: entry.key().id().to_string(),
                depth: entry.depth.load(Ordering::SeqCst),
            })
            .collect();
        queues.sort_by(|a, b| b.depth.cmp(&a.depth));
        queues
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    /// Receive every delivery report from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryReport> {
        self.subscribers.subscribe()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Stop accepting, let in-flight sends finish, drop unsent requests.
    ///
    /// Returns false if workers were still running when `grace` expired.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.closing.store(true, Ordering::SeqCst);
        self.shutdown.trigger();

        tracing::info!(
            active_queues = self.active_queues(),
            backlog = self.total_backlog(),
            "Draining delivery queues"
        );

        let drained = self.workers.wait_idle(grace).await;
        if drained {
            tracing::info!("All queue workers stopped");
        } else {
            tracing::warn!(
                remaining = self.workers.active_count(),
                "Queue workers still running after shutdown grace period"
            );
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::delivery::DeliveryOutcome;
    use crate::ratelimit::headers::MAX_WAIT;
    use crate::resilience::FailureReason;
    use crate::routing::webhook::WebhookTarget;
    use crate::upstream::{UpstreamError, UpstreamRequest, UpstreamResponse};
    use axum::body::Bytes;
    use axum::http::{HeaderMap, HeaderValue, StatusCode};
    use futures_util::future::BoxFuture;
    use std::collections::VecDeque;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct Step {
        delay: Duration,
        reply: Result<UpstreamResponse, UpstreamError>,
    }

    /// Upstream that replays a script, then answers 204.
    #[derive(Default)]
    struct Scripted {
        script: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<(Instant, String)>>,
    }

    impl Scripted {
        fn push(&self, delay: Duration, reply: Result<UpstreamResponse, UpstreamError>) {
            self.script.lock().unwrap().push_back(Step { delay, reply });
        }

        fn reply(&self, status: u16, headers: &[(&'static str, &'static str)]) {
            let mut map = HeaderMap::new();
            for (name, value) in headers {
                map.insert(*name, HeaderValue::from_static(value));
            }
            self.push(
                Duration::ZERO,
                Ok(UpstreamResponse::new(StatusCode::from_u16(status).unwrap(), map, "")),
            );
        }

        fn calls(&self) -> Vec<(Instant, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Upstream for Scripted {
        fn execute(
            &self,
            request: UpstreamRequest,
        ) -> BoxFuture<'_, Result<UpstreamResponse, UpstreamError>> {
            let body = String::from_utf8_lossy(&request.body).into_owned();
            self.calls.lock().unwrap().push((Instant::now(), body));
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Step {
                delay: Duration::ZERO,
                reply: Ok(UpstreamResponse::new(StatusCode::NO_CONTENT, HeaderMap::new(), "")),
            });
            Box::pin(async move {
                tokio::time::sleep(step.delay).await;
                step.reply
            })
        }
    }

    fn manager(upstream: Arc<dyn Upstream>) -> QueueManager {
        let limits = Arc::new(ArcSwap::from_pointee(LimitsConfig::default()));
        QueueManager::new(
            QueueSettings::default(),
            upstream,
            Arc::new(RateLimitTracker::new()),
            limits,
        )
    }

    fn request(id: &str, body: &str) -> DeliveryRequest {
        let target = WebhookTarget {
            key: WebhookKey::parse(id, "token").unwrap(),
            version: None,
            query: None,
        };
        DeliveryRequest::new(
            target,
            Bytes::from(body.to_string()),
            Some(HeaderValue::from_static("application/json")),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        )
    }

    async fn next_report(rx: &mut broadcast::Receiver<DeliveryReport>) -> DeliveryReport {
        tokio::time::timeout(Duration::from_secs(600), rx.recv())
            .await
            .expect("no report within ten minutes")
            .expect("report channel closed")
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_submission_order() {
        let upstream = Arc::new(Scripted::default());
        let manager = manager(upstream.clone());
        let mut reports = manager.subscribe();

        for (i, body) in ["one", "two", "three"].into_iter().enumerate() {
            assert_eq!(manager.enqueue(request("1", body)).unwrap(), i + 1);
        }
        for _ in 0..3 {
            assert_eq!(
                next_report(&mut reports).await.outcome,
                DeliveryOutcome::Delivered { status: 204 }
            );
        }

        let bodies: Vec<_> = upstream.calls().into_iter().map(|(_, b)| b).collect();
        assert_eq!(bodies, ["one", "two", "three"]);
        assert_eq!(manager.depth(&WebhookKey::parse("1", "token").unwrap()), 0);
        assert_eq!(manager.stats().totals().delivered, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_beyond_backlog_ceiling() {
        let upstream = Arc::new(Scripted::default());
        upstream.push(
            Duration::from_secs(5),
            Ok(UpstreamResponse::new(StatusCode::NO_CONTENT, HeaderMap::new(), "")),
        );
        let manager = manager(upstream.clone());

        for expected in 1..=50 {
            assert_eq!(manager.enqueue(request("2", "x")).unwrap(), expected);
        }
        let err = manager.enqueue(request("2", "x")).unwrap_err();
        assert!(matches!(err, ProxyError::QueueFull { limit: 50 }));
        assert_eq!(err.code(), "queue_full");

        // Other webhooks are unaffected.
        assert_eq!(manager.enqueue(request("3", "y")).unwrap(), 1);
        assert_eq!(manager.active_queues(), 2);
        assert_eq!(manager.total_backlog(), 51);
    }

    #[tokio::test(start_paused = true)]
    async fn client_error_is_attempted_once() {
        let upstream = Arc::new(Scripted::default());
        upstream.reply(404, &[]);
        let manager = manager(upstream.clone());
        let mut reports = manager.subscribe();

        manager.enqueue(request("4", "gone")).unwrap();
        let report = next_report(&mut reports).await;

        assert_eq!(report.attempts, 1);
        assert_eq!(
            report.outcome,
            DeliveryOutcome::Failed(FailureReason::Rejected { status: 404 })
        );
        assert_eq!(upstream.calls().len(), 1);
        assert_eq!(manager.stats().recent_failures().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_retried() {
        let upstream = Arc::new(Scripted::default());
        upstream.push(
            Duration::from_secs(20),
            Ok(UpstreamResponse::new(StatusCode::NO_CONTENT, HeaderMap::new(), "")),
        );
        let manager = manager(upstream.clone());
        let mut reports = manager.subscribe();

        manager.enqueue(request("5", "slow")).unwrap();
        let report = next_report(&mut reports).await;

        assert_eq!(report.outcome, DeliveryOutcome::Delivered { status: 204 });
        assert_eq!(report.attempts, 2);
        let calls = upstream.calls();
        // 10s deadline plus at least the 1s base backoff.
        assert!(calls[1].0 - calls[0].0 >= Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_attempt_waits_retry_after() {
        let upstream = Arc::new(Scripted::default());
        upstream.reply(429, &[("retry-after", "2")]);
        let manager = manager(upstream.clone());
        let mut reports = manager.subscribe();

        manager.enqueue(request("6", "limited")).unwrap();
        let report = next_report(&mut reports).await;

        assert_eq!(report.outcome, DeliveryOutcome::Delivered { status: 204 });
        assert_eq!(report.attempts, 2);
        let calls = upstream.calls();
        assert!(calls[1].0 - calls[0].0 >= Duration::from_secs(2));
    }

    const EXHAUSTED: [(&str, &str); 4] = [
        ("x-ratelimit-limit", "1"),
        ("x-ratelimit-remaining", "0"),
        ("x-ratelimit-reset-after", "1"),
        ("x-ratelimit-bucket", "shared"),
    ];

    fn call_at(calls: &[(Instant, String)], body: &str) -> Instant {
        calls
            .iter()
            .find(|(_, b)| b == body)
            .map(|(at, _)| *at)
            .unwrap_or_else(|| panic!("no call with body {body:?}"))
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_delays_each_following_request() {
        let upstream = Arc::new(Scripted::default());
        for _ in 0..3 {
            upstream.reply(204, &EXHAUSTED);
        }
        let manager = manager(upstream.clone());
        let mut reports = manager.subscribe();

        for body in ["a", "b", "c"] {
            manager.enqueue(request("7", body)).unwrap();
        }
        for _ in 0..3 {
            next_report(&mut reports).await;
        }

        let calls = upstream.calls();
        let bodies: Vec<_> = calls.iter().map(|(_, b)| b.as_str()).collect();
        assert_eq!(bodies, ["a", "b", "c"]);
        assert!(calls[1].0 - calls[0].0 >= Duration::from_secs(1));
        assert!(calls[2].0 - calls[1].0 >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn webhooks_sharing_a_bucket_wait_for_each_other() {
        let upstream = Arc::new(Scripted::default());
        upstream.reply(
            204,
            &[
                ("x-ratelimit-remaining", "1"),
                ("x-ratelimit-reset-after", "1"),
                ("x-ratelimit-bucket", "same"),
            ],
        );
        upstream.reply(
            204,
            &[
                ("x-ratelimit-remaining", "0"),
                ("x-ratelimit-reset-after", "2"),
                ("x-ratelimit-bucket", "same"),
            ],
        );
        let manager = manager(upstream.clone());
        let mut reports = manager.subscribe();

        manager.enqueue(request("20", "first")).unwrap();
        next_report(&mut reports).await;
        manager.enqueue(request("21", "exhausts")).unwrap();
        next_report(&mut reports).await;
        manager.enqueue(request("20", "second")).unwrap();
        next_report(&mut reports).await;

        let calls = upstream.calls();
        let gap = call_at(&calls, "second") - call_at(&calls, "exhausts");
        assert!(gap >= Duration::from_secs(2), "sent after {gap:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn global_limit_pauses_other_queues() {
        let upstream = Arc::new(Scripted::default());
        upstream.reply(429, &[("x-ratelimit-global", "true"), ("retry-after", "3")]);
        let manager = manager(upstream.clone());
        let mut reports = manager.subscribe();

        manager.enqueue(request("30", "limited")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.enqueue(request("31", "bystander")).unwrap();
        next_report(&mut reports).await;
        next_report(&mut reports).await;

        let calls = upstream.calls();
        assert_eq!(calls.len(), 3);
        let gap = call_at(&calls, "bystander") - calls[0].0;
        assert!(gap >= Duration::from_secs(3), "sent after {gap:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_retry_after_is_capped() {
        let upstream = Arc::new(Scripted::default());
        upstream.reply(429, &[("retry-after", "1e300")]);
        let manager = manager(upstream.clone());
        let mut reports = manager.subscribe();

        manager.enqueue(request("12", "patient")).unwrap();
        let report = tokio::time::timeout(MAX_WAIT * 2, reports.recv())
            .await
            .expect("no report before the capped wait elapsed")
            .unwrap();

        assert_eq!(report.outcome, DeliveryOutcome::Delivered { status: 204 });
        assert_eq!(report.attempts, 2);
        let calls = upstream.calls();
        assert!(calls[1].0 - calls[0].0 >= MAX_WAIT);
        assert_eq!(manager.enqueue(request("12", "later")).unwrap(), 1);
    }

    /// Panics on its first call, then answers 204.
    #[derive(Default)]
    struct Explodes {
        tripped: AtomicBool,
    }

    impl Upstream for Explodes {
        fn execute(
            &self,
            _request: UpstreamRequest,
        ) -> BoxFuture<'_, Result<UpstreamResponse, UpstreamError>> {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                panic!("upstream transport bug");
            }
            Box::pin(async { Ok(UpstreamResponse::new(StatusCode::NO_CONTENT, HeaderMap::new(), "")) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_worker_is_replaced_on_next_submission() {
        let manager = manager(Arc::new(Explodes::default()));
        let mut reports = manager.subscribe();
        let key = WebhookKey::parse("13", "token").unwrap();

        manager.enqueue(request("13", "lost")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.depth(&key), 1);

        assert_eq!(manager.enqueue(request("13", "recovered")).unwrap(), 1);
        let report = next_report(&mut reports).await;
        assert_eq!(report.outcome, DeliveryOutcome::Delivered { status: 204 });
        assert_eq!(manager.depth(&key), 0);
        assert_eq!(manager.active_queues(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queues_progress_independently() {
        let upstream = Arc::new(Scripted::default());
        upstream.push(
            Duration::from_secs(8),
            Ok(UpstreamResponse::new(StatusCode::NO_CONTENT, HeaderMap::new(), "")),
        );
        let manager = manager(upstream.clone());
        let mut reports = manager.subscribe();

        manager.enqueue(request("8", "slow")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.enqueue(request("9", "fast")).unwrap();

        let first = next_report(&mut reports).await;
        assert_eq!(first.webhook_id, "9");
        let second = next_report(&mut reports).await;
        assert_eq!(second.webhook_id, "8");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_unsent_and_refuses_new() {
        let upstream = Arc::new(Scripted::default());
        upstream.push(
            Duration::from_secs(3),
            Ok(UpstreamResponse::new(StatusCode::NO_CONTENT, HeaderMap::new(), "")),
        );
        let manager = manager(upstream.clone());
        let mut reports = manager.subscribe();

        manager.enqueue(request("10", "in-flight")).unwrap();
        manager.enqueue(request("10", "waiting")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(manager.shutdown(Duration::from_secs(15)).await);
        assert!(matches!(
            manager.enqueue(request("10", "late")),
            Err(ProxyError::ShuttingDown)
        ));

        let mut outcomes = vec![
            next_report(&mut reports).await.outcome,
            next_report(&mut reports).await.outcome,
        ];
        outcomes.sort_by_key(|o| o.label());
        assert_eq!(
            outcomes,
            [DeliveryOutcome::Delivered { status: 204 }, DeliveryOutcome::Dropped]
        );
        assert_eq!(upstream.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_queue_is_evicted() {
        let upstream = Arc::new(Scripted::default());
        let manager = manager(upstream);
        let mut reports = manager.subscribe();

        manager.enqueue(request("11", "once")).unwrap();
        next_report(&mut reports).await;
        assert_eq!(manager.active_queues(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(manager.active_queues(), 0);

        // A fresh queue is created on the next submission.
        assert_eq!(manager.enqueue(request("11", "again")).unwrap(), 1);
        assert_eq!(next_report(&mut reports).await.outcome, DeliveryOutcome::Delivered { status: 204 });
    }
}
