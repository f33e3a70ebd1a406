//! Per-bucket and global rate limit state.
//!
//! # Responsibilities
//! - Map webhook routes to the upstream's bucket ids
//! - Store the most recent authoritative bucket state
//! - Hold the shared global-limit resume time
//! - Serialize upstream calls per bucket
//!
//! # Design Decisions
//! - `update` is the only writer; workers only read before sending
//! - Until the upstream names a bucket, the route key is used as a
//!   provisional bucket id
//! - Per-bucket async locks are held across the wait and the call, so at
//!   most one call per bucket is in flight

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::StatusCode;
use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::observability::metrics;
use crate::ratelimit::headers::RateLimitInfo;
use crate::resilience::timeouts::deadline_after;
use crate::upstream::UpstreamResponse;

/// Wait applied to a 429 that carries no usable timing information.
const FALLBACK_RETRY_AFTER: Duration = Duration::from_secs(1);

/// How long a learned route mapping survives after it was last reported.
/// Outlives bucket state so webhooks sharing a bucket stay serialized.
const ROUTE_MAPPING_TTL: Duration = Duration::from_secs(60 * 60);

/// Rate limit state of one upstream bucket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bucket {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<Instant>,
    /// Last 429 seen on this bucket was the account-wide limit.
    pub global: bool,
}

impl Bucket {
    /// When the bucket blocks sending, the instant it reopens.
    fn blocked_until(&self, now: Instant) -> Option<Instant> {
        match (self.remaining, self.reset_at) {
            (Some(0), Some(reset)) if reset > now => Some(reset),
            _ => None,
        }
    }
}

/// Exclusive right to call the upstream for one bucket.
///
/// Released on drop.
#[derive(Debug)]
pub struct BucketPermit {
    bucket: String,
    _guard: OwnedMutexGuard<()>,
}

impl BucketPermit {
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[derive(Debug, Clone)]
struct RouteMapping {
    bucket: String,
    seen_at: Instant,
}

/// Shared rate limit tracker. One instance per proxy, passed to every worker.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    /// route key → bucket id, learned from responses.
    routes: DashMap<String, RouteMapping>,
    buckets: DashMap<String, Bucket>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
    global_until: Mutex<Option<Instant>>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket currently associated with a route.
    pub fn bucket_for(&self, route: &str) -> String {
        self.routes
            .get(route)
            .map(|mapping| mapping.bucket.clone())
            .unwrap_or_else(|| route.to_string())
    }

    /// Wait for exclusive use of the route's bucket.
    pub async fn acquire(&self, route: &str) -> BucketPermit {
        let bucket = self.bucket_for(route);
        let lock = self
            .locks
            .entry(bucket.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        BucketPermit {
            bucket,
            _guard: guard,
        }
    }

    /// True if neither the bucket nor the global limit blocks a send.
    pub fn can_send_now(&self, bucket: &str) -> bool {
        self.next_available_at(bucket).is_none()
    }

    /// Earliest instant a send on `bucket` is allowed, or `None` if now.
    pub fn next_available_at(&self, bucket: &str) -> Option<Instant> {
        let now = Instant::now();
        let global = self.global_resume_at();
        let local = self.buckets.get(bucket).and_then(|b| b.blocked_until(now));
        match (global, local) {
            (Some(g), Some(l)) => Some(g.max(l)),
            (g, l) => g.or(l),
        }
    }

    /// Resume time of an active global limit.
    pub fn global_resume_at(&self) -> Option<Instant> {
        let now = Instant::now();
        let guard = self.global_until.lock().expect("global limit mutex poisoned");
        guard.filter(|until| *until > now)
    }

    /// Snapshot of a bucket's state.
    pub fn bucket(&self, bucket: &str) -> Option<Bucket> {
        self.buckets.get(bucket).map(|b| b.value().clone())
    }

    /// Record the rate limit state reported by an upstream response.
    pub fn update(&self, route: &str, status: StatusCode, info: &RateLimitInfo) {
        let now = Instant::now();

        let bucket_id = match &info.bucket {
            Some(bucket) => {
                let previous = self.routes.insert(
                    route.to_string(),
                    RouteMapping {
                        bucket: bucket.clone(),
                        seen_at: now,
                    },
                );
                if previous.is_none() && bucket != route {
                    // Provisional state is superseded by the real bucket.
                    self.buckets.remove(route);
                }
                bucket.clone()
            }
            None => self.bucket_for(route),
        };

        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = info
                .retry_after
                .or(info.reset_after)
                .unwrap_or(FALLBACK_RETRY_AFTER);
            metrics::record_upstream_rate_limited(info.scope_label());

            if info.global {
                let resume = deadline_after(now, wait);
                let mut guard = self.global_until.lock().expect("global limit mutex poisoned");
                if guard.map_or(true, |current| current < resume) {
                    *guard = Some(resume);
                }
                drop(guard);
                if let Some(mut entry) = self.buckets.get_mut(&bucket_id) {
                    entry.global = true;
                }
                tracing::warn!(retry_after = ?wait, "Global rate limit hit, pausing all deliveries");
                return;
            }

            let mut entry = self.buckets.entry(bucket_id.clone()).or_default();
            entry.remaining = Some(0);
            entry.reset_at = Some(deadline_after(now, wait));
            entry.global = false;
            if info.limit.is_some() {
                entry.limit = info.limit;
            }
            tracing::debug!(bucket = %bucket_id, retry_after = ?wait, scope = info.scope_label(), "Bucket rate limited");
            return;
        }

        if info.limit.is_none() && info.remaining.is_none() && info.reset_after.is_none() {
            return;
        }

        let mut entry = self.buckets.entry(bucket_id).or_default();
        if info.limit.is_some() {
            entry.limit = info.limit;
        }
        if info.remaining.is_some() {
            entry.remaining = info.remaining;
        }
        if let Some(after) = info.reset_after {
            entry.reset_at = Some(deadline_after(now, after));
        }
        entry.global = false;
    }

    /// Parse a response's headers and record them.
    pub fn record_response(&self, route: &str, response: &UpstreamResponse) -> RateLimitInfo {
        let info = RateLimitInfo::parse(response.status, &response.headers, &response.body);
        self.update(route, response.status, &info);
        info
    }

    /// Drop expired buckets, unused locks and stale route mappings.
    pub fn prune(&self) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| bucket.reset_at.map_or(false, |reset| reset > now));
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        self.routes
            .retain(|_, mapping| now.duration_since(mapping.seen_at) < ROUTE_MAPPING_TTL);
    }

    /// Number of buckets with live state.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(remaining: u32, reset_after_ms: u64, bucket: Option<&str>) -> RateLimitInfo {
        RateLimitInfo {
            bucket: bucket.map(str::to_string),
            limit: Some(5),
            remaining: Some(remaining),
            reset_after: Some(Duration::from_millis(reset_after_ms)),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_blocks_until_reset() {
        let tracker = RateLimitTracker::new();
        tracker.update("webhooks/1", StatusCode::OK, &info(0, 1000, Some("b1")));

        assert_eq!(tracker.bucket_for("webhooks/1"), "b1");
        assert!(!tracker.can_send_now("b1"));
        let at = tracker.next_available_at("b1").unwrap();
        assert_eq!(at - Instant::now(), Duration::from_millis(1000));

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(tracker.can_send_now("b1"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_overrides_cached_remaining() {
        let tracker = RateLimitTracker::new();
        tracker.update("webhooks/1", StatusCode::OK, &info(4, 500, Some("b1")));
        assert!(tracker.can_send_now("b1"));

        let limited = RateLimitInfo {
            retry_after: Some(Duration::from_secs(2)),
            ..Default::default()
        };
        tracker.update("webhooks/1", StatusCode::TOO_MANY_REQUESTS, &limited);

        let bucket = tracker.bucket("b1").unwrap();
        assert_eq!(bucket.remaining, Some(0));
        tokio::time::advance(Duration::from_millis(1999)).await;
        assert!(!tracker.can_send_now("b1"));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(tracker.can_send_now("b1"));
    }

    #[tokio::test(start_paused = true)]
    async fn global_limit_blocks_every_bucket() {
        let tracker = RateLimitTracker::new();
        let global = RateLimitInfo {
            retry_after: Some(Duration::from_secs(3)),
            global: true,
            ..Default::default()
        };
        tracker.update("webhooks/1", StatusCode::TOO_MANY_REQUESTS, &global);

        assert!(!tracker.can_send_now("webhooks/1"));
        assert!(!tracker.can_send_now("some-other-bucket"));
        assert!(tracker.bucket("webhooks/1").is_none());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(tracker.can_send_now("some-other-bucket"));
    }

    #[tokio::test(start_paused = true)]
    async fn later_of_global_and_bucket_wins() {
        let tracker = RateLimitTracker::new();
        tracker.update("webhooks/1", StatusCode::OK, &info(0, 5000, Some("b1")));
        let global = RateLimitInfo {
            retry_after: Some(Duration::from_secs(1)),
            global: true,
            ..Default::default()
        };
        tracker.update("webhooks/2", StatusCode::TOO_MANY_REQUESTS, &global);

        let at = tracker.next_available_at("b1").unwrap();
        assert_eq!(at - Instant::now(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn global_limit_flags_known_bucket() {
        let tracker = RateLimitTracker::new();
        tracker.update("webhooks/1", StatusCode::OK, &info(2, 1000, Some("b1")));
        let global = RateLimitInfo {
            retry_after: Some(Duration::from_secs(1)),
            global: true,
            ..Default::default()
        };
        tracker.update("webhooks/1", StatusCode::TOO_MANY_REQUESTS, &global);
        assert!(tracker.bucket("b1").unwrap().global);

        tracker.update("webhooks/1", StatusCode::OK, &info(1, 1000, None));
        assert!(!tracker.bucket("b1").unwrap().global);
    }

    #[tokio::test(start_paused = true)]
    async fn provisional_bucket_replaced_by_reported_one() {
        let tracker = RateLimitTracker::new();
        let limited = RateLimitInfo {
            retry_after: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        tracker.update("webhooks/7", StatusCode::TOO_MANY_REQUESTS, &limited);
        assert!(tracker.bucket("webhooks/7").is_some());

        tracker.update("webhooks/7", StatusCode::OK, &info(3, 1000, Some("real")));
        assert!(tracker.bucket("webhooks/7").is_none());
        assert_eq!(tracker.bucket_for("webhooks/7"), "real");
    }

    #[tokio::test(start_paused = true)]
    async fn permits_serialize_a_bucket() {
        let tracker = Arc::new(RateLimitTracker::new());
        let first = tracker.acquire("webhooks/1").await;
        assert_eq!(first.bucket(), "webhooks/1");

        let t = tracker.clone();
        let waiter = tokio::spawn(async move {
            let _second = t.acquire("webhooks/1").await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn prune_discards_expired_state() {
        let tracker = RateLimitTracker::new();
        tracker.update("webhooks/1", StatusCode::OK, &info(0, 100, Some("b1")));
        drop(tracker.acquire("webhooks/1").await);
        assert_eq!(tracker.bucket_count(), 1);

        tokio::time::advance(Duration::from_millis(100)).await;
        tracker.prune();
        assert_eq!(tracker.bucket_count(), 0);
        assert_eq!(tracker.bucket_for("webhooks/1"), "b1");

        tokio::time::advance(ROUTE_MAPPING_TTL).await;
        tracker.prune();
        assert_eq!(tracker.bucket_for("webhooks/1"), "webhooks/1");
    }

    #[tokio::test(start_paused = true)]
    async fn shared_bucket_survives_prune() {
        let tracker = Arc::new(RateLimitTracker::new());
        tracker.update("webhooks/1", StatusCode::OK, &info(4, 100, Some("shared")));
        tracker.update("webhooks/2", StatusCode::OK, &info(3, 100, Some("shared")));
        tokio::time::advance(Duration::from_secs(1)).await;
        tracker.prune();

        let first = tracker.acquire("webhooks/1").await;
        assert_eq!(first.bucket(), "shared");
        let t = tracker.clone();
        let second = tokio::spawn(async move { t.acquire("webhooks/2").await.bucket().to_string() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!second.is_finished());

        drop(first);
        assert_eq!(second.await.unwrap(), "shared");
    }
}
