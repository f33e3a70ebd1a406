//! Immediate pass-through forwarding.
//!
//! # Responsibilities
//! - Relay one request to the upstream unchanged
//! - Return status, body and headers verbatim
//! - Feed rate limit headers to the shared tracker
//!
//! # Design Decisions
//! - No retries and no waiting: callers own their backoff
//! - Network failures and timeouts become gateway errors marked with
//!   `x-proxy-error`, distinct from anything the upstream returns

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::http::{header::CONTENT_TYPE, HeaderMap};

use crate::error::ProxyError;
use crate::observability::metrics;
use crate::ratelimit::RateLimitTracker;
use crate::resilience::timeouts::with_deadline;
use crate::routing::webhook::WebhookTarget;
use crate::upstream::{Upstream, UpstreamRequest, UpstreamResponse};

pub struct ImmediateForwarder {
    upstream: Arc<dyn Upstream>,
    tracker: Arc<RateLimitTracker>,
    timeout: Duration,
}

impl ImmediateForwarder {
    pub fn new(upstream: Arc<dyn Upstream>, tracker: Arc<RateLimitTracker>, timeout: Duration) -> Self {
        Self {
            upstream,
            tracker,
            timeout,
        }
    }

    /// Forward one request and return the upstream's response as-is.
    pub async fn forward(
        &self,
        target: WebhookTarget,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse, ProxyError> {
        let route = target.key.route_key();
        let webhook = target.key.to_string();
        let request = UpstreamRequest {
            target,
            content_type: headers.get(CONTENT_TYPE).cloned(),
            body,
        };

        let started = Instant::now();
        match with_deadline(self.timeout, self.upstream.execute(request)).await {
            Ok(response) => {
                self.tracker.record_response(&route, &response);
                metrics::record_upstream_attempt("immediate", response.status.as_u16(), started);
                tracing::debug!(
                    webhook = %webhook,
                    status = %response.status,
                    "Forwarded immediately"
                );
                Ok(response)
            }
            Err(e) => {
                metrics::record_upstream_attempt("immediate", 0, started);
                tracing::warn!(webhook = %webhook, error = %e, "Immediate forward failed");
                Err(e.into())
            }
        }
    }
}
