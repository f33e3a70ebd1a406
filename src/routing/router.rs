//! Dispatch of validated submissions to the immediate or queued path.
//!
//! # Responsibilities
//! - Turn raw path segments into a [`WebhookTarget`]
//! - Immediate: forward once and hand back the upstream response
//! - Queued: run admission checks, enqueue, return the backlog position
//!
//! # Design Decisions
//! - Shutdown is checked before admission so a draining proxy does not
//!   charge flood quota for submissions it will refuse anyway
//! - A submission the queue refuses hands its flood slot back

use std::net::IpAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{header::CONTENT_TYPE, HeaderMap};

use crate::error::ProxyError;
use crate::queue::{DeliveryRequest, QueueManager};
use crate::routing::webhook::{ApiVersion, WebhookKey, WebhookTarget};
use crate::security::AbuseGuard;
use crate::upstream::{ImmediateForwarder, UpstreamResponse};

/// A client submission as it arrived.
#[derive(Debug, Clone)]
pub struct Submission {
    pub version: Option<String>,
    pub id: String,
    pub token: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source: IpAddr,
}

impl Submission {
    fn target(&self) -> Result<WebhookTarget, ProxyError> {
        let key = WebhookKey::parse(&self.id, &self.token)?;
        let version = self.version.as_deref().map(ApiVersion::parse).transpose()?;
        Ok(WebhookTarget {
            key,
            version,
            query: self.query.clone(),
        })
    }
}

pub struct WebhookRouter {
    forwarder: ImmediateForwarder,
    guard: AbuseGuard,
    queues: Arc<QueueManager>,
}

impl WebhookRouter {
    pub fn new(forwarder: ImmediateForwarder, guard: AbuseGuard, queues: Arc<QueueManager>) -> Self {
        Self {
            forwarder,
            guard,
            queues,
        }
    }

    /// Forward now. The caller owns rate-limit handling.
    pub async fn route_immediate(&self, submission: Submission) -> Result<UpstreamResponse, ProxyError> {
        let target = submission.target()?;
        self.forwarder
            .forward(target, &submission.headers, submission.body)
            .await
    }

    /// Enqueue for rate-limit-compliant delivery. Returns the backlog position.
    pub fn route_queued(&self, submission: Submission) -> Result<usize, ProxyError> {
        if self.queues.is_closing() {
            return Err(ProxyError::ShuttingDown);
        }
        let target = submission.target()?;
        self.guard.admit(submission.source, &submission.body)?;

        let content_type = submission.headers.get(CONTENT_TYPE).cloned();
        let source = submission.source;
        let queued = self.queues.enqueue(DeliveryRequest::new(
            target,
            submission.body,
            content_type,
            source,
        ));
        if queued.is_err() {
            self.guard.refund(source);
        }
        queued
    }

    pub fn guard(&self) -> &AbuseGuard {
        &self.guard
    }

    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }
}
