//! Upstream webhook API subsystem.
//!
//! # Data Flow
//! ```text
//! Immediate path:
//!     forward.rs (ImmediateForwarder)
//!     → Upstream::execute (one call, no retry)
//!     → response mirrored to caller, headers fed to the tracker
//!
//! Queued path:
//!     queue worker
//!     → Upstream::execute (bounded by resilience::timeouts)
//!     → tracker update + retry classification
//! ```
//!
//! # Design Decisions
//! - `Upstream` is a trait object so tests can script responses
//! - Timeouts are applied by callers, not implementations, so the same
//!   deadline logic covers real and scripted upstreams

pub mod client;
pub mod forward;

use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use futures_util::future::BoxFuture;
use thiserror::Error;

pub use client::HttpUpstream;
pub use forward::ImmediateForwarder;

use crate::routing::webhook::WebhookTarget;

/// One call to the upstream webhook endpoint.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub target: WebhookTarget,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

/// Fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }
}

/// Failure to obtain any response from the upstream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),

    #[error("upstream connection failed: {0}")]
    Network(String),
}

/// Transport to the upstream API.
pub trait Upstream: Send + Sync {
    fn execute(&self, request: UpstreamRequest)
        -> BoxFuture<'_, Result<UpstreamResponse, UpstreamError>>;
}
