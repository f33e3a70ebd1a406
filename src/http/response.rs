//! Response construction.
//!
//! # Responsibilities
//! - Mirror upstream responses to immediate-path callers
//! - Render proxy errors as `{"code","message"}` with `x-proxy-error`
//! - Render the queued acknowledgement
//!
//! # Design Decisions
//! - Hop-by-hop headers are stripped; everything else, rate-limit headers
//!   included, passes through byte-for-byte
//! - Proxy-generated errors are always marked so callers can tell them
//!   from upstream statuses

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::ProxyError;
use crate::upstream::UpstreamResponse;

pub const X_PROXY_ERROR: &str = "x-proxy-error";

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

#[derive(Debug, Serialize)]
pub struct QueuedAck {
    pub queued: bool,
    pub position: usize,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let code = self.code();
        let body = ErrorBody {
            code,
            message: self.to_string(),
        };
        let mut response = (self.status(), Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(X_PROXY_ERROR, HeaderValue::from_static(code));
        if let Some(wait) = self.retry_after() {
            // Round up so clients never retry early.
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}

/// Accepted onto a queue.
pub fn queued(position: usize) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(QueuedAck {
            queued: true,
            position,
        }),
    )
        .into_response()
}

/// Replay an upstream response to the caller.
pub fn mirror(upstream: UpstreamResponse) -> Response {
    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = strip_hop_by_hop(upstream.headers);
    response
}

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in HOP_BY_HOP {
        headers.remove(HeaderName::from_static(name));
    }
    headers
}
