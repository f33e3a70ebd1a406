//! Caller-visible proxy errors.

use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

use crate::upstream::UpstreamError;

/// Errors returned synchronously to a client.
///
/// Post-enqueue delivery failures are not represented here; they are only
/// observable through logs, metrics and the admin API.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed id, token, version or payload.
    #[error("invalid request: {0}")]
    ClientInput(String),

    /// Body exceeds the configured payload ceiling.
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Source address exceeded the enqueue flood limit.
    #[error("too many queued submissions from this address, retry in {}s", retry_after.as_secs().max(1))]
    Flooded { retry_after: Duration },

    /// Per-webhook backlog ceiling reached.
    #[error("queue for this webhook is full ({limit} pending deliveries)")]
    QueueFull { limit: usize },

    /// Proxy is draining and no longer accepts submissions.
    #[error("proxy is shutting down")]
    ShuttingDown,

    /// Upstream could not be reached on the immediate path.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl ProxyError {
    /// HTTP status reported to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::ClientInput(_) => StatusCode::BAD_REQUEST,
            ProxyError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Flooded { .. } | ProxyError::QueueFull { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ProxyError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Upstream(UpstreamError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Stable machine-readable code, also sent as `x-proxy-error`.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::ClientInput(_) => "invalid_request",
            ProxyError::PayloadTooLarge { .. } => "payload_too_large",
            ProxyError::Flooded { .. } => "flood_limited",
            ProxyError::QueueFull { .. } => "queue_full",
            ProxyError::ShuttingDown => "shutting_down",
            ProxyError::Upstream(UpstreamError::Timeout(_)) => "upstream_timeout",
            ProxyError::Upstream(_) => "upstream_unreachable",
        }
    }

    /// Seconds the caller should wait before retrying, if meaningful.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProxyError::Flooded { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_and_flood_share_status_but_not_code() {
        let full = ProxyError::QueueFull { limit: 50 };
        let flood = ProxyError::Flooded {
            retry_after: Duration::from_secs(3),
        };
        assert_eq!(full.status(), flood.status());
        assert_ne!(full.code(), flood.code());
        assert_eq!(flood.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn upstream_failures_map_to_gateway_statuses() {
        let timeout = ProxyError::from(UpstreamError::Timeout(Duration::from_secs(10)));
        let network = ProxyError::from(UpstreamError::Network("refused".into()));
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(network.status(), StatusCode::BAD_GATEWAY);
    }
}
