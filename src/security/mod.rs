//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Queued submission:
//!     → limits.rs (empty or oversized payload)
//!     → flood.rs (per-source submission rate)
//!     → queue manager (backlog ceiling; a refusal refunds the flood slot)
//! ```
//!
//! # Design Decisions
//! - Checks run at enqueue time only; the immediate path is bounded by
//!   the upstream's own limits
//! - Fail closed: every rejection is a client error and nothing reaches
//!   a queue
//! - Limits are read from the live config on every call

pub mod flood;
pub mod limits;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::config::LimitsConfig;
use crate::error::ProxyError;
use crate::observability::metrics;

pub use flood::FloodGuard;

/// Enqueue-time admission checks.
#[derive(Debug)]
pub struct AbuseGuard {
    limits: Arc<ArcSwap<LimitsConfig>>,
    flood: FloodGuard,
}

impl AbuseGuard {
    pub fn new(limits: Arc<ArcSwap<LimitsConfig>>) -> Self {
        Self {
            limits,
            flood: FloodGuard::new(),
        }
    }

    /// Admit or reject one queued submission from `source`.
    pub fn admit(&self, source: IpAddr, body: &[u8]) -> Result<(), ProxyError> {
        let limits = self.limits.load();

        if let Err(e) = limits::check_payload(body, limits.max_body_bytes) {
            metrics::record_enqueue_rejected(e.code());
            return Err(e);
        }

        let window = Duration::from_secs(limits.flood_window_secs);
        if let Err(retry_after) = self.flood.check(source, window, limits.flood_max_requests) {
            tracing::warn!(source = %source, retry_after = ?retry_after, "Flood limit exceeded");
            metrics::record_enqueue_rejected("flood_limited");
            return Err(ProxyError::Flooded { retry_after });
        }

        Ok(())
    }

    /// Return the flood slot of an admitted submission that the queue
    /// then refused.
    pub fn refund(&self, source: IpAddr) {
        self.flood.refund(source);
    }

    /// Periodic cleanup of idle sources.
    pub fn prune(&self) {
        let window = Duration::from_secs(self.limits.load().flood_window_secs);
        self.flood.prune(window);
    }
}
