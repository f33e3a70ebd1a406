//! Payload limits for queued submissions.
//!
//! # Design Decisions
//! - The ceiling mirrors the upstream's own attachment limit, so a payload
//!   the upstream would reject never takes a queue slot
//! - A transport-level body limit still applies to both paths; this check
//!   only produces the structured error

use crate::error::ProxyError;

/// Reject bodies the upstream would never accept.
pub fn check_payload(body: &[u8], limit: usize) -> Result<(), ProxyError> {
    if body.is_empty() {
        return Err(ProxyError::ClientInput("payload is empty".into()));
    }
    if body.len() > limit {
        return Err(ProxyError::PayloadTooLarge {
            size: body.len(),
            limit,
        });
    }
    Ok(())
}
