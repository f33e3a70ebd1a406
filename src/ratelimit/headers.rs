//! Upstream rate limit header parsing.
//!
//! Parses the upstream's bucket headers and, on 429 responses, the JSON
//! body fields that duplicate them.

use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;

pub const LIMIT: &str = "x-ratelimit-limit";
pub const REMAINING: &str = "x-ratelimit-remaining";
pub const RESET: &str = "x-ratelimit-reset";
pub const RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const BUCKET: &str = "x-ratelimit-bucket";
pub const GLOBAL: &str = "x-ratelimit-global";
pub const SCOPE: &str = "x-ratelimit-scope";
pub const RETRY_AFTER: &str = "retry-after";

/// Longest wait honoured from a single upstream response.
pub const MAX_WAIT: Duration = Duration::from_secs(60 * 60);

/// Every header the immediate path must mirror to the caller.
pub const MIRRORED: [&str; 8] = [
    LIMIT,
    REMAINING,
    RESET,
    RESET_AFTER,
    BUCKET,
    GLOBAL,
    SCOPE,
    RETRY_AFTER,
];

/// Parsed rate limit information from one upstream response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitInfo {
    /// Upstream bucket identifier.
    pub bucket: Option<String>,

    /// Maximum requests allowed per window.
    pub limit: Option<u32>,

    /// Remaining requests in the current window.
    pub remaining: Option<u32>,

    /// Time until the bucket resets.
    pub reset_after: Option<Duration>,

    /// Authoritative wait from a 429 response.
    pub retry_after: Option<Duration>,

    /// The 429 was caused by the account-wide limit.
    pub global: bool,

    /// `user`, `global` or `shared`.
    pub scope: Option<String>,
}

#[derive(Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

impl RateLimitInfo {
    /// Parse rate limit state from a response.
    pub fn parse(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Self {
        let mut info = Self {
            bucket: header_str(headers, BUCKET).map(str::to_string),
            limit: header_str(headers, LIMIT).and_then(|v| v.parse().ok()),
            remaining: header_str(headers, REMAINING).and_then(|v| v.parse().ok()),
            reset_after: header_str(headers, RESET_AFTER).and_then(parse_seconds),
            retry_after: header_str(headers, RETRY_AFTER).and_then(parse_seconds),
            global: header_str(headers, GLOBAL)
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            scope: header_str(headers, SCOPE).map(str::to_string),
        };

        if status == StatusCode::TOO_MANY_REQUESTS {
            if let Ok(parsed) = serde_json::from_slice::<RateLimitBody>(body) {
                if info.retry_after.is_none() {
                    info.retry_after = parsed.retry_after.and_then(seconds_to_duration);
                }
                info.global |= parsed.global;
            }
            if info.scope.as_deref() == Some("global") {
                info.global = true;
            }
        }

        info
    }

    /// Scope label for metrics and logs.
    pub fn scope_label(&self) -> &str {
        if self.global {
            "global"
        } else {
            self.scope.as_deref().unwrap_or("bucket")
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn parse_seconds(raw: &str) -> Option<Duration> {
    raw.parse::<f64>().ok().and_then(seconds_to_duration)
}

fn seconds_to_duration(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(secs).map_or(MAX_WAIT, |wait| wait.min(MAX_WAIT)))
}
