//! Retry classification.
//!
//! # Responsibilities
//! - Classify one upstream outcome as success, retry or permanent failure
//! - Pick the retry delay: upstream retry-after for 429s, jittered
//!   exponential backoff for 5xx and network failures
//! - Bound both retry kinds
//!
//! # Design Decisions
//! - 4xx other than 429 is permanent; retrying cannot change the outcome
//! - Rate-limited retries do not consume the transient-failure budget

use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;

use crate::config::QueueConfig;
use crate::ratelimit::RateLimitInfo;
use crate::resilience::backoff;
use crate::upstream::{UpstreamError, UpstreamResponse};

const FALLBACK_RATE_LIMIT_DELAY: Duration = Duration::from_secs(1);

/// Why a delivery ended without success.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FailureReason {
    /// Upstream client error (bad token, malformed payload, ...).
    #[error("upstream rejected the request with status {status}")]
    Rejected { status: u16 },

    /// Transient failures exhausted the attempt budget.
    #[error("gave up after {failures} failed attempts, last error: {last_error}")]
    RetriesExhausted { failures: u32, last_error: String },

    /// Upstream kept answering 429.
    #[error("still rate limited after {retries} retries")]
    RateLimitExhausted { retries: u32 },
}

/// Why an attempt is being retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryCause {
    RateLimited,
    ServerError(StatusCode),
    Network(UpstreamError),
}

/// Classification of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Retry { delay: Duration, cause: RetryCause },
    PermanentFailure(FailureReason),
}

/// Retries already spent by a delivery, excluding the attempt being
/// classified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryBudget {
    pub transient_failures: u32,
    pub rate_limited: u32,
}

impl RetryBudget {
    /// Account for a retry verdict.
    pub fn charge(&mut self, cause: &RetryCause) {
        match cause {
            RetryCause::RateLimited => self.rate_limited += 1,
            RetryCause::ServerError(_) | RetryCause::Network(_) => self.transient_failures += 1,
        }
    }
}

/// Retry policy for queued deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_rate_limited_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            max_rate_limited_retries: config.max_rate_limited_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Classify the outcome of one upstream call.
    pub fn classify(
        &self,
        outcome: &Result<UpstreamResponse, UpstreamError>,
        spent: RetryBudget,
    ) -> Verdict {
        match outcome {
            Ok(response) if response.status.is_success() => Verdict::Success,
            Ok(response) if response.status == StatusCode::TOO_MANY_REQUESTS => {
                if spent.rate_limited >= self.max_rate_limited_retries {
                    return Verdict::PermanentFailure(FailureReason::RateLimitExhausted {
                        retries: spent.rate_limited,
                    });
                }
                let info =
                    RateLimitInfo::parse(response.status, &response.headers, &response.body);
                let delay = info
                    .retry_after
                    .or(info.reset_after)
                    .unwrap_or(FALLBACK_RATE_LIMIT_DELAY);
                Verdict::Retry {
                    delay,
                    cause: RetryCause::RateLimited,
                }
            }
            Ok(response) if response.status.is_server_error() => {
                self.transient(spent, RetryCause::ServerError(response.status))
            }
            Ok(response) => Verdict::PermanentFailure(FailureReason::Rejected {
                status: response.status.as_u16(),
            }),
            Err(e) => self.transient(spent, RetryCause::Network(e.clone())),
        }
    }

    fn transient(&self, spent: RetryBudget, cause: RetryCause) -> Verdict {
        let failures = spent.transient_failures + 1;
        if failures >= self.max_attempts {
            let last_error = match &cause {
                RetryCause::ServerError(status) => format!("upstream status {}", status.as_u16()),
                RetryCause::Network(e) => e.to_string(),
                RetryCause::RateLimited => "rate limited".to_string(),
            };
            return Verdict::PermanentFailure(FailureReason::RetriesExhausted {
                failures,
                last_error,
            });
        }
        let delay = backoff::with_jitter(backoff::exponential(
            failures,
            self.base_delay,
            self.max_delay,
        ));
        Verdict::Retry { delay, cause }
    }
}
