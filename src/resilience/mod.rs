//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Upstream call:
//!     → timeouts.rs (enforce the per-call deadline)
//!     → retries.rs (classify: success / retry / permanent failure)
//!     → backoff.rs (exponential delay with jitter for transient failures)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every upstream call has a deadline
//! - Only the queued path retries; the immediate path surfaces outcomes
//! - Retry decisions are pure functions of the outcome and spent budget

pub mod backoff;
pub mod retries;
pub mod timeouts;

pub use retries::{FailureReason, RetryBudget, RetryCause, RetryPolicy, Verdict};
