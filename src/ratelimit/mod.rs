//! Upstream rate limit subsystem.
//!
//! # Data Flow
//! ```text
//! Before a send:
//!     worker → tracker.acquire(route) → next_available_at(bucket) → sleep
//!
//! After a response:
//!     headers.rs (parse bucket/global/retry-after)
//!     → tracker.update (single writer)
//! ```

pub mod headers;
pub mod tracker;

pub use headers::RateLimitInfo;
pub use tracker::{Bucket, BucketPermit, RateLimitTracker};
