//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Path params (version?, id, token) + query
//!     → webhook.rs (validate, build WebhookTarget)
//!     → router.rs
//!         immediate → upstream::ImmediateForwarder
//!         queued    → security::AbuseGuard → queue::QueueManager
//! ```
//!
//! # Design Decisions
//! - Validation is syntactic only; token ownership is left to the upstream
//! - Both paths share one target type, so queued deliveries hit exactly
//!   the URL an immediate call would

pub mod router;
pub mod webhook;

pub use router::{Submission, WebhookRouter};
pub use webhook::{ApiVersion, WebhookKey, WebhookTarget};
