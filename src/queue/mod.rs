//! Per-webhook delivery queues.
//!
//! # Data Flow
//! ```text
//! POST ...?queue=true
//!     → QueueManager::enqueue (backlog ceiling, position)
//!     → QueueHandle channel
//!     → QueueWorker (one per webhook, strictly sequential)
//!         → RateLimitTracker::acquire / wait for reset
//!         → Upstream::execute
//!         → RetryPolicy::classify
//!     → DeliveryReport → reporter (stats, metrics, subscribers)
//! ```

pub mod delivery;
pub mod manager;
pub mod report;
mod worker;

pub use delivery::{DeliveryOutcome, DeliveryReport, DeliveryRequest};
pub use manager::{QueueManager, QueueSettings, QueueSnapshot};
pub use report::{DeliveryStats, DeliveryTotals, FailureRecord};
