//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum router, tower layers)
//!     → request.rs (request ID, client address)
//!     → routing::WebhookRouter (immediate or queued)
//!     → response.rs (mirror upstream, map proxy errors)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{ClientIp, TrustForwardedFor, X_REQUEST_ID};
pub use server::{AppState, HttpServer};
