//! Rate-limit-aware webhook proxy library.

// Core subsystems
pub mod config;
pub mod error;
pub mod http;
pub mod routing;

// Delivery
pub mod queue;
pub mod ratelimit;
pub mod upstream;

// Cross-cutting concerns
pub mod admin;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::schema::ProxyConfig;
pub use error::ProxyError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
