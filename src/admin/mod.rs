//! Admin API.
//!
//! Read-only view of queue and delivery state, served on its own listener
//! and protected by a bearer token.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use tokio::time::Instant;

use crate::queue::QueueManager;
use crate::ratelimit::RateLimitTracker;

use self::auth::admin_auth_middleware;
use self::handlers::*;

/// State shared by admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub queues: Arc<QueueManager>,
    pub tracker: Arc<RateLimitTracker>,
    pub started_at: Instant,
    pub api_key: Arc<str>,
}

impl AdminState {
    pub fn new(queues: Arc<QueueManager>, tracker: Arc<RateLimitTracker>, api_key: &str) -> Self {
        Self {
            queues,
            tracker,
            started_at: Instant::now(),
            api_key: Arc::from(api_key),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/queues", get(get_queues))
        .route("/admin/failures", get(get_failures))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}
