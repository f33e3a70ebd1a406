//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the webhook and health handlers
//! - Wire up middleware (tracing, limits, request ID, timeout)
//! - Own the shared tracker, queue manager and live limits
//! - Apply hot-reloaded limits and run periodic state pruning
//! - Drain queues on shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, FromRef, Path, RawQuery, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::{LimitsConfig, ProxyConfig};
use crate::http::request::{self, ClientIp, TrustForwardedFor};
use crate::http::response;
use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;
use crate::queue::{QueueManager, QueueSettings};
use crate::ratelimit::RateLimitTracker;
use crate::routing::{Submission, WebhookRouter};
use crate::security::AbuseGuard;
use crate::upstream::{HttpUpstream, ImmediateForwarder, Upstream};

/// Headroom between the transport body ceiling and the guard's payload
/// ceiling, so oversized queued payloads get the structured 413.
const BODY_LIMIT_SLACK: usize = 64 * 1024;

/// Interval between tracker and flood-window pruning passes.
const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub webhooks: Arc<WebhookRouter>,
    pub trust_forwarded_for: bool,
}

impl FromRef<AppState> for TrustForwardedFor {
    fn from_ref(state: &AppState) -> Self {
        TrustForwardedFor(state.trust_forwarded_for)
    }
}

/// HTTP server for the webhook proxy.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
    webhooks: Arc<WebhookRouter>,
    tracker: Arc<RateLimitTracker>,
    limits: Arc<ArcSwap<LimitsConfig>>,
}

impl HttpServer {
    /// Create a server that talks to the configured upstream over HTTP.
    pub fn new(config: ProxyConfig) -> Result<Self, reqwest::Error> {
        let upstream = Arc::new(HttpUpstream::new(&config.upstream)?);
        Ok(Self::with_upstream(config, upstream))
    }

    /// Create a server over any upstream transport. Spawns the queue
    /// reporter, so it must be called inside a Tokio runtime.
    pub fn with_upstream(config: ProxyConfig, upstream: Arc<dyn Upstream>) -> Self {
        let tracker = Arc::new(RateLimitTracker::new());
        let limits = Arc::new(ArcSwap::from_pointee(config.limits.clone()));

        let forwarder = ImmediateForwarder::new(
            upstream.clone(),
            tracker.clone(),
            Duration::from_secs(config.upstream.timeout_secs),
        );
        let queues = Arc::new(QueueManager::new(
            QueueSettings::from_config(&config),
            upstream,
            tracker.clone(),
            limits.clone(),
        ));
        let webhooks = Arc::new(WebhookRouter::new(
            forwarder,
            AbuseGuard::new(limits.clone()),
            queues,
        ));

        let state = AppState {
            webhooks: webhooks.clone(),
            trust_forwarded_for: config.listener.trust_forwarded_for,
        };
        let router = Self::build_router(&config, state);

        Self {
            router,
            config,
            webhooks,
            tracker,
            limits,
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ProxyConfig, state: AppState) -> Router {
        Router::new()
            .route("/api/webhooks/{id}/{token}", post(immediate_handler))
            .route("/api/{version}/webhooks/{id}/{token}", post(immediate_handler))
            .route("/api/webhooks/{id}/{token}/queue", post(queued_handler))
            .route("/api/{version}/webhooks/{id}/{token}/queue", post(queued_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(
                config.limits.max_body_bytes + BODY_LIMIT_SLACK,
            ))
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(request::propagate_request_id())
            .layer(TraceLayer::new_for_http().make_span_with(request::request_span))
            .layer(request::set_request_id())
    }

    /// The fully layered router, for in-process tests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn queues(&self) -> Arc<QueueManager> {
        self.webhooks.queues().clone()
    }

    pub fn tracker(&self) -> Arc<RateLimitTracker> {
        self.tracker.clone()
    }

    /// Live limits; storing a new value takes effect on the next submission.
    pub fn limits(&self) -> Arc<ArcSwap<LimitsConfig>> {
        self.limits.clone()
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Serve until `shutdown` fires, then drain the queues.
    ///
    /// `limit_updates` carries reloaded `[limits]` from the file watcher.
    pub async fn run(
        self,
        listener: TcpListener,
        limit_updates: Option<mpsc::UnboundedReceiver<LimitsConfig>>,
        shutdown: ShutdownSignal,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        tokio::spawn(prune_periodically(
            self.tracker.clone(),
            self.webhooks.clone(),
            shutdown.clone(),
        ));

        if let Some(updates) = limit_updates {
            tokio::spawn(apply_reloads(updates, self.limits.clone()));
        }

        // Queues stop admitting as soon as shutdown fires, while in-flight
        // HTTP requests are still being drained below.
        let queues = self.webhooks.queues().clone();
        let grace = Duration::from_secs(self.config.lifecycle.shutdown_grace_secs);
        let mut drain_signal = shutdown.clone();
        let drain = tokio::spawn(async move {
            drain_signal.recv().await;
            queues.shutdown(grace).await
        });

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        let mut serve_signal = shutdown;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_signal.recv().await })
            .await?;

        tracing::info!("HTTP server stopped");

        match drain.await {
            Ok(true) => tracing::info!("Delivery queues drained"),
            Ok(false) => tracing::warn!("Delivery queues did not drain within the grace period"),
            Err(e) => tracing::error!(error = %e, "Queue drain task failed"),
        }
        Ok(())
    }
}

/// Path parameters shared by all webhook routes.
#[derive(Debug, Deserialize)]
struct WebhookPath {
    #[serde(default)]
    version: Option<String>,
    id: String,
    token: String,
}

impl WebhookPath {
    fn into_submission(
        self,
        query: Option<String>,
        headers: HeaderMap,
        body: Bytes,
        ClientIp(source): ClientIp,
    ) -> Submission {
        Submission {
            version: self.version,
            id: self.id,
            token: self.token,
            query,
            headers,
            body,
            source,
        }
    }
}

async fn immediate_handler(
    State(state): State<AppState>,
    client: ClientIp,
    Path(path): Path<WebhookPath>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let submission = path.into_submission(query, headers, body, client);

    let response = match state.webhooks.route_immediate(submission).await {
        Ok(upstream) => response::mirror(upstream),
        Err(e) => e.into_response(),
    };
    metrics::record_request("immediate", response.status().as_u16(), started);
    response
}

async fn queued_handler(
    State(state): State<AppState>,
    client: ClientIp,
    Path(path): Path<WebhookPath>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let submission = path.into_submission(query, headers, body, client);

    let response = match state.webhooks.route_queued(submission) {
        Ok(position) => response::queued(position),
        Err(e) => {
            tracing::debug!(code = e.code(), error = %e, "Queued submission refused");
            e.into_response()
        }
    };
    metrics::record_request("queued", response.status().as_u16(), started);
    response
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Drop expired bucket state and idle flood windows.
async fn prune_periodically(
    tracker: Arc<RateLimitTracker>,
    webhooks: Arc<WebhookRouter>,
    mut shutdown: ShutdownSignal,
) {
    let mut interval = tokio::time::interval(PRUNE_INTERVAL);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                tracker.prune();
                webhooks.guard().prune();
                tracing::trace!(buckets = tracker.bucket_count(), "Pruned rate limit state");
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Swap in reloaded `[limits]`.
async fn apply_reloads(
    mut updates: mpsc::UnboundedReceiver<LimitsConfig>,
    limits: Arc<ArcSwap<LimitsConfig>>,
) {
    while let Some(reloaded) = updates.recv().await {
        tracing::info!(
            max_backlog = reloaded.max_backlog,
            max_body_bytes = reloaded.max_body_bytes,
            flood_max_requests = reloaded.flood_max_requests,
            "Limits reloaded"
        );
        limits.store(Arc::new(reloaded));
    }
}
