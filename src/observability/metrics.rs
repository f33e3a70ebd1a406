//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): inbound requests by mode, status
//! - `proxy_request_duration_seconds` (histogram): inbound latency
//! - `proxy_enqueue_rejected_total` (counter): refused submissions by reason
//! - `proxy_upstream_attempts_total` (counter): upstream calls by path, status
//! - `proxy_upstream_duration_seconds` (histogram): upstream call latency
//! - `proxy_upstream_rate_limited_total` (counter): 429s by scope
//! - `proxy_deliveries_total` (counter): queued outcomes
//! - `proxy_delivery_attempts` (histogram): attempts per queued delivery
//! - `proxy_delivery_latency_seconds` (histogram): acceptance to outcome
//! - `proxy_active_queues` (gauge): live per-webhook queues
//! - `proxy_queue_backlog` (gauge): undelivered requests across queues
//!
//! # Design Decisions
//! - Labels never include webhook ids or tokens (unbounded cardinality)
//! - Status 0 means no upstream response (timeout or network failure)

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Inbound request handled. `mode` is "immediate" or "queued".
pub fn record_request(mode: &'static str, status: u16, started: Instant) {
    counter!("proxy_requests_total", "mode" => mode, "status" => status.to_string()).increment(1);
    histogram!("proxy_request_duration_seconds", "mode" => mode)
        .record(started.elapsed().as_secs_f64());
}

pub fn record_enqueue_rejected(reason: &'static str) {
    counter!("proxy_enqueue_rejected_total", "reason" => reason).increment(1);
}

pub fn record_upstream_attempt(path: &'static str, status: u16, started: Instant) {
    counter!("proxy_upstream_attempts_total", "path" => path, "status" => status.to_string())
        .increment(1);
    histogram!("proxy_upstream_duration_seconds", "path" => path)
        .record(started.elapsed().as_secs_f64());
}

pub fn record_upstream_rate_limited(scope: &str) {
    counter!("proxy_upstream_rate_limited_total", "scope" => scope.to_string()).increment(1);
}

pub fn record_delivery(outcome: &'static str, attempts: u32, latency: Duration) {
    counter!("proxy_deliveries_total", "outcome" => outcome).increment(1);
    histogram!("proxy_delivery_attempts").record(f64::from(attempts));
    histogram!("proxy_delivery_latency_seconds").record(latency.as_secs_f64());
}

pub fn queue_opened() {
    gauge!("proxy_active_queues").increment(1.0);
}

pub fn queue_closed() {
    gauge!("proxy_active_queues").decrement(1.0);
}

/// Adjust the global backlog gauge by `delta` requests.
pub fn backlog_changed(delta: f64) {
    gauge!("proxy_queue_backlog").increment(delta);
}
