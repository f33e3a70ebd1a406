//! Per-source flood protection for the queued path.
//!
//! Sliding-window counter: each source address may enqueue at most
//! `max_requests` times within any `window`. Rejections report how long
//! until the oldest counted submission leaves the window.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct FloodGuard {
    windows: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl FloodGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one submission from `source`.
    ///
    /// Returns the wait before the source may submit again if it is over
    /// the limit. Rejected submissions are not counted.
    pub fn check(&self, source: IpAddr, window: Duration, max_requests: u32) -> Result<(), Duration> {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("flood guard mutex poisoned");
        let hits = windows.entry(source).or_default();

        while hits.front().is_some_and(|t| now.duration_since(*t) >= window) {
            hits.pop_front();
        }

        if hits.len() >= max_requests as usize {
            let oldest = hits.front().copied().unwrap_or(now);
            return Err((oldest + window).saturating_duration_since(now));
        }

        hits.push_back(now);
        Ok(())
    }

    /// Uncount the most recent submission from `source`.
    pub fn refund(&self, source: IpAddr) {
        let mut windows = self.windows.lock().expect("flood guard mutex poisoned");
        if let Some(hits) = windows.get_mut(&source) {
            hits.pop_back();
        }
    }

    /// Forget sources with no submissions inside the window.
    pub fn prune(&self, window: Duration) {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("flood guard mutex poisoned");
        windows.retain(|_, hits| hits.back().is_some_and(|t| now.duration_since(*t) < window));
    }

    pub fn tracked_sources(&self) -> usize {
        self.windows.lock().expect("flood guard mutex poisoned").len()
    }
}
