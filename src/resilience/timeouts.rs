//! Timeout enforcement.
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities, so paused test clocks apply
//! - Timeout errors are distinct from other network errors
//! - Timed-out upstream calls are dropped, which cancels the request

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::ratelimit::headers::MAX_WAIT;
use crate::upstream::UpstreamError;

/// Run an upstream call with a deadline.
pub async fn with_deadline<F, T>(deadline: Duration, call: F) -> Result<T, UpstreamError>
where
    F: Future<Output = Result<T, UpstreamError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(UpstreamError::Timeout(deadline)),
    }
}

/// `from + wait`, falling back to `from + MAX_WAIT` where the sum is not
/// representable.
pub fn deadline_after(from: Instant, wait: Duration) -> Instant {
    from.checked_add(wait)
        .or_else(|| from.checked_add(MAX_WAIT))
        .unwrap_or(from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_deadline_falls_back() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(2)), now + Duration::from_secs(2));
        assert_eq!(deadline_after(now, Duration::MAX), now + MAX_WAIT);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_is_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(11)).await;
            Ok::<_, UpstreamError>(())
        };
        let err = with_deadline(Duration::from_secs(10), slow).await.unwrap_err();
        assert_eq!(err, UpstreamError::Timeout(Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn inner_error_passes_through() {
        let failing = async { Err::<(), _>(UpstreamError::Network("reset".into())) };
        let err = with_deadline(Duration::from_secs(10), failing).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Network(_)));
    }
}
