//! Per-adapter minimum-interval rate limiter (§4.1 step 3, §5 Rate limit).

use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Enforces a minimum interval between successive admitted requests on one
/// adapter. Concurrent callers queue on the internal mutex in FIFO order
/// (§5: "within one adapter, requests are not reordered").
pub struct RateLimiter {
    min_interval: Duration,
    last_request_at: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, last_request_at: Mutex::new(None) }
    }

    /// Block until `min_interval` has elapsed since the previous caller's
    /// `acquire` returned, then reserve the slot for this caller.
    pub async fn acquire(&self) {
        let mut last = self.last_request_at.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant as StdInstant;

    #[tokio::test]
    async fn test_min_interval_enforced_across_concurrent_callers() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(50)));
        let start = StdInstant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                start.elapsed()
            }));
        }

        let mut elapsed_times = Vec::new();
        for handle in handles {
            elapsed_times.push(handle.await.unwrap());
        }
        elapsed_times.sort();

        for pair in elapsed_times.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap + Duration::from_millis(5) >= Duration::from_millis(50), "gap {gap:?} too small");
        }
    }

    #[tokio::test]
    async fn test_single_caller_not_delayed() {
        let limiter = RateLimiter::new(Duration::from_secs(10));
        let start = StdInstant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
