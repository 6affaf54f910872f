//! Minimum-spacing rate limiter

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Guarantees at least `interval` between the starts of consecutive calls.
///
/// Callers arriving early are delayed, never rejected. The lock is held
/// while waiting, so concurrent callers are released one at a time in
/// arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next slot and claim it
    pub async fn acquire(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.interval).await;
        }
        *last = Some(Instant::now());
    }
}
