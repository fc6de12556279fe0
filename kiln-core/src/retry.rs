use std::future::Future;
use std::time::Duration;

use tokio_retry::{strategy::FixedInterval, Retry};

/// Bounded retry with a fixed (possibly zero) delay between attempts.
///
/// The policy is a plain value so callers can be exercised in tests without
/// touching whatever operation they wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Runs `op` until it succeeds or `max_attempts` results have been
    /// consumed, returning the last error if every attempt fails.
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let strategy = FixedInterval::new(self.delay).take(self.max_attempts.saturating_sub(1));
        Retry::spawn(strategy, op).await
    }
}
