//! Exponential backoff with jitter for reconnects and command retries.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    ///
    /// Doubles per attempt up to `max_delay`; the upper half of the window
    /// is randomized so reconnecting clients spread out.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(20))
            .min(self.max_delay);
        let half = ceiling / 2;
        let jitter_ms = half.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        half + Duration::from_millis(jitter)
    }

    /// Run `op`, retrying connection-class failures.
    ///
    /// `max_attempts = None` retries without limit, for blocking roles whose
    /// waits may legitimately run forever. Other errors return immediately.
    pub async fn run<T, F, Fut>(&self, what: &str, max_attempts: Option<u32>, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e)
                    if e.is_connection()
                        && max_attempts.is_none_or(|max| attempt + 1 < max) =>
                {
                    let delay = self.delay(attempt);
                    warn!(
                        operation = what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "store connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
