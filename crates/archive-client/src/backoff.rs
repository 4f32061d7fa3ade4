use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Failures served from the short fixed window before the window starts growing.
const FAST_RETRIES: u32 = 10;
const FAST_WINDOW_SECS: f64 = 0.25;
const GROWTH_PER_FAILURE_SECS: f64 = 0.25;
const MAX_WAIT_SECS: f64 = 5.0;

/// Jittered wait between attempts of a transaction that was refused a lock.
///
/// Use one instance per retry loop. The first ten waits are drawn from
/// `[0, 0.25s]`; after that the window slides upward linearly and is capped at 5s.
#[derive(Debug, Default, Clone)]
pub struct LockBackoff {
    failures: u32,
}

impl LockBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn minimum_wait(&self) -> Duration {
        if self.failures < FAST_RETRIES {
            return Duration::ZERO;
        }
        let grown = GROWTH_PER_FAILURE_SECS * f64::from(self.failures - FAST_RETRIES);
        Duration::from_secs_f64(grown.min(MAX_WAIT_SECS - 2.0 * FAST_WINDOW_SECS))
    }

    pub fn maximum_wait(&self) -> Duration {
        if self.failures < FAST_RETRIES {
            return Duration::from_secs_f64(FAST_WINDOW_SECS);
        }
        let upper = self.minimum_wait().as_secs_f64() + 2.0 * FAST_WINDOW_SECS;
        Duration::from_secs_f64(upper.min(MAX_WAIT_SECS))
    }

    /// Draws the next delay and counts the failure.
    pub fn next_delay(&mut self) -> Duration {
        let low = self.minimum_wait().as_secs_f64();
        let high = self.maximum_wait().as_secs_f64();
        let delay = if high > low {
            rand::thread_rng().gen_range(low..=high)
        } else {
            low
        };
        self.failures = self.failures.saturating_add(1);
        Duration::from_secs_f64(delay)
    }

    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        debug!(
            failures = self.failures,
            delay_ms = delay.as_millis() as u64,
            "backing off after lock denial"
        );
        tokio::time::sleep(delay).await;
    }

    /// Resets the failure count after a successful attempt.
    pub fn clear(&mut self) {
        self.failures = 0;
    }
}
