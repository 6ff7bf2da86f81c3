//! Bounded exponential backoff for store (re)connection.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use cadence_core::SchedulerConfig;

/// How often and how patiently an operation against the store is retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn connect(config: &SchedulerConfig) -> Self {
        Self::with_attempts(config.connect_retries, config)
    }

    pub fn reconnect(config: &SchedulerConfig) -> Self {
        Self::with_attempts(config.reconnect_retries, config)
    }

    fn with_attempts(attempts: u32, config: &SchedulerConfig) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (0-based): base * 2^attempt, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// Returns the last error together with the number of attempts made.
    pub async fn run<T, E, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T, (u32, E)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.attempts {
                        return Err((attempt, err));
                    }
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        op = op_name,
                        attempt,
                        max_attempts = self.attempts,
                        delay_ms = delay.as_millis() as u64,
                        "{op_name} failed: {err}; retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
