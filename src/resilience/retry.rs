//! Bounded exponential backoff with jitter around a fallible operation.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, OrkestraError};

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    fn delay_for(&self, attempt: u32) -> Duration {
        let raw_ms = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(attempt as i32);
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);
        if !self.jitter {
            return Duration::from_millis(capped_ms as u64);
        }
        let jitter_factor = rand::thread_rng().gen_range(-0.3..=0.3);
        let jittered_ms = (capped_ms * (1.0 + jitter_factor)).max(0.0);
        Duration::from_millis(jittered_ms as u64)
    }
}

/// Runs `op` up to `max_attempts` times total (1 initial + retries), waiting
/// between attempts per the configured backoff. `op` must return an
/// [`OrkestraError`] whose `kind` drives the retriable classification in
/// [`ErrorKind::is_retriable`].
pub async fn retry_with_backoff<F, Fut, T>(config: &RetryConfig, mut op: F) -> Result<T, OrkestraError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, OrkestraError>>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    info!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                let is_last = attempt + 1 >= config.max_attempts;
                if !err.kind.is_retriable() {
                    warn!(kind = %err.kind, "non-retriable error, propagating immediately");
                    return Err(err);
                }
                if is_last {
                    warn!(attempts = attempt + 1, "retries exhausted");
                    return Err(OrkestraError::retries_exhausted(attempt + 1));
                }
                let delay = config.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis(), kind = %err.kind, "retrying after error");
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
