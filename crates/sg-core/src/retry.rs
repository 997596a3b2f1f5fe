//! Fixed-delay retry with early stop
//!
//! Operations are retried up to `max_attempts` times with a constant pause
//! between attempts. A caller-supplied predicate marks errors that no retry
//! can fix; those end the loop immediately.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Bounded fixed-delay retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Pause between two attempts
    #[serde(with = "crate::config::serde_utils::duration_millis")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Run `op` until it succeeds, returns a terminal error, or the attempt
    /// budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, P>(&self, mut op: F, is_terminal: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if is_terminal(&e) => {
                    tracing::debug!(attempt, error = %e, "Terminal failure, not retrying");
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    tracing::warn!(attempt, error = %e, "Retry budget exhausted");
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(
                        attempt,
                        max_attempts,
                        delay_ms = self.delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
