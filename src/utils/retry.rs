use anyhow::{Error, Result, anyhow};
use std::{fmt::Display, future::Future, time::Duration};
use tokio::time::sleep;
use tracing::{error, warn};

use crate::utils::strip_html;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential: f64,
}

impl Default for RetryConfig {
    /// Used for connecting to the ledger, broker and database at startup.
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            exponential: 2.0,
        }
    }
}

impl RetryConfig {
    /// Short retries inside one poll cycle. A cycle that still fails is retried by the
    /// next cycle anyway.
    pub fn poll() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 2_000,
            exponential: 2.0,
        }
    }

    /// Publishing a captured event. The cursor cannot move until this succeeds, so it
    /// keeps trying for several minutes before giving up.
    pub fn publish() -> Self {
        Self {
            max_attempts: 12,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            exponential: 2.0,
        }
    }

    /// Delay to wait after attempt `attempt` (1-based) failed, before jitter.
    pub fn backoff_ceiling(&self, attempt: u32) -> u64 {
        let exp = self.exponential.powi(attempt.saturating_sub(1) as i32);
        let delay = self.base_delay_ms as f64 * exp;
        if delay.is_finite() {
            (delay as u64).min(self.max_delay_ms)
        } else {
            self.max_delay_ms
        }
    }
}

/// Full jitter: uniformly random in `[0, ceiling]`.
/// https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/
pub fn jittered(ceiling_ms: u64) -> Duration {
    Duration::from_millis((fastrand::f64() * ceiling_ms as f64) as u64)
}

pub async fn retry<F, Fut, T, E>(operation: F, config: &RetryConfig, context: &str) -> Result<T, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let message = strip_html(&e.to_string());
                if attempt >= config.max_attempts {
                    error!(
                        "Operation '{}' failed after {} attempts. Final error: {}",
                        context, attempt, message
                    );
                    return Err(anyhow!(message).context(format!(
                        "'{}' failed after {} attempts",
                        context, attempt
                    )));
                }

                let delay = jittered(config.backoff_ceiling(attempt));
                warn!(
                    "Attempt {}/{} for '{}' failed: {}. Retrying in {}ms...",
                    attempt,
                    config.max_attempts,
                    context,
                    message,
                    delay.as_millis()
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
