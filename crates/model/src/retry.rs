//! Bounded retry with exponential backoff for model calls.
//!
//! Only transient errors (per [`Error::is_transient`]) are retried;
//! invalid input and fatal conditions surface immediately. Each attempt
//! runs under its own timeout.

use std::future::Future;
use std::time::Duration;

use lum_domain::config::AgentConfig;
use lum_domain::{Error, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-attempt timeout.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_agent_config(cfg: &AgentConfig) -> Self {
        Self {
            max_attempts: cfg.model_retries.max(1),
            attempt_timeout: Duration::from_millis(cfg.model_timeout_ms),
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), with jitter of up
    /// to half the capped exponential delay.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let capped = exp.min(self.max_delay);
        let half_ms = (capped.as_millis() as u64) / 2;
        capped + Duration::from_millis(fastrand::u64(0..=half_ms))
    }
}

/// Run `f` until it succeeds, the error is non-transient, or the
/// attempt bound is exhausted.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err: Option<Error> = None;

    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            let delay = policy.backoff_delay(attempt - 1);
            tracing::warn!(
                op,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %last_err.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                "retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
        }

        match tokio::time::timeout(policy.attempt_timeout, f()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if e.is_transient() => last_err = Some(e),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                last_err = Some(Error::Timeout(format!(
                    "{op}: attempt exceeded {}ms",
                    policy.attempt_timeout.as_millis()
                )))
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::Other(format!("{op}: no attempts made"))))
}
