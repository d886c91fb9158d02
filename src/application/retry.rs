use crate::application::error::TimerError;
use crate::infrastructure::config::RetrySettings;
use crate::infrastructure::error::InfraError;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Called with the 1-based number of the failed attempt before each retry.
pub type RetryObserver = Arc<dyn Fn(u32, &InfraError) + Send + Sync>;

const RETRYABLE_KEYWORDS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "unavailable",
    "offline",
    "dns",
    "connection refused",
    "connection reset",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay_ms: settings.base_delay_ms,
            max_delay_ms: settings.max_delay_ms,
            jitter_ms: settings.jitter_ms,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^attempt, max)` plus uniform jitter in `0..=jitter_ms`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt));
        let capped = exponential.min(self.max_delay_ms);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }
}

pub fn is_retryable(error: &InfraError) -> bool {
    match error {
        InfraError::Remote(message) => {
            let message = message.to_ascii_lowercase();
            RETRYABLE_KEYWORDS
                .iter()
                .any(|keyword| message.contains(keyword))
        }
        InfraError::Io(error) => matches!(
            error.kind(),
            std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected
        ),
        _ => false,
    }
}

fn log_retry(attempt: u32, error: &InfraError) {
    tracing::warn!(attempt, %error, "remote operation failed, retrying");
}

#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    observer: RetryObserver,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            observer: Arc::new(log_retry),
        }
    }

    pub fn with_observer(mut self, observer: RetryObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `op` until it succeeds, fails fatally, or `max_attempts` is used up.
    /// Exhaustion yields [`TimerError::NetworkRetryExhausted`] carrying the last error.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, TimerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InfraError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if is_retryable(&error) => {
                    attempt = attempt.saturating_add(1);
                    if attempt >= max_attempts {
                        return Err(TimerError::NetworkRetryExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            source: error,
                        });
                    }
                    (self.observer)(attempt, &error);
                    let delay = self.policy.backoff_delay(attempt - 1);
                    tracing::debug!(operation, attempt, delay_ms = delay.as_millis() as u64, "backing off");
                    sleep(delay).await;
                }
                Err(error) => return Err(TimerError::from(error)),
            }
        }
    }
}
