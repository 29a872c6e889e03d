//! Retry executor with per-attempt timeout, jittered backoff and cancellation.
//!
//! # Policy
//!
//! ```text
//! attempt 1 ──fail(transient)──▶ sleep(base·2⁰ + rand[0,base]) ──▶ attempt 2 ──▶ ...
//!     │                                                                  │
//!     └──fail(permanent)──▶ Err immediately       last attempt fails ──▶ Err(last error)
//! ```
//!
//! - `max_retries` is the total number of attempts (default 3).
//! - Every attempt runs under `timeout` (default 60s). An elapsed attempt
//!   becomes [`LlmError::Timeout`], which is transient, so only the final
//!   attempt surfaces it to the caller.
//! - The cancellation token is raced against both the attempt and the backoff
//!   sleep; cancelling drops the in-flight future (aborting the HTTP call) and
//!   yields [`LlmError::Cancelled`].
//!
//! # Usage
//!
//! ```ignore
//! use edgequake_orchestrator::retry::{RetryExecutor, RetryPolicy};
//!
//! let executor = RetryExecutor::new(RetryPolicy::default());
//! let response = executor
//!     .execute(&cancel, |_attempt| async { provider.complete(&request).await })
//!     .await?;
//! ```

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{LlmError, Result};

/// Retry/timeout parameters for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retries: u32,
    /// Backoff base delay.
    pub base_delay: Duration,
    /// Hard timeout for a single attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Policy with a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            ..Default::default()
        }
    }

    /// Set the total attempt count (minimum 1).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Set the backoff base delay.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Delay after the `failed_attempt`-th failure (0-based):
    /// `base * 2^failed_attempt + random(0, base)`.
    pub fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(1u32 << failed_attempt.min(16));
        let base_ms = self.base_delay.as_millis() as u64;
        let jitter = if base_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=base_ms))
        };
        exponential.saturating_add(jitter)
    }
}

/// Executes an async operation under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    log_retries: bool,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryExecutor {
    /// Create a new retry executor.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            log_retries: true,
        }
    }

    /// Create a retry executor without logging.
    pub fn silent(policy: RetryPolicy) -> Self {
        Self {
            policy,
            log_retries: false,
        }
    }

    /// The policy in effect.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation`, retrying transient failures.
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_if(cancel, LlmError::is_transient, operation)
            .await
    }

    /// Like [`RetryExecutor::execute`], with a caller-supplied retry predicate.
    ///
    /// The predicate is consulted after every failure except the last.
    pub async fn execute_if<F, Fut, T, P>(
        &self,
        cancel: &CancellationToken,
        should_retry: P,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&LlmError) -> bool,
    {
        let max_attempts = self.policy.max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                outcome = tokio::time::timeout(self.policy.timeout, operation(attempt)) => outcome,
            };

            let error = match outcome {
                Ok(Ok(value)) => {
                    if attempt > 1 && self.log_retries {
                        info!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => LlmError::Timeout {
                    after: self.policy.timeout,
                },
            };

            if !should_retry(&error) {
                if self.log_retries {
                    debug!(attempt, error = %error, "Error is non-retryable, stopping");
                }
                return Err(error);
            }

            if attempt >= max_attempts {
                if self.log_retries {
                    warn!(attempts = attempt, error = %error, "Operation failed, giving up");
                }
                return Err(error);
            }

            let delay = self.policy.backoff_delay(attempt - 1);
            if self.log_retries {
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, retrying"
                );
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                _ = sleep(delay) => {}
            }
        }
    }
}
