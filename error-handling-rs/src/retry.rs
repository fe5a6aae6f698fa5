//! # Retry Mechanism
//!
//! Bounded retries with exponential backoff, jitter, a per-attempt timeout
//! and cooperative cancellation, for slow collaborator calls.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::types::Classify;

/// Configuration for a retry policy
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Base duration for exponential backoff
    pub base_backoff: Duration,
    /// Maximum backoff time
    pub max_backoff: Duration,
    /// Jitter factor (0.0 - 1.0) added on top of the backoff
    pub jitter_factor: f64,
    /// Time budget for a single attempt
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            jitter_factor: 0.1,
            attempt_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Why a retried operation ultimately failed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Last attempt returned an error that was final or out of budget.
    Exhausted {
        operation: String,
        attempts: usize,
        last_error: E,
    },
    /// Last attempt exceeded the per-attempt timeout.
    TimedOut {
        operation: String,
        attempts: usize,
        timeout: Duration,
    },
    /// The cancel signal fired before the operation completed.
    Cancelled { operation: String, attempts: usize },
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted {
                operation,
                attempts,
                last_error,
            } => write!(
                f,
                "operation '{}' failed after {} attempt(s): {}",
                operation, attempts, last_error
            ),
            RetryError::TimedOut {
                operation,
                attempts,
                timeout,
            } => write!(
                f,
                "operation '{}' timed out after {} attempt(s) of {}ms",
                operation,
                attempts,
                timeout.as_millis()
            ),
            RetryError::Cancelled {
                operation,
                attempts,
            } => write!(
                f,
                "operation '{}' cancelled after {} attempt(s)",
                operation, attempts
            ),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::TimedOut { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

enum Attempt<T, E> {
    Done(T),
    Failed(E),
    TimedOut,
}

/// A named retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    name: String,
}

impl RetryPolicy {
    /// Creates a new retry policy with the given name and configuration
    pub fn new<S: Into<String>>(name: S, config: Option<RetryConfig>) -> Self {
        Self {
            config: config.unwrap_or_default(),
            name: name.into(),
        }
    }

    /// Creates a policy for operations that should never be retried
    pub fn never() -> Self {
        Self::new(
            "never",
            Some(RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            }),
        )
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `f` until it succeeds, fails with a non-transient error, runs out
    /// of retries, or `cancel` fires. `f` receives the 1-based attempt number.
    pub async fn run<F, Fut, T, E>(
        &self,
        operation: &str,
        cancel: &CancelSignal,
        mut f: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let start = Instant::now();
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    operation: operation.to_string(),
                    attempts: attempt,
                });
            }
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(operation = %operation, attempt, "Operation cancelled mid-attempt");
                    return Err(RetryError::Cancelled {
                        operation: operation.to_string(),
                        attempts: attempt,
                    });
                }
                outcome = self.attempt(f(attempt)) => outcome,
            };

            match outcome {
                Attempt::Done(value) => {
                    if attempt > 1 {
                        info!(
                            operation = %operation,
                            policy = %self.name,
                            attempt,
                            duration_ms = %start.elapsed().as_millis(),
                            "Operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Attempt::Failed(error) => {
                    let transient = error.kind().is_transient();
                    if !transient || attempt >= max_attempts {
                        warn!(
                            operation = %operation,
                            policy = %self.name,
                            attempt,
                            transient,
                            error = %error,
                            "Giving up after retries"
                        );
                        return Err(RetryError::Exhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            last_error: error,
                        });
                    }
                    debug!(operation = %operation, attempt, error = %error, "Retrying after error");
                }
                Attempt::TimedOut => {
                    let timeout = self.config.attempt_timeout.unwrap_or_default();
                    if attempt >= max_attempts {
                        warn!(
                            operation = %operation,
                            policy = %self.name,
                            attempt,
                            timeout_ms = %timeout.as_millis(),
                            "Operation timed out"
                        );
                        return Err(RetryError::TimedOut {
                            operation: operation.to_string(),
                            attempts: attempt,
                            timeout,
                        });
                    }
                    debug!(operation = %operation, attempt, "Attempt timed out, retrying");
                }
            }

            metrics::increment_counter!(
                "incident_retry_attempts_total",
                "operation" => operation.to_string()
            );
            let backoff = self.backoff_for(attempt);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        operation: operation.to_string(),
                        attempts: attempt,
                    });
                }
                _ = sleep(backoff) => {}
            }
        }
    }

    async fn attempt<Fut, T, E>(&self, fut: Fut) -> Attempt<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let result = match self.config.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => return Attempt::TimedOut,
            },
            None => fut.await,
        };
        match result {
            Ok(value) => Attempt::Done(value),
            Err(error) => Attempt::Failed(error),
        }
    }

    /// Exponential backoff for the given (1-based) failed attempt, with jitter.
    fn backoff_for(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as u32;
        let base = self
            .config
            .base_backoff
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.config.max_backoff);
        let jitter = self.config.jitter_factor.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.0..=jitter);
        base + base.mul_f64(factor)
    }
}

impl fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RetryPolicy({}, max_retries={})",
            self.name, self.config.max_retries
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::types::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct FlakyError(ErrorKind);

    impl fmt::Display for FlakyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "flaky: {}", self.0)
        }
    }

    impl Classify for FlakyError {
        fn kind(&self) -> ErrorKind {
            self.0.clone()
        }
    }

    fn fast_policy(max_retries: usize, timeout_ms: Option<u64>) -> RetryPolicy {
        RetryPolicy::new(
            "test",
            Some(RetryConfig {
                max_retries,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                jitter_factor: 0.0,
                attempt_timeout: timeout_ms.map(Duration::from_millis),
            }),
        )
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = fast_policy(3, None);
        let result = policy
            .run("flaky", &CancelSignal::never(), |_| {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(FlakyError(ErrorKind::Communication))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.expect("third attempt succeeds"), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_error_fails_immediately() {
        let policy = fast_policy(5, None);
        let result: Result<(), _> = policy
            .run("invalid", &CancelSignal::never(), |_| async {
                Err(FlakyError(ErrorKind::Validation))
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert!(matches!(err, RetryError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn slow_attempts_time_out() {
        let policy = fast_policy(1, Some(5));
        let result: Result<(), RetryError<FlakyError>> = policy
            .run("slow", &CancelSignal::never(), |_| async {
                sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;

        match result.unwrap_err() {
            RetryError::TimedOut { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected timeout, got {}", other),
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_attempt() {
        let (handle, signal) = cancel_pair();
        let policy = fast_policy(0, None);

        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });

        let result: Result<(), RetryError<FlakyError>> = policy
            .run("hang", &signal, |_| async {
                sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;

        canceller.await.expect("canceller task");
        assert!(result.unwrap_err().is_cancelled());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = fast_policy(5, None);
        assert_eq!(policy.backoff_for(1), Duration::from_millis(1));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(2));
        assert_eq!(policy.backoff_for(10), Duration::from_millis(5));
    }
}
