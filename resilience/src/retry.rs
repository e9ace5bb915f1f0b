//! Retry coordinator: bounded retries, backoff, per-attempt timeout and
//! circuit breaking around one downstream call

use crate::{
    BreakerRegistry, CircuitBreakerConfig, CircuitState, Classify, Error, FailureClass,
    RetryPolicy,
};
use std::fmt::Display;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why the retry loop stopped without a success
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Failure class forbids retrying
    NonRetryable,
    /// Attempt cap reached
    Exhausted,
    /// Shutdown requested between attempts
    Cancelled,
}

/// Successful outcome
#[derive(Debug)]
pub struct RetrySuccess<T> {
    /// Value returned by the call
    pub value: T,
    /// Attempts made, the successful one included
    pub attempts: u32,
}

/// Terminal failure handed back to the caller
#[derive(Debug)]
pub struct RetryFailure<E> {
    /// Last error observed
    pub error: E,
    /// Attempts made
    pub attempts: u32,
    /// Attempt cap that applied to the last error's class
    pub max_attempts: u32,
    /// Why the loop stopped
    pub stop: StopReason,
}

/// Wraps fallible async calls with retry, backoff, timeout and circuit breaking
#[derive(Debug)]
pub struct RetryCoordinator {
    breakers: BreakerRegistry,
}

impl RetryCoordinator {
    /// Create new coordinator; breakers are created lazily per dependency
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: BreakerRegistry::new(breaker_config),
        }
    }

    /// Circuit state for a dependency
    pub fn circuit_state(&self, dependency: &str) -> CircuitState {
        self.breakers.state(dependency)
    }

    /// Read-only access to the breaker registry
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Run `op` until it succeeds, fails permanently, exhausts the policy or
    /// `cancel` fires. `op` receives the 1-based attempt number.
    ///
    /// A cancelled token never interrupts an attempt in flight; it is checked
    /// before each pause and aborts the pause itself.
    pub async fn execute<T, E, F, Fut>(
        &self,
        dependency: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<RetrySuccess<T>, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + From<Error> + Display,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let result = match self.breakers.try_acquire(dependency) {
                Err(open) => {
                    debug!(dependency, attempt, "Fast-failing call: {}", open);
                    Err(E::from(open))
                }
                Ok(permit) => {
                    let outcome =
                        match tokio::time::timeout(policy.attempt_timeout(), op(attempt)).await {
                            Ok(outcome) => outcome,
                            Err(_) => Err(E::from(Error::Timeout {
                                dependency: dependency.to_string(),
                                timeout_ms: policy.attempt_timeout_ms,
                            })),
                        };

                    match &outcome {
                        Ok(_) => permit.success(),
                        Err(e) if e.failure_class() == FailureClass::Permanent => permit.ignore(),
                        Err(_) => permit.failure(),
                    }
                    outcome
                }
            };

            let error = match result {
                Ok(value) => {
                    return Ok(RetrySuccess {
                        value,
                        attempts: attempt,
                    })
                }
                Err(error) => error,
            };

            let class = error.failure_class();
            let limit = policy.attempt_limit(class);

            if class == FailureClass::Permanent {
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    max_attempts: limit,
                    stop: StopReason::NonRetryable,
                });
            }

            if attempt >= limit {
                warn!(
                    dependency,
                    attempts = attempt,
                    "Retries exhausted: {}",
                    error
                );
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    max_attempts: limit,
                    stop: StopReason::Exhausted,
                });
            }

            if cancel.is_cancelled() {
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    max_attempts: limit,
                    stop: StopReason::Cancelled,
                });
            }

            let delay = policy.delay_after(attempt);
            warn!(
                dependency,
                attempt,
                max_attempts = limit,
                delay_ms = delay.as_millis() as u64,
                "Attempt failed, backing off: {}",
                error
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                        max_attempts: limit,
                        stop: StopReason::Cancelled,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug)]
    enum TestError {
        Transient,
        Invalid,
        Unknown,
        Infra(Error),
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl From<Error> for TestError {
        fn from(e: Error) -> Self {
            TestError::Infra(e)
        }
    }

    impl Classify for TestError {
        fn failure_class(&self) -> FailureClass {
            match self {
                TestError::Transient => FailureClass::Transient,
                TestError::Invalid => FailureClass::Permanent,
                TestError::Unknown => FailureClass::Unclassified,
                TestError::Infra(e) => e.failure_class(),
            }
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            max_unclassified_attempts: 2.min(max_attempts),
            initial_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 4,
            attempt_timeout_ms: 200,
        }
    }

    fn coordinator() -> RetryCoordinator {
        RetryCoordinator::new(CircuitBreakerConfig {
            failure_threshold: 100,
            failure_window_ms: 60_000,
            cool_down_ms: 60_000,
        })
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result = coordinator()
            .execute("dep", &fast_policy(3), &cancel, |_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError::Transient)
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result.value, "done");
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_never_exceeds_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let failure = coordinator()
            .execute("dep", &fast_policy(4), &cancel, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError::Transient)
                }
            })
            .await
            .unwrap_err();

        assert_eq!(failure.stop, StopReason::Exhausted);
        assert_eq!(failure.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let failure = coordinator()
            .execute("dep", &fast_policy(5), &cancel, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError::Invalid)
                }
            })
            .await
            .unwrap_err();

        assert_eq!(failure.stop, StopReason::NonRetryable);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unclassified_errors_use_lower_cap() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let failure = coordinator()
            .execute("dep", &fast_policy(5), &cancel, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError::Unknown)
                }
            })
            .await
            .unwrap_err();

        assert_eq!(failure.stop, StopReason::Exhausted);
        assert_eq!(failure.max_attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_transient() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            attempt_timeout_ms: 10,
            ..fast_policy(2)
        };

        let failure = coordinator()
            .execute("slow", &policy, &cancel, |_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<(), TestError>(())
            })
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 2);
        assert!(matches!(
            failure.error,
            TestError::Infra(Error::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast_without_calling() {
        let coordinator = RetryCoordinator::new(CircuitBreakerConfig {
            failure_threshold: 2,
            failure_window_ms: 60_000,
            cool_down_ms: 60_000,
        });
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let failure = coordinator
            .execute("down", &fast_policy(3), &cancel, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError::Transient)
                }
            })
            .await
            .unwrap_err();

        // Third attempt is rejected by the open breaker
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(failure.attempts, 3);
        assert!(matches!(
            failure.error,
            TestError::Infra(Error::CircuitOpen { .. })
        ));
        assert_eq!(coordinator.circuit_state("down"), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_attempts() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            initial_delay_ms: 5_000,
            max_delay_ms: 5_000,
            ..fast_policy(3)
        };

        let token = cancel.clone();
        let failure = coordinator()
            .execute("dep", &policy, &cancel, |_| {
                let calls = calls.clone();
                let token = token.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    token.cancel();
                    Err::<(), _>(TestError::Transient)
                }
            })
            .await
            .unwrap_err();

        assert_eq!(failure.stop, StopReason::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
