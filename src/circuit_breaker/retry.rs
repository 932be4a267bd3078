use super::backoff::calculate_backoff;
use super::types::RetryConfig;
use crate::error::{Classify, ResilienceError};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-call retry decision, given the failure and the number of attempts made so far
type CallPredicate<'a, E> = &'a (dyn Fn(&ResilienceError<E>, u32) -> bool + Sync);

/// Retry executor with configurable backoff
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    name: String,
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        let name = name.into();
        debug!(
            dependency = %name,
            max_attempts = config.max_attempts,
            strategy = %config.strategy,
            "Creating retry executor"
        );
        Self { name, config }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute a function with retries.
    ///
    /// The function reports failures as [`ResilienceError`], so a breaker call can be
    /// passed directly; plain operations wrap their error in
    /// [`ResilienceError::Operation`].
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        E: Classify + 'static,
    {
        self.run(f, None, None).await
    }

    /// Execute with retries, deciding retryability with `should_retry` instead of the
    /// configured classification
    pub async fn execute_with_predicate<F, Fut, T, E, P>(
        &self,
        f: F,
        should_retry: P,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        E: Classify + 'static,
        P: Fn(&ResilienceError<E>, u32) -> bool + Sync,
    {
        self.run(f, Some(&should_retry), None).await
    }

    /// Execute with retries until done or `token` is cancelled
    pub async fn execute_with_cancellation<F, Fut, T, E>(
        &self,
        f: F,
        token: &CancellationToken,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        E: Classify + 'static,
    {
        self.run(f, None, Some(token)).await
    }

    pub async fn execute_with_predicate_and_cancellation<F, Fut, T, E, P>(
        &self,
        f: F,
        should_retry: P,
        token: &CancellationToken,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        E: Classify + 'static,
        P: Fn(&ResilienceError<E>, u32) -> bool + Sync,
    {
        self.run(f, Some(&should_retry), Some(token)).await
    }

    async fn run<F, Fut, T, E>(
        &self,
        mut f: F,
        should_retry: Option<CallPredicate<'_, E>>,
        token: Option<&CancellationToken>,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        E: Classify + 'static,
    {
        let never_cancelled = CancellationToken::new();
        let token = token.unwrap_or(&never_cancelled);
        let mut attempt: u32 = 0;

        loop {
            if token.is_cancelled() {
                return Err(self.cancelled(attempt));
            }

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.cancelled(attempt)),
                outcome = f() => outcome,
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        info!(
                            dependency = %self.name,
                            attempt = attempt + 1,
                            "Call succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => e,
            };

            attempt += 1;

            let retryable = match should_retry {
                Some(should_retry) => should_retry(&error, attempt),
                None => self.config.is_retryable(&error),
            };

            if !retryable {
                warn!(
                    dependency = %self.name,
                    attempt,
                    kind = %error.kind(),
                    error = %error,
                    "Call failed with non-retryable error"
                );
                return Err(self.exhausted(attempt, error));
            }

            if attempt > self.config.max_attempts {
                warn!(
                    dependency = %self.name,
                    attempt,
                    max_attempts = self.config.max_attempts,
                    error = %error,
                    "Call failed after max retries"
                );
                return Err(self.exhausted(attempt, error));
            }

            let delay = calculate_backoff(attempt, &self.config);
            warn!(
                dependency = %self.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Call failed, retrying after backoff"
            );

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.cancelled(attempt)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn exhausted<E>(&self, attempts: u32, last_error: ResilienceError<E>) -> ResilienceError<E> {
        ResilienceError::RetryExhausted {
            dependency: self.name.clone(),
            attempts,
            last_error: Box::new(last_error),
        }
    }

    fn cancelled<E>(&self, attempts: u32) -> ResilienceError<E> {
        info!(dependency = %self.name, attempts, "Retry loop cancelled");
        ResilienceError::Cancelled {
            dependency: self.name.clone(),
        }
    }
}
