use super::types::{CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
use crate::error::ResilienceError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker guarding a single dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Dependency name
    name: String,
    /// Configuration
    config: CircuitBreakerConfig,
    /// Current state, only touched under this lock
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    /// Current circuit state
    circuit_state: CircuitState,
    /// Consecutive failures counted toward opening
    failure_count: u32,
    /// Consecutive successes in half-open state
    success_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    /// Present exactly while the circuit is open
    opened_at: Option<OpenedAt>,
    /// Most recent transition into open, kept after recovery
    last_opened: Option<OpenedAt>,
    /// Trial calls in flight while half-open
    half_open_in_flight: u32,
    /// Bumped on every entry into half-open and on reset, so stale permits release nothing
    trial_generation: u64,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    times_opened: u64,
}

#[derive(Debug, Clone, Copy)]
struct OpenedAt {
    instant: Instant,
    wall: DateTime<Utc>,
}

impl OpenedAt {
    fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: Utc::now(),
        }
    }
}

impl State {
    fn new(trial_generation: u64) -> Self {
        Self {
            circuit_state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
            last_opened: None,
            half_open_in_flight: 0,
            trial_generation,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            times_opened: 0,
        }
    }
}

/// Admission ticket for one call; releases its half-open trial slot if dropped unsettled
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: Option<u64>,
}

impl Permit<'_> {
    fn settle(mut self) -> Option<u64> {
        self.trial.take()
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.trial.take() {
            let mut state = self.breaker.state.lock();
            release_trial(&mut state, Some(generation));
            debug!(
                dependency = %self.breaker.name,
                "Half-open trial abandoned before completing"
            );
        }
    }
}

fn release_trial(state: &mut State, trial: Option<u64>) {
    if let Some(generation) = trial {
        if state.circuit_state == CircuitState::HalfOpen && state.trial_generation == generation {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            dependency = %name,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            open_timeout = ?config.open_timeout,
            "Creating circuit breaker"
        );

        Self {
            name,
            config,
            state: Mutex::new(State::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` through the breaker.
    ///
    /// Fails with [`ResilienceError::CircuitOpen`] without invoking the operation while
    /// the circuit is open, otherwise returns the operation's own result. The lock is
    /// never held while the operation runs.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let permit = match self.try_acquire() {
            Ok(permit) => permit,
            Err(retry_after) => {
                return Err(ResilienceError::CircuitOpen {
                    dependency: self.name.clone(),
                    retry_after,
                })
            }
        };

        match operation().await {
            Ok(value) => {
                self.record_success(permit.settle());
                Ok(value)
            }
            Err(e) => {
                self.record_failure(permit.settle(), &e);
                Err(ResilienceError::Operation(e))
            }
        }
    }

    /// Force the breaker closed and clear every counter and timestamp
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let previous = state.circuit_state;
        *state = State::new(state.trial_generation.wrapping_add(1));
        info!(
            dependency = %self.name,
            previous_state = %previous,
            "Circuit breaker manually reset"
        );
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.state.lock().circuit_state
    }

    /// Snapshot of counters and timestamps
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.circuit_state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            last_failure_at: state.last_failure_at,
            last_success_at: state.last_success_at,
            opened_at: state.opened_at.map(|opened| opened.wall),
            open_for: state.opened_at.map(|opened| opened.instant.elapsed()),
            last_opened_at: state.last_opened.map(|opened| opened.wall),
            since_last_opened: state.last_opened.map(|opened| opened.instant.elapsed()),
            half_open_in_flight: state.half_open_in_flight,
            total_calls: state.total_calls,
            successful_calls: state.successful_calls,
            failed_calls: state.failed_calls,
            rejected_calls: state.rejected_calls,
            times_opened: state.times_opened,
        }
    }

    /// Admit a call, or return how long the caller should wait before trying again
    fn try_acquire(&self) -> Result<Permit<'_>, Duration> {
        let mut state = self.state.lock();

        match state.circuit_state {
            CircuitState::Closed => {
                state.total_calls += 1;
                Ok(Permit {
                    breaker: self,
                    trial: None,
                })
            }
            CircuitState::Open => {
                let elapsed = match state.opened_at {
                    Some(opened) => opened.instant.elapsed(),
                    None => {
                        warn!(dependency = %self.name, "Circuit open but no opened_at timestamp");
                        self.config.open_timeout
                    }
                };

                if elapsed >= self.config.open_timeout {
                    self.transition_to_half_open(&mut state);
                    state.total_calls += 1;
                    state.half_open_in_flight += 1;
                    Ok(Permit {
                        breaker: self,
                        trial: Some(state.trial_generation),
                    })
                } else {
                    let retry_after = self.config.open_timeout - elapsed;
                    state.rejected_calls += 1;
                    debug!(
                        dependency = %self.name,
                        time_remaining = ?retry_after,
                        "Circuit breaker open, rejecting call"
                    );
                    Err(retry_after)
                }
            }
            CircuitState::HalfOpen => {
                if let Some(max) = self.config.half_open_max_calls {
                    if state.half_open_in_flight >= max {
                        state.rejected_calls += 1;
                        debug!(
                            dependency = %self.name,
                            in_flight = state.half_open_in_flight,
                            max,
                            "Max half-open trials in flight, rejecting call"
                        );
                        return Err(Duration::ZERO);
                    }
                }

                state.total_calls += 1;
                state.half_open_in_flight += 1;
                debug!(
                    dependency = %self.name,
                    in_flight = state.half_open_in_flight,
                    "Allowing half-open trial call"
                );
                Ok(Permit {
                    breaker: self,
                    trial: Some(state.trial_generation),
                })
            }
        }
    }

    fn record_success(&self, trial: Option<u64>) {
        let mut state = self.state.lock();
        release_trial(&mut state, trial);
        state.successful_calls += 1;
        state.last_success_at = Some(Utc::now());

        match state.circuit_state {
            CircuitState::Closed => {
                // A single success wipes accumulated failures
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;

                debug!(
                    dependency = %self.name,
                    success_count = state.success_count,
                    threshold = self.config.success_threshold,
                    "Half-open trial call succeeded"
                );

                if state.success_count >= self.config.success_threshold {
                    self.transition_to_closed(&mut state);
                }
            }
            CircuitState::Open => {
                debug!(dependency = %self.name, "Call admitted before opening succeeded");
            }
        }
    }

    fn record_failure<E: std::fmt::Display>(&self, trial: Option<u64>, error: &E) {
        let mut state = self.state.lock();
        release_trial(&mut state, trial);
        state.failed_calls += 1;
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_at = Some(Utc::now());

        match state.circuit_state {
            CircuitState::Closed => {
                debug!(
                    dependency = %self.name,
                    failure_count = state.failure_count,
                    threshold = self.config.failure_threshold,
                    error = %error,
                    "Call failed in closed state"
                );

                if state.failure_count >= self.config.failure_threshold {
                    self.transition_to_open(&mut state);
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    dependency = %self.name,
                    error = %error,
                    "Half-open trial call failed, reopening circuit"
                );
                self.transition_to_open(&mut state);
            }
            CircuitState::Open => {
                debug!(
                    dependency = %self.name,
                    error = %error,
                    "Call admitted before opening failed"
                );
            }
        }
    }

    fn transition_to_open(&self, state: &mut State) {
        warn!(
            dependency = %self.name,
            failure_count = state.failure_count,
            open_timeout = ?self.config.open_timeout,
            "Circuit breaker opening"
        );

        state.circuit_state = CircuitState::Open;
        let opened = OpenedAt::now();
        state.opened_at = Some(opened);
        state.last_opened = Some(opened);
        state.success_count = 0;
        state.half_open_in_flight = 0;
        state.times_opened += 1;
    }

    fn transition_to_half_open(&self, state: &mut State) {
        info!(
            dependency = %self.name,
            "Circuit breaker transitioning to half-open"
        );

        state.circuit_state = CircuitState::HalfOpen;
        state.opened_at = None;
        state.failure_count = 0;
        state.success_count = 0;
        state.half_open_in_flight = 0;
        state.trial_generation = state.trial_generation.wrapping_add(1);
    }

    fn transition_to_closed(&self, state: &mut State) {
        info!(
            dependency = %self.name,
            success_count = state.success_count,
            "Circuit breaker closing"
        );

        state.circuit_state = CircuitState::Closed;
        state.opened_at = None;
        state.failure_count = 0;
        state.success_count = 0;
        state.half_open_in_flight = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(
        failure_threshold: u32,
        open_timeout_secs: u64,
        success_threshold: u32,
    ) -> CircuitBreaker {
        CircuitBreaker::new(
            "test-dependency",
            CircuitBreakerConfig {
                failure_threshold,
                open_timeout: Duration::from_secs(open_timeout_secs),
                success_threshold,
                half_open_max_calls: None,
            },
        )
    }

    async fn fail(cb: &CircuitBreaker) -> ResilienceError<String> {
        cb.execute(|| async { Err::<(), _>("boom".to_string()) })
            .await
            .unwrap_err()
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<&'static str, ResilienceError<String>> {
        cb.execute(|| async { Ok::<_, String>("ok") }).await
    }

    #[tokio::test]
    async fn test_circuit_breaker_starts_closed() {
        let cb = breaker(5, 60, 2);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb).await.unwrap(), "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold_failures() {
        let cb = breaker(3, 60, 2);

        for _ in 0..3 {
            assert!(matches!(fail(&cb).await, ResilienceError::Operation(e) if e == "boom"));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = cb
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert!(cb.stats().opened_at.is_some());
    }

    #[tokio::test]
    async fn test_circuit_resets_on_success() {
        let cb = breaker(3, 60, 2);

        fail(&cb).await;
        fail(&cb).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.stats().failure_count, 0);

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_recovers_after_timeout() {
        let cb = breaker(3, 5, 2);
        for _ in 0..3 {
            fail(&cb).await;
        }

        tokio::time::advance(Duration::from_secs(2)).await;
        match succeed(&cb).await {
            Err(ResilienceError::CircuitOpen { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(3));
            }
            other => panic!("expected CircuitOpen, got {:?}", other),
        }

        tokio::time::advance(Duration::from_secs(4)).await;
        succeed(&cb).await.unwrap();
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::HalfOpen);
        assert_eq!(stats.success_count, 1);
        assert!(stats.opened_at.is_none());

        succeed(&cb).await.unwrap();
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_admitted_exactly_at_timeout() {
        let cb = breaker(1, 5, 1);
        fail(&cb).await;

        tokio::time::advance(Duration::from_secs(5)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_reopens_on_failure() {
        let cb = breaker(2, 10, 2);
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().open_for, Some(Duration::ZERO));

        // The timeout window restarted with the failed trial
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(succeed(&cb).await.unwrap_err().is_circuit_open());

        tokio::time::advance(Duration::from_secs(1)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_max_calls_limits_concurrent_trials() {
        let cb = Arc::new(CircuitBreaker::new(
            "limited",
            CircuitBreakerConfig {
                failure_threshold: 1,
                open_timeout: Duration::from_secs(1),
                success_threshold: 1,
                half_open_max_calls: Some(1),
            },
        ));
        fail(&cb).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.execute(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, String>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(cb.stats().half_open_in_flight, 1);

        assert!(succeed(&cb).await.unwrap_err().is_circuit_open());

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_half_open_admits_every_trial() {
        let cb = Arc::new(breaker(1, 5, 3));
        fail(&cb).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        let mut outcomes = Vec::new();
        let mut trials = Vec::new();
        for _ in 0..4 {
            let (outcome_tx, outcome_rx) = tokio::sync::oneshot::channel::<bool>();
            let cb = cb.clone();
            outcomes.push(outcome_tx);
            trials.push(tokio::spawn(async move {
                cb.execute(|| async move {
                    match outcome_rx.await {
                        Ok(true) => Ok(()),
                        _ => Err("boom".to_string()),
                    }
                })
                .await
            }));
        }
        tokio::task::yield_now().await;

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::HalfOpen);
        assert_eq!(stats.half_open_in_flight, 4);
        assert_eq!(stats.rejected_calls, 0);

        // First trial fails and reopens the circuit
        let mut outcomes = outcomes.into_iter();
        let mut trials = trials.into_iter();
        outcomes.next().unwrap().send(false).unwrap();
        let failed = trials.next().unwrap().await.unwrap();
        assert!(matches!(failed, Err(ResilienceError::Operation(_))));
        assert_eq!(cb.state(), CircuitState::Open);

        // Late successes land while open and change nothing
        for outcome in outcomes {
            outcome.send(true).unwrap();
        }
        for trial in trials {
            trial.await.unwrap().unwrap();
        }

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert!(stats.opened_at.is_some());
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.half_open_in_flight, 0);
        assert_eq!(stats.successful_calls, 3);
        assert_eq!(stats.times_opened, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_its_slot() {
        let cb = Arc::new(CircuitBreaker::new(
            "dropped",
            CircuitBreakerConfig {
                failure_threshold: 1,
                open_timeout: Duration::from_secs(1),
                success_threshold: 1,
                half_open_max_calls: Some(1),
            },
        ));
        fail(&cb).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        let hanging = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.execute(|| std::future::pending::<Result<(), String>>())
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(cb.stats().half_open_in_flight, 1);

        hanging.abort();
        let _ = hanging.await;
        let stats = cb.stats();
        assert_eq!(stats.half_open_in_flight, 0);
        assert_eq!(stats.state, CircuitState::HalfOpen);
        assert_eq!(stats.failed_calls, 1);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset_forces_closed() {
        let cb = breaker(1, 3600, 2);
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.failed_calls, 0);
        assert!(stats.opened_at.is_none());
        assert!(stats.last_failure_at.is_none());
        assert!(stats.last_opened_at.is_none());
        succeed(&cb).await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_tracking() {
        let cb = breaker(2, 60, 2);

        succeed(&cb).await.unwrap();
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(succeed(&cb).await.is_err());

        let stats = cb.stats();
        assert_eq!(stats.name, "test-dependency");
        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.successful_calls, 1);
        assert_eq!(stats.failed_calls, 2);
        assert_eq!(stats.rejected_calls, 1);
        assert_eq!(stats.times_opened, 1);
        assert_eq!(stats.failure_count, 2);
        assert!(stats.last_success_at.is_some());
        assert!(stats.last_failure_at.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_failures_open_once() {
        let cb = Arc::new(breaker(10, 60, 2));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cb = cb.clone();
                tokio::spawn(async move { fail(&cb).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.failed_calls, 10);
        assert_eq!(stats.times_opened, 1);
    }
}
