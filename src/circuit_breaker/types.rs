use crate::error::{Classify, ErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed, calls flow normally
    Closed,
    /// Circuit is open, calls are rejected
    Open,
    /// Circuit is half-open, allowing trial calls
    HalfOpen,
}

impl CircuitState {
    /// Numeric value used for gauges (0 = closed, 1 = open, 2 = half-open)
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures in closed state before opening the circuit
    pub failure_threshold: u32,
    /// Duration to wait in open state before admitting a trial call
    pub open_timeout: Duration,
    /// Number of consecutive successes in half-open state before closing
    pub success_threshold: u32,
    /// Concurrent trial calls admitted in half-open state; `None` admits all
    pub half_open_max_calls: Option<u32>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            half_open_max_calls: None,
        }
    }
}

/// Delay schedule between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
    Jitter,
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackoffStrategy::Fixed => write!(f, "Fixed"),
            BackoffStrategy::Linear => write!(f, "Linear"),
            BackoffStrategy::Exponential => write!(f, "Exponential"),
            BackoffStrategy::Jitter => write!(f, "Jitter"),
        }
    }
}

/// Predicate deciding whether a failed attempt should be retried
pub type RetryPredicate = Arc<dyn Fn(&dyn Classify) -> bool + Send + Sync>;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Retry configuration
#[derive(Clone, Serialize)]
pub struct RetryConfig {
    /// Number of retries after the first attempt
    pub max_attempts: u32,
    /// Base delay
    pub initial_delay: Duration,
    /// Ceiling applied to every computed delay
    pub max_delay: Duration,
    /// Growth factor for exponential and jittered backoff
    pub backoff_multiplier: f64,
    pub strategy: BackoffStrategy,
    /// Error kinds worth retrying; empty defers to the default classifier
    pub retryable_kinds: HashSet<ErrorKind>,
    #[serde(skip)]
    pub should_retry: Option<RetryPredicate>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            strategy: BackoffStrategy::default(),
            retryable_kinds: HashSet::new(),
            should_retry: None,
        }
    }
}

impl RetryConfig {
    /// Replace the retry predicate
    pub fn with_should_retry<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&dyn Classify) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Decide from configuration alone whether an error is worth retrying
    pub fn is_retryable(&self, error: &dyn Classify) -> bool {
        if let Some(should_retry) = &self.should_retry {
            return should_retry(error);
        }
        if !self.retryable_kinds.is_empty() {
            return self.retryable_kinds.contains(&error.kind());
        }
        error.kind().is_transient()
    }
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("strategy", &self.strategy)
            .field("retryable_kinds", &self.retryable_kinds)
            .field("should_retry", &self.should_retry.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

/// Point-in-time view of a circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    /// Dependency name
    pub name: String,
    pub state: CircuitState,
    /// Consecutive failures counted toward opening
    pub failure_count: u32,
    /// Consecutive successes counted toward closing while half-open
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Set while the circuit is open
    pub opened_at: Option<DateTime<Utc>>,
    /// Time spent open so far, while the circuit is open
    pub open_for: Option<Duration>,
    /// Wall-clock time of the most recent opening, kept after the circuit recovers
    pub last_opened_at: Option<DateTime<Utc>>,
    /// Time since the most recent opening
    pub since_last_opened: Option<Duration>,
    /// Trial calls currently in flight while half-open
    pub half_open_in_flight: u32,
    /// Calls admitted to the operation
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Calls rejected without invoking the operation
    pub rejected_calls: u64,
    /// Number of transitions into the open state
    pub times_opened: u64,
}
