use crate::circuit_breaker::types::{
    BackoffStrategy, CircuitBreakerConfig, RetryConfig, DEFAULT_BACKOFF_MULTIPLIER,
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
    DEFAULT_OPEN_TIMEOUT, DEFAULT_SUCCESS_THRESHOLD,
};
use crate::error::{ConfigError, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Resilience settings as read from configuration.
///
/// Keys directly under `CircuitBreaker` and `RetryPolicy` form the unnamed default
/// section; nested mappings are named sections, one per dependency:
///
/// ```yaml
/// CircuitBreaker:
///   FailureThreshold: 5
///   rabbitmq:
///     FailureThreshold: 3
/// RetryPolicy:
///   Strategy: Jitter
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceSettings {
    #[serde(rename = "CircuitBreaker", default)]
    pub circuit_breaker: Section<CircuitBreakerSettings>,
    #[serde(rename = "RetryPolicy", default)]
    pub retry_policy: Section<RetrySettings>,
}

/// Unnamed defaults plus named overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Section<S> {
    #[serde(flatten)]
    pub defaults: S,
    #[serde(flatten)]
    pub named: HashMap<String, S>,
}

/// Circuit breaker keys; absent keys fall back to the next section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CircuitBreakerSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub half_open_max_calls: Option<u32>,
}

/// Retry policy keys; absent keys fall back to the next section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RetrySettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retry_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_delay_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<BackoffStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable_error_kinds: Option<Vec<ErrorKind>>,
}

impl<S> Section<S> {
    /// Resolve one key: named section, then unnamed defaults
    fn lookup<T>(&self, name: &str, key: impl Fn(&S) -> Option<T>) -> Option<T> {
        self.named
            .get(name)
            .and_then(&key)
            .or_else(|| key(&self.defaults))
    }

    /// Every section with a label for error messages
    fn sections<'a>(&'a self, root: &'a str) -> impl Iterator<Item = (String, &'a S)> + 'a {
        std::iter::once((root.to_string(), &self.defaults)).chain(
            self.named
                .iter()
                .map(move |(name, section)| (format!("{}:{}", root, name), section)),
        )
    }
}

impl ResilienceSettings {
    /// Load settings from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse settings from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // An empty document parses as null
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        for (label, section) in self.circuit_breaker.sections("CircuitBreaker") {
            if section.failure_threshold == Some(0) {
                return Err(ConfigError::Config(format!(
                    "{}:FailureThreshold must be > 0",
                    label
                )));
            }
            if section.success_threshold == Some(0) {
                return Err(ConfigError::Config(format!(
                    "{}:SuccessThreshold must be > 0",
                    label
                )));
            }
            if section.half_open_max_calls == Some(0) {
                return Err(ConfigError::Config(format!(
                    "{}:HalfOpenMaxCalls must be > 0",
                    label
                )));
            }
            validate_seconds(&label, "TimeoutSeconds", section.timeout_seconds)?;
        }

        for (label, section) in self.retry_policy.sections("RetryPolicy") {
            validate_seconds(&label, "InitialDelaySeconds", section.initial_delay_seconds)?;
            validate_seconds(&label, "MaxDelaySeconds", section.max_delay_seconds)?;

            if let Some(multiplier) = section.backoff_multiplier {
                if !multiplier.is_finite() || multiplier <= 0.0 {
                    return Err(ConfigError::Config(format!(
                        "{}:BackoffMultiplier must be a positive number",
                        label
                    )));
                }
            }
        }

        Ok(())
    }

    /// Circuit breaker configuration for a dependency
    pub fn circuit_breaker_config(&self, name: &str) -> CircuitBreakerConfig {
        let section = &self.circuit_breaker;
        CircuitBreakerConfig {
            failure_threshold: section
                .lookup(name, |s| s.failure_threshold)
                .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            open_timeout: section
                .lookup(name, |s| s.timeout_seconds)
                .and_then(seconds)
                .unwrap_or(DEFAULT_OPEN_TIMEOUT),
            success_threshold: section
                .lookup(name, |s| s.success_threshold)
                .unwrap_or(DEFAULT_SUCCESS_THRESHOLD),
            half_open_max_calls: section.lookup(name, |s| s.half_open_max_calls),
        }
    }

    /// Retry configuration for a dependency
    pub fn retry_config(&self, name: &str) -> RetryConfig {
        let section = &self.retry_policy;
        RetryConfig {
            max_attempts: section
                .lookup(name, |s| s.max_retry_attempts)
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            initial_delay: section
                .lookup(name, |s| s.initial_delay_seconds)
                .and_then(seconds)
                .unwrap_or(DEFAULT_INITIAL_DELAY),
            max_delay: section
                .lookup(name, |s| s.max_delay_seconds)
                .and_then(seconds)
                .unwrap_or(DEFAULT_MAX_DELAY),
            backoff_multiplier: section
                .lookup(name, |s| s.backoff_multiplier)
                .unwrap_or(DEFAULT_BACKOFF_MULTIPLIER),
            strategy: section.lookup(name, |s| s.strategy).unwrap_or_default(),
            retryable_kinds: section
                .lookup(name, |s| s.retryable_error_kinds.clone())
                .map(|kinds| kinds.into_iter().collect())
                .unwrap_or_default(),
            should_retry: None,
        }
    }
}

fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}

fn validate_seconds(label: &str, key: &str, value: Option<f64>) -> Result<()> {
    match value {
        Some(secs) if seconds(secs).is_none() => Err(ConfigError::Config(format!(
            "{}:{} must be a non-negative number of seconds",
            label, key
        ))),
        _ => Ok(()),
    }
}
