use super::breaker::CircuitBreaker;
use super::retry::RetryExecutor;
use super::types::CircuitBreakerStats;
use crate::config::ResilienceSettings;
use crate::error::{Classify, ResilienceError, Result};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Breaker and retry executor bound to one dependency
#[derive(Debug, Clone)]
pub struct DependencyPolicies {
    pub breaker: Arc<CircuitBreaker>,
    pub retry: Arc<RetryExecutor>,
}

impl DependencyPolicies {
    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    /// Run `operation` through the breaker, retrying failed attempts
    pub async fn execute<F, Fut, T, E>(
        &self,
        operation: F,
    ) -> std::result::Result<T, ResilienceError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Classify + 'static,
    {
        let breaker = &*self.breaker;
        let operation = &operation;
        self.retry.execute(move || breaker.execute(operation)).await
    }

    /// Same as [`execute`](Self::execute), aborting when `token` is cancelled
    pub async fn execute_with_cancellation<F, Fut, T, E>(
        &self,
        operation: F,
        token: &CancellationToken,
    ) -> std::result::Result<T, ResilienceError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Classify + 'static,
    {
        let breaker = &*self.breaker;
        let operation = &operation;
        self.retry
            .execute_with_cancellation(move || breaker.execute(operation), token)
            .await
    }
}

/// Process-wide cache of resilience policies, one entry per dependency name
#[derive(Debug, Clone)]
pub struct ResilienceRegistry {
    /// Settings used to build new entries
    settings: Arc<ResilienceSettings>,
    /// Policies per dependency
    policies: Arc<DashMap<String, DependencyPolicies>>,
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self {
            settings: Arc::new(ResilienceSettings::default()),
            policies: Arc::new(DashMap::new()),
        }
    }
}

impl ResilienceRegistry {
    /// Create a registry after validating its settings
    pub fn new(settings: ResilienceSettings) -> Result<Self> {
        settings.validate()?;
        info!(
            named_breakers = settings.circuit_breaker.named.len(),
            named_retry_policies = settings.retry_policy.named.len(),
            "Creating resilience registry"
        );

        Ok(Self {
            settings: Arc::new(settings),
            policies: Arc::new(DashMap::new()),
        })
    }

    pub fn settings(&self) -> &ResilienceSettings {
        &self.settings
    }

    /// Get or create the policies for a dependency.
    ///
    /// Concurrent first calls for the same name all receive the same instances.
    pub fn get_or_create(&self, name: &str) -> DependencyPolicies {
        if let Some(existing) = self.policies.get(name) {
            return existing.clone();
        }

        self.policies
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(dependency = name, "Creating resilience policies");
                DependencyPolicies {
                    breaker: Arc::new(CircuitBreaker::new(
                        name,
                        self.settings.circuit_breaker_config(name),
                    )),
                    retry: Arc::new(RetryExecutor::new(name, self.settings.retry_config(name))),
                }
            })
            .clone()
    }

    /// Get the policies for a dependency without creating them
    pub fn get(&self, name: &str) -> Option<DependencyPolicies> {
        self.policies.get(name).map(|entry| entry.clone())
    }

    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(name).breaker
    }

    pub fn retry(&self, name: &str) -> Arc<RetryExecutor> {
        self.get_or_create(name).retry
    }

    /// All cached policies, ordered by dependency name
    pub fn get_all(&self) -> Vec<DependencyPolicies> {
        let mut all: Vec<DependencyPolicies> =
            self.policies.iter().map(|entry| entry.value().clone()).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Get all dependency names with cached policies
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.policies.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Stats snapshots for every cached breaker, ordered by dependency name
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        self.get_all()
            .iter()
            .map(|policies| policies.breaker.stats())
            .collect()
    }

    /// Reset an existing breaker; returns false when the name was never requested
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(policies) => {
                policies.breaker.reset();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::types::CircuitState;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("connection refused")]
    struct Refused;

    impl Classify for Refused {
        fn kind(&self) -> ErrorKind {
            ErrorKind::Transient
        }
    }

    fn registry() -> ResilienceRegistry {
        let settings = ResilienceSettings::from_yaml(
            r#"
CircuitBreaker:
  FailureThreshold: 2
  TimeoutSeconds: 30
RetryPolicy:
  MaxRetryAttempts: 1
  InitialDelaySeconds: 0.01
  Strategy: Fixed
"#,
        )
        .unwrap();
        ResilienceRegistry::new(settings).unwrap()
    }

    #[tokio::test]
    async fn test_registry_manages_multiple_dependencies() {
        let registry = registry();

        registry
            .breaker("sql")
            .execute(|| async { Ok::<_, Refused>(()) })
            .await
            .unwrap();

        let geocoder = registry.breaker("geocoder");
        for _ in 0..2 {
            let _ = geocoder.execute(|| async { Err::<(), _>(Refused) }).await;
        }

        assert_eq!(registry.breaker("sql").state(), CircuitState::Closed);
        assert_eq!(registry.breaker("geocoder").state(), CircuitState::Open);
        assert_eq!(registry.names(), vec!["geocoder", "sql"]);
    }

    #[tokio::test]
    async fn test_same_name_returns_same_instances() {
        let registry = registry();
        let first = registry.get_or_create("rabbitmq");
        let second = registry.get_or_create("rabbitmq");

        assert!(Arc::ptr_eq(&first.breaker, &second.breaker));
        assert!(Arc::ptr_eq(&first.retry, &second.retry));

        let cloned = registry.clone();
        assert!(Arc::ptr_eq(&cloned.breaker("rabbitmq"), &first.breaker));
    }

    #[tokio::test(start_paused = true)]
    async fn test_policies_execute_composes_retry_and_breaker() {
        let registry = registry();
        let policies = registry.get_or_create("webhooks");
        let invoked = AtomicU32::new(0);

        let result = policies
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Refused)
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            ResilienceError::RetryExhausted { attempts: 2, .. }
        ));
        assert_eq!(
            err.to_string(),
            "Retries exhausted for 'webhooks' after 2 attempts: connection refused"
        );
        assert_eq!(invoked.load(Ordering::SeqCst), 2);
        assert_eq!(policies.breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_reset_and_stats() {
        let registry = registry();
        assert!(!registry.reset("unknown"));
        assert!(registry.get("unknown").is_none());

        let breaker = registry.breaker("sql");
        for _ in 0..2 {
            let _ = breaker.execute(|| async { Err::<(), _>(Refused) }).await;
        }
        registry.breaker("geocoder");

        let stats = registry.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "geocoder");
        assert_eq!(stats[1].state, CircuitState::Open);

        assert!(registry.reset("sql"));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(registry.get_all().len(), 2);
    }
}
