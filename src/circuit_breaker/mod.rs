pub mod backoff;
pub mod breaker;
pub mod registry;
pub mod retry;
pub mod types;

pub use backoff::calculate_backoff;
pub use breaker::CircuitBreaker;
pub use registry::{DependencyPolicies, ResilienceRegistry};
pub use retry::RetryExecutor;
pub use types::{
    BackoffStrategy, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, RetryConfig,
    RetryPredicate,
};
