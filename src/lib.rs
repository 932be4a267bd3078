pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod metrics;

pub use circuit_breaker::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
    DependencyPolicies, ResilienceRegistry, RetryConfig, RetryExecutor,
};
pub use config::ResilienceSettings;
pub use error::{Classify, ConfigError, ErrorKind, ResilienceError};
pub use tokio_util::sync::CancellationToken;

/// Log output format, picked from `RESILIENCE_LOG_FORMAT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(std::env::var("RESILIENCE_LOG_FORMAT").ok().as_deref())
    }

    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(value) if value.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }

    /// Install the global subscriber for this format
    pub fn init(self) {
        match self {
            LogFormat::Compact => init_tracing(),
            LogFormat::Json => init_json_tracing(),
        }
    }
}

/// Initialize tracing/logging
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "resilience=debug".into()),
        )
        .with_target(false)
        .compact()
        .init();
}

/// Initialize tracing with JSON output, for log shippers
pub fn init_json_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "resilience=info".into()),
        )
        .json()
        .init();
}
