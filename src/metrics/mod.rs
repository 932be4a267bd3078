//! Gauges for circuit breaker state, published on the `metrics` facade.
//!
//! Nothing here installs a recorder; the host process decides where gauges go.

use crate::circuit_breaker::types::CircuitBreakerStats;
use crate::circuit_breaker::ResilienceRegistry;
use ::metrics::{describe_gauge, gauge};
use std::sync::Once;
use tracing::debug;

static DESCRIBE: Once = Once::new();

/// Register all gauges with descriptions
fn register_metrics() {
    describe_gauge!(
        "resilience_circuit_breaker_state",
        "Circuit breaker state (0 = closed, 1 = open, 2 = half-open)"
    );
    describe_gauge!(
        "resilience_circuit_breaker_failure_count",
        "Consecutive failures counted toward opening the circuit"
    );
    describe_gauge!(
        "resilience_circuit_breaker_success_count",
        "Consecutive half-open successes counted toward closing the circuit"
    );
    describe_gauge!(
        "resilience_circuit_breaker_seconds_since_opened",
        "Seconds since the circuit last opened, 0 if it never opened"
    );
    describe_gauge!(
        "resilience_circuit_breaker_rejected_calls",
        "Calls rejected without invoking the dependency"
    );

    debug!("Resilience gauges registered with descriptions");
}

/// Publish gauges for one breaker snapshot
pub fn record_breaker_stats(stats: &CircuitBreakerStats) {
    DESCRIBE.call_once(register_metrics);

    let labels = [("dependency", stats.name.clone())];

    gauge!("resilience_circuit_breaker_state", &labels).set(stats.state.as_gauge());
    gauge!("resilience_circuit_breaker_failure_count", &labels).set(f64::from(stats.failure_count));
    gauge!("resilience_circuit_breaker_success_count", &labels).set(f64::from(stats.success_count));
    gauge!("resilience_circuit_breaker_seconds_since_opened", &labels)
        .set(seconds_since_opened(stats));
    gauge!("resilience_circuit_breaker_rejected_calls", &labels).set(stats.rejected_calls as f64);
}

/// Seconds since the breaker last opened, whatever its current state
fn seconds_since_opened(stats: &CircuitBreakerStats) -> f64 {
    stats
        .since_last_opened
        .map(|since| since.as_secs_f64())
        .unwrap_or(0.0)
}

/// Publish gauges for every breaker in the registry
pub fn publish_registry(registry: &ResilienceRegistry) {
    for stats in registry.stats() {
        record_breaker_stats(&stats);
    }
}
