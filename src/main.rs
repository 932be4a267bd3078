use resilience::{
    CircuitBreakerConfig, CircuitBreakerStats, LogFormat, ResilienceRegistry,
    ResilienceSettings, RetryConfig,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::env;
use std::process;

/// Resolved policies for one dependency, as printed by this tool
#[derive(Serialize)]
struct ResolvedPolicies<'a> {
    name: &'a str,
    circuit_breaker: &'a CircuitBreakerConfig,
    retry: &'a RetryConfig,
    stats: CircuitBreakerStats,
}

fn main() {
    LogFormat::from_env().init();

    // Get settings file path from command line or use default
    let settings_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/resilience.yaml".to_string());

    let settings = match ResilienceSettings::from_file(&settings_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load settings from {}: {}", settings_path, e);
            eprintln!("Usage: resilience [settings_file] [dependency...]");
            process::exit(1);
        }
    };

    // Dependencies named on the command line, plus every named section
    let mut names: BTreeSet<String> = env::args().skip(2).collect();
    names.extend(settings.circuit_breaker.named.keys().cloned());
    names.extend(settings.retry_policy.named.keys().cloned());

    let registry = match ResilienceRegistry::new(settings) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("Invalid settings in {}: {}", settings_path, e);
            process::exit(1);
        }
    };

    let policies: Vec<_> = names.iter().map(|name| registry.get_or_create(name)).collect();
    let resolved: Vec<ResolvedPolicies<'_>> = policies
        .iter()
        .map(|policies| ResolvedPolicies {
            name: policies.name(),
            circuit_breaker: policies.breaker.config(),
            retry: policies.retry.config(),
            stats: policies.breaker.stats(),
        })
        .collect();

    match serde_json::to_string_pretty(&resolved) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Failed to render policies: {}", e);
            process::exit(1);
        }
    }
}
