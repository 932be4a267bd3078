//! Delay schedule between retry attempts.

use super::types::{BackoffStrategy, RetryConfig};
use rand::Rng;
use std::time::Duration;

/// Share of the initial delay used as the upper bound of added jitter
const JITTER_FACTOR: f64 = 0.2;

/// Delay to wait after the given failed attempt (1-based), clamped to `max_delay`.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let attempt = attempt.max(1);
    let initial = config.initial_delay.as_secs_f64();

    let delay = match config.strategy {
        BackoffStrategy::Fixed => initial,
        BackoffStrategy::Linear => initial * f64::from(attempt),
        BackoffStrategy::Exponential => exponential(initial, attempt, config.backoff_multiplier),
        BackoffStrategy::Jitter => {
            let jitter = rand::thread_rng().gen_range(0.0..=initial * JITTER_FACTOR);
            exponential(initial, attempt, config.backoff_multiplier) + jitter
        }
    };

    clamp(delay, config.max_delay)
}

fn exponential(initial: f64, attempt: u32, multiplier: f64) -> f64 {
    let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
    initial * multiplier.powi(exponent)
}

fn clamp(delay_secs: f64, max_delay: Duration) -> Duration {
    if delay_secs.is_nan() {
        return max_delay;
    }
    // Overflowed or huge delays saturate at the ceiling
    Duration::try_from_secs_f64(delay_secs)
        .map(|delay| delay.min(max_delay))
        .unwrap_or(max_delay)
}
