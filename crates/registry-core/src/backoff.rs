//! Reconnect pacing for outgoing links.
//!
//! Exponential backoff with a ceiling plus a randomized jitter term, so a
//! cluster-wide restart does not produce a reconnection storm of dials
//! landing on the same instant.

use std::time::Duration;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt
    pub initial_delay: Duration,
    /// Ceiling for the deterministic part of the delay
    pub max_delay: Duration,
    /// Multiplier for exponential growth
    pub backoff_factor: f64,
    /// Fraction of the base delay added as random jitter (0.3 = up to +30%)
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            jitter: 0.3,
        }
    }
}

/// The deterministic part of the delay for the given attempt (1-based).
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Reconnection state for one peer.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    attempts: u32,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt and return how long to wait before it: the capped
    /// exponential delay plus a random jitter on top.
    pub fn next_delay(&mut self, config: &ReconnectConfig) -> Duration {
        use rand::Rng;

        self.attempts += 1;
        let base = calculate_backoff(self.attempts, config);
        base + base.mul_f64(config.jitter * rand::rng().random::<f64>())
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
