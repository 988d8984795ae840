use rand::Rng;
use std::time::Duration;

use crate::config::WebSocketConfig;

/// Exponential reconnect delay with symmetric jitter.
///
/// Attempt `k` (1-based) waits `min(base * 2^(k-1), max)`, then moves by up to
/// `jitter * delay` in either direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self { base, max: max.max(base), jitter: jitter.clamp(0.0, 1.0) }
    }

    #[must_use]
    pub fn from_config(config: &WebSocketConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_delay_ms),
            Duration::from_millis(config.reconnect_max_delay_ms),
            config.jitter_factor,
        )
    }

    /// Delay before reconnect attempt `attempt` without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Delay before reconnect attempt `attempt`, jitter applied.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::rng().random_range(-self.jitter..=self.jitter);
        delay.mul_f64((1.0 + factor).max(0.0))
    }
}
