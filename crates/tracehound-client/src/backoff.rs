use std::time::Duration;

use crate::ClientConfig;

/// Reconnect delay schedule.
///
/// The first `max_attempts` delays double from `base` up to `max`; after
/// that every retry waits the fixed `fallback` interval. [`Backoff::reset`]
/// is called once a connection succeeds.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    fallback: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            base: Duration::from_millis(config.reconnect_base_delay_ms),
            max: Duration::from_millis(config.reconnect_max_delay_ms),
            max_attempts: config.max_reconnect_attempts,
            fallback: Duration::from_millis(config.fallback_retry_interval_ms),
            attempt: 0,
        }
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = if self.attempt < self.max_attempts {
            let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
            self.base.saturating_mul(factor).min(self.max)
        } else {
            self.fallback
        };
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
