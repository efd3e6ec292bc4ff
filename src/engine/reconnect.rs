//! Reconnect delays for a wallet task, backed by the `backoff` crate.

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

use super::ReconnectPolicy;

/// Per-task backoff state: delay schedule plus attempt budget.
#[derive(Debug)]
pub struct Reconnector {
    backoff: ExponentialBackoff,
    max_delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Reconnector {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(policy.initial_delay)
            .with_multiplier(policy.multiplier.max(1.0))
            .with_max_interval(policy.max_delay)
            .with_randomization_factor(policy.jitter.clamp(0.0, 0.99))
            .with_max_elapsed_time(None)
            .build();

        Self {
            backoff,
            max_delay: policy.max_delay,
            max_attempts: policy.max_attempts,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.backoff.next_backoff().unwrap_or(self.max_delay))
    }

    /// Back to the initial delay after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.backoff.reset();
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
