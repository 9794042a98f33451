//! Linear-backoff reconnection policy for progress channels.
//!
//! When a channel's connection drops, or a connection attempt fails, the
//! channel asks its [`ReconnectPolicy`] for the next delay. The delay
//! grows linearly with the attempt number, and the policy gives up once
//! `max_attempts` reconnects have been spent. A successful open resets
//! the counter.

use std::time::Duration;

/// Compute the delay before reconnect attempt number `attempt` (1-based).
pub fn linear_delay(base_delay: Duration, attempt: u32) -> Duration {
    base_delay.saturating_mul(attempt)
}

/// Bounded linear backoff state owned by a single channel.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempt: u32,
    max_attempts: u32,
    base_delay: Duration,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay,
        }
    }

    /// Reconnect attempts spent since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether every allowed attempt has been used.
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Claim the next attempt and return how long to wait before it.
    ///
    /// Returns `None` once the attempts are exhausted. The counter never
    /// exceeds `max_attempts`.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;
        Some(linear_delay(self.base_delay, self.attempt))
    }

    /// Called on every successful open.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
