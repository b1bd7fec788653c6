//! Connection states and bounded exponential backoff.

use std::fmt;
use std::time::Duration;

/// Upper bound on a single backoff delay.
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before retry number `n` (1-based).
    Backoff(u32),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Backoff(n) => write!(f, "backoff({n})"),
        }
    }
}

/// Counts consecutive failures and yields the delay before each retry:
/// `base`, `2 * base`, `4 * base`, ... until `max_attempts` is spent.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempt: 0,
        }
    }

    /// Retries used since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Record a failure. Returns the retry number and delay, or `None` once
    /// every attempt is spent.
    pub fn next_backoff(&mut self) -> Option<(u32, Duration)> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some((self.attempt, backoff_delay(self.base, self.attempt)))
    }

    /// Called on a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Delay before retry `attempt` (1-based), clamped to [`MAX_BACKOFF_DELAY`].
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_BACKOFF_DELAY)
}
