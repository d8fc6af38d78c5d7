//! Delay-or-drop decisions for failed report sends.

use chrono::Duration;

/// Up to two retries: the first failure waits `first_delay`, the second
/// waits `second_delay`, the third is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub first_delay: Duration,
    pub second_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            first_delay: Duration::minutes(5),
            second_delay: Duration::minutes(15),
        }
    }
}

impl RetryPolicy {
    pub fn new(first_delay: Duration, second_delay: Duration) -> Self {
        Self {
            first_delay,
            second_delay,
        }
    }

    /// Delay before the next attempt, given the number of failed attempts
    /// including the one that just happened. `None` once the budget is spent.
    pub fn delay_for(&self, failed_send_attempts: u32) -> Option<Duration> {
        match failed_send_attempts {
            1 => Some(self.first_delay),
            2 => Some(self.second_delay),
            _ => None,
        }
    }
}
