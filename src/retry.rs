//! Retry/backoff policy.
//!
//! A pure decision function mapping a failed-attempt count to either a delay
//! before the next attempt or a dead-letter verdict. No I/O, no side
//! effects; the dispatcher applies the decision to the store.

use std::time::Duration;

/// Verdict for a message after a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Try again after the given delay.
    Retry(Duration),
    /// No further automatic attempts; park the message for an operator.
    DeadLetter,
}

/// Exponential backoff with a cap and a maximum attempt count.
///
/// The delay doubles with each failed attempt, starting at `initial_delay`
/// and never exceeding `max_delay`, to avoid hammering a failing downstream
/// dependency. Once `max_retries` attempts have failed the policy gives up
/// and dead-letters the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    /// Five attempts, 10s initial delay doubling per attempt, capped at an
    /// hour.
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with explicit parameters.
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
        }
    }

    /// Maximum number of failed attempts before dead-lettering.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decide the outcome after a failed attempt.
    ///
    /// `retry_count` is the number of attempts that have failed so far,
    /// including the one just recorded. Returns [`Decision::DeadLetter`]
    /// once that count reaches `max_retries`, otherwise the backoff delay
    /// for the next attempt.
    pub fn decide(&self, retry_count: u32) -> Decision {
        if retry_count >= self.max_retries {
            return Decision::DeadLetter;
        }

        // retry_count is >= 1 here: a decision is only requested after a
        // failure has been recorded. The exponent cap avoids shift overflow;
        // anything that large saturates to max_delay anyway.
        let exponent = retry_count.saturating_sub(1).min(30);
        let delay = self
            .initial_delay
            .checked_mul(1 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay));

        Decision::Retry(delay)
    }
}
