//! Injected time source for claim eligibility and backoff scheduling.
//!
//! Every `next_attempt_on <= now` comparison in the crate goes through a
//! [`Clock`] so that dispatch and retry behavior is deterministic under
//! test. Production code uses [`SystemClock`]; tests use [`ManualClock`].

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source of the current UTC time.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// `now + delay`, saturating at the end of the representable range.
///
/// Leases and backoff delays come from user configuration; a value too
/// large to schedule means "effectively never", not a panic.
pub(crate) fn saturating_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually advanced clock for testing or local usage.
///
/// Starts at a fixed instant and only moves when [`advance`](Self::advance)
/// is called, so time-dependent behavior (backoff delays, claim leases) can
/// be driven step by step.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at the given instant.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += chrono::Duration::from_std(by).expect("duration out of range");
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}
