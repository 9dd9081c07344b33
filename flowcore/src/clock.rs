use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

/// Longest delay accepted for timers, polls, backoffs and lock durations
/// (100 years).
pub const MAX_DELAY_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// `start + ms`, or `None` when the instant is not representable.
pub fn after_millis(start: DateTime<Utc>, ms: u64) -> Option<DateTime<Utc>> {
    let delay = Duration::try_milliseconds(i64::try_from(ms).ok()?)?;
    start.checked_add_signed(delay)
}

/// Source of "now" for due dates and lock expiration.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic tests and time travel.
///
/// Clones share the same instant.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.write() = instant;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_all_clones() {
        let clock = ManualClock::default();
        let other = clock.clone();
        let start = clock.now();

        other.advance(Duration::minutes(5));

        assert_eq!(clock.now() - start, Duration::minutes(5));
    }

    #[test]
    fn test_after_millis_rejects_unrepresentable_instants() {
        let start = Utc::now();
        assert_eq!(after_millis(start, 1_500), Some(start + Duration::milliseconds(1_500)));
        assert!(after_millis(start, MAX_DELAY_MS).is_some());
        assert_eq!(after_millis(start, u64::MAX / 4), None);
        assert_eq!(after_millis(start, u64::MAX), None);
    }
}
