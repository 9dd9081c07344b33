use chrono::Duration;
use rand::Rng;

/// Computes the wait before a failed job becomes due again.
///
/// `attempt` counts failures so far, starting at 1 for the first failure.
pub trait BackoffStrategy: Send + Sync + std::fmt::Debug {
    fn delay(&self, attempt: u32) -> Duration;
}

/// Retry on the next acquisition cycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImmediateBackoff;

impl BackoffStrategy for ImmediateBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::zero()
    }
}

/// Same wait after every failure.
#[derive(Clone, Copy, Debug)]
pub struct FixedBackoff {
    delay_ms: u64,
}

impl FixedBackoff {
    pub fn new(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

impl BackoffStrategy for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        millis(self.delay_ms)
    }
}

/// `step * attempt`, capped at `max`.
#[derive(Clone, Copy, Debug)]
pub struct LinearBackoff {
    step_ms: u64,
    max_ms: u64,
}

impl LinearBackoff {
    pub fn new(step_ms: u64, max_ms: u64) -> Self {
        Self { step_ms, max_ms }
    }
}

impl BackoffStrategy for LinearBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.step_ms.saturating_mul(attempt as u64);
        millis(scaled.min(self.max_ms))
    }
}

/// `base * 2^(attempt-1)`, capped at `max`, plus up to `jitter_ratio` extra.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_ratio: f32,
}

impl ExponentialBackoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter_ratio: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter_ratio: f32) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let base = exponential_delay(attempt, self.base_ms, self.max_ms);
        with_jitter(base, self.jitter_ratio)
    }
}

/// Capped exponential delay without jitter. Attempt 0 yields zero.
pub fn exponential_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::zero();
    }

    let exp = attempt.saturating_sub(1).min(62) as i32;
    let scaled = (base_ms as f64) * 2f64.powi(exp);
    let capped = scaled.min(max_ms as f64).max(0.0);

    Duration::milliseconds(capped as i64)
}

/// Adds a random extra of `0..=ratio * delay` to `delay`.
pub fn with_jitter(delay: Duration, ratio: f32) -> Duration {
    let delay_ms = delay.num_milliseconds();
    if ratio <= 0.0 || delay_ms <= 0 {
        return delay;
    }
    let spread = ((delay_ms as f64) * f64::from(ratio)) as i64;
    if spread == 0 {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0..=spread);
    Duration::milliseconds(delay_ms + extra)
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(ms.min(i64::MAX as u64) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_doubles_per_attempt() {
        let backoff = ExponentialBackoff::new(1000, 300_000);

        assert_eq!(backoff.delay(1).num_milliseconds(), 1000);
        assert_eq!(backoff.delay(2).num_milliseconds(), 2000);
        assert_eq!(backoff.delay(3).num_milliseconds(), 4000);
    }

    #[test]
    fn test_exponential_capped() {
        let backoff = ExponentialBackoff::new(1000, 5000);
        assert_eq!(backoff.delay(10).num_milliseconds(), 5000);
        assert_eq!(backoff.delay(u32::MAX).num_milliseconds(), 5000);
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let backoff = ExponentialBackoff::new(1000, 300_000).with_jitter(0.25);
        for _ in 0..100 {
            let ms = backoff.delay(2).num_milliseconds();
            assert!((2000..=2500).contains(&ms), "delay {ms} out of range");
        }
    }

    #[test]
    fn test_linear_and_fixed() {
        assert_eq!(LinearBackoff::new(500, 1200).delay(2).num_milliseconds(), 1000);
        assert_eq!(LinearBackoff::new(500, 1200).delay(3).num_milliseconds(), 1200);
        assert_eq!(FixedBackoff::new(750).delay(9).num_milliseconds(), 750);
        assert_eq!(ImmediateBackoff.delay(4), Duration::zero());
    }

    #[test]
    fn test_zero_attempt_has_no_delay() {
        assert_eq!(exponential_delay(0, 1000, 5000), Duration::zero());
    }
}
