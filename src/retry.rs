//! Exponential backoff with jitter and the per-cycle retry bookkeeping.
//!
//! [`RetryCounter`] implements [`backoff::backoff::Backoff`]: every call to
//! `next_backoff` schedules one more retry and returns its delay, or `None` once the
//! policy's attempt cap is reached.

use std::time::Duration;

use backoff::backoff::Backoff;
use rand::Rng as _;

use crate::config::RetryPolicy;

/// Delay before retry `retry` (1-indexed) without jitter:
/// `min(max_delay, base_delay * 2^(retry - 1))`.
#[must_use]
pub fn unjittered_delay(policy: &RetryPolicy, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1);
    1_u32
        .checked_shl(exponent)
        .and_then(|factor| policy.base_delay.checked_mul(factor))
        .map_or(policy.max_delay, |delay| delay.min(policy.max_delay))
}

/// Spreads `delay` over `delay * (1 - ratio/2 + sample * ratio)` and clamps the result
/// to `[0, max]`. `sample` is expected in `[0, 1)`.
#[must_use]
#[expect(
    clippy::float_arithmetic,
    reason = "Jitter only spreads delays; millisecond precision is enough"
)]
pub fn apply_jitter(delay: Duration, jitter_ratio: f64, sample: f64, max: Duration) -> Duration {
    if jitter_ratio <= 0.0 {
        return delay.min(max);
    }

    let factor = (1.0 - jitter_ratio / 2.0 + sample * jitter_ratio).max(0.0);
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
        .map_or(max, |jittered| jittered.min(max))
}

/// Retry state of one `open` cycle.
///
/// `retry` is the backoff exponent and is reset whenever the channel opens. `attempts`
/// counts connect attempts in the current series so that a policy with
/// `max_attempts = N` makes exactly N attempts before giving up.
#[derive(Debug, Clone)]
pub struct RetryCounter {
    policy: RetryPolicy,
    retry: u32,
    attempts: u32,
}

impl RetryCounter {
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry: 0,
            attempts: 0,
        }
    }

    /// Records the start of a connect attempt and returns its number in the series.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    #[must_use]
    pub const fn retry(&self) -> u32 {
        self.retry
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn delay_for(&self, retry: u32, sample: f64) -> Duration {
        apply_jitter(
            unjittered_delay(&self.policy, retry),
            self.policy.jitter_ratio,
            sample,
            self.policy.max_delay,
        )
    }
}

impl Backoff for RetryCounter {
    fn reset(&mut self) {
        self.retry = 0;
        self.attempts = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if !self.policy.allows_retry_after(self.attempts) {
            return None;
        }

        self.retry = self.retry.saturating_add(1);
        let sample = rand::rng().random::<f64>();
        Some(self.delay_for(self.retry, sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, jitter_ratio: f64) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .jitter_ratio(jitter_ratio)
            .build()
    }

    #[test]
    fn unjittered_delay_doubles_until_capped() {
        let policy = policy(0, 0.0);

        let delays: Vec<_> = (1..=6)
            .map(|retry| unjittered_delay(&policy, retry).as_millis())
            .collect();

        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn unjittered_delay_is_monotonic_and_bounded() {
        let policy = policy(0, 0.0);

        let mut previous = Duration::ZERO;
        for retry in 1..=200 {
            let delay = unjittered_delay(&policy, retry);
            assert!(delay >= previous, "retry {retry} shrank the delay");
            assert!(delay <= policy.max_delay, "retry {retry} exceeded max_delay");
            previous = delay;
        }
    }

    #[test]
    fn huge_retry_numbers_saturate_at_max_delay() {
        let policy = policy(0, 0.0);

        assert_eq!(unjittered_delay(&policy, u32::MAX), policy.max_delay);
    }

    #[test]
    fn jitter_spreads_around_the_delay() {
        let delay = Duration::from_millis(400);
        let max = Duration::from_secs(1);

        assert_eq!(apply_jitter(delay, 0.5, 0.0, max), Duration::from_millis(300));
        assert_eq!(apply_jitter(delay, 0.5, 0.5, max), Duration::from_millis(400));
        assert!(apply_jitter(delay, 0.5, 0.999, max) < Duration::from_millis(500));
    }

    #[test]
    fn jitter_never_exceeds_max() {
        let max = Duration::from_secs(1);

        assert_eq!(apply_jitter(max, 1.0, 0.99, max), max);
    }

    #[test]
    fn zero_jitter_is_exact() {
        let delay = Duration::from_millis(100);

        assert_eq!(apply_jitter(delay, 0.0, 0.7, Duration::from_secs(1)), delay);
    }

    #[test]
    fn counter_stops_after_max_attempts() {
        let mut counter = RetryCounter::new(policy(3, 0.0));

        let mut delays = Vec::new();
        loop {
            counter.record_attempt();
            match counter.next_backoff() {
                Some(delay) => delays.push(delay.as_millis()),
                None => break,
            }
        }

        assert_eq!(counter.attempts(), 3);
        assert_eq!(counter.retry(), 2);
        assert_eq!(delays, vec![100, 200]);
    }

    #[test]
    fn reset_starts_a_fresh_series() {
        let mut counter = RetryCounter::new(policy(2, 0.0));
        counter.record_attempt();
        counter.next_backoff().unwrap();
        counter.record_attempt();
        assert!(counter.next_backoff().is_none());

        counter.reset();

        assert_eq!(counter.retry(), 0);
        assert_eq!(counter.attempts(), 0);
        assert_eq!(counter.next_backoff(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn jittered_backoff_stays_within_bounds() {
        let mut counter = RetryCounter::new(policy(0, 1.0));

        for _ in 0..50 {
            let delay = counter.next_backoff().unwrap();
            assert!(delay <= Duration::from_secs(1));
        }
    }
}
