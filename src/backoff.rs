//! A pure, independently-testable exponential backoff sequence.
//!
//! Kept decoupled from `tokio::time::sleep` (it is just an `Iterator<Item = Duration>`)
//! so tests can drive it without waiting on a clock, the same shape as the retry
//! iterator this is grounded on.

use std::time::Duration;

use rand::Rng;

const DEFAULT_INITIAL: Duration = Duration::from_millis(100);
const DEFAULT_MAX: Duration = Duration::from_secs(60);
const DEFAULT_MULTIPLIER: u32 = 2;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,
    max: Duration,
    multiplier: u32,
    jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            current: DEFAULT_INITIAL,
            max: DEFAULT_MAX,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: u32) -> Self {
        Self {
            current: initial,
            max,
            multiplier,
            jitter: true,
        }
    }

    #[cfg(test)]
    fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Resets the sequence back to its initial delay, as called on a successful
    /// subscribe.
    pub fn reset(&mut self) {
        *self = Self {
            current: DEFAULT_INITIAL,
            max: self.max,
            multiplier: self.multiplier,
            jitter: self.jitter,
        };
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.current.min(self.max);
        let next = self.current.saturating_mul(self.multiplier);
        self.current = if next > self.max { self.max } else { next };

        if !self.jitter {
            return Some(delay);
        }
        // Full jitter: a uniformly random delay in [0, delay].
        let millis = delay.as_millis().max(1) as u64;
        let jittered = rand::rng().random_range(0..=millis);
        Some(Duration::from_millis(jittered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_geometrically_until_capped() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1), 2).without_jitter();
        let delays: Vec<_> = (0..6).map(|_| backoff.next().unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let mut backoff = ExponentialBackoff::default().without_jitter();
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.next(), Some(DEFAULT_INITIAL));
    }

    #[test]
    fn jittered_delay_never_exceeds_the_cap() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(100), 2);
        for _ in 0..50 {
            assert!(backoff.next().unwrap() <= Duration::from_millis(100));
        }
    }
}
