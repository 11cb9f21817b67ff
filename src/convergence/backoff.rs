//! Growing delays between convergence polls.
//!
//! ```
//! use std::time::Duration;
//! use teamchain::convergence::Backoff;
//!
//! let delays: Vec<_> = Backoff::new(Duration::from_millis(100), Duration::from_millis(300), 2.0)
//!     .take(4)
//!     .collect();
//! assert_eq!(delays[0], Duration::from_millis(100));
//! assert_eq!(delays[3], Duration::from_millis(300));
//! ```

use std::time::Duration;

/// Starts at `base`; each later delay is the previous one times `factor`,
/// held at `max` once it gets there.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor: f64,
    last: Option<Duration>,
}

impl Backoff {
    /// A factor below 1.0, or one that is not a finite number, is treated
    /// as 1.0.
    pub fn new(base: Duration, max: Duration, factor: f64) -> Self {
        let factor = if factor.is_finite() && factor >= 1.0 {
            factor
        } else {
            1.0
        };
        Self {
            base,
            max,
            factor,
            last: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.last {
            None => self.base.min(self.max),
            Some(last) => self.grow(last),
        };
        self.last = Some(delay);
        delay
    }

    /// Start again from `base`.
    pub fn reset(&mut self) {
        self.last = None;
    }

    fn grow(&self, last: Duration) -> Duration {
        if last >= self.max {
            return self.max;
        }
        let scaled = last.as_nanos() as f64 * self.factor;
        if !scaled.is_finite() || scaled >= self.max.as_nanos() as f64 {
            self.max
        } else {
            Duration::from_nanos(scaled as u64)
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_then_hold_at_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(300), 2.0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));
        assert_eq!(backoff.next_delay(), Duration::from_millis(300));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_long_runs_stay_at_max() {
        let max = Duration::from_secs(5);
        let backoff = Backoff::new(Duration::from_millis(100), max, 1.5);
        assert_eq!(backoff.skip(200).next(), Some(max));

        let huge = Backoff::new(Duration::from_secs(1), Duration::MAX, 1e300);
        assert_eq!(huge.skip(3).next(), Some(Duration::MAX));
    }

    #[test]
    fn test_bad_factors_do_not_grow() {
        for factor in [-1.0, 0.5, f64::NAN, f64::INFINITY] {
            let mut backoff =
                Backoff::new(Duration::from_millis(20), Duration::from_millis(80), factor);
            assert_eq!(backoff.next_delay(), Duration::from_millis(20));
            assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        }
    }

    #[test]
    fn test_base_above_max_is_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(9), Duration::from_secs(1), 2.0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
