use std::time::Duration;

use rand::Rng;

/// Yields `base_interval * factor^(n - 1)` for the n-th retry, capped at `max_interval`. With a
/// non-zero `jitter` every delay is scaled by a random factor in `[1 - jitter, 1 + jitter]`
/// before the cap is applied.
#[derive(Debug, Clone)]
pub struct Exponential {
    base_interval: Duration,
    max_interval: Duration,
    factor: f64,
    jitter: f64,
    /// `None` retries forever.
    max_attempts: Option<u16>,
    attempt: u16,
}

impl Exponential {
    pub fn new(
        base_interval: Duration,
        max_interval: Duration,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self {
            base_interval,
            max_interval,
            factor,
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_millis(
        base_interval_ms: u64,
        max_interval_ms: u64,
        factor: f64,
        jitter: f64,
        max_attempts: Option<u16>,
    ) -> Self {
        Self::new(
            Duration::from_millis(base_interval_ms),
            Duration::from_millis(max_interval_ms),
            factor,
            jitter,
            max_attempts,
        )
    }

    /// Number of intervals handed out so far.
    pub fn attempt(&self) -> u16 {
        self.attempt
    }

    fn delay(&self) -> Duration {
        let exponent = i32::from(self.attempt.saturating_sub(1));
        let mut delay_ms = self.base_interval.as_millis() as f64 * self.factor.powi(exponent);
        if self.jitter > 0.0 {
            delay_ms *= rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        }
        Duration::from_millis(delay_ms as u64).min(self.max_interval)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self
            .max_attempts
            .is_some_and(|max_attempts| self.attempt >= max_attempts)
        {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(delays: impl Iterator<Item = Duration>) -> Vec<u128> {
        delays.map(|d| d.as_millis()).collect()
    }

    #[test]
    fn test_growth_and_cap() {
        let backoff = Exponential::from_millis(100, 500, 2.0, 0.0, Some(5));
        assert_eq!(millis(backoff), vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_unbounded() {
        let mut backoff = Exponential::from_millis(10, 1_000, 3.0, 0.0, None);
        assert_eq!(millis(backoff.by_ref().take(4)), vec![10, 30, 90, 270]);
        assert_eq!(backoff.attempt(), 4);
        assert_eq!(backoff.nth(10), Some(Duration::from_millis(1_000)));
    }

    #[test]
    fn test_no_retries() {
        let mut backoff = Exponential::from_millis(100, 500, 2.0, 0.0, Some(0));
        assert_eq!(backoff.next(), None);
        assert_eq!(backoff.attempt(), 0);
    }

    #[test]
    fn test_jitter_bounds() {
        let mut backoff = Exponential::from_millis(100, 10_000, 2.0, 0.5, Some(20));
        let first = backoff.next().unwrap();
        assert!((50..=150).contains(&first.as_millis()));

        // jitter never pushes a delay past the cap
        let mut capped = Exponential::from_millis(1_000, 1_000, 2.0, 1.0, Some(20));
        assert!(capped.all(|d| d <= Duration::from_millis(1_000)));
    }
}
