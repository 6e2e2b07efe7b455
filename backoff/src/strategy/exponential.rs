use std::time::Duration;

/// An Exponential Backoff strategy that increases the delay exponentially with each retry.
///
/// The delay before retry `k` is `base_interval * factor^(k - 1)`, capped at `max_interval`.
/// The iterator ends after `max_retries` delays have been handed out.
///
/// # Example
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let mut backoff = Exponential::from_millis(1000, 60_000, 2.0, 3);
///
/// assert_eq!(backoff.next(), Some(Duration::from_secs(1)));
/// assert_eq!(backoff.next(), Some(Duration::from_secs(2)));
/// assert_eq!(backoff.next(), Some(Duration::from_secs(4)));
/// assert_eq!(backoff.next(), None);
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    /// The delay before the first retry.
    base_interval: Duration,
    /// The cap.
    max_interval: Duration,
    factor: f64,
    max_retries: usize,
    /// Retries handed out so far.
    current_retry: usize,
}

impl Exponential {
    pub fn new(
        base_interval: Duration,
        max_interval: Duration,
        factor: f64,
        max_retries: usize,
    ) -> Self {
        Self {
            base_interval,
            max_interval,
            factor,
            max_retries,
            current_retry: 0,
        }
    }

    /// Creates an Exponential backoff from milliseconds.
    pub fn from_millis(
        base_interval_ms: u64,
        max_interval_ms: u64,
        factor: f64,
        max_retries: usize,
    ) -> Self {
        Self::new(
            Duration::from_millis(base_interval_ms),
            Duration::from_millis(max_interval_ms),
            factor,
            max_retries,
        )
    }

    /// Resets the backoff to its initial state.
    pub fn reset(&mut self) {
        self.current_retry = 0;
    }

    pub fn current_retry(&self) -> usize {
        self.current_retry
    }

    fn calculate_delay(&self, retry: usize) -> Duration {
        // clamp to 1 so that retry 0 never computes factor^-1
        let exponent = i32::try_from(retry.max(1) - 1).unwrap_or(i32::MAX);
        let delay_ms = (self.base_interval.as_millis() as f64) * self.factor.powi(exponent);
        // `as` saturates, an overflowing product ends up at the cap
        Duration::from_millis(delay_ms as u64).min(self.max_interval)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_retry >= self.max_retries {
            return None;
        }

        self.current_retry += 1;
        Some(self.calculate_delay(self.current_retry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_millis() {
        let backoff = Exponential::from_millis(100, 10000, 2.0, 3);
        assert_eq!(backoff.base_interval, Duration::from_millis(100));
        assert_eq!(backoff.max_interval, Duration::from_millis(10000));
        assert_eq!(backoff.factor, 2.0);
        assert_eq!(backoff.max_retries, 3);
    }

    #[test]
    fn test_exponential_growth() {
        let mut backoff = Exponential::from_millis(100, 10000, 2.0, 10);

        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(800)));
    }

    #[test]
    fn test_max_interval_cap() {
        let mut backoff = Exponential::from_millis(100, 300, 2.0, 10);

        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
        // capped
        assert_eq!(backoff.next(), Some(Duration::from_millis(300)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(300)));
    }

    #[test]
    fn test_huge_exponent_stays_at_cap() {
        let mut backoff = Exponential::from_millis(1000, 60_000, 2.0, 5000);
        let last = backoff.by_ref().last();
        assert_eq!(last, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_max_retries() {
        let mut backoff = Exponential::from_millis(100, 10000, 2.0, 3);

        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert_eq!(backoff.next(), None);
    }

    #[test]
    fn test_zero_retries() {
        let mut backoff = Exponential::from_millis(100, 10000, 2.0, 0);
        assert_eq!(backoff.next(), None);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Exponential::from_millis(100, 10000, 2.0, 10);

        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.current_retry(), 2);

        backoff.reset();

        assert_eq!(backoff.current_retry(), 0);
        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
    }
}
