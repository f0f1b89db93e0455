use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use tracing::warn;

/// A randomized wait, drawn uniformly from `[min, max]` at millisecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub const ZERO: DelayRange = DelayRange {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay)
    }

    pub fn secs(min: f64, max: f64) -> Self {
        Self::new(Duration::from_secs_f64(min), Duration::from_secs_f64(max))
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let lo = self.min.as_millis() as u64;
        let hi = self.max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(lo..=hi))
    }

    pub async fn pause(&self) {
        let delay = self.sample();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRange {
    pub min: u32,
    pub max: u32,
}

impl PixelRange {
    pub fn sample(&self) -> u32 {
        if self.max <= self.min {
            return self.min;
        }
        rand::rng().random_range(self.min..=self.max)
    }
}

/// Bounded probe loop with jittered waits between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: DelayRange,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            interval: DelayRange::secs(10.0, 22.0),
        }
    }
}

impl RetryPolicy {
    /// Run `probe` against `state` until it reports success or the attempt
    /// budget is spent. Returns the 1-based attempt that succeeded.
    pub async fn until<S, F>(&self, label: &str, state: &mut S, mut probe: F) -> Option<u32>
    where
        S: ?Sized + Send,
        F: for<'s> FnMut(&'s mut S, u32) -> BoxFuture<'s, bool>,
    {
        let attempts = self.max_attempts.max(1);
        for attempt in 1..=attempts {
            if probe(&mut *state, attempt).await {
                return Some(attempt);
            }
            if attempt < attempts {
                let wait = self.interval.sample();
                warn!(
                    label,
                    attempt,
                    max_attempts = attempts,
                    wait_ms = wait.as_millis() as u64,
                    "probe failed, waiting before next try"
                );
                tokio::time::sleep(wait).await;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_stay_within_bounds() {
        let range = DelayRange::secs(10.0, 22.0);
        for _ in 0..200 {
            let d = range.sample();
            assert!(d >= Duration::from_secs(10) && d <= Duration::from_secs(22));
        }
        let px = PixelRange { min: 2800, max: 3800 };
        for _ in 0..200 {
            let v = px.sample();
            assert!((2800..=3800).contains(&v));
        }
    }

    #[test]
    fn degenerate_ranges_collapse_to_min() {
        assert_eq!(DelayRange::fixed(Duration::from_secs(3)).sample(), Duration::from_secs(3));
        let inverted = DelayRange::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(inverted.sample(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let mut calls = 0u32;
        let policy = RetryPolicy {
            max_attempts: 3,
            interval: DelayRange::secs(10.0, 22.0),
        };
        let started = tokio::time::Instant::now();
        let outcome = policy
            .until("never", &mut calls, |calls, _| {
                Box::pin(async move {
                    *calls += 1;
                    false
                })
            })
            .await;

        assert_eq!(outcome, None);
        assert_eq!(calls, 3);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(20) && waited <= Duration::from_secs(44));
    }

    #[tokio::test(start_paused = true)]
    async fn reports_succeeding_attempt() {
        let policy = RetryPolicy {
            max_attempts: 4,
            interval: DelayRange::fixed(Duration::from_secs(1)),
        };
        let outcome = policy
            .until("third", &mut (), |_, attempt| Box::pin(async move { attempt == 3 }))
            .await;
        assert_eq!(outcome, Some(3));
    }
}
