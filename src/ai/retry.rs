//! Backoff between LLM attempts
//!
//! A child is waiting on every retry, so the pause depends on why the last
//! attempt failed. A provider's `Retry-After` hint is honoured as given. A
//! rate limit without a hint backs off exponentially with equal jitter. A
//! timeout already cost the child a full call timeout, so it retries after a
//! short pause that does not grow.

use std::time::Duration;

use uuid::Uuid;

/// Retry budget for LLM calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts allowed after the first call
    pub max_retries: u32,
    /// Pause after a timeout, and the first rate-limit step
    pub base_delay: Duration,
    /// Upper bound on any single pause
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Why an attempt is being retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCause {
    RateLimited { retry_after: Option<Duration> },
    Timeout,
}

impl RetryPolicy {
    /// Pause before the attempt following `attempt` (zero-based)
    ///
    /// `jitter` is a sample in `[0, 1]`; see [`sample_jitter`].
    #[must_use]
    pub fn backoff(&self, attempt: u32, cause: RetryCause, jitter: f64) -> Duration {
        let jitter = jitter.clamp(0.0, 1.0);
        match cause {
            RetryCause::RateLimited {
                retry_after: Some(hint),
            } => hint.min(self.max_delay),
            RetryCause::RateLimited { retry_after: None } => {
                let step = self
                    .base_delay
                    .saturating_mul(2u32.saturating_pow(attempt))
                    .min(self.max_delay);
                // equal jitter: half fixed, half random
                let half = step / 2;
                half + half.mul_f64(jitter)
            }
            RetryCause::Timeout => {
                let pause = self.base_delay.min(self.max_delay);
                let half = pause / 2;
                half + half.mul_f64(jitter)
            }
        }
    }
}

/// A uniform jitter sample in `[0, 1]`
#[must_use]
pub fn sample_jitter() -> f64 {
    let (bits, ..) = Uuid::new_v4().as_fields();
    f64::from(bits) / f64::from(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(3),
        }
    }

    #[test]
    fn provider_hint_is_used_as_given() {
        let hint = Duration::from_millis(1200);
        let cause = RetryCause::RateLimited {
            retry_after: Some(hint),
        };
        assert_eq!(policy().backoff(0, cause, 0.0), hint);
        assert_eq!(policy().backoff(2, cause, 1.0), hint);
    }

    #[test]
    fn provider_hint_cannot_stall_the_child() {
        let cause = RetryCause::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        };
        assert_eq!(policy().backoff(0, cause, 0.5), Duration::from_secs(3));
    }

    #[test]
    fn unhinted_rate_limit_doubles_per_attempt() {
        let cause = RetryCause::RateLimited { retry_after: None };
        let p = policy();

        assert_eq!(p.backoff(0, cause, 1.0), Duration::from_millis(400));
        assert_eq!(p.backoff(1, cause, 1.0), Duration::from_millis(800));
        assert_eq!(p.backoff(2, cause, 1.0), Duration::from_millis(1600));
        assert_eq!(p.backoff(3, cause, 1.0), Duration::from_secs(3));
        // jitter only ever removes up to half
        assert_eq!(p.backoff(1, cause, 0.0), Duration::from_millis(400));
    }

    #[test]
    fn timeouts_retry_quickly_at_every_attempt() {
        let p = policy();
        for attempt in 0..6 {
            let pause = p.backoff(attempt, RetryCause::Timeout, 1.0);
            assert_eq!(pause, Duration::from_millis(400));
        }
        assert_eq!(p.backoff(4, RetryCause::Timeout, 0.0), Duration::from_millis(200));
    }

    #[test]
    fn out_of_range_jitter_is_clamped() {
        let p = policy();
        assert_eq!(
            p.backoff(0, RetryCause::Timeout, 7.0),
            p.backoff(0, RetryCause::Timeout, 1.0)
        );
        assert_eq!(
            p.backoff(0, RetryCause::Timeout, -1.0),
            p.backoff(0, RetryCause::Timeout, 0.0)
        );
    }

    #[test]
    fn sampled_jitter_is_a_fraction() {
        for _ in 0..100 {
            let j = sample_jitter();
            assert!((0.0..=1.0).contains(&j), "jitter {j}");
        }
    }
}
