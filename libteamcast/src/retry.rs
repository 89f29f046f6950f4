//! Retry eligibility and backoff for failed task attempts

use chrono::Duration;
use rand::Rng;

use crate::config::RetryConfig;
use crate::error::ErrorClass;

/// What to do with a task whose attempt just failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the task to `pending`, due again after `delay`
    Retry { delay: Duration },
    /// Fail the task for good
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// The error can never succeed on retry
    Fatal,
    /// Transient error, but `max_attempts` has been reached
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_ratio: f64,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter_ratio: config.jitter_ratio,
            max_attempts: config.max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide the fate of a task that has made `attempt_count` attempts
    pub fn decide(&self, attempt_count: u32, class: ErrorClass) -> RetryDecision {
        self.decide_with(attempt_count, class, &mut rand::thread_rng())
    }

    pub fn decide_with<R: Rng + ?Sized>(
        &self,
        attempt_count: u32,
        class: ErrorClass,
        rng: &mut R,
    ) -> RetryDecision {
        if class == ErrorClass::Fatal {
            return RetryDecision::GiveUp(GiveUpReason::Fatal);
        }
        if attempt_count >= self.max_attempts {
            return RetryDecision::GiveUp(GiveUpReason::Exhausted);
        }
        RetryDecision::Retry {
            delay: self.backoff_with(attempt_count, rng),
        }
    }

    /// Delay before the next attempt, without jitter
    ///
    /// `base * 2^(attempt_count - 1)`, capped at the configured maximum.
    pub fn nominal_backoff(&self, attempt_count: u32) -> Duration {
        Duration::milliseconds(self.nominal_ms(attempt_count) as i64)
    }

    fn nominal_ms(&self, attempt_count: u32) -> u64 {
        let exponent = attempt_count.saturating_sub(1);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Nominal backoff moved by up to ±`jitter_ratio`
    ///
    /// Once the nominal delay reaches the cap there is no jitter: every
    /// capped attempt waits exactly the maximum, and jittered delays below it
    /// stay strictly under it, so the sequence never shrinks at the cap.
    pub fn backoff_with<R: Rng + ?Sized>(&self, attempt_count: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_ms(attempt_count);
        if nominal >= self.max_delay_ms || self.jitter_ratio <= 0.0 {
            return Duration::milliseconds(nominal.max(1) as i64);
        }

        let jitter = rng.gen_range(-self.jitter_ratio..=self.jitter_ratio);
        let jittered = (nominal as f64 * (1.0 + jitter)).round() as u64;
        let below_cap = self.max_delay_ms.saturating_sub(1).max(1);
        Duration::milliseconds(jittered.clamp(1, below_cap) as i64)
    }
}
