//! Retry policy for stage attempts.
//!
//! Only failures a stage classifies as retryable are retried. Every attempt,
//! failed or not, is recorded as its own run.

use std::time::Duration;

/// How often, and how patiently, a retryable stage failure is retried.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RetryPolicy {
    /// Fail on the first error.
    #[default]
    None,

    /// Constant pause between attempts.
    Fixed { retries: u32, delay: Duration },

    /// Pause doubling after each attempt, capped at `max_delay`.
    Exponential {
        retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
    },
}

impl RetryPolicy {
    /// Exponential backoff from one second up to five minutes.
    pub fn exponential(retries: u32) -> Self {
        Self::Exponential {
            retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }

    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self::Fixed { retries, delay }
    }

    /// Override the backoff bounds of an exponential policy.
    ///
    /// Other policies are returned unchanged.
    pub fn with_backoff(self, initial: Option<Duration>, max: Option<Duration>) -> Self {
        match self {
            Self::Exponential {
                retries,
                initial_delay,
                max_delay,
            } => Self::Exponential {
                retries,
                initial_delay: initial.unwrap_or(initial_delay),
                max_delay: max.unwrap_or(max_delay),
            },
            other => other,
        }
    }

    /// Pause before the attempt following failed attempt `attempt` (1-based).
    ///
    /// `None` once the retries are used up.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.retries() {
            return None;
        }
        match self {
            Self::None => None,
            Self::Fixed { delay, .. } => Some(*delay),
            Self::Exponential {
                initial_delay,
                max_delay,
                ..
            } => {
                let factor = 2u32.saturating_pow(attempt - 1);
                let delay = initial_delay
                    .checked_mul(factor)
                    .unwrap_or(*max_delay)
                    .min(*max_delay);
                Some(delay)
            }
        }
    }

    /// Retries allowed after the first attempt.
    pub fn retries(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed { retries, .. } | Self::Exponential { retries, .. } => *retries,
        }
    }

    /// Most attempts a stage can make under this policy.
    pub fn attempt_budget(&self) -> u32 {
        self.retries().saturating_add(1)
    }
}
