//! Re-execution policy for failed work units.
//!
//! The engine itself never retries; the runner applies this policy to units
//! whose error is retryable before recording them as failed.

use std::time::Duration;

/// Policy for re-running a unit that failed with a retryable error.
#[derive(Debug, Clone, Default)]
pub enum RetryPolicy {
    /// Fail the unit on its first error.
    #[default]
    None,

    /// Fixed delay between re-runs.
    Fixed {
        /// Maximum number of re-runs.
        max_attempts: u32,
        delay: Duration,
    },

    /// Doubling delay between re-runs.
    Exponential {
        /// Maximum number of re-runs.
        max_attempts: u32,
        /// Delay before the first re-run.
        initial_delay: Duration,
        /// Upper bound for any single delay.
        max_delay: Duration,
    },
}

impl RetryPolicy {
    /// Exponential backoff starting at 1 second, capped at 5 minutes.
    pub fn exponential(max_attempts: u32) -> Self {
        Self::Exponential {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }

    /// Create a fixed delay policy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed { max_attempts, delay }
    }

    /// Delay before re-running after failed attempt number `attempt` (1-indexed).
    ///
    /// Returns `None` once the re-run budget is spent.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts() {
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
                Some(initial_delay.saturating_mul(factor).min(*max_delay))
            }
        }
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed { max_attempts, .. } | Self::Exponential { max_attempts, .. } => {
                *max_attempts
            }
        }
    }
}
