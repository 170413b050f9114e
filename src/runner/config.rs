//! Runner settings that hosts can load from configuration files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Serializable runner settings.
///
/// ```rust,ignore
/// let config: RunnerConfig = serde_json::from_str(r#"{"max_concurrent": 8}"#)?;
/// let runner = RunnerBuilder::new(store).config(&config).mapper(job).build();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Delay between polls of the store, in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of units executed at once.
    pub max_concurrent: usize,
    /// Re-runs granted to a unit failing with a retryable error; 0 disables.
    pub retry_attempts: u32,
    /// Delay before the first re-run, in milliseconds. Doubles per attempt.
    pub retry_initial_delay_ms: u64,
    /// Cap on any single re-run delay, in milliseconds.
    pub retry_max_delay_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_concurrent: 1,
            retry_attempts: 0,
            retry_initial_delay_ms: 1000,
            retry_max_delay_ms: 300_000,
        }
    }
}

impl RunnerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        if self.retry_attempts == 0 {
            return RetryPolicy::None;
        }
        RetryPolicy::Exponential {
            max_attempts: self.retry_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}
