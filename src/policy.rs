//! Flush policy: decides from queue state whether a batch should go out now.
//!
//! The count trigger and the staleness trigger are independent escape
//! valves; either one alone is enough to flush.

use std::time::Duration;

use crate::config::ConfigError;

/// Default number of queued events that triggers a flush.
pub const DEFAULT_COUNT_THRESHOLD: usize = 10;

/// Default maximum age of the oldest queued event.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(300);

/// Decision function evaluated after every enqueue and every sent batch.
pub trait FlushPolicy: Send + Sync {
    /// `oldest_age` is the age of the oldest queued event, or zero when
    /// the queue is empty.
    fn should_flush(&self, count: usize, oldest_age: Duration) -> bool;
}

/// `count >= count_threshold OR oldest_age >= staleness`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdPolicy {
    count_threshold: usize,
    staleness: Duration,
}

impl ThresholdPolicy {
    /// # Errors
    ///
    /// Returns `ConfigError` when `count_threshold` is zero, since that would
    /// flush an empty queue on every check.
    pub fn new(count_threshold: usize, staleness: Duration) -> Result<Self, ConfigError> {
        if count_threshold == 0 {
            return Err(ConfigError {
                message: "flush count threshold must be greater than 0".to_string(),
                env_var: None,
            });
        }

        Ok(Self {
            count_threshold,
            staleness,
        })
    }

    pub fn count_threshold(&self) -> usize {
        self.count_threshold
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            count_threshold: DEFAULT_COUNT_THRESHOLD,
            staleness: DEFAULT_STALENESS,
        }
    }
}

impl FlushPolicy for ThresholdPolicy {
    fn should_flush(&self, count: usize, oldest_age: Duration) -> bool {
        // No "age of nothing": an empty queue never flushes.
        if count == 0 {
            return false;
        }
        count >= self.count_threshold || oldest_age >= self.staleness
    }
}
