// SPDX-License-Identifier: MIT OR Apache-2.0
//! Exponential backoff with tripling steps.

use airlift_error::{Error, ErrorKind, Result};
use std::time::Duration;

/// Retry pacing: the interval starts at `smallest` and triples every three
/// attempts (attempt 4, 7, 10, …), bounded by an optional cap.  Exceeding
/// `max_attempts` is a [`ErrorKind::MaxRetriesExceeded`] error.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    smallest: Duration,
    max_interval: Option<Duration>,
    max_attempts: u32,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Backoff starting at `smallest` with at most `max_attempts` attempts.
    pub fn new(smallest: Duration, max_attempts: u32) -> Self {
        Self {
            smallest,
            max_interval: None,
            max_attempts,
            attempt: 0,
        }
    }

    /// Cap every interval at `max_interval`.
    #[must_use]
    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = Some(max_interval);
        self
    }

    /// Next wait interval, or an error once the attempt budget is spent.
    pub fn next_interval(&mut self) -> Result<Duration> {
        self.attempt += 1;
        if self.attempt > self.max_attempts {
            return Err(Error::new(
                ErrorKind::MaxRetriesExceeded,
                format!("gave up after {} attempts", self.max_attempts),
            ));
        }
        let step = (self.attempt - 1) / 3;
        let mut interval = self.smallest;
        for _ in 0..step {
            interval = interval.saturating_mul(3);
        }
        if let Some(cap) = self.max_interval {
            interval = interval.min(cap);
        }
        Ok(interval)
    }

    /// Forget all prior attempts.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), 10)
    }
}
