//! Retry timing for the update cycle
//!
//! The pipeline never retries a stage in place. Every outcome ends the cycle
//! in `Waiting`, and [`RetrySchedule`] decides how long that wait is:
//!
//! - success: the success interval, and the failure streak resets
//! - failure: the failure interval, grown by `backoff_multiplier` per
//!   consecutive failure and capped at `max_failure_interval`, with optional
//!   jitter
//!
//! With the default multiplier of 1.0 every failure waits exactly the failure
//! interval.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Delay policy with a consecutive-failure streak
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    config: RetryConfig,
    failures: u32,
}

impl RetrySchedule {
    /// Start with no failures recorded
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Delay before the first attempt
    pub fn initial(&self) -> Duration {
        self.config.initial_delay
    }

    /// Record a completed cycle and return the recheck delay
    pub fn on_success(&mut self) -> Duration {
        if self.failures > 0 {
            tracing::info!(failures = self.failures, "cycle succeeded after failures");
        }
        self.failures = 0;
        self.config.success_interval
    }

    /// Record a failed cycle and return the retry delay
    pub fn on_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.backoff_delay();
        if self.config.jitter {
            add_jitter(delay)
        } else {
            delay
        }
    }

    /// Consecutive failed cycles so far
    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    fn backoff_delay(&self) -> Duration {
        let base = self.config.failure_interval;
        let cap = self.config.max_failure_interval.max(base);
        let exponent = i32::try_from(self.failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let grown = base.as_secs_f64() * self.config.backoff_multiplier.max(1.0).powi(exponent);
        if !grown.is_finite() || grown >= cap.as_secs_f64() {
            return cap;
        }
        Duration::from_secs_f64(grown)
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}
