use backoff::ExponentialBackoff;
use std::time::Duration;

use crate::settings::UploaderConfig;

/// Per-task retry delay: `base` after a task's first failed attempt,
/// doubling with each further one up to `cap`. No jitter, so delays are
/// predictable on a phone that only gets signal in bursts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap: cap.max(base) }
    }

    pub fn from_config(config: &UploaderConfig) -> Self {
        Self::new(config.backoff_base, config.backoff_cap)
    }

    /// Delay after the `failures`-th failed attempt in the current budget.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let doublings = failures.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << doublings).min(self.cap)
    }
}

/// Short in-attempt backoff for a single attachment.
pub fn attachment_backoff(config: &UploaderConfig) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: config.attachment_backoff,
        initial_interval: config.attachment_backoff,
        max_interval: Duration::from_secs(4).max(config.attachment_backoff),
        max_elapsed_time: Some(Duration::from_secs(30)),
        ..Default::default()
    }
}
