use std::time::Duration;

/// Retry tuning for part transfers and session finalization.
///
/// Delays grow exponentially from `base_delay` and are capped at
/// `max_delay`. The schedule is deterministic so that a stalled part
/// surfaces as an error after a predictable amount of time.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries per part after the initial attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        let delay = self.base_delay.as_secs_f64() * 2f64.powi(exp as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}
