use std::time::Duration;

use crate::retry::RetryPolicy;

/// Tuning for the upload orchestrator.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub limits: ConcurrencyLimits,
    pub retry: RetryPolicy,
    pub authorizer: AuthorizerConfig,
    pub speed: SpeedConfig,
}

/// Caps on concurrent work.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimits {
    /// Sessions allowed to transfer at once; the rest queue in FIFO order.
    pub max_sessions: usize,
    /// Part uploads in flight per session.
    pub parts_per_session: usize,
    /// Buffered events per subscriber before the oldest are dropped.
    pub event_capacity: usize,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            max_sessions: 3,
            parts_per_session: 3,
            event_capacity: 256,
        }
    }
}

/// Presigned-URL cache behavior.
#[derive(Debug, Clone)]
pub struct AuthorizerConfig {
    /// Parts requested per presign round trip.
    pub batch_size: u32,
    /// An authorization this close to expiry counts as expired.
    pub safety_margin: Duration,
}

impl Default for AuthorizerConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            safety_margin: Duration::from_secs(60),
        }
    }
}

/// Sliding-window throughput estimation.
#[derive(Debug, Clone)]
pub struct SpeedConfig {
    /// Only samples newer than this feed the estimate.
    pub window: Duration,
    /// Completions closer together than this merge into one sample.
    pub min_sample_interval: Duration,
    /// Hard cap on retained samples.
    pub max_samples: usize,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5),
            min_sample_interval: Duration::from_millis(500),
            max_samples: 100,
        }
    }
}
