use std::collections::VecDeque;
use std::time::Instant;

use crate::config::SpeedConfig;

/// Sliding-window throughput estimator.
///
/// Each completed part records a sample; samples older than the window are
/// ignored, so the rate tracks recent behavior instead of the whole
/// transfer. Completions that land close together merge into one sample to
/// keep the window from filling with bursts.
#[derive(Debug)]
pub struct SpeedEstimator {
    config: SpeedConfig,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedEstimator {
    pub fn new(config: SpeedConfig) -> Self {
        Self {
            config,
            samples: VecDeque::new(),
        }
    }

    /// Record `bytes` transferred at the current instant.
    pub fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        match self.samples.back_mut() {
            Some((at, total)) if now.duration_since(*at) < self.config.min_sample_interval => {
                *total += bytes;
            }
            _ => self.samples.push_back((now, bytes)),
        }

        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > self.config.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > self.config.max_samples {
            self.samples.pop_front();
        }
    }

    /// Bytes per second over the samples still inside the window.
    ///
    /// Needs at least two fresh samples to produce a rate; returns zero
    /// otherwise.
    pub fn bytes_per_second(&self) -> f64 {
        let now = Instant::now();
        let fresh: Vec<&(Instant, u64)> = self
            .samples
            .iter()
            .filter(|(at, _)| now.duration_since(*at) <= self.config.window)
            .collect();
        if fresh.len() < 2 {
            return 0.0;
        }

        let first = fresh[0].0;
        let last = fresh[fresh.len() - 1].0;
        let elapsed = last.duration_since(first).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }

        let total: u64 = fresh.iter().map(|(_, bytes)| bytes).sum();
        total as f64 / elapsed
    }

    /// Seconds until `remaining` bytes drain at the current rate, or `None`
    /// when the rate is unknown.
    pub fn eta_seconds(&self, remaining: u64) -> Option<f64> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(remaining as f64 / speed)
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}
