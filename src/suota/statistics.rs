//! Upload throughput statistics.

use std::time::Duration;

/// Rolling record of per-block throughput samples in bytes per second.
#[derive(Debug, Clone, Default)]
pub struct SpeedStatistics {
    speeds: Vec<f64>,
    sum: f64,
    max: f64,
    min: f64,
    current: f64,
}

impl SpeedStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every sample. Called when a transfer starts.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record `bytes` transferred over `elapsed`. Zero-length intervals are ignored.
    pub fn record(&mut self, bytes: usize, elapsed: Duration) -> Option<f64> {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        let speed = bytes as f64 / secs;
        if self.speeds.is_empty() {
            self.max = speed;
            self.min = speed;
        } else {
            self.max = self.max.max(speed);
            self.min = self.min.min(speed);
        }
        self.speeds.push(speed);
        self.sum += speed;
        self.current = speed;
        Some(speed)
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn avg(&self) -> f64 {
        if self.speeds.is_empty() {
            0.0
        } else {
            self.sum / self.speeds.len() as f64
        }
    }

    pub fn samples(&self) -> &[f64] {
        &self.speeds
    }
}
