use crate::config::EngineConfig;
use crate::hasher::HashSample;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Which worker pool a hash job is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SizeClass {
    Large,
    Small,
}

/// Rolling averages for one size class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WorkloadStat {
    pub bytes_per_sec: f64,
    pub secs_per_file: f64,
    pub samples: u64,
}

impl WorkloadStat {
    fn record(&mut self, sample: &HashSample, alpha: f64) {
        let rate = sample.bytes_per_sec();
        let latency = sample.projected_latency();
        if self.samples == 0 {
            self.bytes_per_sec = rate;
            self.secs_per_file = latency;
        } else {
            self.bytes_per_sec = ewma(self.bytes_per_sec, rate, alpha);
            self.secs_per_file = ewma(self.secs_per_file, latency, alpha);
        }
        self.samples += 1;
    }
}

/// One EWMA step. The new value is first clamped to [avg/4, avg*4] so a single
/// outlier can move the average by a bounded factor only.
fn ewma(avg: f64, value: f64, alpha: f64) -> f64 {
    let clamped = if avg > 0.0 {
        value.clamp(avg / 4.0, avg * 4.0)
    } else {
        value
    };
    alpha * clamped + (1.0 - alpha) * avg
}

/// Large/small boundary that follows observed hashing latency.
///
/// When large files take longer than the target latency the threshold drops,
/// so more files are routed to the dedicated large pool; when they finish well
/// under target it rises again.
#[derive(Debug, Clone)]
pub struct AdaptiveThreshold {
    threshold: u64,
    min: u64,
    max: u64,
    target_latency: Duration,
    alpha: f64,
    step_down: f64,
    step_up: f64,
    large: WorkloadStat,
    small: WorkloadStat,
}

impl AdaptiveThreshold {
    pub fn new(initial: u64, min: u64, max: u64, target_latency: Duration) -> Self {
        let min = min.min(max);
        Self {
            threshold: initial.clamp(min, max),
            min,
            max,
            target_latency,
            alpha: 0.3,
            step_down: 0.75,
            step_up: 1.25,
            large: WorkloadStat::default(),
            small: WorkloadStat::default(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let mut threshold = Self::new(
            config.initial_large_threshold,
            config.min_large_threshold,
            config.max_large_threshold,
            config.target_latency(),
        );
        threshold.alpha = config.ewma_alpha.clamp(0.01, 1.0);
        threshold.step_down = config.threshold_step_down;
        threshold.step_up = config.threshold_step_up;
        threshold
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn classify(&self, size: u64) -> SizeClass {
        if size >= self.threshold {
            SizeClass::Large
        } else {
            SizeClass::Small
        }
    }

    pub fn stat(&self, class: SizeClass) -> WorkloadStat {
        match class {
            SizeClass::Large => self.large,
            SizeClass::Small => self.small,
        }
    }

    /// Large files are currently slower than the target latency.
    pub fn under_pressure(&self) -> bool {
        self.large.samples > 0 && self.large.secs_per_file > self.target_latency.as_secs_f64()
    }

    /// Fold a completed hash into the rolling stats and recalibrate.
    /// Returns true when the threshold moved.
    pub fn record_sample(&mut self, class: SizeClass, sample: HashSample) -> bool {
        match class {
            SizeClass::Large => self.large.record(&sample, self.alpha),
            SizeClass::Small => {
                self.small.record(&sample, self.alpha);
                return false;
            }
        }

        let target = self.target_latency.as_secs_f64();
        let latency = self.large.secs_per_file;
        let factor = if latency > target {
            self.step_down
        } else if latency < target / 2.0 {
            self.step_up
        } else {
            return false;
        };

        let previous = self.threshold;
        let next = (previous as f64 * factor).round();
        self.threshold = (next.max(0.0) as u64).clamp(self.min, self.max);
        if self.threshold != previous {
            debug!(
                "Large-file threshold {} -> {} bytes (rolling latency {:.1}s)",
                previous, self.threshold, latency
            );
            if self.threshold == self.min || self.threshold == self.max {
                info!("Large-file threshold reached its bound at {} bytes", self.threshold);
            }
        }
        self.threshold != previous
    }
}
