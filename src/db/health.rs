//! Point-in-time health summary derived from [`super::metrics::Stats`] and
//! the controller's current memory reading.

use serde::{Deserialize, Serialize};

/// Overall health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Nothing flagged.
    Healthy,
    /// At least one check is outside its comfortable range.
    Degraded,
    /// At least one check indicates the engine cannot make progress.
    Unhealthy,
}

/// A single named health check and its current reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Check {
    /// Ratio of cache hits to total cache consultations.
    CacheHitRate {
        /// Observed ratio in `[0, 1]`.
        current: f64,
        /// Minimum acceptable ratio.
        threshold: f64,
        /// Whether `current` is within bounds.
        healthy: bool,
    },
    /// Fraction of the memory maximum currently in use.
    MemoryUse {
        /// Observed percentage.
        percent: u8,
        /// Configured maximum percentage.
        threshold: u8,
        /// Whether `percent` is within bounds.
        healthy: bool,
    },
    /// How many consecutive batches have retried after a memory-limit abort.
    MemoryLimitRetries {
        /// Consecutive retry count.
        count: u64,
        /// Whether `count` is within bounds.
        healthy: bool,
    },
    /// Seconds since the last successfully completed batch.
    LastBatchAge {
        /// Observed age.
        seconds_ago: u64,
        /// Maximum acceptable age.
        threshold: u64,
        /// Whether `seconds_ago` is within bounds.
        healthy: bool,
    },
}

/// Aggregated health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Overall verdict.
    pub status: HealthStatus,
    /// Individual checks that were evaluated.
    pub checks: Vec<Check>,
}

impl HealthCheck {
    /// Start a healthy report with no checks yet recorded.
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            checks: Vec::new(),
        }
    }

    /// Record a check, downgrading `status` if it is unhealthy.
    ///
    /// `MemoryLimitRetries` downgrades straight to `Unhealthy`: repeated
    /// memory-limit aborts mean the engine cannot currently make progress,
    /// not merely that it is under pressure.
    pub fn add_check(&mut self, check: Check) {
        let is_healthy = match &check {
            Check::CacheHitRate { healthy, .. }
            | Check::MemoryUse { healthy, .. }
            | Check::MemoryLimitRetries { healthy, .. }
            | Check::LastBatchAge { healthy, .. } => *healthy,
        };

        if !is_healthy {
            self.status = match self.status {
                HealthStatus::Healthy => HealthStatus::Degraded,
                HealthStatus::Degraded => HealthStatus::Degraded,
                HealthStatus::Unhealthy => HealthStatus::Unhealthy,
            };

            if matches!(check, Check::MemoryLimitRetries { count, .. } if count > 0) {
                self.status = HealthStatus::Unhealthy;
            }
        }

        self.checks.push(check);
    }

    /// True if the overall status is `Healthy`.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}
