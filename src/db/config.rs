//! Engine configuration.
//!
//! Layered the way the teacher crate's `db::Config` is: one aggregate struct
//! with a `Default` matching the documented defaults, plus named presets for
//! common deployment profiles.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ProcessingError, Result};

/// Point-cache sizing and behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Disable the point cache entirely (every lookup goes to the store).
    pub disabled: bool,
    /// Maximum number of distinct points held in the cache.
    pub size: usize,
    /// Hit-count head start given to freshly inserted cache values so they
    /// survive the first `trim()` pass even before being consulted.
    pub boost: u32,
    /// Suppress updates that are numerically identical to the cached value.
    pub updates_filtered: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            size: 1000,
            boost: 10,
            updates_filtered: false,
        }
    }
}

/// Batch sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Batch size the controller starts with.
    pub limit_initial: usize,
    /// Upper bound the adaptive algorithm will never exceed.
    pub limit_maximum: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            limit_initial: 1000,
            limit_maximum: 5000,
        }
    }
}

/// Memory-pressure thresholds, all expressed as percentages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Below this percentage of total memory, the batch limit may grow.
    pub total_use_low: u8,
    /// Above this percentage of total memory, the batch limit is halved.
    pub total_use_high: u8,
    /// Above this percentage of total memory, the batch is aborted.
    pub total_use_maximum: u8,
    /// Below this percentage of *currently committed* memory, the batch
    /// limit may grow, even if `total_use_low` has not been reached.
    pub actual_use_low: u8,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            total_use_low: 5,
            total_use_high: 50,
            total_use_maximum: 75,
            actual_use_low: 25,
        }
    }
}

impl MemoryConfig {
    fn validate(&self) -> Result<()> {
        let all = [
            self.total_use_low,
            self.total_use_high,
            self.total_use_maximum,
            self.actual_use_low,
        ];
        if all.iter().any(|p| *p > 100) {
            return Err(ProcessingError::Config(
                "memory thresholds must be percentages in 0..=100".into(),
            ));
        }
        if self.total_use_low > self.total_use_high || self.total_use_high > self.total_use_maximum
        {
            return Err(ProcessingError::Config(
                "memory thresholds must satisfy low <= high <= maximum".into(),
            ));
        }
        Ok(())
    }
}

/// Append-only trace-stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Enable writing received/sent trace streams.
    pub enabled: bool,
    /// Directory the trace streams are written under.
    pub data_directory: PathBuf,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            data_directory: PathBuf::from("./traces"),
        }
    }
}

/// Top-level engine configuration, aggregating every sub-config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Point-cache settings.
    pub cache: CacheConfig,
    /// Batch sizing.
    pub batch: BatchConfig,
    /// Memory-pressure thresholds.
    pub memory: MemoryConfig,
    /// Trace-stream settings.
    pub trace: TraceConfig,
    /// When true, notices are accepted even for points with no declared
    /// results (or recalc-triggers for points with no declared inputs).
    pub resynchronizes: bool,
    /// Ceiling on fixed-point passes during set-up and prepare-inputs,
    /// guarding against a misbehaving behavior that never converges.
    pub max_fixed_point_passes: usize,
    /// `tracing` env-filter directive string, e.g. `"info"` or
    /// `"derived_values_engine=debug,warn"`.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            memory: MemoryConfig::default(),
            trace: TraceConfig::default(),
            resynchronizes: false,
            max_fixed_point_passes: 64,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Favor durability and a stable footprint: traces enabled, filtering
    /// on, conservative batch ceiling.
    pub fn production() -> Self {
        Self {
            cache: CacheConfig {
                updates_filtered: true,
                ..CacheConfig::default()
            },
            batch: BatchConfig {
                limit_initial: 500,
                limit_maximum: 2000,
            },
            trace: TraceConfig {
                enabled: true,
                data_directory: PathBuf::from("/var/lib/derived-values/traces"),
            },
            ..Self::default()
        }
    }

    /// A middle ground: traces on, larger batches, filtering off.
    pub fn balanced() -> Self {
        Self {
            batch: BatchConfig {
                limit_initial: 1000,
                limit_maximum: 5000,
            },
            trace: TraceConfig {
                enabled: true,
                data_directory: PathBuf::from("./traces"),
            },
            ..Self::default()
        }
    }

    /// Throughput over everything: traces off, larger cache, bigger batches.
    pub fn benchmark() -> Self {
        Self {
            cache: CacheConfig {
                size: 50_000,
                ..CacheConfig::default()
            },
            batch: BatchConfig {
                limit_initial: 5000,
                limit_maximum: 20_000,
            },
            trace: TraceConfig {
                enabled: false,
                data_directory: PathBuf::from("./traces"),
            },
            ..Self::default()
        }
    }

    /// Parse a TOML document into a fully layered config, falling back to
    /// `Default` for any section or field the document omits.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| ProcessingError::Config(format!("invalid engine config: {e}")))
    }

    /// Load and parse `path`, the way the teacher's CLI config loader reads
    /// its own TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Validate cross-field invariants not expressible through `Default`
    /// alone. Called once at start-up; a failure here is a refuse-to-start
    /// `ProcessingError::Config`.
    pub fn validate(&self) -> Result<()> {
        self.memory.validate()?;
        if self.batch.limit_initial == 0 {
            return Err(ProcessingError::Config(
                "batch.limit.initial must be at least 1".into(),
            ));
        }
        if self.batch.limit_initial > self.batch.limit_maximum {
            return Err(ProcessingError::Config(
                "batch.limit.initial must not exceed batch.limit.maximum".into(),
            ));
        }
        if self.max_fixed_point_passes == 0 {
            return Err(ProcessingError::Config(
                "max_fixed_point_passes must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
