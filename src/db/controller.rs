//! The batch controller (component C5).
//!
//! Owns the point cache, manufactures batches, enforces the memory-pressure
//! discipline of §4.5, tracks scheduled deferred updates, and commits the
//! per-batch trace streams. Mirrors the way the teacher's `GroupCommitState`
//! and `CompactionState` each own one piece of cross-batch state behind a
//! small, explicit API rather than letting the caller reach into internals.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::PointCache;
use crate::clock::Timestamp;
use crate::db::batch::Batch;
use crate::db::config::{EngineConfig, MemoryConfig};
use crate::db::metrics::Stats;
use crate::db::trace::TraceWriter;
use crate::error::{ProcessingError, Result};
use crate::model::PointValue;

/// A point-in-time memory reading: bytes currently in use, and bytes
/// considered the hard ceiling this engine instance may occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    /// Bytes currently resident/committed.
    pub used_bytes: u64,
    /// The configured ceiling `used_bytes` is measured against.
    pub max_bytes: u64,
}

impl MemorySample {
    /// `used_bytes` as a percentage of `max_bytes`, saturating at 100.
    pub fn percent_of_max(&self) -> u8 {
        if self.max_bytes == 0 {
            return 0;
        }
        ((self.used_bytes.saturating_mul(100)) / self.max_bytes).min(100) as u8
    }
}

/// Supplies the current process memory reading. Implementations must be
/// cheap: the controller probes on every Batch map insertion.
pub trait MemoryProbe: Send + Sync {
    /// The current reading.
    fn sample(&self) -> MemorySample;
}

/// Best-effort resident-memory probe. On Linux, reads the resident set size
/// from `/proc/self/statm`; elsewhere it always reports zero use, which
/// disables the memory-pressure discipline rather than guessing wrong.
#[derive(Debug, Clone, Copy)]
pub struct ProcessMemoryProbe {
    max_bytes: u64,
}

impl ProcessMemoryProbe {
    /// Build a probe whose ceiling is `max_bytes`.
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    #[cfg(target_os = "linux")]
    fn resident_bytes() -> u64 {
        let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
            return 0;
        };
        let page_size = 4096u64;
        statm
            .split_whitespace()
            .nth(1)
            .and_then(|pages| pages.parse::<u64>().ok())
            .map(|pages| pages * page_size)
            .unwrap_or(0)
    }

    #[cfg(not(target_os = "linux"))]
    fn resident_bytes() -> u64 {
        0
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn sample(&self) -> MemorySample {
        MemorySample {
            used_bytes: Self::resident_bytes(),
            max_bytes: self.max_bytes,
        }
    }
}

/// A fixed reading for deterministic tests (scenario 3 depends on this).
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryProbe {
    sample: MemorySample,
}

impl FixedMemoryProbe {
    /// Always report `sample`.
    pub fn new(sample: MemorySample) -> Self {
        Self { sample }
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn sample(&self) -> MemorySample {
        self.sample
    }
}

/// Owns cross-batch state: the point cache, the adaptive batch-size limit,
/// scheduled deferred updates, and the trace streams.
pub struct BatchController {
    cache: PointCache,
    stats: Arc<Stats>,
    memory: MemoryConfig,
    probe: Arc<dyn MemoryProbe>,
    batch_limit: usize,
    batch_limit_max: usize,
    max_fixed_point_passes: usize,
    scheduled_updates: BTreeMap<Timestamp, Vec<PointValue>>,
    received_trace: TraceWriter,
    sent_trace: TraceWriter,
    consecutive_memory_limit_retries: u64,
}

impl BatchController {
    /// Build a controller from configuration, reporting into `stats` and
    /// probing memory via `probe`.
    pub fn new(config: &EngineConfig, stats: Arc<Stats>, probe: Arc<dyn MemoryProbe>) -> Result<Self> {
        config.validate()?;
        let received_trace = TraceWriter::open(
            config.trace.data_directory.join("received.trace"),
            config.trace.enabled,
        )?;
        let sent_trace = TraceWriter::open(
            config.trace.data_directory.join("sent.trace"),
            config.trace.enabled,
        )?;
        Ok(Self {
            cache: PointCache::new(&config.cache, stats.clone()),
            stats,
            memory: config.memory.clone(),
            probe,
            batch_limit: config.batch.limit_initial,
            batch_limit_max: config.batch.limit_maximum,
            max_fixed_point_passes: config.max_fixed_point_passes,
            scheduled_updates: BTreeMap::new(),
            received_trace,
            sent_trace,
            consecutive_memory_limit_retries: 0,
        })
    }

    /// The batch limit the next batch should be built with.
    pub fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    /// Manufacture a fresh, empty batch sized to the current limit.
    pub fn new_batch(&self) -> Batch {
        Batch::new(self.stats.clone(), self.max_fixed_point_passes)
    }

    /// Mutable access to the owned point cache.
    pub fn cache_mut(&mut self) -> &mut PointCache {
        &mut self.cache
    }

    /// A standalone memory check combining probe and remediation, for
    /// callers that do not also hold a separate borrow of the cache (e.g.
    /// tests, or call sites outside `Batch::accept_notices`). Processor code
    /// that must pass a `&mut PointCache` into `accept_notices` alongside a
    /// `check_memory` closure should use [`BatchController::probe_handle`] /
    /// [`BatchController::memory_max_percent`] to build a closure that only
    /// probes, and call [`BatchController::handle_memory_limit_exceeded`]
    /// itself once `accept_notices` returns, to avoid borrowing the
    /// controller twice at once.
    pub fn check_memory(&mut self) -> Result<()> {
        if self.probe.sample().percent_of_max() > self.memory.total_use_maximum {
            self.handle_memory_limit_exceeded();
            return Err(ProcessingError::MemoryLimit);
        }
        Ok(())
    }

    /// A cloned handle to the memory probe, for building a self-contained
    /// `check_memory` closure that does not borrow the controller.
    pub fn probe_handle(&self) -> Arc<dyn MemoryProbe> {
        self.probe.clone()
    }

    /// The configured `total_use_maximum` percentage (§4.5's in-batch cap).
    pub fn memory_max_percent(&self) -> u8 {
        self.memory.total_use_maximum
    }

    /// Remediate an in-batch memory-limit breach (accept-notices phase):
    /// clear the cache and halve the next batch limit, per the worked
    /// retry scenario (1000 notices tripping the cap retry at 500).
    pub fn handle_memory_limit_exceeded(&mut self) {
        warn!(
            cap = self.memory.total_use_maximum,
            "memory cap exceeded mid-batch, clearing cache and halving batch limit"
        );
        self.cache.clear();
        self.batch_limit = (self.batch_limit / 2).max(1);
        self.stats
            .memory_limit_retries
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.consecutive_memory_limit_retries += 1;
    }

    /// How many consecutive batches have just retried after a memory-limit
    /// abort (health-check input).
    pub fn consecutive_memory_limit_retries(&self) -> u64 {
        self.consecutive_memory_limit_retries
    }

    /// Apply the post-batch half/double adjustment of §4.5. `full_batch`
    /// is whether the batch ran at the current limit without being cut
    /// short by a memory-limit retry.
    pub fn after_batch_completed(&mut self, full_batch: bool) {
        self.consecutive_memory_limit_retries = 0;
        let sample = self.probe.sample();
        let percent = sample.percent_of_max();
        if percent > self.memory.total_use_high {
            self.batch_limit = (self.batch_limit / 2).max(1);
            info!(new_limit = self.batch_limit, percent, "batch limit halved");
        } else if full_batch {
            let actual_committed_low = self.memory.actual_use_low.max(self.memory.total_use_low);
            if percent < actual_committed_low {
                let doubled = self.batch_limit.saturating_mul(2).min(self.batch_limit_max);
                if doubled != self.batch_limit {
                    self.batch_limit = doubled;
                    info!(new_limit = self.batch_limit, percent, "batch limit doubled");
                }
            }
        }
    }

    /// Schedule a deferred update to be surfaced by `get_due_updates` once
    /// `at` is reached.
    pub fn schedule_update(&mut self, at: Timestamp, update: PointValue) {
        self.scheduled_updates.entry(at).or_default().push(update);
    }

    /// The earliest scheduled deferred-update timestamp, if any; used by the
    /// processor loop to bound how long it waits on the receptionist.
    pub fn next_due_at(&self) -> Option<Timestamp> {
        self.scheduled_updates.keys().next().copied()
    }

    /// Drain every deferred update scheduled at or before `now`, up to the
    /// current batch limit, feeding each through the cache's
    /// `accept_update` as a side effect (so a later notice-driven update at
    /// the same key is recognised as unchanged if filtering is enabled).
    pub fn get_due_updates(&mut self, now: Timestamp, updates_filtered: bool) -> Vec<PointValue> {
        let mut due = Vec::new();
        let mut exhausted = Vec::new();
        for (&stamp, updates) in self.scheduled_updates.range(..=now) {
            for u in updates {
                if due.len() >= self.batch_limit {
                    break;
                }
                due.push(u.clone());
            }
            exhausted.push(stamp);
            if due.len() >= self.batch_limit {
                break;
            }
        }
        for stamp in exhausted {
            self.scheduled_updates.remove(&stamp);
        }
        for u in &due {
            self.cache.accept_update(u, updates_filtered);
        }
        due
    }

    /// Commit the current batch's trace appends and reset the in-batch
    /// memory-limit retry counter.
    pub fn commit_traces(&mut self, received: &[PointValue], sent: &[PointValue]) -> Result<()> {
        self.received_trace.append_and_commit(received)?;
        self.sent_trace.append_and_commit(sent)?;
        Ok(())
    }

    /// Discard whatever was buffered for this batch without writing it.
    pub fn rollback_traces(&mut self) {
        self.received_trace.rollback();
        self.sent_trace.rollback();
    }

    /// Trim the point cache back to its configured capacity.
    pub fn trim_cache(&mut self) {
        self.cache.trim();
    }
}
