//! Thread-safe counters exposed to an observer.
//!
//! Batch-scoped counters are updated from the single processing thread;
//! `Stats` itself is safe to read from a metrics thread concurrently thanks
//! to atomic counters, the way the teacher's own `PerformanceMetrics` is
//! read from its health-check task while the pager mutates it.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($field:ident),+ $(,)?) => {
        /// Snapshot of every counter at a point in time.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct StatsSnapshot {
            $(
                #[allow(missing_docs)]
                pub $field: u64,
            )+
        }

        /// Thread-safe running counters for one engine instance.
        ///
        /// Fields are crate-visible `AtomicU64`s: sibling modules (cache,
        /// query manager, batch, controller) bump the specific counter that
        /// applies to them directly with `fetch_add`, the way the teacher's
        /// `PerformanceMetrics` fields are touched directly by the pager.
        #[derive(Debug, Default)]
        pub struct Stats {
            $(
                #[allow(missing_docs)]
                pub $field: AtomicU64,
            )+
        }

        impl Stats {
            /// A fresh, all-zero set of counters.
            pub fn new() -> Self {
                Self::default()
            }

            $(
                #[allow(missing_docs)]
                pub fn $field(&self) -> u64 {
                    self.$field.load(Ordering::Relaxed)
                }
            )+

            /// Take a point-in-time snapshot of every counter.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $(
                        $field: self.$field(),
                    )+
                }
            }
        }

        impl StatsSnapshot {
            /// Counter deltas between this (later) snapshot and an earlier
            /// one, saturating at zero so a `Stats::new()` reset between
            /// snapshots never reports an underflowed delta.
            pub fn subtract(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
                StatsSnapshot {
                    $(
                        $field: self.$field.saturating_sub(earlier.$field),
                    )+
                }
            }
        }
    };
}

counters! {
    batches_processed,
    notices_received,
    dropped_notice_count,
    queries_prepared,
    queries_sent,
    values_received,
    cache_hits,
    cache_entries_added,
    cache_entries_removed,
    cache_values_added,
    cache_values_updated,
    cache_values_removed,
    results_prepared,
    dropped_result_count,
    cutoff_result_count,
    updates_sent,
    dropped_update_count,
    memory_limit_retries,
    processing_time_nanos,
    reception_time_nanos,
    update_time_nanos,
}

impl Stats {
    /// Add an elapsed duration to a nanosecond-accumulator field. Saturates
    /// rather than wraps so a pathologically long batch cannot corrupt the
    /// running total for every batch after it.
    pub fn add_duration(field: &AtomicU64, elapsed: std::time::Duration) {
        field.fetch_add(elapsed.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }
}
