//! The point cache (component C1).
//!
//! Avoids re-asking the external store for values the engine has already
//! seen, and short-circuits store queries whose window is provably covered
//! by cached values. The outer map is ordered by access recency exactly the
//! way the teacher's pager orders its page cache — `lru::LruCache` — so
//! `trim()` evicts the least-recently-touched points first; each retained
//! entry is itself a timestamp-ordered map supporting cheap range lookups.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::debug;

use crate::clock::Timestamp;
use crate::db::config::CacheConfig;
use crate::db::metrics::Stats;
use crate::model::{PointId, PointValue, StoreQuery};

/// One cached observation for a point, with the window over which it is
/// known to be the only value the store holds for that point.
#[derive(Debug, Clone)]
struct CacheValue {
    value: PointValue,
    /// Exclusive lower bound of the window this value is authoritative for.
    after: Option<Timestamp>,
    /// Exclusive upper bound of the window this value is authoritative for.
    before: Option<Timestamp>,
    /// Whether the window was established by a query that ignored nulls.
    nulls_ignored: bool,
    /// Consultations since insertion, seeded with the configured boost so a
    /// freshly inserted value survives the first `trim()` pass unconsulted.
    hits: u32,
}

/// All cached observations for a single point, ordered by timestamp so a
/// `reverse`/`forward` query is a single `range` lookup.
#[derive(Debug, Default)]
struct CacheEntry {
    values: BTreeMap<Timestamp, CacheValue>,
}

impl CacheEntry {
    fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Bounded, LRU-ordered cache of previously observed point values.
pub struct PointCache {
    entries: LruCache<PointId, CacheEntry>,
    disabled: bool,
    boost: u32,
    stats: Arc<Stats>,
}

impl PointCache {
    /// Build a cache from configuration, reporting rollups into `stats`.
    pub fn new(config: &CacheConfig, stats: Arc<Stats>) -> Self {
        let cap = NonZeroUsize::new(config.size.max(1)).expect("size clamped to >= 1 above");
        Self {
            entries: LruCache::new(cap),
            disabled: config.disabled,
            boost: config.boost,
            stats,
        }
    }

    /// Number of distinct points currently cached.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no points are cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a freshly observed notice. Returns `false` (and does nothing)
    /// if the cache is disabled or the value is not cacheable.
    pub fn accept_notice(&mut self, value: &PointValue) -> bool {
        if self.disabled || !value.flags.cacheable {
            return false;
        }
        self.insert(value.clone(), None, None, false);
        true
    }

    /// Record an about-to-be-emitted update, reporting whether its payload
    /// differs from what is currently cached for that `(point, timestamp)`.
    ///
    /// When `updates_filtered` is `false` this always reports `true`: the
    /// caller, not the cache, is the source of truth for whether filtering
    /// is active, and a disabled filter must never silently suppress
    /// updates (see the open-question note in the design notes).
    pub fn accept_update(&mut self, value: &PointValue, updates_filtered: bool) -> bool {
        if self.disabled || !value.flags.cacheable {
            // No change-tracking history exists for this value; report
            // "changed" so a disabled/uncacheable update is never silently
            // dropped by the filter.
            return true;
        }
        let changed = self.changed_from_cached(value);
        self.insert(value.clone(), None, None, false);
        changed || !updates_filtered
    }

    fn changed_from_cached(&mut self, value: &PointValue) -> bool {
        match self.entries.get(&value.point_id) {
            Some(entry) => match entry.values.get(&value.timestamp) {
                Some(existing) => {
                    existing.value.flags.deleted != value.flags.deleted
                        || !payload_eq(&existing.value.payload, &value.payload)
                }
                None => true,
            },
            None => true,
        }
    }

    /// Remove the specific `(point, timestamp)` entry, dropping the whole
    /// `CacheEntry` if it becomes empty (invariant 7).
    pub fn forget(&mut self, point_id: PointId, timestamp: Timestamp) {
        let Some(entry) = self.entries.peek_mut(&point_id) else {
            return;
        };
        if entry.values.remove(&timestamp).is_some() {
            self.stats
                .cache_values_removed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        if entry.is_empty() {
            self.entries.pop(&point_id);
            self.stats
                .cache_entries_removed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Consult the cache for a store query; returns `Some` only when the
    /// cached data provably answers the request, in which case the caller
    /// should treat the store query as cancelled.
    pub fn handle_query(&mut self, query: &StoreQuery) -> Option<PointValue> {
        if self.disabled || query.pull || query.sync || query.multi_row {
            return None;
        }
        let Some(instant) = query.interval.instant_value() else {
            return self.handle_range_query(query);
        };
        let entry = self.entries.get_mut(&query.point_id)?;
        let hit = entry.values.get_mut(&instant)?;
        hit.hits += 1;
        self.stats
            .cache_hits
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        debug!(point = ?query.point_id, stamp = ?instant, "point cache instant hit");
        Some(hit.value.clone())
    }

    fn handle_range_query(&mut self, query: &StoreQuery) -> Option<PointValue> {
        let entry = self.entries.get_mut(&query.point_id)?;
        let candidate_key = if query.reverse {
            let bound = query.interval.before?;
            entry.values.range(..bound).next_back().map(|(k, _)| *k)
        } else {
            let bound = query.interval.after?;
            entry
                .values
                .range((std::ops::Bound::Excluded(bound), std::ops::Bound::Unbounded))
                .next()
                .map(|(k, _)| *k)
        }?;
        let cached = entry.values.get_mut(&candidate_key)?;

        let window_covers = {
            let after_ok = query
                .interval
                .after
                .zip(cached.after)
                .map(|(q, c)| c <= q)
                .unwrap_or(cached.after.is_none());
            let before_ok = query
                .interval
                .before
                .zip(cached.before)
                .map(|(q, c)| c >= q)
                .unwrap_or(cached.before.is_none());
            let nulls_ok = !query.not_null || !cached.nulls_ignored;
            after_ok && before_ok && nulls_ok
        };
        if !window_covers {
            return None;
        }
        cached.hits += 1;
        self.stats
            .cache_hits
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Some(cached.value.clone())
    }

    /// Insert every value from a (possibly partial) store response, and
    /// infer each value's `[after, before)` authoritative window from
    /// adjacency within the response.
    pub fn remember_response(
        &mut self,
        point_id: PointId,
        query: &StoreQuery,
        values: &[PointValue],
        complete: bool,
    ) {
        if self.disabled || values.is_empty() {
            return;
        }
        for (i, value) in values.iter().enumerate() {
            if !value.flags.cacheable {
                continue;
            }
            // Forward responses are ascending (index 0 earliest); reverse
            // responses are descending (index 0 latest), so the neighbor
            // that bounds `after` vs `before` swaps with `query.reverse`.
            let (after, before) = if query.reverse {
                let before = if i == 0 {
                    query.interval.before
                } else {
                    Some(values[i - 1].timestamp)
                };
                let after = if i + 1 < values.len() {
                    Some(values[i + 1].timestamp)
                } else if complete {
                    query.interval.after
                } else {
                    None
                };
                (after, before)
            } else {
                let after = if i == 0 {
                    query.interval.after
                } else {
                    Some(values[i - 1].timestamp)
                };
                let before = if i + 1 < values.len() {
                    Some(values[i + 1].timestamp)
                } else if complete {
                    query.interval.before
                } else {
                    None
                };
                (after, before)
            };
            self.insert(value.clone(), after, before, query.not_null);
        }
        let _ = point_id;
    }

    fn insert(
        &mut self,
        value: PointValue,
        after: Option<Timestamp>,
        before: Option<Timestamp>,
        nulls_ignored: bool,
    ) {
        let point_id = value.point_id;
        let timestamp = value.timestamp;
        let is_new_entry = self.entries.get(&point_id).is_none();
        if is_new_entry {
            self.stats
                .cache_entries_added
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        if self.entries.get(&point_id).is_none() {
            self.entries.put(point_id, CacheEntry::default());
        }
        let entry = self.entries.get_mut(&point_id).expect("just inserted");
        let is_new_value = !entry.values.contains_key(&timestamp);
        entry.values.insert(
            timestamp,
            CacheValue {
                value,
                after,
                before,
                nulls_ignored,
                hits: self.boost,
            },
        );
        if is_new_value {
            self.stats
                .cache_values_added
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        } else {
            self.stats
                .cache_values_updated
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Evict least-recently-used points until the cache is back at or below
    /// capacity, then give every retained entry a second-chance pass: drop
    /// values with `hits == 0`, keeping at least the most recent one.
    pub fn trim(&mut self) {
        while self.entries.len() > self.entries.cap().get() {
            if let Some((_, entry)) = self.entries.pop_lru() {
                self.stats.cache_entries_removed.fetch_add(
                    1,
                    std::sync::atomic::Ordering::Relaxed,
                );
                self.stats.cache_values_removed.fetch_add(
                    entry.values.len() as u64,
                    std::sync::atomic::Ordering::Relaxed,
                );
            } else {
                break;
            }
        }
        let mut emptied = Vec::new();
        for (point_id, entry) in self.entries.iter_mut() {
            if entry.values.len() <= 1 {
                continue;
            }
            let newest = *entry.values.keys().next_back().expect("non-empty");
            let before = entry.values.len();
            entry.values.retain(|stamp, v| *stamp == newest || v.hits > 0);
            for v in entry.values.values_mut() {
                if v.hits > 0 {
                    v.hits -= 1;
                }
            }
            let removed = before - entry.values.len();
            if removed > 0 {
                self.stats
                    .cache_values_removed
                    .fetch_add(removed as u64, std::sync::atomic::Ordering::Relaxed);
            }
            if entry.is_empty() {
                emptied.push(*point_id);
            }
        }
        for point_id in emptied {
            self.entries.pop(&point_id);
            self.stats
                .cache_entries_removed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Drop the entire cache, rolling counts up to `stats` first.
    pub fn clear(&mut self) {
        let mut total_values = 0u64;
        for (_, entry) in self.entries.iter() {
            total_values += entry.values.len() as u64;
        }
        self.stats
            .cache_entries_removed
            .fetch_add(self.entries.len() as u64, std::sync::atomic::Ordering::Relaxed);
        self.stats
            .cache_values_removed
            .fetch_add(total_values, std::sync::atomic::Ordering::Relaxed);
        self.entries.clear();
    }
}

fn payload_eq(a: &Option<crate::model::Payload>, b: &Option<crate::model::Payload>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.value_eq(b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Payload, PointFlags};

    fn cacheable(point: u128, stamp: i64, payload: f64) -> PointValue {
        PointValue::new(
            PointId::new(point),
            Timestamp::from_nanos(stamp),
            Payload::Float(payload),
        )
        .with_flags(PointFlags::default().cacheable())
    }

    fn cache(size: usize) -> PointCache {
        let cfg = CacheConfig {
            size,
            ..CacheConfig::default()
        };
        PointCache::new(&cfg, Arc::new(Stats::new()))
    }

    #[test]
    fn accept_notice_then_instant_query_hits() {
        let mut c = cache(10);
        let v = cacheable(1, 100, 1.0);
        assert!(c.accept_notice(&v));

        let q = StoreQuery {
            point_id: v.point_id,
            interval: crate::clock::Interval::instant(v.timestamp),
            reverse: false,
            count_only: false,
            limit: 1,
            sync: false,
            not_null: false,
            pull: false,
            multi_row: false,
        };
        let hit = c.handle_query(&q).expect("should hit cache");
        assert_eq!(hit.timestamp, v.timestamp);
    }

    #[test]
    fn non_cacheable_value_is_not_stored() {
        let mut c = cache(10);
        let v = PointValue::new(PointId::new(1), Timestamp::from_nanos(1), Payload::Int(1));
        assert!(!c.accept_notice(&v));
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn trim_respects_capacity() {
        let mut c = cache(2);
        for i in 0..5 {
            c.accept_notice(&cacheable(i, 0, i as f64));
        }
        c.trim();
        assert!(c.len() <= 2);
    }

    #[test]
    fn accept_update_reports_unchanged_when_filtering_enabled() {
        let mut c = cache(10);
        let v = cacheable(1, 0, 9.0);
        c.accept_notice(&v);
        let same = cacheable(1, 0, 9.0);
        assert!(!c.accept_update(&same, true));
    }

    #[test]
    fn accept_update_always_reports_changed_when_filtering_disabled() {
        let mut c = cache(10);
        let v = cacheable(1, 0, 9.0);
        c.accept_notice(&v);
        let same = cacheable(1, 0, 9.0);
        assert!(c.accept_update(&same, false));
    }

    #[test]
    fn forget_drops_empty_entry() {
        let mut c = cache(10);
        let v = cacheable(1, 0, 1.0);
        c.accept_notice(&v);
        c.forget(v.point_id, v.timestamp);
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn remember_response_infers_windows_for_reverse_order() {
        // Descending response, as a reverse query actually delivers it:
        // index 0 is latest, so the neighbor bounding `before` is the
        // array-predecessor and the neighbor bounding `after` is the
        // array-successor, the opposite of a forward response.
        let mut c = cache(10);
        let values = vec![
            cacheable(1, 300, 3.0),
            cacheable(1, 200, 2.0),
            cacheable(1, 100, 1.0),
        ];
        let query = StoreQuery {
            point_id: PointId::new(1),
            interval: crate::clock::Interval {
                after: Some(Timestamp::from_nanos(150)),
                before: Some(Timestamp::from_nanos(250)),
            },
            reverse: true,
            count_only: false,
            limit: 3,
            sync: false,
            not_null: false,
            pull: false,
            multi_row: false,
        };
        c.remember_response(PointId::new(1), &query, &values, true);

        let hit = c.handle_query(&query).expect("cached window covers this query");
        assert_eq!(hit.timestamp, Timestamp::from_nanos(200));
    }
}
