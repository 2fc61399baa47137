//! The batch (component C3): the mutable working set of one processing
//! iteration.
//!
//! Mirrors the lifecycle discipline of the teacher's own `Transaction`
//! (explicit phase transitions, `clear()` to help the allocator) without
//! adopting its `Drop`-enforced commit/rollback panic: a `Batch` that is
//! dropped mid-phase is simply abandoned (see `ProcessingError::Interrupted`
//! in the processor loop), matching the design's explicit recovery paths
//! rather than treating every early exit as a programmer error.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::behavior::PointRegistry;
use crate::cache::PointCache;
use crate::clock::{Interval, Timestamp};
use crate::control::FilterControl;
use crate::db::metrics::Stats;
use crate::error::Result;
use crate::model::{
    BatchQuery, BatchQueryMode, Notice, NoticeKind, PointId, PointValue, ResultValue,
};
use crate::query::{QueryManager, ResolvedQuery, StoreClient};

type PointTimeMap = BTreeMap<PointId, BTreeMap<Timestamp, PointValue>>;

fn point_time_get<'a>(map: &'a PointTimeMap, point_id: PointId, stamp: Timestamp) -> Option<&'a PointValue> {
    map.get(&point_id).and_then(|inner| inner.get(&stamp))
}

fn point_time_insert(map: &mut PointTimeMap, value: PointValue) {
    map.entry(value.point_id).or_default().insert(value.timestamp, value);
}

fn point_time_remove(map: &mut PointTimeMap, point_id: PointId, stamp: Timestamp) -> Option<PointValue> {
    let inner = map.get_mut(&point_id)?;
    let removed = inner.remove(&stamp);
    if inner.is_empty() {
        map.remove(&point_id);
    }
    removed
}

/// The mutable working set of one processing iteration: every notice,
/// every value (input, interpolated, extrapolated, synthesized) known to
/// this batch, and the results/updates it is building toward.
pub struct Batch {
    notices: Vec<Notice>,
    notice_index: HashMap<(PointId, Timestamp), usize>,

    input_values: PointTimeMap,
    interpolated_values: PointTimeMap,
    extrapolated_values: PointTimeMap,
    synthesized_values: PointTimeMap,

    results: Vec<ResultValue>,
    result_index: HashMap<(PointId, Timestamp), usize>,
    recalc_latest_results: Vec<(PointId, Timestamp)>,
    recalc_latest_seen: HashSet<(PointId, Timestamp)>,
    fetched_result_requested: HashSet<(PointId, Timestamp)>,

    updates: Vec<PointValue>,
    queued_signals: Vec<(String, String)>,

    notice_frozen: bool,
    results_frozen: bool,

    query_manager: QueryManager,
    stats: Arc<Stats>,
    max_fixed_point_passes: usize,
}

impl Batch {
    /// Start an empty batch.
    pub fn new(stats: Arc<Stats>, max_fixed_point_passes: usize) -> Self {
        Self {
            notices: Vec::new(),
            notice_index: HashMap::new(),
            input_values: BTreeMap::new(),
            interpolated_values: BTreeMap::new(),
            extrapolated_values: BTreeMap::new(),
            synthesized_values: BTreeMap::new(),
            results: Vec::new(),
            result_index: HashMap::new(),
            recalc_latest_results: Vec::new(),
            recalc_latest_seen: HashSet::new(),
            fetched_result_requested: HashSet::new(),
            updates: Vec::new(),
            queued_signals: Vec::new(),
            notice_frozen: false,
            results_frozen: false,
            query_manager: QueryManager::new(stats.clone()),
            stats,
            max_fixed_point_passes,
        }
    }

    /// How many notices are currently accepted.
    pub fn notice_count(&self) -> usize {
        self.notices.len()
    }

    /// Every notice accepted so far, in insertion order.
    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    /// Every result currently in the batch.
    pub fn results(&self) -> &[ResultValue] {
        &self.results
    }

    /// Every update queued for emission so far.
    pub fn updates(&self) -> &[PointValue] {
        &self.updates
    }

    /// The ceiling configured for the set-up/prepare-inputs fixed-point
    /// loops.
    pub fn max_fixed_point_passes(&self) -> usize {
        self.max_fixed_point_passes
    }

    /// A mutable handle to this batch's query manager, for behaviors that
    /// enqueue store queries during `prepare_trigger`/`prepare_select`.
    pub fn query_manager_mut(&mut self) -> &mut QueryManager {
        &mut self.query_manager
    }

    fn is_cacheable_seed(value: &PointValue) -> bool {
        value.flags.cacheable && !value.flags.deleted
    }

    /// Accept a batch of incoming notices (invariant 1: a notice is stored
    /// exactly once; a second observation of the same key updates in
    /// place). `check_memory` is consulted before every insertion and a
    /// `ProcessingError::MemoryLimit` aborts the whole call, leaving every
    /// notice accepted so far in place. Every accepted regular notice is
    /// also seeded into `cache` as already-known, so a later query for the
    /// same (point, timestamp) within this batch hits the cache instead of
    /// round-tripping to the store.
    pub fn accept_notices(
        &mut self,
        notices: Vec<Notice>,
        registry: &dyn PointRegistry,
        cache: &mut PointCache,
        resynchronizes: bool,
        check_memory: &dyn Fn() -> Result<()>,
    ) -> Result<()> {
        debug_assert!(!self.notice_frozen, "accept_notices called after freeze");
        for notice in notices {
            check_memory()?;

            let def = registry.lookup(notice.value.point_id);
            let eligible = match notice.kind {
                NoticeKind::RecalcTrigger => {
                    resynchronizes || def.map(|d| !d.inputs().is_empty()).unwrap_or(false)
                }
                NoticeKind::Regular => {
                    resynchronizes || def.map(|d| !d.results().is_empty()).unwrap_or(false)
                }
            };
            if !eligible {
                self.stats
                    .dropped_notice_count
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                continue;
            }

            if let Some(sync) = def.and_then(|d| d.sync()) {
                if !sync.is_in_sync(notice.value.timestamp) {
                    let resynchronized = def.map(|d| d.resynchronized()).unwrap_or(false);
                    if resynchronized {
                        debug!(point = ?notice.value.point_id, "notice out of sync, resynchronizing point accepts anyway");
                    } else {
                        warn!(point = ?notice.value.point_id, "notice out of sync, dropping");
                        self.stats
                            .dropped_notice_count
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        continue;
                    }
                }
            }

            if notice.value.flags.deleted {
                point_time_remove(&mut self.input_values, notice.value.point_id, notice.value.timestamp);
                cache.forget(notice.value.point_id, notice.value.timestamp);
            } else if notice.kind == NoticeKind::Regular {
                if Self::is_cacheable_seed(&notice.value) {
                    point_time_insert(&mut self.input_values, notice.value.clone());
                }
                // Seed the cache so a later query for this same (point,
                // timestamp) within the batch short-circuits instead of
                // round-tripping to the store.
                cache.accept_notice(&notice.value);
            }

            let key = notice.value.key();
            match self.notice_index.get(&key) {
                Some(&idx) => self.notices[idx] = notice,
                None => {
                    self.notice_index.insert(key, self.notices.len());
                    self.notices.push(notice);
                }
            }
            self.stats
                .notices_received
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        Ok(())
    }

    /// Freeze notice acceptance (invariant 4): further calls to
    /// `accept_notices` are a programming error.
    pub fn freeze_notices(&mut self) {
        self.notice_frozen = true;
    }

    /// Freeze result creation (invariant 3): further result insertion is a
    /// programming error.
    pub fn freeze_results(&mut self) {
        self.results_frozen = true;
    }

    /// Create or update the result for `(point_id, timestamp)`, applying
    /// invariant 5: a non-replaceable result may not be overwritten by a
    /// distinct concrete value. Rejects self-triggering (invariant 6 /
    /// property P6): a notice may not create a result at its own key.
    pub fn set_up_result_value(
        &mut self,
        point_id: PointId,
        timestamp: Timestamp,
        triggered_by: Option<PointId>,
    ) -> Option<&mut ResultValue> {
        debug_assert!(!self.results_frozen, "set_up_result_value called after freeze");

        if let Some(trigger) = triggered_by {
            if trigger == point_id && self.notice_index.contains_key(&(point_id, timestamp)) {
                warn!(point = ?point_id, stamp = ?timestamp, "self-trigger suppressed");
                return None;
            }
        }

        let key = (point_id, timestamp);
        match self.result_index.get(&key) {
            Some(&idx) => {
                if !self.results[idx].replaceable {
                    debug!(point = ?point_id, stamp = ?timestamp, "result already present and not replaceable, keeping existing");
                    return self.results.get_mut(idx);
                }
                Some(&mut self.results[idx])
            }
            None => {
                let mut result = ResultValue::new(point_id, timestamp);
                result.triggered_by = triggered_by;
                self.result_index.insert(key, self.results.len());
                self.results.push(result);
                self.stats
                    .results_prepared
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.results.last_mut()
            }
        }
    }

    /// Register `(point_id, timestamp)` for the recalc-latest fetch step,
    /// if `count > 0`.
    pub fn register_recalc_latest(&mut self, point_id: PointId, timestamp: Timestamp, count: u32) {
        if count == 0 {
            return;
        }
        let key = (point_id, timestamp);
        if self.recalc_latest_seen.insert(key) {
            self.recalc_latest_results.push(key);
        }
    }

    /// Results registered for the recalc-latest fetch step.
    pub fn recalc_latest_results(&self) -> &[(PointId, Timestamp)] {
        &self.recalc_latest_results
    }

    /// Mark an existing result as replaceable, allowing a later distinct
    /// concrete value to overwrite it via `set_up_result_value`.
    pub fn mark_replaceable(&mut self, point_id: PointId, timestamp: Timestamp) {
        if let Some(&idx) = self.result_index.get(&(point_id, timestamp)) {
            self.results[idx].replaceable = true;
        }
    }

    /// Replace the result at `(point_id, timestamp)` with a fresh, empty
    /// one, only if it is marked replaceable. Returns `false` otherwise.
    pub fn replace_result_value(&mut self, point_id: PointId, timestamp: Timestamp) -> bool {
        let key = (point_id, timestamp);
        match self.result_index.get(&key) {
            Some(&idx) if self.results[idx].replaceable => {
                self.results[idx] = ResultValue::new(point_id, timestamp);
                true
            }
            _ => false,
        }
    }

    /// Every `(point, timestamp)` key currently holding a result, snapshotted
    /// so callers can iterate by key while temporarily taking individual
    /// results out of the batch (see [`Batch::take_result`]).
    pub fn result_keys(&self) -> Vec<(PointId, Timestamp)> {
        self.results.iter().map(|r| r.key()).collect()
    }

    /// Temporarily remove a result from the batch, returning ownership to
    /// the caller. Used by the prepare-inputs and compute phases so a
    /// `Behavior`/`Transform` can be handed `&mut ResultValue` and `&mut
    /// Batch` at the same time without the two aliasing each other.
    /// Pair with [`Batch::put_result`] to put an in-progress result back.
    pub fn take_result(&mut self, point_id: PointId, timestamp: Timestamp) -> Option<ResultValue> {
        let idx = self.result_index.remove(&(point_id, timestamp))?;
        let result = self.results.remove(idx);
        for v in self.result_index.values_mut() {
            if *v > idx {
                *v -= 1;
            }
        }
        Some(result)
    }

    /// Put a result previously removed by [`Batch::take_result`] back into
    /// the batch under its own key.
    pub fn put_result(&mut self, result: ResultValue) {
        let key = result.key();
        self.result_index.insert(key, self.results.len());
        self.results.push(result);
    }

    /// True if a "fetched-result" store query has already been requested
    /// for `(point_id, timestamp)` this batch (§4.6 phase 3), so the
    /// prepare-inputs fixed point does not re-enqueue it every pass.
    pub fn fetched_result_already_requested(&mut self, point_id: PointId, timestamp: Timestamp) -> bool {
        !self.fetched_result_requested.insert((point_id, timestamp))
    }

    /// Discard a result entirely (used when `select` reports a missing
    /// required input).
    pub fn drop_result(&mut self, point_id: PointId, timestamp: Timestamp) {
        if let Some(idx) = self.result_index.remove(&(point_id, timestamp)) {
            self.results.remove(idx);
            for v in self.result_index.values_mut() {
                if *v > idx {
                    *v -= 1;
                }
            }
            self.stats
                .dropped_result_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Count a result as dropped without it being present in the result
    /// index (e.g. one already pulled out via [`Batch::take_result`] for a
    /// `select` that reported a missing required input, or blocked by
    /// [`crate::control::CutoffControl`]).
    pub fn record_dropped_result(&self) {
        self.stats
            .dropped_result_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Count a result as blocked by the cutoff control (property P4); not an
    /// error, just a counted outcome (§7).
    pub fn record_cutoff_blocked(&self) {
        self.stats
            .cutoff_result_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Route a resolved value into the correct disjoint map (invariant 2)
    /// based on its own flags.
    fn file_value(&mut self, value: PointValue) {
        if value.flags.interpolated {
            point_time_insert(&mut self.interpolated_values, value);
        } else if value.flags.extrapolated {
            point_time_insert(&mut self.extrapolated_values, value);
        } else if value.flags.synthesized {
            point_time_insert(&mut self.synthesized_values, value);
        } else {
            point_time_insert(&mut self.input_values, value);
        }
    }

    /// Look up a single value per §4.3's three-way switch.
    pub fn get_point_value(&self, query: BatchQuery) -> Option<PointValue> {
        match query.mode {
            BatchQueryMode::Instant => self.lookup_instant(query.point_id, query.stamp, query.not_null, query.polated),
            BatchQueryMode::NotBefore => self.lookup_not_before(query),
            BatchQueryMode::Before => self.lookup_before(query),
        }
    }

    fn candidate_ok(&self, v: &PointValue, not_null: bool) -> bool {
        !(not_null && v.payload.is_none())
    }

    fn lookup_instant(
        &self,
        point_id: PointId,
        stamp: Timestamp,
        not_null: bool,
        polated: bool,
    ) -> Option<PointValue> {
        if let Some(v) = point_time_get(&self.input_values, point_id, stamp) {
            if self.candidate_ok(v, not_null) {
                return Some(v.clone());
            }
        }
        if !polated {
            return None;
        }
        for map in [&self.interpolated_values, &self.extrapolated_values, &self.synthesized_values] {
            if let Some(v) = point_time_get(map, point_id, stamp) {
                if self.candidate_ok(v, not_null) {
                    return Some(v.clone());
                }
            }
        }
        None
    }

    fn candidates_for(&self, point_id: PointId, polated: bool) -> Vec<&BTreeMap<Timestamp, PointValue>> {
        let mut maps = vec![];
        if let Some(m) = self.input_values.get(&point_id) {
            maps.push(m);
        }
        if polated {
            for source in [&self.interpolated_values, &self.extrapolated_values, &self.synthesized_values] {
                if let Some(m) = source.get(&point_id) {
                    maps.push(m);
                }
            }
        }
        maps
    }

    fn lookup_not_before(&self, query: BatchQuery) -> Option<PointValue> {
        let maps = self.candidates_for(query.point_id, query.polated);
        let mut cursor = query.stamp;
        loop {
            let next = maps
                .iter()
                .filter_map(|m| m.range(cursor..).next())
                .min_by_key(|(t, _)| **t)?;
            let (stamp, value) = next;
            if self.candidate_ok(value, query.not_null) {
                return Some(value.clone());
            }
            cursor = stamp.after();
        }
    }

    fn lookup_before(&self, query: BatchQuery) -> Option<PointValue> {
        let maps = self.candidates_for(query.point_id, query.polated);
        let mut cursor = query.stamp;
        loop {
            let next = maps
                .iter()
                .filter_map(|m| m.range(..cursor).next_back())
                .max_by_key(|(t, _)| **t)?;
            let (stamp, value) = next;
            if self.candidate_ok(value, query.not_null) {
                return Some(value.clone());
            }
            cursor = *stamp;
        }
    }

    /// Every accumulated value for `point_id` within `interval`, merging
    /// inputs with interpolated/extrapolated/synthesized values when
    /// `polated` is set. Priority on a timestamp collision is input >
    /// interpolated > extrapolated > synthesized.
    ///
    /// When `polated` and `sync` are both set, the actual inputs are
    /// supplemented with a synthesized lattice: every cadence timestamp
    /// `sync` reports within `interval` that has no actual value gets one
    /// filled in via [`Batch::get_point_value`]'s interpolated → extrapolated
    /// → synthesized priority, and the result is merged with the real inputs
    /// in time order (§4.3).
    pub fn get_point_values(
        &self,
        point_id: PointId,
        interval: Interval,
        polated: bool,
        sync: Option<&dyn crate::behavior::SyncPredicate>,
    ) -> Vec<PointValue> {
        let mut merged: BTreeMap<Timestamp, PointValue> = BTreeMap::new();
        let sources = if polated {
            vec![
                &self.synthesized_values,
                &self.extrapolated_values,
                &self.interpolated_values,
                &self.input_values,
            ]
        } else {
            vec![&self.input_values]
        };
        for source in sources {
            if let Some(inner) = source.get(&point_id) {
                for (stamp, value) in inner.iter() {
                    if interval.contains(*stamp) {
                        merged.insert(*stamp, value.clone());
                    }
                }
            }
        }
        if polated {
            if let Some(sync) = sync {
                for stamp in sync.timestamps_in(interval) {
                    if merged.contains_key(&stamp) {
                        continue;
                    }
                    if let Some(filled) = self.lookup_instant(point_id, stamp, false, true) {
                        merged.insert(stamp, filled);
                    }
                }
            }
        }
        merged.into_values().collect()
    }

    /// Queue an update for emission, consulting the cache's change test
    /// through `filter` (§4.2's `updates_filtered` mode / property P5).
    pub fn add_update(&mut self, value: PointValue, cache: &mut PointCache, filter: &FilterControl) {
        if cache.accept_update(&value, filter.is_enabled()) {
            self.updates.push(value);
            self.stats
                .updates_sent
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        } else {
            self.stats
                .dropped_update_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Enqueue a store query on behalf of a relation's behavior. The cache
    /// is consulted later, when the batch drains its pending queries (see
    /// [`QueryManager::enqueue`]) — a behavior only ever holds `&mut Batch`.
    pub fn enqueue_query(&mut self, query: crate::model::StoreQuery) {
        self.query_manager.enqueue(query);
    }

    /// Drain every pending store query against `store`, filing each
    /// returned value into the correct disjoint map. Returns the resolved
    /// queries for callers that need the raw per-query results (e.g. to
    /// detect an empty response).
    pub fn process_store_queries(
        &mut self,
        store: &dyn StoreClient,
        cache: &mut PointCache,
    ) -> Result<Vec<ResolvedQuery>> {
        let resolved = self.query_manager.drain(store, cache)?;
        for r in &resolved {
            for value in &r.values {
                self.file_value(value.clone());
            }
        }
        Ok(resolved)
    }

    /// True if the query manager has queries still to drain.
    pub fn has_pending_queries(&self) -> bool {
        self.query_manager.has_pending()
    }

    /// Queue a signal for the alerter, bounding growth the way the design's
    /// reference TTL cache bounds its pending-breach buffer.
    pub fn queue_signal(&mut self, name: impl Into<String>, info: impl Into<String>) {
        const MAX_QUEUED_SIGNALS: usize = 1024;
        if self.queued_signals.len() >= MAX_QUEUED_SIGNALS {
            self.queued_signals.remove(0);
        }
        self.queued_signals.push((name.into(), info.into()));
    }

    /// Drain every queued signal for the alerter to consume.
    pub fn drain_signals(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.queued_signals)
    }

    /// Release every map, helping the allocator before the batch is dropped.
    pub fn clear(&mut self) {
        self.notices.clear();
        self.notice_index.clear();
        self.input_values.clear();
        self.interpolated_values.clear();
        self.extrapolated_values.clear();
        self.synthesized_values.clear();
        self.results.clear();
        self.result_index.clear();
        self.recalc_latest_results.clear();
        self.recalc_latest_seen.clear();
        self.fetched_result_requested.clear();
        self.updates.clear();
        self.queued_signals.clear();
    }
}

/// Convert a computed result into a plain value ready for emission,
/// applying the §4.6 compute-phase conversion rules.
pub fn finalize_result(
    result: &ResultValue,
    outcome: crate::behavior::TransformOutcome,
    null_removes: bool,
) -> Option<PointValue> {
    match outcome {
        crate::behavior::TransformOutcome::Disabled => None,
        crate::behavior::TransformOutcome::Value(mut value) => {
            if value.payload.is_none() && !null_removes {
                return None;
            }
            if value.payload.is_none() {
                value.flags.deleted = true;
            }
            value.point_id = result.point_id;
            value.timestamp = result.timestamp;
            Some(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::config::CacheConfig;
    use crate::model::{NoticeKind, Payload, PointFlags};

    struct EmptyRegistry;
    impl PointRegistry for EmptyRegistry {
        fn lookup(&self, _point_id: PointId) -> Option<&dyn crate::behavior::PointDefinition> {
            None
        }
    }

    fn stats() -> Arc<Stats> {
        Arc::new(Stats::new())
    }

    fn regular(point: u128, stamp: i64, payload: f64) -> Notice {
        Notice::regular(
            PointValue::new(PointId::new(point), Timestamp::from_nanos(stamp), Payload::Float(payload))
                .with_flags(PointFlags::default().cacheable()),
        )
    }

    #[test]
    fn duplicate_notice_updates_in_place() {
        let mut batch = Batch::new(stats(), 8);
        let mut cache = PointCache::new(&CacheConfig::default(), stats());
        let registry = EmptyRegistry;
        batch
            .accept_notices(vec![regular(1, 0, 1.0)], &registry, &mut cache, true, &|| Ok(()))
            .unwrap();
        batch
            .accept_notices(vec![regular(1, 0, 2.0)], &registry, &mut cache, true, &|| Ok(()))
            .unwrap();
        assert_eq!(batch.notice_count(), 1);
    }

    #[test]
    fn notice_with_no_declared_results_is_dropped_unless_resynchronizing() {
        let mut batch = Batch::new(stats(), 8);
        let mut cache = PointCache::new(&CacheConfig::default(), stats());
        let registry = EmptyRegistry;
        batch
            .accept_notices(vec![regular(1, 0, 1.0)], &registry, &mut cache, false, &|| Ok(()))
            .unwrap();
        assert_eq!(batch.notice_count(), 0);
    }

    #[test]
    fn recalc_trigger_with_no_inputs_is_dropped() {
        let mut batch = Batch::new(stats(), 8);
        let mut cache = PointCache::new(&CacheConfig::default(), stats());
        let registry = EmptyRegistry;
        let notice = Notice::recalc_trigger(PointValue::new(
            PointId::new(1),
            Timestamp::from_nanos(0),
            Payload::Float(1.0),
        ));
        batch
            .accept_notices(vec![notice], &registry, &mut cache, false, &|| Ok(()))
            .unwrap();
        assert_eq!(batch.notice_count(), 0);
        assert_eq!(batch.notices().len(), 0);
    }

    #[test]
    fn deletion_notice_removes_input_value() {
        let mut batch = Batch::new(stats(), 8);
        let mut cache = PointCache::new(&CacheConfig::default(), stats());
        let registry = EmptyRegistry;
        batch
            .accept_notices(vec![regular(1, 0, 1.0)], &registry, &mut cache, true, &|| Ok(()))
            .unwrap();
        assert!(batch
            .get_point_value(BatchQuery {
                point_id: PointId::new(1),
                stamp: Timestamp::from_nanos(0),
                mode: BatchQueryMode::Instant,
                not_null: false,
                sync: false,
                polated: false,
            })
            .is_some());

        let deletion = Notice {
            value: PointValue::deletion(PointId::new(1), Timestamp::from_nanos(0)),
            kind: NoticeKind::Regular,
        };
        batch
            .accept_notices(vec![deletion], &registry, &mut cache, true, &|| Ok(()))
            .unwrap();
        assert!(batch
            .get_point_value(BatchQuery {
                point_id: PointId::new(1),
                stamp: Timestamp::from_nanos(0),
                mode: BatchQueryMode::Instant,
                not_null: false,
                sync: false,
                polated: false,
            })
            .is_none());
    }

    #[test]
    fn set_up_result_value_rejects_replacing_non_replaceable_with_distinct() {
        let mut batch = Batch::new(stats(), 8);
        let point = PointId::new(9);
        let stamp = Timestamp::from_nanos(0);
        batch.set_up_result_value(point, stamp, None);
        assert!(!batch.replace_result_value(point, stamp));
        assert_eq!(batch.results().len(), 1);
    }

    #[test]
    fn set_up_result_value_allows_replacing_when_marked_replaceable() {
        let mut batch = Batch::new(stats(), 8);
        let point = PointId::new(9);
        let stamp = Timestamp::from_nanos(0);
        batch.set_up_result_value(point, stamp, None);
        batch.mark_replaceable(point, stamp);
        assert!(batch.replace_result_value(point, stamp));
    }

    #[test]
    fn self_trigger_is_suppressed() {
        let mut batch = Batch::new(stats(), 8);
        let mut cache = PointCache::new(&CacheConfig::default(), stats());
        let registry = EmptyRegistry;
        batch
            .accept_notices(vec![regular(1, 0, 1.0)], &registry, &mut cache, true, &|| Ok(()))
            .unwrap();
        let created = batch.set_up_result_value(PointId::new(1), Timestamp::from_nanos(0), Some(PointId::new(1)));
        assert!(created.is_none());
    }

    #[test]
    fn get_point_values_merges_within_interval() {
        let mut batch = Batch::new(stats(), 8);
        point_time_insert(
            &mut batch.input_values,
            PointValue::new(PointId::new(1), Timestamp::from_nanos(10), Payload::Float(1.0)),
        );
        point_time_insert(
            &mut batch.input_values,
            PointValue::new(PointId::new(1), Timestamp::from_nanos(20), Payload::Float(2.0)),
        );
        let values = batch.get_point_values(PointId::new(1), Interval::UNBOUNDED, false, None);
        assert_eq!(values.len(), 2);
    }

    struct EveryTen;
    impl crate::behavior::SyncPredicate for EveryTen {
        fn is_in_sync(&self, stamp: Timestamp) -> bool {
            stamp.as_nanos() % 10 == 0
        }
    }

    #[test]
    fn get_point_values_fills_sync_lattice_gaps_with_extrapolated() {
        let mut batch = Batch::new(stats(), 8);
        point_time_insert(
            &mut batch.input_values,
            PointValue::new(PointId::new(1), Timestamp::from_nanos(10), Payload::Float(1.0)),
        );
        point_time_insert(
            &mut batch.extrapolated_values,
            PointValue::new(PointId::new(1), Timestamp::from_nanos(20), Payload::Float(9.0))
                .with_flags(PointFlags::default().extrapolated()),
        );
        let interval = Interval {
            after: Some(Timestamp::from_nanos(0)),
            before: Some(Timestamp::from_nanos(30)),
        };
        let values = batch.get_point_values(PointId::new(1), interval, true, Some(&EveryTen));
        let stamps: Vec<i64> = values.iter().map(|v| v.timestamp.as_nanos()).collect();
        assert_eq!(stamps, vec![10, 20]);
        assert!(values[1].flags.extrapolated);
    }

    #[test]
    fn get_point_values_without_sync_does_not_synthesize_gaps() {
        let mut batch = Batch::new(stats(), 8);
        point_time_insert(
            &mut batch.input_values,
            PointValue::new(PointId::new(1), Timestamp::from_nanos(10), Payload::Float(1.0)),
        );
        point_time_insert(
            &mut batch.extrapolated_values,
            PointValue::new(PointId::new(1), Timestamp::from_nanos(20), Payload::Float(9.0))
                .with_flags(PointFlags::default().extrapolated()),
        );
        let interval = Interval {
            after: Some(Timestamp::from_nanos(0)),
            before: Some(Timestamp::from_nanos(15)),
        };
        let values = batch.get_point_values(PointId::new(1), interval, true, None);
        assert_eq!(values.len(), 1);
    }
}
