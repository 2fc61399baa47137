//! The processor loop (component C6).
//!
//! Owns the top-level per-iteration algorithm of §4.6: drain due updates,
//! fetch notices, run the four-phase `process`, emit or roll back. Runs on
//! a dedicated OS thread, the way the teacher runs its group-commit and
//! compaction background work — entirely synchronous, CPU/store-bound
//! phases with no async yield points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::behavior::PointRegistry;
use crate::clock::{Clock, Interval, Timestamp};
use crate::control::{CutoffControl, FilterControl};
use crate::db::batch::{finalize_result, Batch};
use crate::db::config::EngineConfig;
use crate::db::controller::{BatchController, MemoryProbe};
use crate::db::metrics::Stats;
use crate::error::{ProcessingError, Result};
use crate::model::{BatchQuery, BatchQueryMode, Notice, PointValue};
use crate::query::StoreClient;

/// Supplies incoming notices and the commit/rollback handshake on the
/// inbound side (§6.1). A single `ProcessorLoop` drives one receptionist.
pub trait Receptionist {
    /// Fetch up to `limit` notices, waiting at most `timeout` (`None` means
    /// wait indefinitely). Returns an empty vector on timeout.
    fn fetch(&mut self, limit: usize, timeout: Option<Duration>) -> Result<Vec<Notice>>;

    /// Acknowledge the most recently fetched batch as durably processed.
    fn commit(&mut self) -> Result<()>;

    /// Release the most recently fetched batch back for redelivery.
    fn rollback(&mut self) -> Result<()>;
}

/// One downstream store the engine emits updates to (§6.2). The engine
/// calls `add_update` for every update in a batch, then `send_updates`
/// once; a `None` entry in the returned vector means that update was
/// accepted, in the same order as it was added.
pub trait DownstreamStore {
    /// Queue `value` for the next `send_updates` call.
    fn add_update(&mut self, value: &PointValue);

    /// Flush every queued update, returning a per-update outcome: `None`
    /// for success, `Some(message)` for a per-update failure.
    fn send_updates(&mut self) -> Result<Vec<Option<String>>>;
}

/// Emits queued service-level signals at the end of a successful batch
/// (§6.3).
pub trait Alerter {
    /// Deliver one `(name, info)` signal.
    fn send_signal(&mut self, name: &str, info: &str) -> Result<()>;
}

/// Converts a millisecond monotonic-clock reading (as carried by the
/// cutoff control point's payload) into an engine [`Timestamp`].
fn millis_to_timestamp(millis: i64) -> Timestamp {
    Timestamp::from_nanos(millis.saturating_mul(1_000_000))
}

/// Drives one engine instance's batches to completion, end to end.
pub struct ProcessorLoop {
    controller: BatchController,
    registry: Arc<dyn PointRegistry>,
    store: Arc<dyn StoreClient>,
    clock: Arc<dyn Clock>,
    stats: Arc<Stats>,
    cutoff: CutoffControl,
    filter: FilterControl,
    resynchronizes: bool,
}

impl ProcessorLoop {
    /// Build a processor from configuration, a loaded point registry, the
    /// external store client used to resolve queries, a clock, and a
    /// memory probe.
    pub fn new(
        config: &EngineConfig,
        registry: Arc<dyn PointRegistry>,
        store: Arc<dyn StoreClient>,
        clock: Arc<dyn Clock>,
        stats: Arc<Stats>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Self> {
        let controller = BatchController::new(config, stats.clone(), probe)?;
        Ok(Self {
            controller,
            registry,
            store,
            clock,
            stats,
            cutoff: CutoffControl::unset(),
            filter: FilterControl::new(config.cache.updates_filtered),
            resynchronizes: config.resynchronizes,
        })
    }

    /// Counters for this processor's engine instance.
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// The controller's current adaptive batch limit.
    pub fn batch_limit(&self) -> usize {
        self.controller.batch_limit()
    }

    /// Refresh the cutoff control from its source point's current value.
    pub fn refresh_cutoff(&mut self, control_value: Option<&PointValue>) {
        self.cutoff.refresh(control_value, millis_to_timestamp);
    }

    /// Refresh the updates-filter control from its source point's current
    /// value.
    pub fn refresh_filter(&mut self, control_value: Option<&PointValue>) {
        self.filter.refresh(control_value);
    }

    /// Schedule a deferred update to be surfaced by the next `run_once`
    /// (or directly by [`Self::due_updates`]) once `at` is reached.
    pub fn schedule_update(&mut self, at: Timestamp, update: PointValue) {
        self.controller.schedule_update(at, update);
    }

    /// Drain every deferred update currently due at or before `now`, without
    /// running a full loop iteration. Exposed for callers driving the engine
    /// one step at a time (tests, embedding code with their own event loop).
    pub fn due_updates(&mut self, now: Timestamp) -> Vec<PointValue> {
        self.controller.get_due_updates(now, self.filter.is_enabled())
    }

    /// Run until `stop` is set, driving `receptionist`/`stores`/`alerter`.
    /// Returns on a `StoreAccess`/unrecoverable error (the caller is
    /// expected to request a service restart) or once `stop` flips true.
    pub fn run(
        &mut self,
        receptionist: &mut dyn Receptionist,
        stores: &mut [Box<dyn DownstreamStore>],
        alerter: &mut dyn Alerter,
        stop: &AtomicBool,
    ) -> Result<()> {
        while !stop.load(Ordering::Relaxed) {
            self.run_once(receptionist, stores, alerter, stop)?;
        }
        Ok(())
    }

    /// One pass of the top-level loop in §4.6: drain due updates, fetch a
    /// batch of notices, process it, emit or roll back.
    pub fn run_once(
        &mut self,
        receptionist: &mut dyn Receptionist,
        stores: &mut [Box<dyn DownstreamStore>],
        alerter: &mut dyn Alerter,
        stop: &AtomicBool,
    ) -> Result<()> {
        let now = self.clock.now();
        let due = self.controller.get_due_updates(now, self.filter.is_enabled());
        if !due.is_empty() {
            self.emit_updates(&due, stores)?;
        }

        let timeout = self
            .controller
            .next_due_at()
            .map(|at| {
                let remaining = at.as_nanos().saturating_sub(now.as_nanos());
                Duration::from_nanos(remaining.max(0) as u64)
            });
        let notices = receptionist.fetch(self.controller.batch_limit(), timeout)?;
        if notices.is_empty() || stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        let received: Vec<PointValue> = notices.iter().map(|n| n.value.clone()).collect();

        let start = std::time::Instant::now();
        match self.process(notices, stop) {
            Ok((updates, signals)) => {
                self.emit_updates(&updates, stores)?;
                receptionist.commit()?;
                self.controller.commit_traces(&received, &updates)?;
                self.controller.after_batch_completed(true);
                self.controller.trim_cache();
                for (name, info) in signals {
                    if let Err(e) = alerter.send_signal(&name, &info) {
                        warn!(error = %e, "alerter signal delivery failed");
                    }
                }
                self.stats
                    .batches_processed
                    .fetch_add(1, Ordering::Relaxed);
                Stats::add_duration(&self.stats.processing_time_nanos, start.elapsed());
            }
            Err(ProcessingError::MemoryLimit) => {
                debug!("batch aborted on memory limit, rolling back for retry");
                self.controller.rollback_traces();
                receptionist.rollback()?;
                self.controller.after_batch_completed(false);
            }
            Err(e @ ProcessingError::StoreAccess(_)) => {
                error!(error = %e, "store access failure, requesting restart");
                self.controller.rollback_traces();
                receptionist.rollback()?;
                return Err(e);
            }
            Err(e) => {
                warn!(error = %e, "batch aborted, rolling back");
                self.controller.rollback_traces();
                receptionist.rollback()?;
            }
        }
        Ok(())
    }

    fn emit_updates(&mut self, updates: &[PointValue], stores: &mut [Box<dyn DownstreamStore>]) -> Result<()> {
        for store in stores.iter_mut() {
            for update in updates {
                store.add_update(update);
            }
            let outcomes = store.send_updates()?;
            for outcome in outcomes.into_iter().flatten() {
                warn!(error = %outcome, "downstream store rejected an update");
            }
        }
        Ok(())
    }

    /// Run the four phases of §4.6 against a freshly fetched notice batch,
    /// returning the computed updates and queued alerter signals. An `Err`
    /// means the whole batch should be rolled back. `stop` is polled between
    /// each `ResultValue` computation so a service-stop request lands
    /// without waiting for the whole batch to finish (§5).
    pub fn process(
        &mut self,
        notices: Vec<Notice>,
        stop: &AtomicBool,
    ) -> Result<(Vec<PointValue>, Vec<(String, String)>)> {
        let store = self.store.clone();
        let mut batch = self.accept_notices(notices)?;
        self.set_up_results(&mut batch, &*store)?;
        self.prepare_inputs(&mut batch, &*store)?;
        let updates = self.compute_results(&mut batch, stop)?;
        let signals = batch.drain_signals();
        batch.clear();
        Ok((updates, signals))
    }

    fn accept_notices(&mut self, notices: Vec<Notice>) -> Result<Batch> {
        let notices_count = notices.len();
        let mut batch = self.controller.new_batch();
        let probe = self.controller.probe_handle();
        let max_percent = self.controller.memory_max_percent();
        let check_memory = move || -> Result<()> {
            if probe.sample().percent_of_max() > max_percent {
                Err(ProcessingError::MemoryLimit)
            } else {
                Ok(())
            }
        };
        let registry = self.registry.clone();
        let resynchronizes = self.resynchronizes;
        let cache = self.controller.cache_mut();
        match batch.accept_notices(notices, &*registry, cache, resynchronizes, &check_memory) {
            Ok(()) => Ok(batch),
            Err(ProcessingError::MemoryLimit) => {
                self.controller.handle_memory_limit_exceeded();
                if notices_count > 1 {
                    Err(ProcessingError::MemoryLimit)
                } else {
                    warn!("single oversized notice dropped after memory-limit breach");
                    Ok(batch)
                }
            }
            Err(e) => Err(e),
        }
    }

    fn set_up_results(&mut self, batch: &mut Batch, store: &dyn StoreClient) -> Result<()> {
        let max_passes = batch.max_fixed_point_passes();
        let registry = self.registry.clone();

        let mut pass = 0usize;
        loop {
            let mut all_ready = true;
            for notice in batch.notices().to_vec() {
                if notice.kind != crate::model::NoticeKind::Regular {
                    continue;
                }
                if let Some(def) = registry.lookup(notice.value.point_id) {
                    for relation in def.results() {
                        if !relation.behavior.prepare_trigger(&notice, batch) {
                            all_ready = false;
                        }
                    }
                }
            }
            if all_ready {
                break;
            }
            self.drain_queries(batch, store)?;
            pass += 1;
            if pass > max_passes {
                return Err(ProcessingError::ServiceNotAvailable(
                    "set-up fixed point did not converge within max_fixed_point_passes".into(),
                ));
            }
        }

        for notice in batch.notices().to_vec() {
            match notice.kind {
                crate::model::NoticeKind::Regular => {
                    if let Some(def) = registry.lookup(notice.value.point_id) {
                        for relation in def.results() {
                            relation.behavior.trigger(&notice, batch);
                        }
                    }
                }
                crate::model::NoticeKind::RecalcTrigger => {
                    batch.set_up_result_value(notice.value.point_id, notice.value.timestamp, None);
                }
            }
        }

        let blocked: Vec<_> = batch
            .results()
            .iter()
            .filter(|r| !self.cutoff.verify(*r))
            .map(|r| r.key())
            .collect();
        for (point_id, timestamp) in blocked {
            batch.take_result(point_id, timestamp);
            batch.record_cutoff_blocked();
        }

        let keys: Vec<_> = batch.results().iter().map(|r| r.key()).collect();
        for (point_id, timestamp) in keys {
            if let Some(def) = registry.lookup(point_id) {
                batch.register_recalc_latest(point_id, timestamp, def.recalc_latest());
            }
        }

        batch.freeze_results();
        Ok(())
    }

    fn prepare_inputs(&mut self, batch: &mut Batch, store: &dyn StoreClient) -> Result<()> {
        let max_passes = batch.max_fixed_point_passes();
        let registry = self.registry.clone();

        let mut pass = 0usize;
        loop {
            let mut all_ready = true;
            for (point_id, timestamp) in batch.result_keys() {
                let Some(result) = batch.take_result(point_id, timestamp) else {
                    continue;
                };
                if let Some(def) = registry.lookup(point_id) {
                    for relation in def.inputs() {
                        if !relation.behavior.prepare_select(&result, batch) {
                            all_ready = false;
                        }
                    }
                }
                batch.put_result(result);
            }
            if all_ready {
                break;
            }
            self.drain_queries(batch, store)?;
            pass += 1;
            if pass > max_passes {
                return Err(ProcessingError::ServiceNotAvailable(
                    "prepare-inputs fixed point did not converge within max_fixed_point_passes".into(),
                ));
            }
        }

        for (point_id, timestamp) in batch.result_keys() {
            let Some(mut result) = batch.take_result(point_id, timestamp) else {
                continue;
            };
            let mut admitted = true;
            if let Some(def) = registry.lookup(point_id) {
                for relation in def.inputs() {
                    if !relation.behavior.select(&mut result, batch) {
                        admitted = false;
                        break;
                    }
                }
            }
            if !admitted {
                batch.record_dropped_result();
                continue;
            }
            if let Some(def) = registry.lookup(point_id) {
                if def.transform().uses_fetched_result()
                    && !batch.fetched_result_already_requested(point_id, timestamp)
                {
                    let query = crate::model::StoreQuery {
                        point_id,
                        interval: Interval::instant(timestamp),
                        reverse: false,
                        count_only: false,
                        limit: 1,
                        sync: false,
                        not_null: false,
                        pull: false,
                        multi_row: false,
                    };
                    batch.enqueue_query(query);
                }
            }
            batch.put_result(result);
        }
        self.drain_queries(batch, store)?;

        for (point_id, timestamp) in batch.result_keys() {
            let Some(mut result) = batch.take_result(point_id, timestamp) else {
                continue;
            };
            let needs_fetched = registry
                .lookup(point_id)
                .map(|def| def.transform().uses_fetched_result())
                .unwrap_or(false);
            if needs_fetched && !result.inputs.iter().any(|v| v.flags.fetched) {
                if let Some(fetched) = batch.get_point_value(BatchQuery {
                    point_id,
                    stamp: timestamp,
                    mode: BatchQueryMode::Instant,
                    not_null: false,
                    sync: false,
                    polated: true,
                }) {
                    result.inputs.push(fetched);
                }
            }
            batch.put_result(result);
        }
        Ok(())
    }

    fn drain_queries(&mut self, batch: &mut Batch, store: &dyn StoreClient) -> Result<()> {
        loop {
            batch.process_store_queries(store, self.controller.cache_mut())?;
            if !batch.has_pending_queries() {
                break;
            }
        }
        Ok(())
    }

    /// Computes each result's update in turn, checking `stop` between every
    /// `ResultValue` so a service-stop request is honored promptly even
    /// mid-batch (§5): the batch so far is abandoned without a commit,
    /// matching `ProcessingError::Interrupted`'s documented recovery (no
    /// partial emission, the whole batch rolls back).
    fn compute_results(&mut self, batch: &mut Batch, stop: &AtomicBool) -> Result<Vec<PointValue>> {
        let registry = self.registry.clone();
        let filter = self.filter;
        let mut updates = Vec::new();

        for (point_id, timestamp) in batch.result_keys() {
            if stop.load(Ordering::Relaxed) {
                return Err(ProcessingError::Interrupted);
            }
            let Some(result) = batch.take_result(point_id, timestamp) else {
                continue;
            };
            let def = match registry.lookup(point_id) {
                Some(def) => def,
                None => {
                    batch.record_dropped_result();
                    continue;
                }
            };
            let outcome = def.transform().apply_to(&result, batch);
            let null_removes = def.transform().null_removes(point_id);
            match finalize_result(&result, outcome, null_removes) {
                Some(update) => {
                    batch.add_update(update.clone(), self.controller.cache_mut(), &filter);
                    updates.push(update);
                }
                None => batch.record_dropped_result(),
            }
        }
        Ok(updates)
    }
}
