//! Black-box scenarios from the design's testable-properties section,
//! driven through the public API with an in-memory fake store, a fixed
//! point registry, and a sum transform (`S = A_t + A_{t-PERIOD}`).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use derived_values_engine::behavior::{
    PointDefinition, PointRegistry, PrimaryBehavior, Relation, Transform, TransformOutcome,
};
use derived_values_engine::clock::{Interval, Timestamp};
use derived_values_engine::db::controller::{FixedMemoryProbe, MemoryProbe, MemorySample};
use derived_values_engine::db::{Alerter, DownstreamStore, EngineConfig, ProcessorLoop, Receptionist, Stats};
use derived_values_engine::model::{
    BatchQuery, BatchQueryMode, Notice, Payload, PointFlags, PointId, PointValue, StoreQuery,
};
use derived_values_engine::query::{StoreClient, StoreResponse};

const PERIOD: i64 = 1_000;
const POINT_A: u128 = 1;
const POINT_S: u128 = 2;

fn stamp(n: i64) -> Timestamp {
    Timestamp::from_nanos(n * PERIOD)
}

fn cacheable(point: u128, n: i64, value: f64) -> PointValue {
    PointValue::new(PointId::new(point), stamp(n), Payload::Float(value))
        .with_flags(PointFlags::default().cacheable())
}

/// An in-memory store keyed by `(point, timestamp)`, answering single-row
/// instant queries the way the prepare-inputs phase issues them.
#[derive(Default)]
struct FakeStore {
    rows: Mutex<BTreeMap<(PointId, Timestamp), PointValue>>,
}

impl FakeStore {
    fn with(values: Vec<PointValue>) -> Self {
        let mut rows = BTreeMap::new();
        for v in values {
            rows.insert(v.key(), v);
        }
        Self {
            rows: Mutex::new(rows),
        }
    }

    fn put(&self, v: PointValue) {
        self.rows.lock().unwrap().insert(v.key(), v);
    }
}

impl StoreClient for FakeStore {
    fn query(&self, query: &StoreQuery) -> derived_values_engine::error::Result<StoreResponse> {
        let rows = self.rows.lock().unwrap();
        let values: Vec<PointValue> = if let Some(instant) = query.interval.instant_value() {
            rows.get(&(query.point_id, instant))
                .cloned()
                .into_iter()
                .map(|mut v| {
                    v.flags.fetched = true;
                    v
                })
                .collect()
        } else {
            rows.values()
                .filter(|v| v.point_id == query.point_id && query.interval.contains(v.timestamp))
                .take(query.limit.max(1))
                .cloned()
                .map(|mut v| {
                    v.flags.fetched = true;
                    v
                })
                .collect()
        };
        Ok(StoreResponse {
            values,
            complete: true,
        })
    }
}

/// Attached to point A's `results` relation: every regular notice on A
/// creates (or updates) the result for S at the same timestamp.
struct TriggerSum;
impl PrimaryBehavior for TriggerSum {
    fn prepare_trigger(&self, _notice: &Notice, _batch: &mut derived_values_engine::db::Batch) -> bool {
        true
    }
    fn trigger(&self, notice: &Notice, batch: &mut derived_values_engine::db::Batch) {
        batch.set_up_result_value(PointId::new(POINT_S), notice.value.timestamp, Some(notice.value.point_id));
    }
    fn prepare_select(&self, _result: &derived_values_engine::model::ResultValue, _batch: &mut derived_values_engine::db::Batch) -> bool {
        true
    }
    fn select(&self, _result: &mut derived_values_engine::model::ResultValue, _batch: &mut derived_values_engine::db::Batch) -> bool {
        true
    }
}

/// Attached to S's `inputs` relation: fetches A at the result's own
/// timestamp and at `timestamp - PERIOD`, populating `result.inputs` with
/// both in that order.
struct SelectSum;
impl PrimaryBehavior for SelectSum {
    fn prepare_trigger(&self, _notice: &Notice, _batch: &mut derived_values_engine::db::Batch) -> bool {
        true
    }
    fn trigger(&self, _notice: &Notice, _batch: &mut derived_values_engine::db::Batch) {}

    fn prepare_select(&self, result: &derived_values_engine::model::ResultValue, batch: &mut derived_values_engine::db::Batch) -> bool {
        let prior = Timestamp::from_nanos(result.timestamp.as_nanos() - PERIOD);
        if batch
            .get_point_value(BatchQuery {
                point_id: PointId::new(POINT_A),
                stamp: prior,
                mode: BatchQueryMode::Instant,
                not_null: false,
                sync: false,
                polated: false,
            })
            .is_some()
        {
            return true;
        }
        let query = StoreQuery {
            point_id: PointId::new(POINT_A),
            interval: Interval::instant(prior),
            reverse: false,
            count_only: false,
            limit: 1,
            sync: false,
            not_null: false,
            pull: false,
            multi_row: false,
        };
        batch.enqueue_query(query);
        false
    }

    fn select(&self, result: &mut derived_values_engine::model::ResultValue, batch: &mut derived_values_engine::db::Batch) -> bool {
        let current = batch.get_point_value(BatchQuery {
            point_id: PointId::new(POINT_A),
            stamp: result.timestamp,
            mode: BatchQueryMode::Instant,
            not_null: false,
            sync: false,
            polated: false,
        });
        let prior = batch.get_point_value(BatchQuery {
            point_id: PointId::new(POINT_A),
            stamp: Timestamp::from_nanos(result.timestamp.as_nanos() - PERIOD),
            mode: BatchQueryMode::Instant,
            not_null: false,
            sync: false,
            polated: false,
        });
        match (current, prior) {
            (Some(c), Some(p)) => {
                result.inputs.push(c);
                result.inputs.push(p);
                true
            }
            _ => false,
        }
    }
}

struct SumTransform;
impl Transform for SumTransform {
    fn apply_to(&self, result: &derived_values_engine::model::ResultValue, _batch: &derived_values_engine::db::Batch) -> TransformOutcome {
        let sum: f64 = result
            .inputs
            .iter()
            .map(|v| match &v.payload {
                Some(Payload::Float(f)) => *f,
                _ => 0.0,
            })
            .sum();
        TransformOutcome::Value(
            PointValue::new(PointId::new(POINT_S), result.timestamp, Payload::Float(sum))
                .with_flags(PointFlags::default().cacheable()),
        )
    }
}

struct ADef {
    results: Vec<Relation>,
    transform: Arc<dyn Transform>,
}
impl PointDefinition for ADef {
    fn point_id(&self) -> PointId {
        PointId::new(POINT_A)
    }
    fn results(&self) -> &[Relation] {
        &self.results
    }
    fn inputs(&self) -> &[Relation] {
        &[]
    }
    fn transform(&self) -> &Arc<dyn Transform> {
        &self.transform
    }
    fn sync(&self) -> Option<&Arc<dyn derived_values_engine::behavior::SyncPredicate>> {
        None
    }
}

struct SDef {
    inputs: Vec<Relation>,
    transform: Arc<dyn Transform>,
}
impl PointDefinition for SDef {
    fn point_id(&self) -> PointId {
        PointId::new(POINT_S)
    }
    fn results(&self) -> &[Relation] {
        &[]
    }
    fn inputs(&self) -> &[Relation] {
        &self.inputs
    }
    fn transform(&self) -> &Arc<dyn Transform> {
        &self.transform
    }
    fn sync(&self) -> Option<&Arc<dyn derived_values_engine::behavior::SyncPredicate>> {
        None
    }
}

struct NoopTransform;
impl Transform for NoopTransform {
    fn apply_to(&self, _result: &derived_values_engine::model::ResultValue, _batch: &derived_values_engine::db::Batch) -> TransformOutcome {
        TransformOutcome::Disabled
    }
}

struct Registry {
    a: ADef,
    s: SDef,
}

impl PointRegistry for Registry {
    fn lookup(&self, point_id: PointId) -> Option<&dyn PointDefinition> {
        if point_id == PointId::new(POINT_A) {
            Some(&self.a)
        } else if point_id == PointId::new(POINT_S) {
            Some(&self.s)
        } else {
            None
        }
    }
}

fn registry() -> Arc<Registry> {
    Arc::new(Registry {
        a: ADef {
            results: vec![Relation {
                point_id: PointId::new(POINT_S),
                behavior: Arc::new(TriggerSum),
            }],
            transform: Arc::new(NoopTransform),
        },
        s: SDef {
            inputs: vec![Relation {
                point_id: PointId::new(POINT_A),
                behavior: Arc::new(SelectSum),
            }],
            transform: Arc::new(SumTransform),
        },
    })
}

fn running() -> AtomicBool {
    AtomicBool::new(false)
}

fn unlimited_probe() -> Arc<dyn MemoryProbe> {
    Arc::new(FixedMemoryProbe::new(MemorySample {
        used_bytes: 0,
        max_bytes: 100,
    }))
}

fn processor(store: Arc<FakeStore>) -> ProcessorLoop {
    let config = EngineConfig {
        trace: derived_values_engine::db::config::TraceConfig {
            enabled: false,
            ..Default::default()
        },
        ..EngineConfig::default()
    };
    ProcessorLoop::new(
        &config,
        registry(),
        store,
        Arc::new(derived_values_engine::clock::TestClock::new(Timestamp::from_nanos(0))),
        Arc::new(Stats::new()),
        unlimited_probe(),
    )
    .expect("valid config")
}

#[test]
fn single_regular_notice_triggers_a_sum() {
    let store = Arc::new(FakeStore::with(vec![cacheable(POINT_A, 0, 2.0)]));
    let mut proc = processor(store);

    let notices = vec![Notice::regular(cacheable(POINT_A, 1, 5.0))];
    let stop = running();
    let (updates, _signals) = proc.process(notices, &stop).expect("batch processes");

    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].point_id, PointId::new(POINT_S));
    match &updates[0].payload {
        Some(Payload::Float(f)) => assert!((f - 7.0).abs() < f64::EPSILON),
        other => panic!("expected float payload, got {other:?}"),
    }
    assert_eq!(proc.stats().notices_received(), 1);
    assert_eq!(proc.stats().updates_sent(), 1);
}

#[test]
fn cutoff_drops_stale_result() {
    let store = Arc::new(FakeStore::with(vec![cacheable(POINT_A, 0, 2.0)]));
    let mut proc = processor(store);
    proc.refresh_cutoff(Some(&PointValue::new(
        PointId::new(99),
        Timestamp::from_nanos(0),
        Payload::Int(stamp(2).as_nanos() / 1_000_000),
    )));

    let notices = vec![Notice::regular(cacheable(POINT_A, 1, 5.0))];
    let stop = running();
    let (updates, _signals) = proc.process(notices, &stop).expect("batch processes");

    assert!(updates.is_empty());
    assert_eq!(proc.stats().cutoff_result_count(), 1);
    assert_eq!(proc.stats().notices_received(), 1);
}

#[test]
fn updates_filter_suppresses_identical_second_update() {
    let store = Arc::new(FakeStore::with(vec![cacheable(POINT_A, 0, 2.0)]));
    let mut proc = {
        let config = EngineConfig {
            cache: derived_values_engine::db::config::CacheConfig {
                updates_filtered: true,
                ..Default::default()
            },
            trace: derived_values_engine::db::config::TraceConfig {
                enabled: false,
                ..Default::default()
            },
            ..EngineConfig::default()
        };
        ProcessorLoop::new(
            &config,
            registry(),
            store.clone(),
            Arc::new(derived_values_engine::clock::TestClock::new(Timestamp::from_nanos(0))),
            Arc::new(Stats::new()),
            unlimited_probe(),
        )
        .unwrap()
    };

    // A@1 = 5.0 → S@1 = 5.0 + A@0(2.0) = 7.0, first emission.
    let stop = running();
    let (first, _) = proc.process(vec![Notice::regular(cacheable(POINT_A, 1, 5.0))], &stop).unwrap();
    assert_eq!(first.len(), 1);
    store.put(cacheable(POINT_A, 1, 5.0));

    // A@2 = 0.0 → S@2 = 0.0 + A@1(5.0) = 5.0. Seed the store so the S cache
    // entry from the first batch already reads 7.0, and arrange a second
    // notice producing an identical payload at a fresh timestamp to a
    // *different* scenario is unnecessary here: we instead re-deliver the
    // very same notice, which recomputes the same S@1 = 7.0 and must be
    // filtered as unchanged.
    let (second, _) = proc.process(vec![Notice::regular(cacheable(POINT_A, 1, 5.0))], &stop).unwrap();
    assert!(second.is_empty());
    assert_eq!(proc.stats().dropped_update_count(), 1);
}

#[test]
fn recalc_trigger_with_no_inputs_is_rejected() {
    let store = Arc::new(FakeStore::default());
    let mut proc = processor(store);

    // A has no declared inputs, so a RecalcTrigger notice on A must be
    // dropped rather than create a self-result.
    let notices = vec![Notice::recalc_trigger(cacheable(POINT_A, 1, 1.0))];
    let stop = running();
    let (updates, _signals) = proc.process(notices, &stop).expect("batch processes");

    assert!(updates.is_empty());
    assert_eq!(proc.stats().dropped_notice_count(), 1);
}

#[test]
fn scheduled_deferred_update_fires_before_new_notices() {
    let store = Arc::new(FakeStore::default());
    let mut proc = processor(store);

    let scheduled = cacheable(POINT_S, 9, 42.0);
    proc.schedule_update(stamp(9), scheduled.clone());

    // Not yet due.
    assert!(proc.due_updates(stamp(8)).is_empty());

    // Due once the clock reaches its timestamp.
    let due = proc.due_updates(stamp(9));
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].point_id, PointId::new(POINT_S));

    // Already drained; a second check at the same or later instant finds
    // nothing left.
    assert!(proc.due_updates(stamp(100)).is_empty());
}

/// Hands out notices from a shared queue in `fetch`-sized chunks, only
/// removing them from the queue on `commit` so a `rollback` redelivers the
/// same chunk next time, the way a real receptionist's ack/nack would.
struct QueueReceptionist {
    notices: std::collections::VecDeque<Notice>,
    pending: usize,
}
impl Receptionist for QueueReceptionist {
    fn fetch(
        &mut self,
        limit: usize,
        _timeout: Option<std::time::Duration>,
    ) -> derived_values_engine::error::Result<Vec<Notice>> {
        let take = limit.min(self.notices.len());
        self.pending = take;
        Ok(self.notices.iter().take(take).cloned().collect())
    }
    fn commit(&mut self) -> derived_values_engine::error::Result<()> {
        for _ in 0..self.pending {
            self.notices.pop_front();
        }
        self.pending = 0;
        Ok(())
    }
    fn rollback(&mut self) -> derived_values_engine::error::Result<()> {
        self.pending = 0;
        Ok(())
    }
}

struct NoopStore;
impl DownstreamStore for NoopStore {
    fn add_update(&mut self, _value: &PointValue) {}
    fn send_updates(&mut self) -> derived_values_engine::error::Result<Vec<Option<String>>> {
        Ok(Vec::new())
    }
}

struct NoopAlerter;
impl Alerter for NoopAlerter {
    fn send_signal(&mut self, _name: &str, _info: &str) -> derived_values_engine::error::Result<()> {
        Ok(())
    }
}

#[test]
fn memory_limit_breach_shrinks_batch_limit_and_recovers() {
    // A probe that reports high usage on exactly the call that crosses
    // `trip_after`, then drops back down, the way resident memory spikes
    // once mid-batch and recedes once the cache is cleared and the batch
    // shrinks.
    struct ClimbingProbe {
        calls: AtomicU64,
        trip_after: u64,
        tripped: std::sync::atomic::AtomicBool,
    }
    impl MemoryProbe for ClimbingProbe {
        fn sample(&self) -> MemorySample {
            let n = self.calls.fetch_add(1, Ordering::Relaxed);
            let used = if n >= self.trip_after
                && !self.tripped.swap(true, Ordering::Relaxed)
            {
                90
            } else {
                0
            };
            MemorySample {
                used_bytes: used,
                max_bytes: 100,
            }
        }
    }

    let store = Arc::new(FakeStore::with(vec![cacheable(POINT_A, 0, 0.0)]));
    let config = EngineConfig {
        trace: derived_values_engine::db::config::TraceConfig {
            enabled: false,
            ..Default::default()
        },
        ..EngineConfig::default()
    };
    let probe: Arc<dyn MemoryProbe> = Arc::new(ClimbingProbe {
        calls: AtomicU64::new(0),
        trip_after: 700,
        tripped: std::sync::atomic::AtomicBool::new(false),
    });
    let mut proc = ProcessorLoop::new(
        &config,
        registry(),
        store,
        Arc::new(derived_values_engine::clock::TestClock::new(Timestamp::from_nanos(0))),
        Arc::new(Stats::new()),
        probe,
    )
    .unwrap();

    let notices: std::collections::VecDeque<Notice> = (0..1000)
        .map(|i| Notice::regular(cacheable(POINT_A, i + 1, i as f64)))
        .collect();
    let mut receptionist = QueueReceptionist {
        notices,
        pending: 0,
    };
    let mut stores: Vec<Box<dyn DownstreamStore>> = vec![Box::new(NoopStore)];
    let mut alerter = NoopAlerter;
    let stop = running();

    // First iteration: fetches up to the initial batch_limit (1000),
    // trips the cap at the 700th probe call, rolls back, halves the limit.
    proc.run_once(&mut receptionist, &mut stores, &mut alerter, &stop)
        .expect("rollback is not itself an error");
    assert_eq!(proc.stats().memory_limit_retries(), 1);
    assert_eq!(proc.batch_limit(), 500);
    assert_eq!(proc.stats().batches_processed(), 0);

    // Second iteration: retries with the halved limit and completes.
    proc.run_once(&mut receptionist, &mut stores, &mut alerter, &stop)
        .expect("retry succeeds");
    assert_eq!(proc.stats().batches_processed(), 1);

    // Drain whatever notices remain so the scenario reaches full
    // completion, confirming at least two successful batches overall.
    while !receptionist.notices.is_empty() {
        proc.run_once(&mut receptionist, &mut stores, &mut alerter, &stop)
            .expect("remaining notices process cleanly");
    }
    assert!(proc.stats().batches_processed() >= 2);
}
