//! Behavior and Transform contracts (component C8).
//!
//! These traits are the seam between the engine and user-supplied
//! point-definition metadata: the engine calls them, it never implements
//! them. Concrete behaviors live with whatever loads point definitions
//! (out of scope here); the engine only needs the four-method surface
//! below, matching the closed family (primary, recalc-trigger, resync)
//! the design notes call out, kept open as a trait so new relation kinds
//! can be added without engine changes.

use std::sync::Arc;

use crate::clock::{Interval, Timestamp};
use crate::db::batch::Batch;
use crate::model::{Notice, PointId, PointValue, ResultValue};

/// The per-relation strategy attached to a point's input or result edges.
///
/// `prepare_*` methods run during the fixed-point set-up/prepare-inputs
/// loops and may enqueue store queries on the batch; they return `true` once
/// no further lookups are needed for this relation. `trigger`/`select` run
/// once the fixed point is reached and do the actual result/input wiring.
pub trait PrimaryBehavior: Send + Sync {
    /// Ready the batch (typically by enqueuing store queries) for `trigger`.
    /// Returns `true` when no further preparation is needed.
    fn prepare_trigger(&self, notice: &Notice, batch: &mut Batch) -> bool;

    /// Create or update the `ResultValue` this notice drives, via the
    /// batch's `set_up_result_value` family.
    fn trigger(&self, notice: &Notice, batch: &mut Batch);

    /// Ready the batch for `select`. Returns `true` when no further
    /// preparation is needed.
    fn prepare_select(&self, result: &ResultValue, batch: &mut Batch) -> bool;

    /// Populate `result.inputs` from the batch. Returns `false` if the
    /// required input could not be found, which drops the result.
    fn select(&self, result: &mut ResultValue, batch: &mut Batch) -> bool;
}

/// What a [`Transform`] produced for a given result.
#[derive(Debug, Clone)]
pub enum TransformOutcome {
    /// No update should be emitted for this result.
    Disabled,
    /// A value was computed.
    Value(PointValue),
}

/// The per-point computation that turns a result's collected inputs into a
/// value ready to send downstream.
pub trait Transform: Send + Sync {
    /// Compute the outcome for `result` from its accumulated inputs.
    fn apply_to(&self, result: &ResultValue, batch: &Batch) -> TransformOutcome;

    /// Whether this transform wants the result's own previous value fetched
    /// as an implicit extra input before `apply_to` runs.
    fn uses_fetched_result(&self) -> bool {
        false
    }

    /// Whether a `None` payload for `point_id` should be emitted as a
    /// deletion rather than suppressed.
    fn null_removes(&self, _point_id: PointId) -> bool {
        false
    }
}

/// A cadence predicate declared by a point (e.g. "every 15 minutes").
pub trait SyncPredicate: Send + Sync {
    /// True if `stamp` lands on this predicate's expected cadence.
    fn is_in_sync(&self, stamp: Timestamp) -> bool;

    /// Every timestamp within `interval` that lands on this predicate's
    /// cadence, in ascending order: the "lattice" `Batch::get_point_values`
    /// walks to fill gaps between actual inputs (§4.3). A fixed-interval
    /// cadence can generate this directly; an irregular (e.g. cron-like)
    /// predicate may fall back to the default, which walks every candidate
    /// instant via repeated `is_in_sync` calls and is only suitable for
    /// short intervals.
    fn timestamps_in(&self, interval: Interval) -> Vec<Timestamp> {
        let mut out = Vec::new();
        let Some(mut cursor) = interval.after.map(Timestamp::after) else {
            return out;
        };
        let Some(before) = interval.before else {
            return out;
        };
        while cursor < before {
            if self.is_in_sync(cursor) {
                out.push(cursor);
            }
            cursor = cursor.after();
        }
        out
    }
}

/// One declared input or result edge: the related point, and the behavior
/// governing how this relation participates in set-up/prepare.
#[derive(Clone)]
pub struct Relation {
    /// The related point.
    pub point_id: PointId,
    /// The strategy for this relation.
    pub behavior: Arc<dyn PrimaryBehavior>,
}

/// Metadata the engine reads for every point it may process.
///
/// This is the seam through which the surrounding platform's metadata
/// store/validator (out of scope here) supplies everything the engine
/// needs per point.
pub trait PointDefinition: Send + Sync {
    /// The point this definition describes.
    fn point_id(&self) -> PointId;

    /// Points that, when they carry a regular notice, should recompute this
    /// point (i.e. this point's result-relations as seen from an input).
    fn results(&self) -> &[Relation];

    /// Points this point's result computation reads as inputs.
    fn inputs(&self) -> &[Relation];

    /// The computation producing this point's value from its inputs.
    fn transform(&self) -> &Arc<dyn Transform>;

    /// Optional expected-cadence predicate.
    fn sync(&self) -> Option<&Arc<dyn SyncPredicate>>;

    /// How many of the most recent results should be fetched back from the
    /// store once computed (recalc-latest bookkeeping); `0` disables it.
    fn recalc_latest(&self) -> u32 {
        0
    }

    /// Whether this point participates in resynchronization (accepting
    /// notices/triggers even without declared results/inputs).
    fn resynchronized(&self) -> bool {
        false
    }
}

/// Looks up point definitions by id. Backed by whatever loads and holds the
/// platform's point metadata; the engine only ever reads through this seam.
pub trait PointRegistry: Send + Sync {
    /// The definition for `point_id`, if one is loaded.
    fn lookup(&self, point_id: PointId) -> Option<&dyn PointDefinition>;
}
