//! Data model shared by every component of the processing engine.
//!
//! This module defines the identifiers, payload, and value types that flow
//! through the cache, the query manager, and the batch.
//!
//! # Examples
//!
//! ```rust
//! use derived_values_engine::clock::Timestamp;
//! use derived_values_engine::model::{Payload, PointFlags, PointId, PointValue};
//!
//! let v = PointValue::new(PointId::new(1), Timestamp::from_nanos(0), Payload::Float(2.0))
//!     .with_flags(PointFlags::default().cacheable());
//! assert_eq!(v.point_id, PointId::new(1));
//! ```

use std::cmp::Ordering;

use crate::clock::{Interval, Timestamp};

/// Opaque 128-bit identifier for a point.
///
/// The top bit is reserved to key the "deleted" companion identifier used by
/// tombstone notices; ordinary points never set it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PointId(u128);

const DELETED_BIT: u128 = 1 << 127;

impl PointId {
    /// Build a point id from a raw 128-bit value.
    pub const fn new(raw: u128) -> Self {
        Self(raw & !DELETED_BIT)
    }

    /// The raw 128-bit value, with the deleted-marker bit cleared.
    pub const fn raw(self) -> u128 {
        self.0
    }

    /// The companion identifier used to key a tombstone for this point.
    pub const fn deleted_marker(self) -> Self {
        Self(self.0 | DELETED_BIT)
    }

    /// True if this id is a deleted-marker id.
    pub const fn is_deleted_marker(self) -> bool {
        self.0 & DELETED_BIT != 0
    }
}

/// A scalar value carried by a point.
///
/// Mirrors the small closed set of property types an industrial point
/// platform actually needs: numeric readings, boolean/discrete state, and
/// text diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Discrete/boolean reading.
    Bool(bool),
    /// Integer reading (counters, enumerated states).
    Int(i64),
    /// Floating point reading (the common case for analog points).
    Float(f64),
    /// Free-form text (diagnostics, quality descriptions).
    Text(String),
}

impl Payload {
    /// Value-equality used by the cache's change test; `Float` compares with
    /// bitwise equality rather than attempting epsilon comparison, matching
    /// the platform's convention that recomputation always re-derives the
    /// exact same bits from the exact same inputs.
    pub fn value_eq(&self, other: &Payload) -> bool {
        match (self, other) {
            (Payload::Bool(a), Payload::Bool(b)) => a == b,
            (Payload::Int(a), Payload::Int(b)) => a == b,
            (Payload::Float(a), Payload::Float(b)) => a.to_bits() == b.to_bits(),
            (Payload::Text(a), Payload::Text(b)) => a == b,
            _ => false,
        }
    }
}

/// Quality/state attached to a point value, separate from its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointState {
    /// Value is trustworthy.
    Good,
    /// Value is present but of suspect quality.
    Uncertain,
    /// Value is known to be bad; downstream consumers should not act on it.
    Bad,
}

/// Flags describing how a [`PointValue`] was produced and how it may be
/// used. Plain booleans rather than a bitset: the set is small, closed, and
/// rarely all set at once, so a struct reads better at call sites than a
/// mask of magic constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointFlags {
    /// This value is a tombstone: the point has no value at this instant.
    pub deleted: bool,
    /// This value has been purged from the store and must not be re-cached.
    pub purged: bool,
    /// This value participates in the store's optimistic-versioning scheme.
    pub versioned: bool,
    /// This value was produced inside the batch, not read from the store.
    pub synthesized: bool,
    /// This value was produced by interpolation between two stored values.
    pub interpolated: bool,
    /// This value was produced by extrapolation from a single stored value.
    pub extrapolated: bool,
    /// This value is eligible for the point cache.
    pub cacheable: bool,
    /// This value was read from the store during the current batch.
    pub fetched: bool,
    /// A result carrying this flag may be replaced by a later, distinct
    /// concrete variant within the same batch.
    pub replaceable: bool,
    /// This value requests recomputation of its own point (recalc-trigger).
    pub recalc_trigger: bool,
}

impl PointFlags {
    /// Builder: mark cacheable.
    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    /// Builder: mark deleted.
    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Builder: mark synthesized (and, for convenience, not cacheable: batch-
    /// local values are never written back to the store-backed cache).
    pub fn synthesized(mut self) -> Self {
        self.synthesized = true;
        self
    }

    /// Builder: mark interpolated (implies synthesized).
    pub fn interpolated(mut self) -> Self {
        self.interpolated = true;
        self.synthesized = true;
        self
    }

    /// Builder: mark extrapolated (implies synthesized).
    pub fn extrapolated(mut self) -> Self {
        self.extrapolated = true;
        self.synthesized = true;
        self
    }

    /// Builder: mark fetched.
    pub fn fetched(mut self) -> Self {
        self.fetched = true;
        self
    }

    /// Builder: mark replaceable.
    pub fn replaceable(mut self) -> Self {
        self.replaceable = true;
        self
    }

    /// True if this value was produced by interpolation or extrapolation,
    /// rather than read verbatim or deleted.
    pub fn is_polated(&self) -> bool {
        self.interpolated || self.extrapolated
    }
}

/// A single `(point, timestamp)` observation flowing through the engine.
///
/// Equality and ordering are defined purely on `(point_id, timestamp)`: two
/// `PointValue`s referring to the same point at the same instant are the
/// same entry even if their payload or flags differ (the newer one wins on
/// insertion per the batch's map semantics).
#[derive(Debug, Clone)]
pub struct PointValue {
    /// The point this value belongs to.
    pub point_id: PointId,
    /// The instant this value is stamped at.
    pub timestamp: Timestamp,
    /// Optional quality/state.
    pub state: Option<PointState>,
    /// The value itself; `None` means "known absent at this instant".
    pub payload: Option<Payload>,
    /// Provenance/usage flags.
    pub flags: PointFlags,
}

impl PointValue {
    /// Construct a value with no state and default flags.
    pub fn new(point_id: PointId, timestamp: Timestamp, payload: Payload) -> Self {
        Self {
            point_id,
            timestamp,
            state: None,
            payload: Some(payload),
            flags: PointFlags::default(),
        }
    }

    /// Construct a tombstone (null payload, deleted flag set) for a point.
    pub fn deletion(point_id: PointId, timestamp: Timestamp) -> Self {
        Self {
            point_id,
            timestamp,
            state: None,
            payload: None,
            flags: PointFlags::default().deleted(),
        }
    }

    /// Builder: attach flags.
    pub fn with_flags(mut self, flags: PointFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Builder: attach a state.
    pub fn with_state(mut self, state: PointState) -> Self {
        self.state = Some(state);
        self
    }

    /// The key this value occupies in every time-indexed map: `(point,
    /// timestamp)`.
    pub fn key(&self) -> (PointId, Timestamp) {
        (self.point_id, self.timestamp)
    }
}

impl PartialEq for PointValue {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for PointValue {}

impl PartialOrd for PointValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PointValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// A to-be-computed value, accumulating the inputs its transform will read.
#[derive(Debug, Clone)]
pub struct ResultValue {
    /// The derived point this result will produce a value for.
    pub point_id: PointId,
    /// The instant the result is being computed for.
    pub timestamp: Timestamp,
    /// The point whose notice caused this result to be created, if any; used
    /// to suppress self-triggering (invariant 6 of the design).
    pub triggered_by: Option<PointId>,
    /// Inputs collected for this result so far, in arrival order.
    pub inputs: Vec<PointValue>,
    /// Whether a later, distinct concrete result may overwrite this one.
    pub replaceable: bool,
}

impl ResultValue {
    /// Start a new, empty result for `point_id` at `timestamp`.
    pub fn new(point_id: PointId, timestamp: Timestamp) -> Self {
        Self {
            point_id,
            timestamp,
            triggered_by: None,
            inputs: Vec::new(),
            replaceable: false,
        }
    }

    /// The key this result occupies in the batch's result map.
    pub fn key(&self) -> (PointId, Timestamp) {
        (self.point_id, self.timestamp)
    }
}

/// The kind of an incoming [`Notice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    /// An ordinary observation: drives recomputation of points that declare
    /// this point as an input.
    Regular,
    /// A synthetic request to recompute the notice's own point.
    RecalcTrigger,
}

/// An incoming value, classified by how it should drive recomputation.
#[derive(Debug, Clone)]
pub struct Notice {
    /// The underlying observation.
    pub value: PointValue,
    /// How this notice should be interpreted.
    pub kind: NoticeKind,
}

impl Notice {
    /// A regular notice.
    pub fn regular(value: PointValue) -> Self {
        Self {
            value,
            kind: NoticeKind::Regular,
        }
    }

    /// A recalc-trigger notice.
    pub fn recalc_trigger(value: PointValue) -> Self {
        Self {
            value,
            kind: NoticeKind::RecalcTrigger,
        }
    }
}

/// A query against a [`crate::db::batch::Batch`]'s in-memory maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchQueryMode {
    /// Exact-match at an instant.
    Instant,
    /// First value at or after the interval's lower bound.
    NotBefore,
    /// Last value strictly before the interval's upper bound.
    Before,
}

/// A query against the batch's accumulated values.
#[derive(Debug, Clone, Copy)]
pub struct BatchQuery {
    /// The point being queried.
    pub point_id: PointId,
    /// The instant (for `Instant`) or bound (for `NotBefore`/`Before`).
    pub stamp: Timestamp,
    /// Lookup mode.
    pub mode: BatchQueryMode,
    /// Reject values with a null payload.
    pub not_null: bool,
    /// Reject values that are out of sync with the point's sync predicate.
    pub sync: bool,
    /// Allow interpolated/extrapolated/synthesized values, not only inputs.
    pub polated: bool,
}

/// A query issued against the external store, after the cache has been
/// consulted and failed to answer it.
#[derive(Debug, Clone, Copy)]
pub struct StoreQuery {
    /// The point being queried.
    pub point_id: PointId,
    /// The window to search within.
    pub interval: Interval,
    /// Search from the end of the interval backward rather than forward.
    pub reverse: bool,
    /// Only report whether any value exists, not the value itself.
    pub count_only: bool,
    /// Maximum number of rows the store may return for this query.
    pub limit: usize,
    /// Require results in sync with the point's sync predicate.
    pub sync: bool,
    /// Reject null-payload rows.
    pub not_null: bool,
    /// Pull raw versioned rows rather than interpolated/extrapolated ones.
    pub pull: bool,
    /// Multiple independent rows are expected (disables cache short-circuit).
    pub multi_row: bool,
}
