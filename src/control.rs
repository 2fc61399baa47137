//! External control predicates (component C4).
//!
//! Two small, independently refreshed gates sourced from dedicated control
//! points elsewhere in the platform: a cutoff timestamp that admits or
//! rejects new results, and a boolean that enables update filtering.

use tracing::warn;

use crate::clock::Timestamp;
use crate::model::{PointValue, ResultValue};

/// Admits results whose timestamp is not older than an externally driven
/// cutoff. With no cutoff loaded, everything is admitted.
#[derive(Debug, Default, Clone, Copy)]
pub struct CutoffControl {
    cutoff: Option<Timestamp>,
}

impl CutoffControl {
    /// No cutoff loaded: admit everything.
    pub fn unset() -> Self {
        Self { cutoff: None }
    }

    /// A cutoff loaded at `cutoff`: admit only results at or after it.
    pub fn at(cutoff: Timestamp) -> Self {
        Self {
            cutoff: Some(cutoff),
        }
    }

    /// Refresh from the control point's current value, a millisecond
    /// monotonic-clock reading. An absent or unparseable value clears the
    /// cutoff and is logged, rather than treated as a hard failure: the
    /// engine should keep admitting results while the control catches up.
    pub fn refresh(&mut self, control_value: Option<&PointValue>, millis_to_timestamp: impl Fn(i64) -> Timestamp) {
        self.cutoff = control_value.and_then(|v| match &v.payload {
            Some(crate::model::Payload::Int(ms)) => Some(millis_to_timestamp(*ms)),
            Some(crate::model::Payload::Float(ms)) => Some(millis_to_timestamp(*ms as i64)),
            other => {
                warn!(?other, "cutoff control point value missing or unparseable");
                None
            }
        });
    }

    /// True if `result` may be admitted: the cutoff is unset, or `result`'s
    /// timestamp is at or after it.
    pub fn verify(&self, result: &ResultValue) -> bool {
        self.cutoff.map_or(true, |c| result.timestamp >= c)
    }
}

/// Whether updates identical to the cached value should be suppressed.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilterControl {
    enabled: bool,
}

impl FilterControl {
    /// Build with an explicit initial state (normally the configured
    /// `cache.updates.filtered` default).
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Refresh from the control point's current boolean value. A missing or
    /// non-boolean value leaves the current setting unchanged.
    pub fn refresh(&mut self, control_value: Option<&PointValue>) {
        if let Some(crate::model::Payload::Bool(b)) =
            control_value.and_then(|v| v.payload.as_ref())
        {
            self.enabled = *b;
        }
    }

    /// Whether filtering is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}
