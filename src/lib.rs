//! # derived-values-engine
//!
//! A derived-values processing engine for an industrial point-value
//! platform: it accepts notices that raw points have changed, derives new
//! points from them through user-supplied behaviors and transforms, and
//! emits the results downstream, batch by batch.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//!
//! use derived_values_engine::{EngineConfig, ProcessorLoop, Stats, SystemClock, ProcessMemoryProbe};
//!
//! # fn example(
//! #     registry: Arc<dyn derived_values_engine::PointRegistry>,
//! #     store: Arc<dyn derived_values_engine::StoreClient>,
//! #     receptionist: &mut dyn derived_values_engine::Receptionist,
//! #     stores: &mut [Box<dyn derived_values_engine::DownstreamStore>],
//! #     alerter: &mut dyn derived_values_engine::Alerter,
//! # ) -> derived_values_engine::Result<()> {
//! let config = EngineConfig::balanced();
//! let stats = Arc::new(Stats::new());
//! let probe = Arc::new(ProcessMemoryProbe::new(8 * 1024 * 1024 * 1024));
//! let mut processor = ProcessorLoop::new(
//!     &config,
//!     registry,
//!     store,
//!     Arc::new(SystemClock),
//!     stats,
//!     probe,
//! )?;
//!
//! let stop = AtomicBool::new(false);
//! processor.run(receptionist, stores, alerter, &stop)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The engine is layered the way most of the platforms it plugs into are:
//! - **Model layer**: point identities, values, notices, queries (`model`).
//! - **Cache layer**: the per-engine point cache, LRU-bounded (`cache`).
//! - **Query layer**: store query batching and response filing (`query`).
//! - **Batch layer**: the per-iteration working set (`db::batch`).
//! - **Control layer**: cutoff and updates-filter control points (`control`).
//! - **Processor layer**: the four-phase algorithm and its driving loop
//!   (`db::processor`), governed by an adaptive controller (`db::controller`).
//!
//! See `DESIGN.md` in the repository root for how each part is grounded.

pub mod behavior;
pub mod cache;
pub mod clock;
pub mod control;
pub mod db;
pub mod error;
pub mod logging;
pub mod model;
pub mod query;

// Re-export the main public API
pub use crate::behavior::{PointDefinition, PointRegistry, PrimaryBehavior, Relation, SyncPredicate, Transform, TransformOutcome};
pub use crate::cache::PointCache;
pub use crate::clock::{Clock, Interval, SystemClock, TestClock, Timestamp};
pub use crate::control::{CutoffControl, FilterControl};
pub use crate::db::{
    Alerter, Batch, BatchController, DownstreamStore, EngineConfig, HealthCheck, HealthStatus,
    ProcessorLoop, Receptionist, Stats, StatsSnapshot,
};
pub use crate::db::controller::{FixedMemoryProbe, MemoryProbe, ProcessMemoryProbe};
pub use crate::error::{ProcessingError, Result};
pub use crate::model::{
    BatchQuery, BatchQueryMode, Notice, NoticeKind, Payload, PointFlags, PointId, PointState,
    PointValue, ResultValue, StoreQuery,
};
pub use crate::query::{QueryManager, StoreClient, StoreResponse};
