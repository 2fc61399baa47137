//! The engine's processing core (components C3, C5, C6): the per-batch
//! working set, its controller, the trace streams it writes, and the
//! top-level processor loop that drives them.

pub mod batch;
pub mod config;
pub mod controller;
pub mod health;
pub mod metrics;
pub mod processor;
pub mod trace;

pub use batch::{finalize_result, Batch};
pub use config::{BatchConfig, CacheConfig, EngineConfig, MemoryConfig, TraceConfig};
pub use controller::{BatchController, FixedMemoryProbe, MemoryProbe, MemorySample, ProcessMemoryProbe};
pub use health::{Check, HealthCheck, HealthStatus};
pub use metrics::{Stats, StatsSnapshot};
pub use processor::{Alerter, DownstreamStore, ProcessorLoop, Receptionist};
pub use trace::TraceWriter;
