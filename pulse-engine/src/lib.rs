pub mod collector;
pub mod engine;

use pulse_core::MetricEvent;

pub use collector::{build_collectors, Collector, CollectorKind, CollectorStats, ReplayCollector};
pub use engine::{AnomalyCounters, AnomalyEngine, AnomalyQuery, EngineStats};

/// One unit of work on the engine channel.
pub type MetricBatch = Vec<MetricEvent>;
