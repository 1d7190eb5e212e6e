pub mod double_sign;
pub mod downtime;
pub mod registry;
pub mod stats;
pub mod tx_spike;

use pulse_core::{Anomaly, MetricEvent, Result};

pub use double_sign::DoubleSignDetector;
pub use downtime::{ValidatorDowntimeDetector, ValidatorState, ValidatorStatus};
pub use registry::{build_detectors, DetectorKind};
pub use stats::{Ewma, RollingWindow};
pub use tx_spike::TxSpikeDetector;

/// A stateful scorer for one anomaly class.
///
/// Detectors see every batch the engine receives and ignore event types they
/// do not care about. An error fails only this detector's pass over the
/// batch; the engine keeps running the others.
pub trait Detector: Send {
    fn name(&self) -> &str;

    fn process_metrics(&mut self, batch: &[MetricEvent]) -> Result<Vec<Anomaly>>;

    fn stats(&self) -> serde_json::Value;

    fn reset(&mut self);
}

/// Unwraps a `json!({ .. })` literal into the field map anomalies carry.
pub(crate) fn into_map(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

/// Rounds to two decimal places for human-facing metrics.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
