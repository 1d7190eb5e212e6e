pub mod config;
pub mod event;
pub mod model;
pub mod storage;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

pub use config::EngineConfig;
pub use event::MetricEventBuilder;

#[derive(Debug, Error)]
pub enum PulseError {
    #[error("Unknown metric type: {0}")]
    UnknownMetricType(String),

    #[error("Invalid metric: {0}")]
    InvalidMetric(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Detector {detector} failed: {reason}")]
    Detector { detector: String, reason: String },

    #[error("Alert error: {0}")]
    Alert(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("Engine is not running")]
    NotRunning,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PulseError>;

/// Wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Tx,
    Block,
    Vote,
}

impl MetricKind {
    pub const ALL: [MetricKind; 3] = [MetricKind::Tx, MetricKind::Block, MetricKind::Vote];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Tx => "tx",
            MetricKind::Block => "block",
            MetricKind::Vote => "vote",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tx" => Ok(MetricKind::Tx),
            "block" => Ok(MetricKind::Block),
            "vote" => Ok(MetricKind::Vote),
            other => Err(PulseError::UnknownMetricType(other.to_string())),
        }
    }
}

/// One timestamped observation handed to the engine by a collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub timestamp: i64,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl MetricEvent {
    pub fn new(kind: MetricKind, timestamp: i64, fields: Map<String, Value>) -> Self {
        Self {
            kind,
            timestamp,
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn field_f64(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(Value::as_f64)
    }

    pub fn field_u64(&self, name: &str) -> Option<u64> {
        self.fields.get(name).and_then(Value::as_u64)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn field_bool(&self, name: &str) -> Option<bool> {
        self.fields.get(name).and_then(Value::as_bool)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(PulseError::Other(format!("unknown severity: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    TxSpike,
    ValidatorDowntime,
    DoubleSign,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::TxSpike => "tx_spike",
            AnomalyKind::ValidatorDowntime => "validator_downtime",
            AnomalyKind::DoubleSign => "double_sign",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnomalyKind {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tx_spike" => Ok(AnomalyKind::TxSpike),
            "validator_downtime" => Ok(AnomalyKind::ValidatorDowntime),
            "double_sign" => Ok(AnomalyKind::DoubleSign),
            other => Err(PulseError::Other(format!("unknown anomaly type: {}", other))),
        }
    }
}

/// The thing an anomaly is about, e.g. `validator/val-7` or `network/mempool`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub kind: String,
    pub id: String,
}

impl Entity {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn validator(id: impl Into<String>) -> Self {
        Self::new("validator", id)
    }

    pub fn network(id: impl Into<String>) -> Self {
        Self::new("network", id)
    }

    pub fn matches(&self, needle: &str) -> bool {
        self.kind == needle || self.id == needle
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub entity: Entity,
    pub timestamp: i64,
    pub explanation: String,
    pub metrics: Map<String, Value>,
}

impl Anomaly {
    pub fn new(
        kind: AnomalyKind,
        severity: Severity,
        entity: Entity,
        timestamp: i64,
        explanation: String,
        metrics: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            entity,
            timestamp,
            explanation,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_kind_rejects_unknown_names() {
        assert_eq!("vote".parse::<MetricKind>().unwrap(), MetricKind::Vote);
        let err = "trade".parse::<MetricKind>().unwrap_err();
        assert!(matches!(err, PulseError::UnknownMetricType(name) if name == "trade"));
    }

    #[test]
    fn test_metric_event_uses_type_key() {
        let json = r#"{"type":"tx","timestamp":1000,"fields":{"tx_count":4}}"#;
        let event: MetricEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, MetricKind::Tx);
        assert_eq!(event.field_u64("tx_count"), Some(4));

        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back["type"], "tx");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Medium);
        assert!(Severity::Low < Severity::High);
    }

    #[test]
    fn test_entity_matches_kind_or_id() {
        let entity = Entity::validator("val-1");
        assert!(entity.matches("validator"));
        assert!(entity.matches("val-1"));
        assert!(!entity.matches("val-2"));
    }

    #[test]
    fn test_anomaly_ids_are_unique() {
        let a = Anomaly::new(
            AnomalyKind::DoubleSign,
            Severity::Critical,
            Entity::validator("v"),
            1,
            String::new(),
            Map::new(),
        );
        let b = Anomaly::new(
            AnomalyKind::DoubleSign,
            Severity::Critical,
            Entity::validator("v"),
            1,
            String::new(),
            Map::new(),
        );
        assert_ne!(a.id, b.id);
        assert_eq!(serde_json::to_value(&a).unwrap()["type"], "double_sign");
    }
}
