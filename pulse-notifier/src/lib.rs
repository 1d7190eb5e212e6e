pub mod logging;
pub mod manager;
pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_core::{Anomaly, Result, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

pub use logging::LogChannel;
pub use manager::AlertManager;
pub use webhook::WebhookChannel;

/// A channel-agnostic rendering of one alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: uuid::Uuid,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl Notification {
    pub fn from_anomaly(anomaly: &Anomaly) -> Self {
        let timestamp = DateTime::<Utc>::from_timestamp_millis(anomaly.timestamp).unwrap_or_else(Utc::now);

        Self {
            id: anomaly.id,
            timestamp,
            severity: anomaly.severity,
            title: format!("{} detected on {}", anomaly.kind, anomaly.entity),
            message: anomaly.explanation.clone(),
            data: serde_json::to_value(anomaly).ok(),
        }
    }

    /// A low-severity message used to check channel connectivity.
    pub fn test() -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: Utc::now(),
            severity: Severity::Low,
            title: "PulseScan test alert".to_string(),
            message: "Alert delivery is working.".to_string(),
            data: None,
        }
    }
}

/// One delivery target for notifications.
#[async_trait]
pub trait AlertChannel: Send + Sync + Debug {
    async fn send(&self, notification: &Notification) -> Result<()>;
    fn name(&self) -> &str;
    fn is_enabled(&self) -> bool;
}

/// What the engine hands anomalies to.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(&self, anomaly: &Anomaly) -> Result<()>;

    async fn send_test_alert(&self) -> Result<()>;

    /// Sends a test notification through every channel and reports which
    /// ones delivered it.
    async fn test_notifiers(&self) -> BTreeMap<String, bool>;

    fn stats(&self) -> AlertStats;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertStats {
    pub sent: u64,
    pub filtered: u64,
    pub failed: u64,
    pub channels: Vec<String>,
}

pub fn format_notification_message(notification: &Notification) -> String {
    let marker = match notification.severity {
        Severity::Critical => "[CRITICAL]",
        Severity::High => "[HIGH]",
        Severity::Medium => "[MEDIUM]",
        Severity::Low => "[LOW]",
    };

    format!(
        "{} {}\n\n{}\n\nTime: {}",
        marker,
        notification.title,
        notification.message,
        notification.timestamp.to_rfc3339()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::{AnomalyKind, Entity};

    fn anomaly() -> Anomaly {
        Anomaly::new(
            AnomalyKind::ValidatorDowntime,
            Severity::High,
            Entity::validator("val-7"),
            1_700_000_000_000,
            "Validator val-7 has missed 4 consecutive blocks".to_string(),
            serde_json::Map::new(),
        )
    }

    #[test]
    fn test_notification_from_anomaly() {
        let anomaly = anomaly();
        let notification = Notification::from_anomaly(&anomaly);

        assert_eq!(notification.id, anomaly.id);
        assert_eq!(notification.severity, Severity::High);
        assert_eq!(notification.title, "validator_downtime detected on validator/val-7");
        assert_eq!(notification.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(notification.data.as_ref().unwrap()["type"], "validator_downtime");
    }

    #[test]
    fn test_format_message() {
        let message = format_notification_message(&Notification::from_anomaly(&anomaly()));
        assert!(message.starts_with("[HIGH] validator_downtime detected on validator/val-7"));
        assert!(message.contains("missed 4 consecutive blocks"));
        assert!(message.contains("2023-11-14T22:13:20"));
    }
}
