use crate::{AlertChannel, AlertSink, AlertStats, LogChannel, Notification, WebhookChannel};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use pulse_core::{config::AlertsConfig, Anomaly, PulseError, Result, Severity};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

/// Fans anomalies out to every enabled channel.
///
/// Anomalies below `min_severity` are dropped. A failing channel is logged
/// and counted; the remaining channels still receive the alert.
pub struct AlertManager {
    enabled: bool,
    min_severity: Severity,
    channels: Vec<Box<dyn AlertChannel>>,
    stats: Mutex<AlertStats>,
}

impl AlertManager {
    pub fn new(min_severity: Severity) -> Self {
        Self {
            enabled: true,
            min_severity,
            channels: Vec::new(),
            stats: Mutex::new(AlertStats::default()),
        }
    }

    pub fn from_config(config: &AlertsConfig) -> Result<Self> {
        let mut manager = Self::new(config.min_severity);
        manager.enabled = config.enabled;

        if config.log.enabled {
            manager.add_channel(Box::new(LogChannel::new(true)));
        }
        if config.webhook.enabled {
            manager.add_channel(Box::new(WebhookChannel::new(config.webhook.clone())?));
        }

        Ok(manager)
    }

    pub fn add_channel(&mut self, channel: Box<dyn AlertChannel>) {
        info!("Alert channel registered: {}", channel.name());
        self.channels.push(channel);
    }

    pub fn get_enabled_channels(&self) -> Vec<String> {
        self.channels
            .iter()
            .filter(|c| c.is_enabled())
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Delivers to every enabled channel concurrently, returning each
    /// channel's outcome.
    async fn dispatch(&self, notification: &Notification) -> Vec<(String, bool)> {
        let enabled: Vec<&dyn AlertChannel> = self
            .channels
            .iter()
            .filter(|c| c.is_enabled())
            .map(|c| c.as_ref())
            .collect();

        let results = join_all(enabled.iter().map(|c| c.send(notification))).await;

        let mut outcomes = Vec::with_capacity(enabled.len());
        let mut stats = self.stats.lock();
        for (channel, result) in enabled.iter().zip(results) {
            match result {
                Ok(()) => {
                    stats.sent += 1;
                    outcomes.push((channel.name().to_string(), true));
                }
                Err(e) => {
                    stats.failed += 1;
                    error!("Failed to send alert via {}: {}", channel.name(), e);
                    outcomes.push((channel.name().to_string(), false));
                }
            }
        }
        outcomes
    }

    fn all_failed(outcomes: &[(String, bool)]) -> bool {
        !outcomes.is_empty() && outcomes.iter().all(|(_, ok)| !ok)
    }
}

#[async_trait]
impl AlertSink for AlertManager {
    async fn send_alert(&self, anomaly: &Anomaly) -> Result<()> {
        if !self.enabled || anomaly.severity < self.min_severity {
            debug!(
                "Alert for {} {} below {} filtered",
                anomaly.kind, anomaly.severity, self.min_severity
            );
            self.stats.lock().filtered += 1;
            return Ok(());
        }

        let outcomes = self.dispatch(&Notification::from_anomaly(anomaly)).await;
        if Self::all_failed(&outcomes) {
            return Err(PulseError::Alert(format!(
                "No channel delivered alert {}",
                anomaly.id
            )));
        }
        Ok(())
    }

    async fn send_test_alert(&self) -> Result<()> {
        let outcomes = self.dispatch(&Notification::test()).await;
        if outcomes.is_empty() {
            return Err(PulseError::Alert("No alert channels enabled".to_string()));
        }
        if Self::all_failed(&outcomes) {
            return Err(PulseError::Alert("Test alert failed on every channel".to_string()));
        }
        Ok(())
    }

    async fn test_notifiers(&self) -> BTreeMap<String, bool> {
        self.dispatch(&Notification::test()).await.into_iter().collect()
    }

    fn stats(&self) -> AlertStats {
        let mut stats = self.stats.lock().clone();
        stats.channels = self.get_enabled_channels();
        stats
    }
}
