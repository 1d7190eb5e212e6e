use crate::{PulseError, Result, Severity};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Copies every `Some` field of an override section onto its target.
macro_rules! override_fields {
    ($target:expr, $overrides:expr; $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $overrides.$field {
                $target.$field = value;
            }
        )+
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub collectors: CollectorsConfig,
    pub detectors: DetectorsConfig,
    pub alerts: AlertsConfig,
    pub anomalies: AnomaliesConfig,
    pub engine: PipelineConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub max_points: usize,
    pub retention_ms: i64,
    pub cleanup_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_points: 10_000,
            retention_ms: 24 * 60 * 60 * 1000,
            cleanup_interval_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CollectorsConfig {
    pub mempool: CollectorConfig,
    pub block: CollectorConfig,
}

/// A collector replays JSON-lines metric events from `source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub enabled: bool,
    pub source: Option<PathBuf>,
    pub interval_ms: u64,
    pub batch_size: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source: None,
            interval_ms: 1000,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DetectorsConfig {
    pub tx_spike: TxSpikeConfig,
    pub validator_downtime: ValidatorDowntimeConfig,
    pub double_sign: DoubleSignConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxSpikeConfig {
    pub enabled: bool,
    pub window_size: usize,
    pub min_samples: usize,
    pub z_threshold: f64,
    pub critical_z_threshold: f64,
    pub ewma_alpha: f64,
    pub cooldown_ms: i64,
}

impl Default for TxSpikeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size: 60,
            min_samples: 10,
            z_threshold: 3.0,
            critical_z_threshold: 6.0,
            ewma_alpha: 0.3,
            cooldown_ms: 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorDowntimeConfig {
    pub enabled: bool,
    pub miss_threshold: u32,
    pub critical_miss_threshold: u32,
    pub cooldown_ms: i64,
}

impl Default for ValidatorDowntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            miss_threshold: 3,
            critical_miss_threshold: 10,
            cooldown_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoubleSignConfig {
    pub enabled: bool,
    pub height_window: u64,
}

impl Default for DoubleSignConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            height_window: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertsConfig {
    pub enabled: bool,
    pub min_severity: Severity,
    pub log: LogAlertConfig,
    pub webhook: WebhookConfig,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_severity: Severity::Medium,
            log: LogAlertConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogAlertConfig {
    pub enabled: bool,
}

impl Default for LogAlertConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    pub timeout_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomaliesConfig {
    pub retention_ms: i64,
    pub max_recent: usize,
}

impl Default for AnomaliesConfig {
    fn default() -> Self {
        Self {
            retention_ms: 24 * 60 * 60 * 1000,
            max_recent: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

// Overrides. Every field is optional and unknown keys are rejected.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfigOverride {
    pub storage: Option<StorageOverride>,
    pub collectors: Option<CollectorsOverride>,
    pub detectors: Option<DetectorsOverride>,
    pub alerts: Option<AlertsOverride>,
    pub anomalies: Option<AnomaliesOverride>,
    pub engine: Option<PipelineOverride>,
    pub api: Option<ApiOverride>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageOverride {
    pub max_points: Option<usize>,
    pub retention_ms: Option<i64>,
    pub cleanup_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorsOverride {
    pub mempool: Option<CollectorOverride>,
    pub block: Option<CollectorOverride>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorOverride {
    pub enabled: Option<bool>,
    pub source: Option<PathBuf>,
    pub interval_ms: Option<u64>,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectorsOverride {
    pub tx_spike: Option<TxSpikeOverride>,
    pub validator_downtime: Option<ValidatorDowntimeOverride>,
    pub double_sign: Option<DoubleSignOverride>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TxSpikeOverride {
    pub enabled: Option<bool>,
    pub window_size: Option<usize>,
    pub min_samples: Option<usize>,
    pub z_threshold: Option<f64>,
    pub critical_z_threshold: Option<f64>,
    pub ewma_alpha: Option<f64>,
    pub cooldown_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidatorDowntimeOverride {
    pub enabled: Option<bool>,
    pub miss_threshold: Option<u32>,
    pub critical_miss_threshold: Option<u32>,
    pub cooldown_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DoubleSignOverride {
    pub enabled: Option<bool>,
    pub height_window: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertsOverride {
    pub enabled: Option<bool>,
    pub min_severity: Option<Severity>,
    pub log: Option<LogAlertOverride>,
    pub webhook: Option<WebhookOverride>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogAlertOverride {
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookOverride {
    pub enabled: Option<bool>,
    pub url: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnomaliesOverride {
    pub retention_ms: Option<i64>,
    pub max_recent: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineOverride {
    pub channel_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiOverride {
    pub enabled: Option<bool>,
    pub bind: Option<String>,
}

impl EngineConfig {
    /// Defaults with `overrides` applied on top.
    pub fn resolve(overrides: EngineConfigOverride) -> Self {
        let mut config = Self::default();
        config.apply(overrides);
        config
    }

    pub fn apply(&mut self, overrides: EngineConfigOverride) {
        if let Some(storage) = overrides.storage {
            override_fields!(self.storage, storage; max_points, retention_ms, cleanup_interval_ms);
        }
        if let Some(collectors) = overrides.collectors {
            if let Some(mempool) = collectors.mempool {
                self.collectors.mempool.apply(mempool);
            }
            if let Some(block) = collectors.block {
                self.collectors.block.apply(block);
            }
        }
        if let Some(detectors) = overrides.detectors {
            if let Some(o) = detectors.tx_spike {
                override_fields!(
                    self.detectors.tx_spike, o;
                    enabled, window_size, min_samples, z_threshold,
                    critical_z_threshold, ewma_alpha, cooldown_ms
                );
            }
            if let Some(o) = detectors.validator_downtime {
                override_fields!(
                    self.detectors.validator_downtime, o;
                    enabled, miss_threshold, critical_miss_threshold, cooldown_ms
                );
            }
            if let Some(o) = detectors.double_sign {
                override_fields!(self.detectors.double_sign, o; enabled, height_window);
            }
        }
        if let Some(alerts) = overrides.alerts {
            override_fields!(self.alerts, alerts; enabled, min_severity);
            if let Some(log) = alerts.log {
                override_fields!(self.alerts.log, log; enabled);
            }
            if let Some(webhook) = alerts.webhook {
                override_fields!(self.alerts.webhook, webhook; enabled, url, timeout_ms);
            }
        }
        if let Some(anomalies) = overrides.anomalies {
            override_fields!(self.anomalies, anomalies; retention_ms, max_recent);
        }
        if let Some(engine) = overrides.engine {
            override_fields!(self.engine, engine; channel_capacity);
        }
        if let Some(api) = overrides.api {
            override_fields!(self.api, api; enabled, bind);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(PulseError::Configuration(msg.to_string()));

        if self.storage.max_points == 0 {
            return fail("storage.max_points must be positive");
        }
        if self.storage.retention_ms <= 0 {
            return fail("storage.retention_ms must be positive");
        }
        if self.storage.cleanup_interval_ms == 0 {
            return fail("storage.cleanup_interval_ms must be positive");
        }

        let spike = &self.detectors.tx_spike;
        if spike.window_size < 2 {
            return fail("detectors.tx_spike.window_size must be at least 2");
        }
        if spike.min_samples < 2 || spike.min_samples > spike.window_size {
            return fail("detectors.tx_spike.min_samples must be between 2 and window_size");
        }
        if !(spike.ewma_alpha > 0.0 && spike.ewma_alpha <= 1.0) {
            return fail("detectors.tx_spike.ewma_alpha must be in (0, 1]");
        }
        if spike.z_threshold <= 0.0 || spike.critical_z_threshold < spike.z_threshold {
            return fail("detectors.tx_spike thresholds must satisfy 0 < z_threshold <= critical_z_threshold");
        }

        let downtime = &self.detectors.validator_downtime;
        if downtime.miss_threshold == 0 || downtime.critical_miss_threshold < downtime.miss_threshold {
            return fail("detectors.validator_downtime thresholds must satisfy 0 < miss_threshold <= critical_miss_threshold");
        }

        if self.anomalies.max_recent == 0 {
            return fail("anomalies.max_recent must be positive");
        }
        if self.engine.channel_capacity == 0 {
            return fail("engine.channel_capacity must be positive");
        }
        if self.alerts.webhook.enabled && self.alerts.webhook.url.is_empty() {
            return fail("alerts.webhook.url is required when the webhook is enabled");
        }

        for (name, collector) in [("mempool", &self.collectors.mempool), ("block", &self.collectors.block)] {
            if collector.enabled && collector.source.is_none() {
                return Err(PulseError::Configuration(format!(
                    "collectors.{}.source is required when the collector is enabled",
                    name
                )));
            }
        }

        Ok(())
    }
}

impl CollectorConfig {
    fn apply(&mut self, overrides: CollectorOverride) {
        override_fields!(self, overrides; enabled, interval_ms, batch_size);
        if overrides.source.is_some() {
            self.source = overrides.source;
        }
    }
}
