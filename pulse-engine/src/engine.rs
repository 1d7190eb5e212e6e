use crate::{build_collectors, Collector, CollectorStats, MetricBatch};
use parking_lot::{Mutex, RwLock};
use pulse_anomaly::{build_detectors, Detector};
use pulse_core::{
    config::EngineConfig,
    storage::{InMemoryStore, MetricStore, StorageStats},
    Anomaly, AnomalyKind, MetricEvent, MetricKind, PulseError, Result, Severity,
};
use pulse_notifier::{AlertManager, AlertSink, AlertStats};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

pub const DEFAULT_ANOMALY_LIMIT: usize = 100;

/// Slice sizes `force_detection` pulls from each partition.
pub const FORCE_TX_SAMPLES: usize = 50;
pub const FORCE_BLOCK_SAMPLES: usize = 20;
pub const FORCE_VOTE_SAMPLES: usize = 100;

/// Filters for `get_recent_anomalies`. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyQuery {
    pub since: Option<i64>,
    #[serde(rename = "type")]
    pub kind: Option<AnomalyKind>,
    pub severity: Option<Severity>,
    /// Matches either the entity kind or the entity id.
    pub entity: Option<String>,
    pub limit: Option<usize>,
}

impl AnomalyQuery {
    fn matches(&self, anomaly: &Anomaly) -> bool {
        self.since.map_or(true, |since| anomaly.timestamp >= since)
            && self.kind.map_or(true, |kind| anomaly.kind == kind)
            && self.severity.map_or(true, |severity| anomaly.severity == severity)
            && self
                .entity
                .as_deref()
                .map_or(true, |entity| anomaly.entity.matches(entity))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyCounters {
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
}

impl AnomalyCounters {
    fn record(&mut self, anomaly: &Anomaly) {
        self.total += 1;
        *self.by_type.entry(anomaly.kind.to_string()).or_default() += 1;
        *self
            .by_severity
            .entry(anomaly.severity.to_string())
            .or_default() += 1;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub uptime_secs: u64,
    pub running: bool,
    pub anomalies: AnomalyCounters,
    pub recent_anomalies: usize,
    pub batches_processed: u64,
    pub detector_failures: u64,
    pub storage_failures: u64,
    pub alert_failures: u64,
    pub storage: StorageStats,
    pub collectors: BTreeMap<String, CollectorStats>,
    pub detectors: BTreeMap<String, serde_json::Value>,
    pub alerts: AlertStats,
    pub config: EngineConfig,
}

/// Everything a batch mutates. Holding this lock for a whole batch keeps
/// batches from interleaving.
struct Pipeline {
    detectors: Vec<Box<dyn Detector>>,
    batches: u64,
    detector_failures: u64,
}

#[derive(Default)]
struct RecentAnomalies {
    anomalies: Vec<Anomaly>,
    counters: AnomalyCounters,
}

#[derive(Default)]
struct Runtime {
    started_at: Option<Instant>,
    sender: Option<mpsc::Sender<MetricBatch>>,
    shutdown: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<()>>,
}

/// Wires storage, detectors and alerting into the metric pipeline.
///
/// Shared by `Arc`. Batches arrive either through `process_metrics` or the
/// channel returned by `get_event_sender` while the engine is running; both
/// paths apply batches one at a time.
pub struct AnomalyEngine {
    config: EngineConfig,
    storage: Arc<dyn MetricStore>,
    alerts: Arc<dyn AlertSink>,
    pipeline: tokio::sync::Mutex<Pipeline>,
    recent: RwLock<RecentAnomalies>,
    collectors: tokio::sync::Mutex<Vec<Box<dyn Collector>>>,
    running: AtomicBool,
    runtime: Mutex<Runtime>,
    storage_failures: AtomicU64,
    alert_failures: AtomicU64,
}

impl AnomalyEngine {
    pub fn new(
        config: EngineConfig,
        storage: Arc<dyn MetricStore>,
        detectors: Vec<Box<dyn Detector>>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            config,
            storage,
            alerts,
            pipeline: tokio::sync::Mutex::new(Pipeline {
                detectors,
                batches: 0,
                detector_failures: 0,
            }),
            recent: RwLock::new(RecentAnomalies::default()),
            collectors: tokio::sync::Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            runtime: Mutex::new(Runtime::default()),
            storage_failures: AtomicU64::new(0),
            alert_failures: AtomicU64::new(0),
        }
    }

    /// Validates `config` and builds the default collaborators: an in-memory
    /// store with its retention sweep, the enabled detectors and collectors,
    /// and an `AlertManager`. Must be called from within a Tokio runtime.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(InMemoryStore::with_cleanup(config.storage.clone()));
        let detectors = build_detectors(&config.detectors);
        let alerts = Arc::new(AlertManager::from_config(&config.alerts)?);
        let collectors = build_collectors(&config.collectors);

        info!(
            "Engine configured with {} detectors and {} collectors",
            detectors.len(),
            collectors.len()
        );

        let mut engine = Self::new(config, storage, detectors, alerts);
        *engine.collectors.get_mut() = collectors;
        Ok(engine)
    }

    pub fn with_collector(mut self, collector: Box<dyn Collector>) -> Self {
        self.collectors.get_mut().push(collector);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the batch worker and every collector.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PulseError::AlreadyRunning);
        }
        info!("Starting anomaly engine...");

        if let Err(e) = self.storage.open().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let (sender, receiver) = mpsc::channel(self.config.engine.channel_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(Self::run_worker(self.clone(), receiver, shutdown_rx));

        for collector in self.collectors.lock().await.iter_mut() {
            match collector.start(sender.clone()).await {
                Ok(()) => info!("Collector {} started", collector.name()),
                Err(e) => error!("Collector {} failed to start: {}", collector.name(), e),
            }
        }

        let mut runtime = self.runtime.lock();
        runtime.started_at = Some(Instant::now());
        runtime.sender = Some(sender);
        runtime.shutdown = Some(shutdown_tx);
        runtime.worker = Some(worker);

        info!("Anomaly engine started");
        Ok(())
    }

    /// Stops collectors, lets the worker finish every batch already queued,
    /// then closes storage. A batch already inside the pipeline runs to
    /// completion.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(PulseError::NotRunning);
        }
        info!("Stopping anomaly engine...");

        for collector in self.collectors.lock().await.iter_mut() {
            if let Err(e) = collector.stop().await {
                warn!("Collector {} failed to stop: {}", collector.name(), e);
            }
        }

        let (shutdown, worker) = {
            let mut runtime = self.runtime.lock();
            runtime.sender = None;
            (runtime.shutdown.take(), runtime.worker.take())
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Engine worker ended abnormally: {}", e);
            }
        }

        self.storage.close().await?;
        info!("Anomaly engine stopped");
        Ok(())
    }

    /// A sender into the batch channel, while the engine is running.
    pub fn get_event_sender(&self) -> Option<mpsc::Sender<MetricBatch>> {
        self.runtime.lock().sender.clone()
    }

    async fn run_worker(
        engine: Arc<Self>,
        mut receiver: mpsc::Receiver<MetricBatch>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                batch = receiver.recv() => match batch {
                    Some(batch) => {
                        engine.process_metrics(&batch).await;
                    }
                    None => break,
                },
            }
        }

        // Batches accepted before shutdown still run; new sends are refused.
        receiver.close();
        let mut drained = 0;
        while let Some(batch) = receiver.recv().await {
            engine.process_metrics(&batch).await;
            drained += 1;
        }
        if drained > 0 {
            info!("Engine worker drained {} queued batches", drained);
        }
        debug!("Engine worker exited");
    }

    /// Stores `batch`, runs it through every detector and forwards the
    /// resulting anomalies to alerting.
    pub async fn process_metrics(&self, batch: &[MetricEvent]) -> Vec<Anomaly> {
        let mut pipeline = self.pipeline.lock().await;
        self.write_batch(batch).await;
        self.detect(&mut pipeline, batch).await
    }

    /// Re-runs detection over the newest stored points without writing them
    /// back.
    pub async fn force_detection(&self) -> Result<Vec<Anomaly>> {
        let (tx, block, vote) = tokio::join!(
            self.storage.get_recent(MetricKind::Tx, FORCE_TX_SAMPLES),
            self.storage.get_recent(MetricKind::Block, FORCE_BLOCK_SAMPLES),
            self.storage.get_recent(MetricKind::Vote, FORCE_VOTE_SAMPLES),
        );

        let mut batch = tx?;
        batch.extend(block?);
        batch.extend(vote?);
        info!("Forced detection over {} stored points", batch.len());

        let mut pipeline = self.pipeline.lock().await;
        Ok(self.detect(&mut pipeline, &batch).await)
    }

    async fn write_batch(&self, batch: &[MetricEvent]) {
        let mut tx = Vec::new();
        let mut block = Vec::new();
        let mut vote = Vec::new();
        for event in batch {
            match event.kind {
                MetricKind::Tx => tx.push(event.clone()),
                MetricKind::Block => block.push(event.clone()),
                MetricKind::Vote => vote.push(event.clone()),
            }
        }

        let (tx_result, block_result, vote_result) = tokio::join!(
            self.storage.write_tx_metrics(&tx),
            self.storage.write_block_metrics(&block),
            self.storage.write_validator_metrics(&vote),
        );

        for (kind, result) in [
            (MetricKind::Tx, tx_result),
            (MetricKind::Block, block_result),
            (MetricKind::Vote, vote_result),
        ] {
            if let Err(e) = result {
                self.storage_failures.fetch_add(1, Ordering::Relaxed);
                error!("Failed to store {} metrics: {}", kind, e);
            }
        }
    }

    async fn detect(&self, pipeline: &mut Pipeline, batch: &[MetricEvent]) -> Vec<Anomaly> {
        let mut found = Vec::new();

        for detector in pipeline.detectors.iter_mut() {
            match detector.process_metrics(batch) {
                Ok(anomalies) => found.extend(anomalies),
                Err(e) => {
                    pipeline.detector_failures += 1;
                    error!("Detector {} failed: {}", detector.name(), e);
                }
            }
        }
        pipeline.batches += 1;

        if found.is_empty() {
            return found;
        }

        {
            let mut recent = self.recent.write();
            for anomaly in &found {
                recent.counters.record(anomaly);
                recent.anomalies.push(anomaly.clone());
            }
            self.enforce_bounds(&mut recent);
        }

        for anomaly in &found {
            if let Err(e) = self.alerts.send_alert(anomaly).await {
                self.alert_failures.fetch_add(1, Ordering::Relaxed);
                error!("Failed to send alert for anomaly {}: {}", anomaly.id, e);
            }
        }

        found
    }

    /// Retention is measured from the newest cached anomaly, so the cache
    /// ages on the same event clock the detectors use.
    fn enforce_bounds(&self, recent: &mut RecentAnomalies) {
        let Some(newest) = recent.anomalies.iter().map(|a| a.timestamp).max() else {
            return;
        };

        let cutoff = newest - self.config.anomalies.retention_ms;
        recent.anomalies.retain(|a| a.timestamp >= cutoff);

        let max_recent = self.config.anomalies.max_recent;
        if recent.anomalies.len() > max_recent {
            recent.anomalies.sort_by_key(|a| a.timestamp);
            let excess = recent.anomalies.len() - max_recent;
            recent.anomalies.drain(..excess);
        }
    }

    /// Cached anomalies matching `query`, newest first. The cache is only
    /// trimmed when a batch produces anomalies, so entries past retention
    /// stay visible until the next one does.
    pub fn get_recent_anomalies(&self, query: &AnomalyQuery) -> Vec<Anomaly> {
        let mut anomalies: Vec<Anomaly> = self
            .recent
            .read()
            .anomalies
            .iter()
            .filter(|a| query.matches(a))
            .cloned()
            .collect();

        anomalies.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        anomalies.truncate(query.limit.unwrap_or(DEFAULT_ANOMALY_LIMIT));
        anomalies
    }

    pub async fn stats(&self) -> EngineStats {
        let (batches_processed, detector_failures, detectors) = {
            let pipeline = self.pipeline.lock().await;
            let detectors = pipeline
                .detectors
                .iter()
                .map(|d| (d.name().to_string(), d.stats()))
                .collect();
            (pipeline.batches, pipeline.detector_failures, detectors)
        };

        let collectors = self
            .collectors
            .lock()
            .await
            .iter()
            .map(|c| (c.name().to_string(), c.stats()))
            .collect();

        let (anomalies, recent_anomalies) = {
            let recent = self.recent.read();
            (recent.counters.clone(), recent.anomalies.len())
        };

        let uptime_secs = self
            .runtime
            .lock()
            .started_at
            .map_or(0, |started| started.elapsed().as_secs());

        EngineStats {
            uptime_secs,
            running: self.is_running(),
            anomalies,
            recent_anomalies,
            batches_processed,
            detector_failures,
            storage_failures: self.storage_failures.load(Ordering::Relaxed),
            alert_failures: self.alert_failures.load(Ordering::Relaxed),
            storage: self.storage.stats(),
            collectors,
            detectors,
            alerts: self.alerts.stats(),
            config: self.config.clone(),
        }
    }

    pub async fn send_test_alert(&self) -> Result<()> {
        self.alerts.send_test_alert().await
    }

    /// Sends a test notification through every alert channel.
    pub async fn test_alerts(&self) -> BTreeMap<String, bool> {
        self.alerts.test_notifiers().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::{config::AnomaliesConfig, Entity};

    fn engine(anomalies: AnomaliesConfig) -> AnomalyEngine {
        let config = EngineConfig {
            anomalies,
            ..EngineConfig::default()
        };
        AnomalyEngine::new(
            config.clone(),
            Arc::new(InMemoryStore::new(config.storage.clone())),
            Vec::new(),
            Arc::new(AlertManager::new(Severity::Critical)),
        )
    }

    fn anomaly(kind: AnomalyKind, severity: Severity, entity: Entity, ts: i64) -> Anomaly {
        Anomaly::new(kind, severity, entity, ts, String::new(), serde_json::Map::new())
    }

    fn seed(engine: &AnomalyEngine, anomalies: Vec<Anomaly>) {
        let mut recent = engine.recent.write();
        for a in &anomalies {
            recent.counters.record(a);
        }
        recent.anomalies.extend(anomalies);
        engine.enforce_bounds(&mut recent);
    }

    #[test]
    fn test_query_filters_and_sorts_newest_first() {
        let engine = engine(AnomaliesConfig::default());
        seed(
            &engine,
            vec![
                anomaly(AnomalyKind::ValidatorDowntime, Severity::Medium, Entity::validator("V1"), 10),
                anomaly(AnomalyKind::TxSpike, Severity::Critical, Entity::network("mempool"), 20),
                anomaly(AnomalyKind::ValidatorDowntime, Severity::Critical, Entity::validator("V2"), 30),
            ],
        );

        let all = engine.get_recent_anomalies(&AnomalyQuery::default());
        assert_eq!(all.iter().map(|a| a.timestamp).collect::<Vec<_>>(), vec![30, 20, 10]);

        let critical = engine.get_recent_anomalies(&AnomalyQuery {
            severity: Some(Severity::Critical),
            ..AnomalyQuery::default()
        });
        assert_eq!(critical.len(), 2);

        let by_kind = engine.get_recent_anomalies(&AnomalyQuery {
            entity: Some("validator".to_string()),
            since: Some(15),
            ..AnomalyQuery::default()
        });
        assert_eq!(by_kind.len(), 1);
        assert_eq!(by_kind[0].entity.id, "V2");

        let by_id = engine.get_recent_anomalies(&AnomalyQuery {
            entity: Some("V1".to_string()),
            ..AnomalyQuery::default()
        });
        assert_eq!(by_id.len(), 1);
    }

    #[test]
    fn test_default_limit_is_one_hundred() {
        let engine = engine(AnomaliesConfig::default());
        seed(
            &engine,
            (0..150)
                .map(|i| anomaly(AnomalyKind::TxSpike, Severity::Medium, Entity::network("mempool"), i))
                .collect(),
        );

        let recent = engine.get_recent_anomalies(&AnomalyQuery::default());
        assert_eq!(recent.len(), DEFAULT_ANOMALY_LIMIT);
        assert_eq!(recent[0].timestamp, 149);
    }

    #[test]
    fn test_cache_keeps_newest_within_max_recent() {
        let engine = engine(AnomaliesConfig {
            retention_ms: 1_000_000,
            max_recent: 3,
        });
        seed(
            &engine,
            [5, 1, 4, 2, 3]
                .into_iter()
                .map(|ts| anomaly(AnomalyKind::TxSpike, Severity::Medium, Entity::network("mempool"), ts))
                .collect(),
        );

        let kept = engine.get_recent_anomalies(&AnomalyQuery::default());
        assert_eq!(kept.iter().map(|a| a.timestamp).collect::<Vec<_>>(), vec![5, 4, 3]);
    }

    #[test]
    fn test_cache_drops_anomalies_past_retention() {
        let engine = engine(AnomaliesConfig {
            retention_ms: 100,
            max_recent: 1000,
        });
        seed(
            &engine,
            [0, 50, 150, 200]
                .into_iter()
                .map(|ts| anomaly(AnomalyKind::TxSpike, Severity::Medium, Entity::network("mempool"), ts))
                .collect(),
        );

        let kept = engine.get_recent_anomalies(&AnomalyQuery::default());
        assert_eq!(kept.iter().map(|a| a.timestamp).collect::<Vec<_>>(), vec![200, 150]);
    }

    #[tokio::test]
    async fn test_cache_ages_only_when_new_anomalies_arrive() {
        let engine = engine(AnomaliesConfig {
            retention_ms: 100,
            max_recent: 1000,
        });
        let mempool = |ts| anomaly(AnomalyKind::TxSpike, Severity::Medium, Entity::network("mempool"), ts);
        seed(&engine, vec![mempool(0), mempool(50)]);

        assert!(engine.process_metrics(&[]).await.is_empty());
        assert_eq!(engine.get_recent_anomalies(&AnomalyQuery::default()).len(), 2);

        seed(&engine, vec![mempool(200)]);
        let kept = engine.get_recent_anomalies(&AnomalyQuery::default());
        assert_eq!(kept.iter().map(|a| a.timestamp).collect::<Vec<_>>(), vec![200]);
    }

    #[test]
    fn test_query_deserializes_type_key() {
        let query: AnomalyQuery =
            serde_json::from_value(serde_json::json!({ "type": "double_sign", "limit": 5 })).unwrap();
        assert_eq!(query.kind, Some(AnomalyKind::DoubleSign));
        assert_eq!(query.limit, Some(5));
    }
}
