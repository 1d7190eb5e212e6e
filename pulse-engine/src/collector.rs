use crate::MetricBatch;
use async_trait::async_trait;
use parking_lot::Mutex;
use pulse_core::{
    config::{CollectorConfig, CollectorsConfig},
    MetricEvent, MetricKind, Result,
};
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

/// A producer of metric batches. Collectors push into the engine's channel
/// and never call the pipeline directly.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&mut self, sender: mpsc::Sender<MetricBatch>) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;

    fn stats(&self) -> CollectorStats;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectorStats {
    pub running: bool,
    pub batches_sent: u64,
    pub events_sent: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorKind {
    Mempool,
    Block,
}

impl CollectorKind {
    pub const ALL: [CollectorKind; 2] = [CollectorKind::Mempool, CollectorKind::Block];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectorKind::Mempool => "mempool",
            CollectorKind::Block => "block",
        }
    }

    /// Mempool collectors carry `tx` samples; block collectors carry blocks
    /// and the votes on them.
    pub fn accepts(&self, kind: MetricKind) -> bool {
        match self {
            CollectorKind::Mempool => kind == MetricKind::Tx,
            CollectorKind::Block => matches!(kind, MetricKind::Block | MetricKind::Vote),
        }
    }

    pub fn config<'a>(&self, collectors: &'a CollectorsConfig) -> &'a CollectorConfig {
        match self {
            CollectorKind::Mempool => &collectors.mempool,
            CollectorKind::Block => &collectors.block,
        }
    }
}

impl fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds a replay collector for every enabled collector section.
pub fn build_collectors(config: &CollectorsConfig) -> Vec<Box<dyn Collector>> {
    let mut collectors: Vec<Box<dyn Collector>> = Vec::new();

    for kind in CollectorKind::ALL {
        let section = kind.config(config);
        if !section.enabled {
            continue;
        }
        if section.source.is_none() {
            warn!("Collector {} is enabled but has no source, skipping", kind);
            continue;
        }
        info!("Registering collector: {}", kind);
        collectors.push(Box::new(ReplayCollector::new(kind, section.clone())));
    }

    collectors
}

/// Replays `MetricEvent`s from a JSON-lines file, `batch_size` events every
/// `interval_ms`. Events of a type the collector does not carry are dropped.
pub struct ReplayCollector {
    kind: CollectorKind,
    config: CollectorConfig,
    stats: Arc<Mutex<CollectorStats>>,
    handle: Option<JoinHandle<()>>,
}

impl ReplayCollector {
    pub fn new(kind: CollectorKind, config: CollectorConfig) -> Self {
        Self {
            kind,
            config,
            stats: Arc::new(Mutex::new(CollectorStats::default())),
            handle: None,
        }
    }

    async fn load(&self, path: &Path) -> Result<Vec<MetricEvent>> {
        let contents = tokio::fs::read_to_string(path).await?;
        let mut events = Vec::new();

        for (line_no, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<MetricEvent>(line) {
                Ok(event) if self.kind.accepts(event.kind) => events.push(event),
                Ok(event) => debug!(
                    "{} collector skipping {} event on line {}",
                    self.kind,
                    event.kind,
                    line_no + 1
                ),
                Err(e) => {
                    self.stats.lock().errors += 1;
                    warn!(
                        "{} collector could not parse line {}: {}",
                        self.kind,
                        line_no + 1,
                        e
                    );
                }
            }
        }

        Ok(events)
    }
}

#[async_trait]
impl Collector for ReplayCollector {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    async fn start(&mut self, sender: mpsc::Sender<MetricBatch>) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        let events = match &self.config.source {
            Some(path) => self.load(path).await?,
            None => Vec::new(),
        };
        info!("{} collector replaying {} events", self.kind, events.len());

        let kind = self.kind;
        let stats = self.stats.clone();
        let batch_size = self.config.batch_size.max(1);
        let period = Duration::from_millis(self.config.interval_ms.max(1));
        stats.lock().running = true;

        self.handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            for chunk in events.chunks(batch_size) {
                interval.tick().await;
                if sender.send(chunk.to_vec()).await.is_err() {
                    debug!("{} collector channel closed", kind);
                    break;
                }
                let mut stats = stats.lock();
                stats.batches_sent += 1;
                stats.events_sent += chunk.len() as u64;
            }
            stats.lock().running = false;
            info!("{} collector finished replay", kind);
        }));

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.stats.lock().running = false;
        Ok(())
    }

    fn stats(&self) -> CollectorStats {
        self.stats.lock().clone()
    }
}
