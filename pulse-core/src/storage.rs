use crate::{
    config::StorageConfig,
    model::{fields, VoteRecord},
    now_millis, MetricEvent, MetricKind, PulseError, Result,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Spacing assumed between samples when `get_recent` turns a count into a
/// time window.
pub const RECENT_SPACING_MS: i64 = 60 * 1000;

/// Fraction of a partition dropped once it grows past `max_points`.
const EVICTION_FRACTION: f64 = 0.2;

#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn write_tx_metrics(&self, batch: &[MetricEvent]) -> Result<()>;

    async fn write_block_metrics(&self, batch: &[MetricEvent]) -> Result<()>;

    async fn write_validator_metrics(&self, batch: &[MetricEvent]) -> Result<()>;

    /// Events with `start <= timestamp <= end`, ascending by timestamp.
    async fn query_range(
        &self,
        kind: MetricKind,
        start: i64,
        end: i64,
        limit: Option<usize>,
    ) -> Result<Vec<MetricEvent>>;

    async fn get_recent(&self, kind: MetricKind, count: usize) -> Result<Vec<MetricEvent>> {
        let end = now_millis();
        let start = end - count as i64 * RECENT_SPACING_MS;
        self.query_range(kind, start, end, Some(count)).await
    }

    /// Starts any background work the store needs. Called on every engine
    /// start, including a restart after `close`.
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()>;

    fn stats(&self) -> StorageStats;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub writes: u64,
    pub reads: u64,
    pub merged: u64,
    pub evicted: u64,
    pub expired: u64,
    pub rejected: u64,
    pub tx_points: usize,
    pub block_points: usize,
    pub vote_points: usize,
}

/// Votes at the same timestamp from different validators or heights must not
/// collide, so the key carries all three. Field order gives timestamp-first
/// ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct VoteKey {
    timestamp: i64,
    validator: String,
    height: u64,
}

#[derive(Default)]
struct Partitions {
    tx: BTreeMap<i64, MetricEvent>,
    block: BTreeMap<i64, MetricEvent>,
    vote: BTreeMap<VoteKey, MetricEvent>,
    stats: StorageStats,
}

impl Partitions {
    fn refresh_sizes(&mut self) {
        self.stats.tx_points = self.tx.len();
        self.stats.block_points = self.block.len();
        self.stats.vote_points = self.vote.len();
    }

    fn remove_older_than(&mut self, cutoff: i64) -> usize {
        let before = self.tx.len() + self.block.len() + self.vote.len();
        self.tx.retain(|_, e| e.timestamp >= cutoff);
        self.block.retain(|_, e| e.timestamp >= cutoff);
        self.vote.retain(|_, e| e.timestamp >= cutoff);
        let removed = before - (self.tx.len() + self.block.len() + self.vote.len());

        self.stats.expired += removed as u64;
        self.refresh_sizes();
        removed
    }
}

/// Bounded in-memory store with per-type partitions, size-based eviction and
/// a periodic retention sweep.
pub struct InMemoryStore {
    config: StorageConfig,
    partitions: Arc<RwLock<Partitions>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryStore {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            partitions: Arc::new(RwLock::new(Partitions::default())),
            sweeper: Mutex::new(None),
        }
    }

    /// Creates the store and starts the retention sweep. Must be called from
    /// within a Tokio runtime.
    pub fn with_cleanup(config: StorageConfig) -> Self {
        let store = Self::new(config);
        store.start_cleanup();
        store
    }

    pub fn start_cleanup(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let partitions = self.partitions.clone();
        let retention_ms = self.config.retention_ms;
        let period = Duration::from_millis(self.config.cleanup_interval_ms);

        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let removed = partitions.write().remove_older_than(now_millis() - retention_ms);
                if removed > 0 {
                    debug!("Retention sweep removed {} expired points", removed);
                }
            }
        }));

        info!(
            "Storage retention sweep started (every {:?}, retention {}ms)",
            period, retention_ms
        );
    }

    /// Runs a retention pass against the wall clock.
    pub fn cleanup(&self) -> usize {
        self.cleanup_before(now_millis() - self.config.retention_ms)
    }

    /// Removes every point with `timestamp < cutoff` across all partitions.
    pub fn cleanup_before(&self, cutoff: i64) -> usize {
        self.partitions.write().remove_older_than(cutoff)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn eviction_count(&self, len: usize) -> usize {
        if len <= self.config.max_points {
            return 0;
        }
        let fraction = (len as f64 * EVICTION_FRACTION).floor() as usize;
        fraction.max(len - self.config.max_points)
    }
}

fn ensure_kind(batch: &[MetricEvent], kind: MetricKind) -> Result<()> {
    match batch.iter().find(|e| e.kind != kind) {
        Some(e) => Err(PulseError::InvalidMetric(format!(
            "{} event at {} written to the {} partition",
            e.kind, e.timestamp, kind
        ))),
        None => Ok(()),
    }
}

/// Drops the `count` lowest keys. Keys order by timestamp first.
fn evict_oldest<K: Ord>(partition: &mut BTreeMap<K, MetricEvent>, count: usize) -> usize {
    let mut evicted = 0;
    while evicted < count && partition.pop_first().is_some() {
        evicted += 1;
    }
    evicted
}

/// Whole numbers stay JSON integers so merged counts read back as counts.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}

/// Folds `incoming` into a tx sample already stored at the same timestamp.
///
/// `avg_size` and `pending_latency_avg` become the mean of the stored and the
/// incoming value, so after more than two merges the result is not the true
/// mean of the folded samples.
fn merge_tx(existing: &mut MetricEvent, incoming: &MetricEvent) {
    for (name, value) in &incoming.fields {
        let combined = match (existing.field_f64(name), value.as_f64()) {
            (Some(a), Some(b)) => match name.as_str() {
                fields::TX_COUNT | fields::TOTAL_SIZE => Some(a + b),
                fields::AVG_SIZE | fields::PENDING_LATENCY_AVG => Some((a + b) / 2.0),
                fields::MIN_GAS_PRICE => Some(a.min(b)),
                fields::MAX_GAS_PRICE => Some(a.max(b)),
                _ => None,
            },
            _ => None,
        };

        let merged = combined.map(number).unwrap_or_else(|| value.clone());
        existing.fields.insert(name.clone(), merged);
    }
}

#[async_trait]
impl MetricStore for InMemoryStore {
    async fn write_tx_metrics(&self, batch: &[MetricEvent]) -> Result<()> {
        ensure_kind(batch, MetricKind::Tx)?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut guard = self.partitions.write();
        let partitions = &mut *guard;
        for event in batch {
            match partitions.tx.get_mut(&event.timestamp) {
                Some(existing) => {
                    merge_tx(existing, event);
                    partitions.stats.merged += 1;
                }
                None => {
                    partitions.tx.insert(event.timestamp, event.clone());
                }
            }
            partitions.stats.writes += 1;
        }

        let evict = self.eviction_count(partitions.tx.len());
        if evict > 0 {
            let evicted = evict_oldest(&mut partitions.tx, evict);
            partitions.stats.evicted += evicted as u64;
            debug!("Evicted {} tx points over max_points", evicted);
        }
        partitions.refresh_sizes();
        Ok(())
    }

    async fn write_block_metrics(&self, batch: &[MetricEvent]) -> Result<()> {
        ensure_kind(batch, MetricKind::Block)?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut guard = self.partitions.write();
        let partitions = &mut *guard;
        for event in batch {
            partitions.block.insert(event.timestamp, event.clone());
            partitions.stats.writes += 1;
        }

        let evict = self.eviction_count(partitions.block.len());
        if evict > 0 {
            let evicted = evict_oldest(&mut partitions.block, evict);
            partitions.stats.evicted += evicted as u64;
            debug!("Evicted {} block points over max_points", evicted);
        }
        partitions.refresh_sizes();
        Ok(())
    }

    async fn write_validator_metrics(&self, batch: &[MetricEvent]) -> Result<()> {
        ensure_kind(batch, MetricKind::Vote)?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut guard = self.partitions.write();
        let partitions = &mut *guard;
        for event in batch {
            let vote = match VoteRecord::from_event(event) {
                Ok(vote) => vote,
                Err(e) => {
                    warn!("Skipping vote without a usable key: {}", e);
                    partitions.stats.rejected += 1;
                    continue;
                }
            };

            let key = VoteKey {
                timestamp: vote.timestamp,
                validator: vote.validator,
                height: vote.height,
            };
            partitions.vote.insert(key, event.clone());
            partitions.stats.writes += 1;
        }

        let evict = self.eviction_count(partitions.vote.len());
        if evict > 0 {
            let evicted = evict_oldest(&mut partitions.vote, evict);
            partitions.stats.evicted += evicted as u64;
            debug!("Evicted {} vote points over max_points", evicted);
        }
        partitions.refresh_sizes();
        Ok(())
    }

    async fn query_range(
        &self,
        kind: MetricKind,
        start: i64,
        end: i64,
        limit: Option<usize>,
    ) -> Result<Vec<MetricEvent>> {
        let limit = limit.unwrap_or(usize::MAX);
        if start > end || limit == 0 {
            return Ok(Vec::new());
        }

        let mut partitions = self.partitions.write();
        partitions.stats.reads += 1;

        let events = match kind {
            MetricKind::Tx => partitions
                .tx
                .range(start..=end)
                .map(|(_, e)| e.clone())
                .take(limit)
                .collect(),
            MetricKind::Block => partitions
                .block
                .range(start..=end)
                .map(|(_, e)| e.clone())
                .take(limit)
                .collect(),
            MetricKind::Vote => partitions
                .vote
                .values()
                .skip_while(|e| e.timestamp < start)
                .take_while(|e| e.timestamp <= end)
                .take(limit)
                .cloned()
                .collect(),
        };

        Ok(events)
    }

    /// The newest `count` points of a partition, ascending by timestamp.
    async fn get_recent(&self, kind: MetricKind, count: usize) -> Result<Vec<MetricEvent>> {
        let mut partitions = self.partitions.write();
        partitions.stats.reads += 1;

        let mut events: Vec<MetricEvent> = match kind {
            MetricKind::Tx => partitions.tx.values().rev().take(count).cloned().collect(),
            MetricKind::Block => partitions.block.values().rev().take(count).cloned().collect(),
            MetricKind::Vote => partitions.vote.values().rev().take(count).cloned().collect(),
        };
        events.reverse();
        Ok(events)
    }

    async fn open(&self) -> Result<()> {
        self.start_cleanup();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }

        let mut partitions = self.partitions.write();
        partitions.tx.clear();
        partitions.block.clear();
        partitions.vote.clear();
        partitions.refresh_sizes();

        info!("In-memory store closed");
        Ok(())
    }

    fn stats(&self) -> StorageStats {
        self.partitions.read().stats.clone()
    }
}
