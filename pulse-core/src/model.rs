use crate::{MetricEvent, MetricKind, PulseError, Result};
use serde::{Deserialize, Serialize};

/// Field names shared by collectors, storage and detectors.
pub mod fields {
    pub const TX_COUNT: &str = "tx_count";
    pub const TOTAL_SIZE: &str = "total_size";
    pub const AVG_SIZE: &str = "avg_size";
    pub const MIN_GAS_PRICE: &str = "min_gas_price";
    pub const MAX_GAS_PRICE: &str = "max_gas_price";
    pub const PENDING_LATENCY_AVG: &str = "pending_latency_avg";

    pub const VALIDATOR: &str = "validator";
    pub const HEIGHT: &str = "height";
    pub const SIGNED: &str = "signed";
    pub const BLOCK_HASH: &str = "block_hash";
}

/// Mempool sample as seen by the spike detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxMetrics {
    pub timestamp: i64,
    pub tx_count: f64,
    pub total_size: Option<f64>,
}

impl TxMetrics {
    pub fn from_event(event: &MetricEvent) -> Result<Self> {
        expect_kind(event, MetricKind::Tx)?;
        let tx_count = event.field_f64(fields::TX_COUNT).ok_or_else(|| {
            PulseError::InvalidMetric(format!("tx event at {} has no tx_count", event.timestamp))
        })?;

        Ok(Self {
            timestamp: event.timestamp,
            tx_count,
            total_size: event.field_f64(fields::TOTAL_SIZE),
        })
    }
}

/// A single validator vote for a block height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub timestamp: i64,
    pub validator: String,
    pub height: u64,
    pub signed: bool,
    pub block_hash: Option<String>,
}

impl VoteRecord {
    pub fn from_event(event: &MetricEvent) -> Result<Self> {
        expect_kind(event, MetricKind::Vote)?;
        let missing = |name: &str| {
            PulseError::InvalidMetric(format!(
                "vote event at {} has no valid {}",
                event.timestamp, name
            ))
        };

        Ok(Self {
            timestamp: event.timestamp,
            validator: event
                .field_str(fields::VALIDATOR)
                .ok_or_else(|| missing(fields::VALIDATOR))?
                .to_string(),
            height: event
                .field_u64(fields::HEIGHT)
                .ok_or_else(|| missing(fields::HEIGHT))?,
            signed: event
                .field_bool(fields::SIGNED)
                .ok_or_else(|| missing(fields::SIGNED))?,
            block_hash: event.field_str(fields::BLOCK_HASH).map(str::to_string),
        })
    }
}

fn expect_kind(event: &MetricEvent, kind: MetricKind) -> Result<()> {
    if event.kind != kind {
        return Err(PulseError::InvalidMetric(format!(
            "expected {} event, got {}",
            kind, event.kind
        )));
    }
    Ok(())
}
