use crate::{into_map, Detector};
use pulse_core::{
    config::DoubleSignConfig, model::VoteRecord, Anomaly, AnomalyKind, Entity, MetricEvent,
    MetricKind, Result, Severity,
};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, error};

#[derive(Debug, Clone)]
struct SignedVote {
    block_hash: String,
    timestamp: i64,
}

/// Reports validators that sign two different blocks at the same height.
///
/// Every conflict is reported regardless of timing. Evidence that was
/// already reported (same validator, height and conflicting hash) is not
/// reported twice.
pub struct DoubleSignDetector {
    config: DoubleSignConfig,
    // keyed by (height, validator) so old heights prune with one split
    seen: BTreeMap<(u64, String), SignedVote>,
    reported: HashSet<(u64, String, String)>,
    max_height: u64,
    processed: u64,
    anomalies: u64,
    skipped: u64,
}

impl DoubleSignDetector {
    pub fn new(config: DoubleSignConfig) -> Self {
        Self {
            config,
            seen: BTreeMap::new(),
            reported: HashSet::new(),
            max_height: 0,
            processed: 0,
            anomalies: 0,
            skipped: 0,
        }
    }

    fn check(&mut self, vote: VoteRecord, block_hash: String) -> Option<Anomaly> {
        let key = (vote.height, vote.validator.clone());
        let first = match self.seen.get(&key) {
            None => {
                self.seen.insert(
                    key,
                    SignedVote {
                        block_hash,
                        timestamp: vote.timestamp,
                    },
                );
                return None;
            }
            Some(first) if first.block_hash == block_hash => return None,
            Some(first) => first.clone(),
        };

        if !self
            .reported
            .insert((vote.height, vote.validator.clone(), block_hash.clone()))
        {
            debug!(
                "Double-sign by {} at height {} already reported",
                vote.validator, vote.height
            );
            return None;
        }

        let explanation = format!(
            "Validator {} signed conflicting blocks at height {}: {} and {}",
            vote.validator, vote.height, first.block_hash, block_hash
        );
        error!("{}", explanation);

        let metrics = into_map(json!({
            "height": vote.height,
            "first_block_hash": first.block_hash,
            "conflicting_block_hash": block_hash,
            "first_seen_at": first.timestamp,
            "conflict_seen_at": vote.timestamp,
        }));

        self.anomalies += 1;
        Some(Anomaly::new(
            AnomalyKind::DoubleSign,
            Severity::Critical,
            Entity::validator(vote.validator),
            vote.timestamp,
            explanation,
            metrics,
        ))
    }

    fn prune(&mut self) {
        let cutoff = self.max_height.saturating_sub(self.config.height_window);
        if cutoff == 0 {
            return;
        }
        self.seen = self.seen.split_off(&(cutoff, String::new()));
        self.reported.retain(|(height, _, _)| *height >= cutoff);
    }
}

impl Detector for DoubleSignDetector {
    fn name(&self) -> &str {
        "double_sign"
    }

    fn process_metrics(&mut self, batch: &[MetricEvent]) -> Result<Vec<Anomaly>> {
        let mut anomalies = Vec::new();

        for event in batch.iter().filter(|e| e.kind == MetricKind::Vote) {
            let mut vote = match VoteRecord::from_event(event) {
                Ok(vote) => vote,
                Err(e) => {
                    debug!("Ignoring vote: {}", e);
                    self.skipped += 1;
                    continue;
                }
            };
            self.processed += 1;

            let block_hash = match vote.block_hash.take() {
                Some(hash) if vote.signed => hash,
                _ => continue,
            };
            self.max_height = self.max_height.max(vote.height);

            if let Some(anomaly) = self.check(vote, block_hash) {
                anomalies.push(anomaly);
            }
        }

        self.prune();
        Ok(anomalies)
    }

    fn stats(&self) -> serde_json::Value {
        json!({
            "votes_processed": self.processed,
            "votes_skipped": self.skipped,
            "tracked_signatures": self.seen.len(),
            "max_height": self.max_height,
            "anomalies": self.anomalies,
        })
    }

    fn reset(&mut self) {
        self.seen.clear();
        self.reported.clear();
        self.max_height = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::{model::fields, MetricEventBuilder};

    fn signed(validator: &str, height: u64, hash: &str, ts: i64) -> MetricEvent {
        MetricEventBuilder::vote()
            .at(ts)
            .with_field(fields::VALIDATOR, validator)
            .with_field(fields::HEIGHT, height)
            .with_field(fields::SIGNED, true)
            .with_field(fields::BLOCK_HASH, hash)
            .build()
    }

    fn detector() -> DoubleSignDetector {
        DoubleSignDetector::new(DoubleSignConfig::default())
    }

    #[test]
    fn test_conflicting_hashes_are_critical() {
        let mut detector = detector();
        let batch = vec![signed("V1", 10, "0xaa", 1), signed("V1", 10, "0xbb", 2)];

        let anomalies = detector.process_metrics(&batch).unwrap();
        assert_eq!(anomalies.len(), 1);

        let anomaly = &anomalies[0];
        assert_eq!(anomaly.kind, AnomalyKind::DoubleSign);
        assert_eq!(anomaly.severity, Severity::Critical);
        assert_eq!(anomaly.entity, Entity::validator("V1"));
        assert_eq!(anomaly.metrics["first_block_hash"], "0xaa");
        assert_eq!(anomaly.metrics["conflicting_block_hash"], "0xbb");
        assert_eq!(anomaly.metrics["height"], 10);
    }

    #[test]
    fn test_same_hash_or_other_validator_is_fine() {
        let mut detector = detector();
        let batch = vec![
            signed("V1", 10, "0xaa", 1),
            signed("V1", 10, "0xaa", 2),
            signed("V2", 10, "0xbb", 3),
            signed("V1", 11, "0xbb", 4),
        ];
        assert!(detector.process_metrics(&batch).unwrap().is_empty());
    }

    #[test]
    fn test_each_distinct_conflict_is_reported_without_cooldown() {
        let mut detector = detector();
        let batch = vec![
            signed("V1", 10, "0xaa", 1),
            signed("V1", 10, "0xbb", 2),
            signed("V1", 10, "0xcc", 3),
            signed("V1", 11, "0x01", 4),
            signed("V1", 11, "0x02", 5),
        ];
        assert_eq!(detector.process_metrics(&batch).unwrap().len(), 3);
    }

    #[test]
    fn test_replayed_evidence_is_not_reported_twice() {
        let mut detector = detector();
        let batch = vec![signed("V1", 10, "0xaa", 1), signed("V1", 10, "0xbb", 2)];
        assert_eq!(detector.process_metrics(&batch).unwrap().len(), 1);
        assert!(detector.process_metrics(&batch).unwrap().is_empty());
    }

    #[test]
    fn test_unsigned_votes_are_ignored() {
        let mut detector = detector();
        let unsigned = MetricEventBuilder::vote()
            .at(2)
            .with_field(fields::VALIDATOR, "V1")
            .with_field(fields::HEIGHT, 10u64)
            .with_field(fields::SIGNED, false)
            .with_field(fields::BLOCK_HASH, "0xbb")
            .build();
        let batch = vec![signed("V1", 10, "0xaa", 1), unsigned];
        assert!(detector.process_metrics(&batch).unwrap().is_empty());
    }

    #[test]
    fn test_old_heights_are_pruned() {
        let mut detector = DoubleSignDetector::new(DoubleSignConfig {
            enabled: true,
            height_window: 10,
        });
        let batch: Vec<_> = (1..=30).map(|h| signed("V1", h, "0xaa", h as i64)).collect();
        detector.process_metrics(&batch).unwrap();

        assert_eq!(detector.stats()["tracked_signatures"], 11);
    }
}
