use crate::{into_map, round2, Detector};
use pulse_core::{
    config::ValidatorDowntimeConfig, model::VoteRecord, Anomaly, AnomalyKind, Entity,
    MetricEvent, MetricKind, Result, Severity,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

const MISS_WINDOW_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatorStatus {
    Active,
    Degraded,
    Jailed,
}

impl ValidatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidatorStatus::Active => "active",
            ValidatorStatus::Degraded => "degraded",
            ValidatorStatus::Jailed => "jailed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissRecord {
    pub height: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorState {
    pub validator: String,
    pub consecutive_misses: u32,
    pub total_misses: u64,
    pub total_blocks: u64,
    pub last_seen: i64,
    pub status: ValidatorStatus,
    pub recent_misses: VecDeque<MissRecord>,
}

impl ValidatorState {
    fn new(validator: &str) -> Self {
        Self {
            validator: validator.to_string(),
            consecutive_misses: 0,
            total_misses: 0,
            total_blocks: 0,
            last_seen: 0,
            status: ValidatorStatus::Active,
            recent_misses: VecDeque::new(),
        }
    }

    /// Share of observed blocks this validator signed, in percent.
    pub fn uptime_percentage(&self) -> f64 {
        if self.total_blocks == 0 {
            return 100.0;
        }
        let signed = self.total_blocks.saturating_sub(self.total_misses) as f64;
        round2(signed / self.total_blocks as f64 * 100.0)
    }

    fn record_miss(&mut self, height: u64, timestamp: i64) {
        self.consecutive_misses += 1;
        self.total_misses += 1;
        self.recent_misses.push_back(MissRecord { height, timestamp });

        let cutoff = timestamp - MISS_WINDOW_MS;
        self.recent_misses.retain(|m| m.timestamp >= cutoff);
    }
}

/// Tracks per-validator vote participation and raises an anomaly when a
/// validator keeps missing blocks.
///
/// Event time drives the cooldown and the one-hour miss window, so replays
/// and tests behave the same as live traffic.
pub struct ValidatorDowntimeDetector {
    config: ValidatorDowntimeConfig,
    validators: HashMap<String, ValidatorState>,
    last_alert: HashMap<String, i64>,
    processed: u64,
    anomalies: u64,
    suppressed: u64,
    skipped: u64,
}

impl ValidatorDowntimeDetector {
    pub fn new(config: ValidatorDowntimeConfig) -> Self {
        Self {
            config,
            validators: HashMap::new(),
            last_alert: HashMap::new(),
            processed: 0,
            anomalies: 0,
            suppressed: 0,
            skipped: 0,
        }
    }

    pub fn validator_state(&self, validator: &str) -> Option<&ValidatorState> {
        self.validators.get(validator)
    }

    pub fn validators(&self) -> impl Iterator<Item = &ValidatorState> {
        self.validators.values()
    }

    fn evaluate(&mut self, validator: &str, now: i64) -> Option<Anomaly> {
        if let Some(last) = self.last_alert.get(validator) {
            if now - last < self.config.cooldown_ms {
                self.suppressed += 1;
                debug!("Downtime alert for {} suppressed by cooldown", validator);
                return None;
            }
        }

        let state = self.validators.get_mut(validator)?;
        let (severity, status, threshold) =
            if state.consecutive_misses >= self.config.critical_miss_threshold {
                (
                    Severity::Critical,
                    ValidatorStatus::Jailed,
                    self.config.critical_miss_threshold,
                )
            } else if state.consecutive_misses >= self.config.miss_threshold {
                (
                    Severity::Medium,
                    ValidatorStatus::Degraded,
                    self.config.miss_threshold,
                )
            } else {
                return None;
            };
        state.status = status;

        let uptime = state.uptime_percentage();
        let explanation = format!(
            "Validator {} has missed {} consecutive blocks, exceeding the {} threshold of {} (uptime {:.2}%)",
            validator,
            state.consecutive_misses,
            if severity == Severity::Critical { "critical" } else { "warning" },
            threshold,
            uptime
        );

        let metrics = into_map(json!({
            "consecutive_misses": state.consecutive_misses,
            "total_misses": state.total_misses,
            "total_blocks": state.total_blocks,
            "uptime_percentage": uptime,
            "misses_1h": state.recent_misses.len(),
            "status": status.as_str(),
            "miss_threshold": self.config.miss_threshold,
            "critical_miss_threshold": self.config.critical_miss_threshold,
        }));

        self.last_alert.insert(validator.to_string(), now);
        self.anomalies += 1;

        if severity == Severity::Critical {
            warn!("{}", explanation);
        } else {
            info!("{}", explanation);
        }

        Some(Anomaly::new(
            AnomalyKind::ValidatorDowntime,
            severity,
            Entity::validator(validator),
            now,
            explanation,
            metrics,
        ))
    }
}

impl Detector for ValidatorDowntimeDetector {
    fn name(&self) -> &str {
        "validator_downtime"
    }

    fn process_metrics(&mut self, batch: &[MetricEvent]) -> Result<Vec<Anomaly>> {
        let mut anomalies = Vec::new();

        for event in batch.iter().filter(|e| e.kind == MetricKind::Vote) {
            let vote = match VoteRecord::from_event(event) {
                Ok(vote) => vote,
                Err(e) => {
                    debug!("Ignoring vote: {}", e);
                    self.skipped += 1;
                    continue;
                }
            };
            self.processed += 1;

            let state = self
                .validators
                .entry(vote.validator.clone())
                .or_insert_with(|| ValidatorState::new(&vote.validator));
            state.total_blocks += 1;
            state.last_seen = state.last_seen.max(vote.timestamp);

            if vote.signed {
                state.consecutive_misses = 0;
                state.status = ValidatorStatus::Active;
                continue;
            }

            state.record_miss(vote.height, vote.timestamp);
            if let Some(anomaly) = self.evaluate(&vote.validator, vote.timestamp) {
                anomalies.push(anomaly);
            }
        }

        Ok(anomalies)
    }

    fn stats(&self) -> serde_json::Value {
        let count = |status: ValidatorStatus| {
            self.validators
                .values()
                .filter(|s| s.status == status)
                .count()
        };

        json!({
            "tracked_validators": self.validators.len(),
            "active": count(ValidatorStatus::Active),
            "degraded": count(ValidatorStatus::Degraded),
            "jailed": count(ValidatorStatus::Jailed),
            "votes_processed": self.processed,
            "votes_skipped": self.skipped,
            "anomalies": self.anomalies,
            "suppressed": self.suppressed,
        })
    }

    fn reset(&mut self) {
        self.validators.clear();
        self.last_alert.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::{model::fields, MetricEventBuilder};

    const SECOND: i64 = 1000;

    fn vote(validator: &str, height: u64, signed: bool, ts: i64) -> MetricEvent {
        MetricEventBuilder::vote()
            .at(ts)
            .with_field(fields::VALIDATOR, validator)
            .with_field(fields::HEIGHT, height)
            .with_field(fields::SIGNED, signed)
            .build()
    }

    fn detector() -> ValidatorDowntimeDetector {
        ValidatorDowntimeDetector::new(ValidatorDowntimeConfig {
            enabled: true,
            miss_threshold: 3,
            critical_miss_threshold: 10,
            cooldown_ms: 5 * 60 * SECOND,
        })
    }

    #[test]
    fn test_ten_misses_emit_one_medium_alert_within_cooldown() {
        let mut detector = detector();
        let batch: Vec<_> = (1..=10)
            .map(|h| vote("V1", h, false, h as i64 * SECOND))
            .collect();

        let anomalies = detector.process_metrics(&batch).unwrap();
        assert_eq!(anomalies.len(), 1);

        let anomaly = &anomalies[0];
        assert_eq!(anomaly.severity, Severity::Medium);
        assert_eq!(anomaly.kind, AnomalyKind::ValidatorDowntime);
        assert_eq!(anomaly.entity, Entity::validator("V1"));
        assert_eq!(anomaly.timestamp, 3 * SECOND);
        assert_eq!(anomaly.metrics["consecutive_misses"], 3);

        let state = detector.validator_state("V1").unwrap();
        assert_eq!(state.consecutive_misses, 10);
        assert_eq!(state.total_misses, 10);
        assert_eq!(state.status, ValidatorStatus::Degraded);
    }

    #[test]
    fn test_critical_after_cooldown_elapses() {
        let mut detector = detector();
        let mut batch: Vec<_> = (1..=9)
            .map(|h| vote("V1", h, false, h as i64 * SECOND))
            .collect();
        batch.push(vote("V1", 10, false, 10 * 60 * SECOND));

        let anomalies = detector.process_metrics(&batch).unwrap();
        assert_eq!(anomalies.len(), 2);
        assert_eq!(anomalies[1].severity, Severity::Critical);
        assert_eq!(
            detector.validator_state("V1").unwrap().status,
            ValidatorStatus::Jailed
        );
    }

    #[test]
    fn test_signed_vote_resets_state() {
        let mut detector = detector();
        let mut batch: Vec<_> = (1..=5)
            .map(|h| vote("V1", h, false, h as i64 * SECOND))
            .collect();
        batch.push(vote("V1", 6, true, 6 * SECOND));

        detector.process_metrics(&batch).unwrap();
        let state = detector.validator_state("V1").unwrap();
        assert_eq!(state.consecutive_misses, 0);
        assert_eq!(state.status, ValidatorStatus::Active);
        assert_eq!(state.total_misses, 5);
        assert_eq!(state.total_blocks, 6);
    }

    #[test]
    fn test_anomaly_metrics_and_explanation() {
        let mut detector = detector();
        let mut batch = vec![vote("val-9", 1, true, SECOND)];
        batch.extend((2..=4).map(|h| vote("val-9", h, false, h as i64 * SECOND)));

        let anomalies = detector.process_metrics(&batch).unwrap();
        assert_eq!(anomalies.len(), 1);

        let metrics = &anomalies[0].metrics;
        assert_eq!(metrics["total_blocks"], 4);
        assert_eq!(metrics["total_misses"], 3);
        assert_eq!(metrics["uptime_percentage"], 25.0);
        assert_eq!(metrics["misses_1h"], 3);
        assert_eq!(metrics["status"], "degraded");
        assert_eq!(metrics["miss_threshold"], 3);
        assert_eq!(metrics["critical_miss_threshold"], 10);

        let explanation = &anomalies[0].explanation;
        assert!(explanation.contains("val-9"));
        assert!(explanation.contains("3 consecutive"));
        assert!(explanation.contains("25.00%"));
    }

    #[test]
    fn test_recent_misses_pruned_to_one_hour() {
        let mut detector = detector();
        let batch = vec![
            vote("V2", 1, false, 0),
            vote("V2", 2, true, SECOND),
            vote("V2", 3, false, 2 * MISS_WINDOW_MS),
        ];
        detector.process_metrics(&batch).unwrap();

        let state = detector.validator_state("V2").unwrap();
        assert_eq!(state.recent_misses.len(), 1);
        assert_eq!(state.recent_misses[0].height, 3);
    }

    #[test]
    fn test_uptime_defaults_to_full() {
        let state = ValidatorState::new("fresh");
        assert_eq!(state.uptime_percentage(), 100.0);
    }

    #[test]
    fn test_validators_are_tracked_independently() {
        let mut detector = detector();
        let batch: Vec<_> = (1..=3)
            .flat_map(|h| {
                vec![
                    vote("A", h, false, h as i64 * SECOND),
                    vote("B", h, true, h as i64 * SECOND),
                ]
            })
            .collect();

        let anomalies = detector.process_metrics(&batch).unwrap();
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].entity.id, "A");
        assert_eq!(detector.stats()["tracked_validators"], 2);
    }

    #[test]
    fn test_ignores_other_events_and_malformed_votes() {
        let mut detector = detector();
        let batch = vec![
            MetricEventBuilder::tx().at(1).with_field(fields::TX_COUNT, 4).build(),
            MetricEventBuilder::vote().at(2).with_field(fields::SIGNED, false).build(),
        ];
        assert!(detector.process_metrics(&batch).unwrap().is_empty());
        assert_eq!(detector.stats()["votes_skipped"], 1);
        assert_eq!(detector.stats()["votes_processed"], 0);
    }
}
