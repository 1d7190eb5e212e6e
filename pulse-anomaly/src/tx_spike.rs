use crate::{
    into_map, round2,
    stats::{is_anomalous_z_score, z_score, Ewma, RollingWindow},
    Detector,
};
use pulse_core::{
    config::TxSpikeConfig, model::TxMetrics, Anomaly, AnomalyKind, Entity, MetricEvent,
    MetricKind, Result, Severity,
};
use serde_json::json;
use tracing::{debug, info};

/// Flags bursts in mempool volume against a rolling baseline of `tx_count`
/// and `total_size`.
pub struct TxSpikeDetector {
    config: TxSpikeConfig,
    count_window: RollingWindow,
    size_window: RollingWindow,
    count_ewma: Ewma,
    last_alert: Option<i64>,
    processed: u64,
    anomalies: u64,
    suppressed: u64,
    skipped: u64,
}

struct Burst {
    series: &'static str,
    value: f64,
    z: f64,
}

impl TxSpikeDetector {
    pub fn new(config: TxSpikeConfig) -> Self {
        Self {
            count_window: RollingWindow::new(config.window_size),
            size_window: RollingWindow::new(config.window_size),
            count_ewma: Ewma::new(config.ewma_alpha),
            config,
            last_alert: None,
            processed: 0,
            anomalies: 0,
            suppressed: 0,
            skipped: 0,
        }
    }

    /// Positive z-score of `value` against `window`, once the window holds
    /// enough samples to be a baseline.
    fn score(&self, window: &RollingWindow, value: f64) -> Option<f64> {
        if window.len() < self.config.min_samples {
            return None;
        }
        let z = z_score(value, window);
        (z > 0.0 && is_anomalous_z_score(z, self.config.z_threshold)).then_some(z)
    }

    fn detect(&mut self, sample: &TxMetrics) -> Option<Anomaly> {
        let count_burst = self.score(&self.count_window, sample.tx_count).map(|z| Burst {
            series: "tx_count",
            value: sample.tx_count,
            z,
        });
        let size_burst = sample.total_size.and_then(|size| {
            self.score(&self.size_window, size).map(|z| Burst {
                series: "total_size",
                value: size,
                z,
            })
        });

        let burst = match (count_burst, size_burst) {
            (Some(a), Some(b)) => Some(if b.z > a.z { b } else { a }),
            (a, b) => a.or(b),
        }?;

        if let Some(last) = self.last_alert {
            if sample.timestamp - last < self.config.cooldown_ms {
                self.suppressed += 1;
                debug!("Tx spike at {} suppressed by cooldown", sample.timestamp);
                return None;
            }
        }

        let severity = if burst.z >= self.config.critical_z_threshold {
            Severity::Critical
        } else {
            Severity::Medium
        };

        let (baseline_mean, baseline_stddev) = match burst.series {
            "total_size" => (self.size_window.mean(), self.size_window.stddev()),
            _ => (self.count_window.mean(), self.count_window.stddev()),
        };

        let explanation = format!(
            "Transaction burst: {} of {:.0} is {:.2} standard deviations above the rolling mean of {:.2} (threshold {:.1})",
            burst.series, burst.value, burst.z, baseline_mean, self.config.z_threshold
        );

        let metrics = into_map(json!({
            "series": burst.series,
            "tx_count": sample.tx_count,
            "total_size": sample.total_size,
            "baseline_mean": round2(baseline_mean),
            "baseline_stddev": round2(baseline_stddev),
            "z_score": round2(burst.z),
            "z_threshold": self.config.z_threshold,
            "tx_count_ewma": self.count_ewma.get().map(round2),
            "tx_count_p95": self.count_window.percentile(95.0),
            "baseline_samples": self.count_window.len(),
        }));

        self.last_alert = Some(sample.timestamp);
        self.anomalies += 1;
        info!("{}", explanation);

        Some(Anomaly::new(
            AnomalyKind::TxSpike,
            severity,
            Entity::network("mempool"),
            sample.timestamp,
            explanation,
            metrics,
        ))
    }
}

impl Detector for TxSpikeDetector {
    fn name(&self) -> &str {
        "tx_spike"
    }

    fn process_metrics(&mut self, batch: &[MetricEvent]) -> Result<Vec<Anomaly>> {
        let mut anomalies = Vec::new();

        for event in batch.iter().filter(|e| e.kind == MetricKind::Tx) {
            let sample = match TxMetrics::from_event(event) {
                Ok(sample) => sample,
                Err(e) => {
                    debug!("Ignoring tx sample: {}", e);
                    self.skipped += 1;
                    continue;
                }
            };
            self.processed += 1;

            if let Some(anomaly) = self.detect(&sample) {
                anomalies.push(anomaly);
            }

            self.count_window.add(sample.tx_count);
            if let Some(size) = sample.total_size {
                self.size_window.add(size);
            }
            self.count_ewma.update(sample.tx_count);
        }

        Ok(anomalies)
    }

    fn stats(&self) -> serde_json::Value {
        json!({
            "samples_processed": self.processed,
            "samples_skipped": self.skipped,
            "anomalies": self.anomalies,
            "suppressed": self.suppressed,
            "baseline_samples": self.count_window.len(),
            "baseline_mean": round2(self.count_window.mean()),
            "baseline_stddev": round2(self.count_window.stddev()),
            "tx_count_ewma": self.count_ewma.get(),
        })
    }

    fn reset(&mut self) {
        self.count_window.clear();
        self.size_window.clear();
        self.count_ewma.reset();
        self.last_alert = None;
    }
}
