use crate::{DoubleSignDetector, Detector, TxSpikeDetector, ValidatorDowntimeDetector};
use pulse_core::config::DetectorsConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// The detector classes the engine knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    TxSpike,
    ValidatorDowntime,
    DoubleSign,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; 3] = [
        DetectorKind::TxSpike,
        DetectorKind::ValidatorDowntime,
        DetectorKind::DoubleSign,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::TxSpike => "tx_spike",
            DetectorKind::ValidatorDowntime => "validator_downtime",
            DetectorKind::DoubleSign => "double_sign",
        }
    }

    pub fn is_enabled(&self, config: &DetectorsConfig) -> bool {
        match self {
            DetectorKind::TxSpike => config.tx_spike.enabled,
            DetectorKind::ValidatorDowntime => config.validator_downtime.enabled,
            DetectorKind::DoubleSign => config.double_sign.enabled,
        }
    }

    pub fn build(&self, config: &DetectorsConfig) -> Box<dyn Detector> {
        match self {
            DetectorKind::TxSpike => Box::new(TxSpikeDetector::new(config.tx_spike.clone())),
            DetectorKind::ValidatorDowntime => Box::new(ValidatorDowntimeDetector::new(
                config.validator_downtime.clone(),
            )),
            DetectorKind::DoubleSign => {
                Box::new(DoubleSignDetector::new(config.double_sign.clone()))
            }
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds every enabled detector, in a fixed order.
pub fn build_detectors(config: &DetectorsConfig) -> Vec<Box<dyn Detector>> {
    DetectorKind::ALL
        .iter()
        .filter(|kind| kind.is_enabled(config))
        .map(|kind| {
            info!("Registering detector: {}", kind);
            kind.build(config)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_build_every_detector() {
        let detectors = build_detectors(&DetectorsConfig::default());
        let names: Vec<&str> = detectors.iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["tx_spike", "validator_downtime", "double_sign"]);
    }

    #[test]
    fn test_disabled_detectors_are_skipped() {
        let mut config = DetectorsConfig::default();
        config.tx_spike.enabled = false;
        config.double_sign.enabled = false;

        let detectors = build_detectors(&config);
        assert_eq!(detectors.len(), 1);
        assert_eq!(detectors[0].name(), DetectorKind::ValidatorDowntime.as_str());
    }

    #[test]
    fn test_built_name_matches_kind() {
        let config = DetectorsConfig::default();
        for kind in DetectorKind::ALL {
            assert_eq!(kind.build(&config).name(), kind.as_str());
        }
    }
}
