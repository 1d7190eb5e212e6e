use config::{Config, Environment, File, FileFormat};
use pulse_core::{
    config::{EngineConfig, EngineConfigOverride},
    PulseError, Result,
};
use std::path::Path;
use tracing::info;

/// Prefix for environment overrides. Nested keys use `__`, e.g.
/// `PULSESCAN_STORAGE__MAX_POINTS=5000`.
pub const ENV_PREFIX: &str = "PULSESCAN";

/// Loads an `EngineConfig` from an optional YAML file plus `PULSESCAN_*`
/// environment variables. Both layers are partial; anything they leave
/// unset keeps its default.
pub struct ConfigManager {
    config: Config,
    engine_config: EngineConfig,
}

impl ConfigManager {
    pub fn new() -> Result<Self> {
        Self::from_file("config.yaml")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()).format(FileFormat::Yaml))
            .add_source(environment())
            .build()
            .map_err(|e| PulseError::Configuration(e.to_string()))?;

        let engine_config = resolve(&config)?;
        info!("Configuration loaded from {}", path.as_ref().display());

        Ok(Self {
            config,
            engine_config,
        })
    }

    pub fn from_env() -> Result<Self> {
        let config = Config::builder()
            .add_source(environment())
            .build()
            .map_err(|e| PulseError::Configuration(e.to_string()))?;

        let engine_config = resolve(&config)?;
        info!("Configuration loaded from environment");

        Ok(Self {
            config,
            engine_config,
        })
    }

    pub fn get_config(&self) -> &EngineConfig {
        &self.engine_config
    }

    pub fn get_config_mut(&mut self) -> &mut EngineConfig {
        &mut self.engine_config
    }

    pub fn into_config(self) -> EngineConfig {
        self.engine_config
    }

    /// Discards in-memory edits and re-resolves the loaded sources.
    pub fn reload(&mut self) -> Result<()> {
        self.engine_config = resolve(&self.config)?;
        info!("Configuration reloaded");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.engine_config.validate()?;
        info!("Configuration validation passed");
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.engine_config)
            .map_err(|e| PulseError::Configuration(e.to_string()))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_yaml()?)?;
        info!("Configuration saved to {}", path.as_ref().display());
        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

fn resolve(config: &Config) -> Result<EngineConfig> {
    let overrides: EngineConfigOverride = config
        .clone()
        .try_deserialize()
        .map_err(|e| PulseError::Configuration(e.to_string()))?;
    Ok(EngineConfig::resolve(overrides))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::Severity;
    use std::io::Write;

    fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = yaml_file(
            r#"
storage:
  max_points: 500
detectors:
  validator_downtime:
    miss_threshold: 4
alerts:
  min_severity: high
"#,
        );

        let manager = ConfigManager::from_file(file.path()).unwrap();
        let config = manager.get_config();
        assert_eq!(config.storage.max_points, 500);
        assert_eq!(config.storage.cleanup_interval_ms, 300_000);
        assert_eq!(config.detectors.validator_downtime.miss_threshold, 4);
        assert_eq!(config.detectors.validator_downtime.critical_miss_threshold, 10);
        assert_eq!(config.alerts.min_severity, Severity::High);
        assert!(manager.validate().is_ok());
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let file = yaml_file("storage:\n  max_pionts: 500\n");
        let result = ConfigManager::from_file(file.path());
        assert!(matches!(result, Err(PulseError::Configuration(_))));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(ConfigManager::from_file("/nonexistent/pulsescan.yaml").is_err());
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let file = yaml_file("alerts:\n  webhook:\n    enabled: true\n");
        let manager = ConfigManager::from_file(file.path()).unwrap();
        assert!(manager.validate().is_err());
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = yaml_file("api:\n  bind: \"127.0.0.1:7000\"\n");
        std::env::set_var("PULSESCAN_API__BIND", "127.0.0.1:9100");
        let manager = ConfigManager::from_file(file.path());
        std::env::remove_var("PULSESCAN_API__BIND");

        assert_eq!(manager.unwrap().get_config().api.bind, "127.0.0.1:9100");
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let file = yaml_file("anomalies:\n  max_recent: 42\n");
        let mut manager = ConfigManager::from_file(file.path()).unwrap();

        let out = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        manager.save_to_file(out.path()).unwrap();
        let saved = ConfigManager::from_file(out.path()).unwrap();
        assert_eq!(saved.get_config().anomalies.max_recent, 42);
        assert_eq!(saved.get_config().storage, manager.get_config().storage);

        manager.get_config_mut().anomalies.max_recent = 7;
        manager.reload().unwrap();
        assert_eq!(manager.get_config().anomalies.max_recent, 42);
    }
}
