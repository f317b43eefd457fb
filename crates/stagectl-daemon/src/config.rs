/*
[INPUT]:  YAML configuration file, STAGECTL__* environment overrides
[OUTPUT]: Parsed and validated daemon configuration
[POS]:    Configuration layer - registry, timings, simulator, logging, operation queue
[UPDATE]: When adding new configuration options
*/

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use stagectl_instrument::SimulationConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::executor::Timing;
use crate::operations::{
    ALIGNMENT_TIMING, ANGLE_ADJUSTMENT_TIMING, AXIS_MOVEMENT_TIMING, OperationRequest,
    PROFILE_MEASUREMENT_TIMING,
};
use crate::task::DEFAULT_HISTORY_CAPACITY;

/// Prefix of environment overrides, e.g. `STAGECTL__REGISTRY__HISTORY_CAPACITY=50`.
pub const ENV_PREFIX: &str = "STAGECTL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration for the control daemon
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub registry: RegistryConfig,
    /// Poll-loop timings per operation kind
    pub timing: TimingConfig,
    /// Simulated instrument tuning
    pub simulation: SimulationConfig,
    pub log: LogConfig,
    /// Operations run one after another at startup
    pub operations: Vec<OperationRequest>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Number of tasks kept in history before the oldest is evicted
    pub history_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// A kind that is present must carry all five timing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    pub axis_movement: Timing,
    pub alignment: Timing,
    pub angle_adjustment: Timing,
    pub profile_measurement: Timing,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            axis_movement: AXIS_MOVEMENT_TIMING,
            alignment: ALIGNMENT_TIMING,
            angle_adjustment: ANGLE_ADJUSTMENT_TIMING,
            profile_measurement: PROFILE_MEASUREMENT_TIMING,
        }
    }
}

impl TimingConfig {
    fn entries(&self) -> [(&'static str, &Timing); 4] {
        [
            ("axis_movement", &self.axis_movement),
            ("alignment", &self.alignment),
            ("angle_adjustment", &self.angle_adjustment),
            ("profile_measurement", &self.profile_measurement),
        ]
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// EnvFilter directive, e.g. "info" or "stagectl_daemon=debug"
    pub level: String,
    /// Directory for daily rolling log files; stdout only when unset
    pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a YAML file, layered with environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text without environment overrides.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.history_capacity == 0 {
            return Err(ConfigError::Invalid(
                "registry.history_capacity must be at least 1".to_string(),
            ));
        }
        for (kind, timing) in self.timing.entries() {
            if timing.poll_interval_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "timing.{kind}.poll_interval_ms must be positive"
                )));
            }
            if timing.timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "timing.{kind}.timeout_ms must be positive"
                )));
            }
        }
        for (index, request) in self.operations.iter().enumerate() {
            request.validate().map_err(|err| {
                ConfigError::Invalid(format!("operations[{index}] ({}): {err}", request.kind()))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::MovementType;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config = DaemonConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.registry.history_capacity, 100);
        assert_eq!(config.timing, TimingConfig::default());
        assert_eq!(config.timing.alignment.timeout_ms, 300_000);
        assert_eq!(config.log.level, "info");
        assert!(config.operations.is_empty());
    }

    #[test]
    fn parses_operation_queue_and_timing_override() {
        let yaml = r#"
registry:
  history_capacity: 5
timing:
  axis_movement:
    poll_interval_ms: 10
    start_delay_ms: 0
    settle_ms: 0
    stop_settle_ms: 0
    timeout_ms: 1000
operations:
  - kind: axis_movement
    movement: absolute
    axis: 1
    position: 120.0
    speed: 500.0
  - kind: profile_measurement
    scan_axis: 7
"#;
        let config = DaemonConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.registry.history_capacity, 5);
        assert_eq!(config.timing.axis_movement.poll_interval_ms, 10);
        assert_eq!(config.timing.alignment, ALIGNMENT_TIMING);
        assert_eq!(config.operations.len(), 2);
        match &config.operations[0] {
            OperationRequest::AxisMovement(request) => {
                assert_eq!(request.movement, MovementType::Absolute);
                assert_eq!(request.target, 120.0);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_capacity() {
        let err = DaemonConfig::from_yaml_str("registry:\n  history_capacity: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_invalid_queued_request() {
        let yaml = "operations:
  - kind: axis_movement
    movement: relative
    axis: 20
    distance: 1.0
";
        let err = DaemonConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("operations[0]"));
    }

    fn write_temp_config(content: &str) -> std::path::PathBuf {
        let name = format!("stagectl-config-{}.yaml", uuid::Uuid::new_v4());
        let path = std::env::temp_dir().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{content}").unwrap();
        path
    }

    #[test]
    fn load_reads_yaml_file() {
        let path = write_temp_config("log:\n  level: debug\nsimulation:\n  axis_count: 6");

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.simulation.axis_count, 6);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn environment_overrides_file_values() {
        let path = write_temp_config("registry:\n  history_capacity: 7");
        let key = format!("{ENV_PREFIX}__REGISTRY__HISTORY_CAPACITY");
        // SAFETY: only this test sets the variable; other loads tolerate either value.
        unsafe { std::env::set_var(&key, "42") };
        let loaded = DaemonConfig::load(&path);
        unsafe { std::env::remove_var(&key) };
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded.unwrap().registry.history_capacity, 42);
    }
}
