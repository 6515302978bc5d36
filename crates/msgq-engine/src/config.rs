use crate::ConfigError;
use msgq_async::{CommitterConfig, StackConfig};
use msgq_core::ReturnCode;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub async_stack: AsyncStackConfig,
    pub store: StoreConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncStackConfig {
    pub initial_entries: usize,
    pub initial_payload_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// Commits complete inline
    Sync,
    /// Commits are completed later by the background committer
    Deferred,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub mode: StoreMode,
    pub max_batch: usize,
    /// Numeric return code every commit completes with
    pub result_code: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
}

impl Default for AsyncStackConfig {
    fn default() -> Self {
        let defaults = StackConfig::default();
        AsyncStackConfig {
            initial_entries: defaults.initial_entries,
            initial_payload_bytes: defaults.initial_payload_bytes,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            mode: StoreMode::Sync,
            max_batch: 64,
            result_code: ReturnCode::Ok.code(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_enabled: true,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.async_stack.initial_entries == 0 {
            return Err(ConfigError::Invalid(
                "async_stack.initial_entries must be at least 1".to_string(),
            ));
        }
        if self.store.max_batch == 0 {
            return Err(ConfigError::Invalid(
                "store.max_batch must be at least 1".to_string(),
            ));
        }
        let rc = self.store_result()?;
        if rc.is_async() {
            return Err(ConfigError::Invalid(format!(
                "store.result_code {} cannot be a deferral",
                self.store.result_code
            )));
        }
        Ok(())
    }

    /// Code commits complete with
    pub fn store_result(&self) -> Result<ReturnCode, ConfigError> {
        ReturnCode::from_code(self.store.result_code).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "store.result_code {} is not a known return code",
                self.store.result_code
            ))
        })
    }

    pub fn to_stack_config(&self) -> StackConfig {
        StackConfig {
            initial_entries: self.async_stack.initial_entries,
            initial_payload_bytes: self.async_stack.initial_payload_bytes,
        }
    }

    pub fn to_committer_config(&self) -> Result<CommitterConfig, ConfigError> {
        Ok(CommitterConfig {
            max_batch: self.store.max_batch,
            result: self.store_result()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.mode, StoreMode::Sync);
        assert_eq!(config.to_stack_config(), StackConfig::default());
    }

    #[test]
    fn test_from_file_with_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "async_stack:\n  initial_entries: 4\nstore:\n  mode: deferred\n  result_code: 504\nmonitoring:\n  log_format: json"
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.async_stack.initial_entries, 4);
        assert_eq!(
            config.async_stack.initial_payload_bytes,
            StackConfig::default().initial_payload_bytes
        );
        assert_eq!(config.store.mode, StoreMode::Deferred);
        assert_eq!(config.store.max_batch, 64);
        assert_eq!(config.store_result().unwrap(), ReturnCode::StoreBusy);
        assert_eq!(config.monitoring.log_format, LogFormat::Json);
        assert_eq!(config.monitoring.log_level, "info");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.store.result_code = ReturnCode::AsyncCompletion.code();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.store.result_code = 7;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.async_stack.initial_entries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            EngineConfig::from_file("/nonexistent/msgq.yaml"),
            Err(ConfigError::Io(_))
        ));
    }
}
