pub mod config;
pub mod engine;
pub mod metrics;
pub mod telemetry;

pub use config::{EngineConfig, LogFormat, StoreMode};
pub use engine::Engine;
pub use metrics::EngineMetrics;
pub use telemetry::init_tracing;

use msgq_core::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Io(e) => EngineError::IoError(e),
            other => EngineError::InvalidConfig(other.to_string()),
        }
    }
}

impl From<MetricsError> for EngineError {
    fn from(e: MetricsError) -> Self {
        EngineError::Other(e.to_string())
    }
}
