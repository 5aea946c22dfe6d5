use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    /// Camera unreachable; drives the reconnect policy.
    #[error("Connect error: {0}")]
    ConnectError(String),

    /// Mid-stream read failure; drives the reconnect policy.
    #[error("IO error: {0}")]
    IoError(String),

    /// Per-frame detection failure, recovered inside the pipeline.
    #[error("Detection error: {0}")]
    DetectionError(String),

    /// PTZ command failure, reported as an event only.
    #[error("Command error: {0}")]
    CommandError(String),

    #[error("Not found: {0}")]
    NotFoundError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<std::io::Error> for OrchestratorError {
    fn from(error: std::io::Error) -> Self {
        OrchestratorError::IoError(error.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for OrchestratorError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        OrchestratorError::Timeout(error.to_string())
    }
}

impl From<config::ConfigError> for OrchestratorError {
    fn from(error: config::ConfigError) -> Self {
        OrchestratorError::ConfigError(error.to_string())
    }
}

impl From<validator::ValidationErrors> for OrchestratorError {
    fn from(error: validator::ValidationErrors) -> Self {
        OrchestratorError::ConfigError(error.to_string())
    }
}

impl From<serde_yaml::Error> for OrchestratorError {
    fn from(error: serde_yaml::Error) -> Self {
        OrchestratorError::ConfigError(error.to_string())
    }
}

impl From<prometheus::Error> for OrchestratorError {
    fn from(error: prometheus::Error) -> Self {
        OrchestratorError::ConfigError(format!("metrics: {}", error))
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
