//! Error types for the consensus orchestrator

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, ConsensusError>;

#[derive(Error, Debug)]
pub enum ConsensusError {

    // =============================
    // Startup Errors
    // =============================

    #[error("Missing credential: {0} is not set")]
    MissingCredential(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Prompt file error: {0}")]
    PromptError(String),

    // =============================
    // Pipeline Errors
    // =============================

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Pipeline aborted at {stage}: {reason}")]
    Aborted { stage: String, reason: String },

    #[error("Report error: {0}")]
    ReportError(String),

    #[error("Debug shell error: {0}")]
    ShellError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ConsensusError {
    /// Network-level failures are retried by the provider adapters.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConsensusError::HttpError(_) | ConsensusError::TransportError(_)
        )
    }
}
