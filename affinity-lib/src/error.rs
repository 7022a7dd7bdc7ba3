//! Error types for affinity-cli

use std::path::PathBuf;
use thiserror::Error;

/// Affinity CLI result type
pub type Result<T> = std::result::Result<T, AffinityError>;

/// Main error type for provisioning operations
#[derive(Error, Debug)]
pub enum AffinityError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Preflight checks failed: {0}")]
    GuardrailBlocking(String),

    #[error("Network error: {0}")]
    NetworkRetryable(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: String, got: String },

    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    #[error("Dependency installation failed: {0}")]
    DependencyInstall(String),

    #[error("Component '{component}' failed ({remaining} component(s) not applied): {reason}")]
    ComponentApplyFailed {
        component: String,
        remaining: usize,
        reason: String,
    },

    #[error("Installer failed: {0}")]
    InstallFailed(String),

    #[error("Expected artifact missing from prefix: {0}")]
    VerifyMissingArtifact(String),

    #[error("Prefix is busy: {} is held by another run", .0.display())]
    Busy(PathBuf),

    #[error("Cancelled")]
    Cancelled,

    #[error("Command execution failed: {command} - {error}")]
    CommandExecution { command: String, error: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AffinityError {
    /// Whether a phase-level retry may recover from this error.
    ///
    /// `Busy`, `ConfigInvalid` and `Cancelled` are never transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AffinityError::NetworkRetryable(_)
                | AffinityError::ComponentApplyFailed { .. }
                | AffinityError::CommandExecution { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AffinityError::Cancelled)
    }
}

impl From<config::ConfigError> for AffinityError {
    fn from(err: config::ConfigError) -> Self {
        AffinityError::ConfigInvalid(err.to_string())
    }
}
