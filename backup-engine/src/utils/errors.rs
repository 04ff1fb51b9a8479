//! Custom error types for the backup engine.

use std::fmt;
use thiserror::Error;

/// Pipeline stage a fatal failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Initialize,
    Dump,
    Uploads,
    OptimizedImages,
    Metadata,
    Archive,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Initialize => "initialize",
            Stage::Dump => "database dump",
            Stage::Uploads => "uploads",
            Stage::OptimizedImages => "optimized images",
            Stage::Metadata => "metadata",
            Stage::Archive => "archive",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("A backup or restore operation is already running for site '{site}'")]
    OperationAlreadyRunning { site: String },

    #[error("Lock store unavailable: {0}")]
    LockStoreUnavailable(String),

    #[error("Stage '{stage}' failed: {source:#}")]
    Stage {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    #[error("Upload to backup store failed: {0}")]
    StoreUpload(String),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn stage(stage: Stage, source: impl Into<anyhow::Error>) -> Self {
        EngineError::Stage {
            stage,
            source: source.into(),
        }
    }

    /// Whether the caller may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::LockStoreUnavailable(_) | EngineError::StoreUpload(_)
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::LockStoreUnavailable("down".into()).is_retryable());
        assert!(EngineError::StoreUpload("timeout".into()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::OperationAlreadyRunning {
            site: "default".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_stage_error_message() {
        let err = EngineError::stage(Stage::Dump, anyhow::anyhow!("pg_dump exited with 1"));
        assert_eq!(
            err.to_string(),
            "Stage 'database dump' failed: pg_dump exited with 1"
        );
    }
}
