use backup_engine::EngineError;
use std::process::ExitCode;

#[derive(thiserror::Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    Config(String),

    #[error("Another backup or restore is already running for site '{0}'")]
    Busy(String),

    #[error("Backup failed")]
    BackupFailed,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CliError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Config(_) => ExitCode::from(2),
            CliError::Busy(_) => ExitCode::from(3),
            CliError::BackupFailed | CliError::Engine(_) | CliError::Internal(_) => {
                ExitCode::FAILURE
            }
        }
    }
}
