//! Error handling for the botlink CLI

use std::process::ExitCode;

use thiserror::Error;

use crate::config::ConfigError;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("botlink error: {0}")]
    Botlink(#[from] botlink_core::BotlinkError),

    #[error("Credential store error: {0}")]
    Store(#[from] botlink_core::StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CliError {
    /// Process exit status for this failure
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Config(_) => ExitCode::from(78),
            CliError::Botlink(err) if err.class() == "configuration" => ExitCode::from(78),
            CliError::Botlink(_) | CliError::Store(_) => ExitCode::from(69),
            CliError::Io(_) | CliError::Serialization(_) => ExitCode::FAILURE,
        }
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
