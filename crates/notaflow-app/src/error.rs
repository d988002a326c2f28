//! Application-level error type for the binary.
//!
//! Only startup resource exhaustion is fatal to the process; per-message
//! failures are handled inside the worker loop and never surface here.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::AppConfigError;
use crate::services::repository::RepositoryError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] AppConfigError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("failed to connect to database: {0}")]
    DatabaseConnect(#[source] sqlx::Error),

    #[error("failed to read field rules from {path}: {source}")]
    RulesFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse field rules from {path}: {source}")]
    RulesParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to wait for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}
