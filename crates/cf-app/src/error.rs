//! Error types for the cf-app layer.

use std::path::PathBuf;

use cf_case::CaseError;

/// Application error wrapping the backend crates' errors.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Failed to read config file: {path}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Case type error: {0}")]
    Types(String),

    #[error("Unknown case type: {0}")]
    UnknownCaseType(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error(transparent)]
    Case(#[from] CaseError),

    #[error("No open case with id {0}")]
    CaseNotFound(String),

    #[error("Remote path not found: {0}")]
    PathNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Timed out after {seconds:.1}s waiting for {what}")]
    Timeout { what: String, seconds: f64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl From<cf_core::CoreError> for AppError {
    fn from(err: cf_core::CoreError) -> Self {
        AppError::InvalidInput(err.to_string())
    }
}

impl From<cf_remote::RemoteError> for AppError {
    fn from(err: cf_remote::RemoteError) -> Self {
        AppError::Remote(err.to_string())
    }
}

impl From<cf_types::TypeError> for AppError {
    fn from(err: cf_types::TypeError) -> Self {
        AppError::Types(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::Config(err.to_string())
    }
}
