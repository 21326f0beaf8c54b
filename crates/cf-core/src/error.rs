use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid remote path: {path:?} ({reason})")]
    InvalidPath { path: String, reason: &'static str },

    #[error("Invalid argument: {what}")]
    InvalidArg { what: &'static str },

    #[error("Identifier space exhausted: {what}")]
    IdExhausted { what: &'static str },
}
