//! Misuse errors returned by case operations.
//!
//! Remote failures never appear here; they become case state.

use thiserror::Error;

use crate::state::{CaseState, StageState};

pub type CaseResult<T> = Result<T, CaseError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CaseError {
    #[error("Case is defunct")]
    Defunct,

    #[error("Another operation is already in flight")]
    Busy,

    #[error("Operation '{op}' not allowed while case is {state}")]
    WrongCaseState { op: &'static str, state: CaseState },

    #[error("Operation '{op}' not allowed while stage '{stage}' is {state}")]
    WrongStageState {
        op: &'static str,
        stage: String,
        state: StageState,
    },

    #[error("Stage '{stage}' needs '{prerequisite}' to be finished first")]
    PrerequisiteNotFinished { stage: String, prerequisite: String },

    #[error("Case type is unknown")]
    UnknownType,

    #[error("Case type has no {what} stage")]
    MissingStage { what: String },

    #[error("Case has already been created")]
    AlreadyCreated,

    #[error("Unknown parameter: {name}")]
    UnknownParameter { name: String },

    #[error("Parameter '{name}' is frozen while stage '{stage}' is {state}")]
    ParameterFrozen {
        name: String,
        stage: String,
        state: StageState,
    },

    #[error("Invalid value for '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("File tree node is not available: {what}")]
    MissingNode { what: &'static str },

    #[error("Invalid case name: {name:?}")]
    InvalidName { name: String },
}
