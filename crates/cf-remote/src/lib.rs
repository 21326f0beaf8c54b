//! cf-remote: the remote platform as seen by a case.
//!
//! - `tree`: cached remote file tree with per-node listeners
//! - `interface`: asynchronous request/completion contract
//! - `params`: the case parameter document
//! - `local`: backend over a local directory, jobs run as shell commands
//! - `scripted`: backend whose completions are driven by hand, for tests

pub mod interface;
pub mod local;
pub mod params;
pub mod scripted;
pub mod tree;

pub use interface::{
    EntryKind, JobHandle, JobStatus, RemoteDataInterface, RemoteEntry, RemoteEvent, RemoteReply,
};
pub use local::{JobRecord, LocalDirRemote};
pub use params::{PARAM_FILE_NAME, ParamDocument};
pub use scripted::{IssuedRequest, RemoteCall, ScriptedRemote};
pub use tree::{FileNode, FileTree, TreeNotice};

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Failures reported by a remote backend. Cloneable so completions can be
/// queued and replayed.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Remote path not found: {path}")]
    NotFound { path: String },

    #[error("Remote path already exists: {path}")]
    AlreadyExists { path: String },

    #[error("Request rejected by remote: {message}")]
    Rejected { message: String },

    #[error("Remote I/O error: {message}")]
    Io { message: String },

    #[error("Malformed remote data: {message}")]
    Malformed { message: String },

    #[error("Remote platform unavailable")]
    Disconnected,

    #[error(transparent)]
    Core(#[from] cf_core::CoreError),
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        RemoteError::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::Malformed {
            message: err.to_string(),
        }
    }
}
