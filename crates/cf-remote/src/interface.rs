//! Asynchronous request/completion contract with the remote platform.
//!
//! Every request method returns a [`RequestId`] right away. The outcome is
//! delivered later by [`RemoteDataInterface::drain_events`] as a
//! [`RemoteEvent::Completed`] carrying the same id. An `Err` from the request
//! method itself means the request was never issued.

use std::collections::BTreeMap;
use std::fmt;

use cf_core::{RemotePath, RequestId};
use serde::{Deserialize, Serialize};

use crate::params::ParamDocument;
use crate::{RemoteError, RemoteResult};

/// Opaque job identifier assigned by the remote at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobHandle(pub String);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

/// One child in a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl RemoteEntry {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::File,
            size: Some(size),
        }
    }

    pub fn folder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Folder,
            size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteReply {
    Listing {
        path: RemotePath,
        entries: Vec<RemoteEntry>,
    },
    Buffer {
        path: RemotePath,
        data: Vec<u8>,
    },
    FolderCreated {
        path: RemotePath,
    },
    ParametersWritten {
        folder: RemotePath,
    },
    JobAccepted {
        job: JobHandle,
    },
    ArtifactsDeleted {
        folder: RemotePath,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobStatus {
    Finished,
    Failed { message: String },
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Finished)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Completed {
        request: RequestId,
        outcome: Result<RemoteReply, RemoteError>,
    },
    JobDone {
        job: JobHandle,
        status: JobStatus,
    },
}

pub trait RemoteDataInterface {
    fn list_folder(&mut self, path: &RemotePath) -> RemoteResult<RequestId>;

    fn fetch_buffer(&mut self, path: &RemotePath) -> RemoteResult<RequestId>;

    fn create_folder(&mut self, parent: &RemotePath, name: &str) -> RemoteResult<RequestId>;

    fn write_parameters(
        &mut self,
        folder: &RemotePath,
        document: &ParamDocument,
    ) -> RemoteResult<RequestId>;

    /// Submit the job registered under `app`, run inside `folder`.
    fn submit_job(
        &mut self,
        app: &str,
        folder: &RemotePath,
        inputs: &BTreeMap<String, String>,
    ) -> RemoteResult<RequestId>;

    /// Remove a stage's output. `artifacts` are paths relative to `folder`.
    fn delete_artifacts(
        &mut self,
        folder: &RemotePath,
        stage: &str,
        artifacts: &[String],
    ) -> RemoteResult<RequestId>;

    /// Take every completion and job notification that has arrived so far.
    fn drain_events(&mut self) -> Vec<RemoteEvent>;
}

impl<T: RemoteDataInterface + ?Sized> RemoteDataInterface for Box<T> {
    fn list_folder(&mut self, path: &RemotePath) -> RemoteResult<RequestId> {
        (**self).list_folder(path)
    }

    fn fetch_buffer(&mut self, path: &RemotePath) -> RemoteResult<RequestId> {
        (**self).fetch_buffer(path)
    }

    fn create_folder(&mut self, parent: &RemotePath, name: &str) -> RemoteResult<RequestId> {
        (**self).create_folder(parent, name)
    }

    fn write_parameters(
        &mut self,
        folder: &RemotePath,
        document: &ParamDocument,
    ) -> RemoteResult<RequestId> {
        (**self).write_parameters(folder, document)
    }

    fn submit_job(
        &mut self,
        app: &str,
        folder: &RemotePath,
        inputs: &BTreeMap<String, String>,
    ) -> RemoteResult<RequestId> {
        (**self).submit_job(app, folder, inputs)
    }

    fn delete_artifacts(
        &mut self,
        folder: &RemotePath,
        stage: &str,
        artifacts: &[String],
    ) -> RemoteResult<RequestId> {
        (**self).delete_artifacts(folder, stage, artifacts)
    }

    fn drain_events(&mut self) -> Vec<RemoteEvent> {
        (**self).drain_events()
    }
}
