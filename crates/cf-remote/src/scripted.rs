//! Backend whose completions are produced by hand.
//!
//! Every call is recorded; the caller then decides how and when each request
//! completes. Used to drive case instances through exact event orders.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use cf_core::{IdAllocator, RemotePath, RequestId};

use crate::interface::{JobHandle, JobStatus, RemoteDataInterface, RemoteEvent, RemoteReply};
use crate::params::ParamDocument;
use crate::{RemoteError, RemoteResult};

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    ListFolder {
        path: RemotePath,
    },
    FetchBuffer {
        path: RemotePath,
    },
    CreateFolder {
        parent: RemotePath,
        name: String,
    },
    WriteParameters {
        folder: RemotePath,
        document: ParamDocument,
    },
    SubmitJob {
        app: String,
        folder: RemotePath,
        inputs: BTreeMap<String, String>,
    },
    DeleteArtifacts {
        folder: RemotePath,
        stage: String,
        artifacts: Vec<String>,
    },
}

impl RemoteCall {
    /// True for calls that change remote state.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            RemoteCall::ListFolder { .. } | RemoteCall::FetchBuffer { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssuedRequest {
    pub id: RequestId,
    pub call: RemoteCall,
}

#[derive(Debug, Default)]
pub struct ScriptedRemote {
    ids: IdAllocator,
    issued: Vec<IssuedRequest>,
    answered: BTreeSet<RequestId>,
    events: VecDeque<RemoteEvent>,
    refuse_next: Option<RemoteError>,
    next_job: u64,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request issued so far, oldest first.
    pub fn issued(&self) -> &[IssuedRequest] {
        &self.issued
    }

    /// Issued requests that have not been completed yet, oldest first.
    pub fn unanswered(&self) -> Vec<IssuedRequest> {
        self.issued
            .iter()
            .filter(|r| !self.answered.contains(&r.id))
            .cloned()
            .collect()
    }

    pub fn mutating_calls(&self) -> Vec<&IssuedRequest> {
        self.issued.iter().filter(|r| r.call.is_mutating()).collect()
    }

    /// Most recent request matching `pred`.
    pub fn last_where(&self, pred: impl Fn(&RemoteCall) -> bool) -> Option<&IssuedRequest> {
        self.issued.iter().rev().find(|r| pred(&r.call))
    }

    pub fn last_listing_of(&self, path: &RemotePath) -> Option<RequestId> {
        self.last_where(|c| matches!(c, RemoteCall::ListFolder { path: p } if p == path))
            .map(|r| r.id)
    }

    pub fn last_fetch_of(&self, path: &RemotePath) -> Option<RequestId> {
        self.last_where(|c| matches!(c, RemoteCall::FetchBuffer { path: p } if p == path))
            .map(|r| r.id)
    }

    pub fn last_mutating(&self) -> Option<&IssuedRequest> {
        self.last_where(RemoteCall::is_mutating)
    }

    /// The next request method call returns `err` without being issued.
    pub fn refuse_next(&mut self, err: RemoteError) {
        self.refuse_next = Some(err);
    }

    pub fn complete_ok(&mut self, request: RequestId, reply: RemoteReply) {
        self.answered.insert(request);
        self.events.push_back(RemoteEvent::Completed {
            request,
            outcome: Ok(reply),
        });
    }

    pub fn complete_err(&mut self, request: RequestId, err: RemoteError) {
        self.answered.insert(request);
        self.events.push_back(RemoteEvent::Completed {
            request,
            outcome: Err(err),
        });
    }

    /// Allocate a job handle for use in a `JobAccepted` reply.
    pub fn new_job_handle(&mut self) -> JobHandle {
        self.next_job += 1;
        JobHandle(format!("job-{}", self.next_job))
    }

    pub fn finish_job(&mut self, job: JobHandle, status: JobStatus) {
        self.events.push_back(RemoteEvent::JobDone { job, status });
    }

    fn record(&mut self, call: RemoteCall) -> RemoteResult<RequestId> {
        if let Some(err) = self.refuse_next.take() {
            return Err(err);
        }
        let id = self.ids.next_request()?;
        self.issued.push(IssuedRequest { id, call });
        Ok(id)
    }
}

impl RemoteDataInterface for ScriptedRemote {
    fn list_folder(&mut self, path: &RemotePath) -> RemoteResult<RequestId> {
        self.record(RemoteCall::ListFolder { path: path.clone() })
    }

    fn fetch_buffer(&mut self, path: &RemotePath) -> RemoteResult<RequestId> {
        self.record(RemoteCall::FetchBuffer { path: path.clone() })
    }

    fn create_folder(&mut self, parent: &RemotePath, name: &str) -> RemoteResult<RequestId> {
        self.record(RemoteCall::CreateFolder {
            parent: parent.clone(),
            name: name.to_string(),
        })
    }

    fn write_parameters(
        &mut self,
        folder: &RemotePath,
        document: &ParamDocument,
    ) -> RemoteResult<RequestId> {
        self.record(RemoteCall::WriteParameters {
            folder: folder.clone(),
            document: document.clone(),
        })
    }

    fn submit_job(
        &mut self,
        app: &str,
        folder: &RemotePath,
        inputs: &BTreeMap<String, String>,
    ) -> RemoteResult<RequestId> {
        self.record(RemoteCall::SubmitJob {
            app: app.to_string(),
            folder: folder.clone(),
            inputs: inputs.clone(),
        })
    }

    fn delete_artifacts(
        &mut self,
        folder: &RemotePath,
        stage: &str,
        artifacts: &[String],
    ) -> RemoteResult<RequestId> {
        self.record(RemoteCall::DeleteArtifacts {
            folder: folder.clone(),
            stage: stage.to_string(),
            artifacts: artifacts.to_vec(),
        })
    }

    fn drain_events(&mut self) -> Vec<RemoteEvent> {
        self.events.drain(..).collect()
    }
}
