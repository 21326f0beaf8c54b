//! The per-case lifecycle state machine.
//!
//! A [`CfdCaseInstance`] never decides final state on its own. Operations put
//! the case into `AGAVE_INVOKE`, issue remote work, then wait for a folder
//! refresh; the outcome is always re-derived from what the refreshed file tree
//! shows.
//!
//! Whoever runs the event loop feeds the instance through:
//! - [`CfdCaseInstance::underlying_files_updated`] for tree notices on watched folders
//! - [`CfdCaseInstance::on_remote_completed`] for every request completion
//! - [`CfdCaseInstance::remote_app_done`] for job completion
//! - [`CfdCaseInstance::case_folder_removed`] when the case folder disappears

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Instant;

use cf_core::{CaseId, NodeId, RemotePath, RequestId};
use cf_remote::{
    FileTree, JobHandle, JobStatus, PARAM_FILE_NAME, ParamDocument, RemoteDataInterface,
    RemoteError, RemoteReply, RemoteResult,
};
use cf_types::{CaseTypeDef, CaseTypeRegistry, StageKind};
use tracing::{debug, info, warn};

use crate::derive::{FolderValidity, FolderView, ReadNeed, derive_folder, output_folders};
use crate::error::{CaseError, CaseResult};
use crate::lock::{EasyBoolLock, OpGuard};
use crate::notify::{CaseEvent, Observers};
use crate::state::{CaseState, StageState};

/// What an instance needs from its surroundings while handling a call.
pub struct CaseContext<'a> {
    pub tree: &'a mut FileTree,
    pub remote: &'a mut dyn RemoteDataInterface,
}

impl<'a> CaseContext<'a> {
    pub fn new(tree: &'a mut FileTree, remote: &'a mut dyn RemoteDataInterface) -> Self {
        Self { tree, remote }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Operation {
    CreateCase {
        name: String,
        containing: NodeId,
    },
    ChangeParameters {
        written: BTreeMap<String, String>,
    },
    RunStage {
        stage: String,
        job_status: Option<JobStatus>,
    },
    RollBack {
        stages: Vec<String>,
    },
}

impl Operation {
    fn label(&self) -> &'static str {
        match self {
            Operation::CreateCase { .. } => "create_case",
            Operation::ChangeParameters { .. } => "change_parameters",
            Operation::RunStage { .. } => "run_stage",
            Operation::RollBack { .. } => "roll_back",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    AwaitingReply(RequestId),
    AwaitingJob(JobHandle),
    /// Outstanding refresh reads; the operation resolves when none are left.
    AwaitingRefresh(BTreeSet<RequestId>),
}

/// The one operation in flight. Dropping it releases the case lock.
#[derive(Debug)]
struct PendingOp {
    _guard: OpGuard,
    op: Operation,
    phase: Phase,
    started: Instant,
    /// A job that finished before its submission was acknowledged.
    early_job: Option<(JobHandle, JobStatus)>,
}

enum Resolution {
    Wait(Vec<ReadNeed>),
    Success,
    Failure(String),
}

pub struct CfdCaseInstance {
    id: CaseId,
    defunct: bool,
    /// Last emitted state.
    old_state: CaseState,

    case_folder: Option<NodeId>,
    case_path: Option<RemotePath>,
    case_name: Option<String>,
    my_type: Option<Arc<CaseTypeDef>>,
    types: Arc<CaseTypeRegistry>,

    current_params: BTreeMap<String, String>,
    stage_states: BTreeMap<String, StageState>,
    /// Stages whose last job failed; cleared by resubmission or rollback.
    stage_faults: BTreeSet<String>,
    validity: FolderValidity,

    lock: EasyBoolLock,
    pending: Option<PendingOp>,
    error_latched: bool,

    expected_new_case_folder: Option<String>,
    fresh_folder: bool,
    reads_in_flight: BTreeMap<RequestId, RemotePath>,

    observers: Observers,
}

impl CfdCaseInstance {
    /// Bind to an existing remote folder. The case starts `LOADING` and
    /// requests whatever it needs to find its type and stage states.
    pub fn open(
        id: CaseId,
        ctx: &mut CaseContext<'_>,
        folder: NodeId,
        types: Arc<CaseTypeRegistry>,
    ) -> CaseResult<Self> {
        let node = ctx
            .tree
            .node(folder)
            .filter(|n| n.is_folder())
            .ok_or(CaseError::MissingNode {
                what: "case folder",
            })?;
        let path = node.path.clone();
        let name = node.name().to_string();

        let mut instance = Self::blank(id, None, types);
        instance.case_folder = Some(folder);
        instance.case_path = Some(path.clone());
        instance.case_name = Some(name);
        ctx.tree.watch(folder, id);
        info!(case = %id, path = %path, "opening case");

        instance.refresh(ctx);
        Ok(instance)
    }

    /// A case of a known type with no folder yet; see [`Self::create_case`].
    pub fn for_type(
        id: CaseId,
        case_type: Arc<CaseTypeDef>,
        types: Arc<CaseTypeRegistry>,
    ) -> Self {
        Self::blank(id, Some(case_type), types)
    }

    fn blank(id: CaseId, my_type: Option<Arc<CaseTypeDef>>, types: Arc<CaseTypeRegistry>) -> Self {
        Self {
            id,
            defunct: false,
            old_state: CaseState::Loading,
            case_folder: None,
            case_path: None,
            case_name: None,
            my_type,
            types,
            current_params: BTreeMap::new(),
            stage_states: BTreeMap::new(),
            stage_faults: BTreeSet::new(),
            validity: FolderValidity::Loading,
            lock: EasyBoolLock::new(),
            pending: None,
            error_latched: false,
            expected_new_case_folder: None,
            fresh_folder: false,
            reads_in_flight: BTreeMap::new(),
            observers: Observers::new(),
        }
    }

    // Accessors report cached knowledge; the remote may have moved on.

    pub fn id(&self) -> CaseId {
        self.id
    }

    pub fn is_defunct(&self) -> bool {
        self.defunct
    }

    pub fn case_state(&self) -> CaseState {
        self.old_state
    }

    pub fn case_folder(&self) -> Option<&RemotePath> {
        self.case_path.as_ref()
    }

    pub fn case_folder_node(&self) -> Option<NodeId> {
        self.case_folder
    }

    pub fn case_name(&self) -> Option<&str> {
        self.case_name.as_deref()
    }

    pub fn my_type(&self) -> Option<&Arc<CaseTypeDef>> {
        self.my_type.as_ref()
    }

    pub fn current_params(&self) -> &BTreeMap<String, String> {
        &self.current_params
    }

    pub fn stage_states(&self) -> &BTreeMap<String, StageState> {
        &self.stage_states
    }

    pub fn stage_state(&self, stage: &str) -> Option<StageState> {
        self.stage_states.get(stage).copied()
    }

    pub fn is_busy(&self) -> bool {
        self.lock.is_held()
    }

    /// When the in-flight operation was issued.
    pub fn pending_since(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.started)
    }

    pub fn invalid_reason(&self) -> Option<&str> {
        match &self.validity {
            FolderValidity::Invalid(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn subscribe(&mut self) -> Receiver<CaseEvent> {
        self.observers.subscribe()
    }

    // ---- operations ----

    /// Create the backing folder `name` inside `containing`.
    pub fn create_case(
        &mut self,
        ctx: &mut CaseContext<'_>,
        name: &str,
        containing: NodeId,
    ) -> CaseResult<()> {
        self.check_usable()?;
        if self.case_folder.is_some() || self.expected_new_case_folder.is_some() {
            return Err(CaseError::AlreadyCreated);
        }
        let case_type = self.my_type.clone().ok_or(CaseError::UnknownType)?;
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(CaseError::InvalidName {
                name: name.to_string(),
            });
        }
        let parent = ctx
            .tree
            .node(containing)
            .filter(|n| n.is_folder())
            .map(|n| n.path.clone())
            .ok_or(CaseError::MissingNode {
                what: "containing folder",
            })?;
        let guard = self.acquire()?;

        info!(case = %self.id, name, parent = %parent, case_type = %case_type.name, "creating case");
        self.expected_new_case_folder = Some(name.to_string());
        ctx.tree.watch(containing, self.id);
        let issued = ctx.remote.create_folder(&parent, name);
        self.start(
            ctx,
            guard,
            Operation::CreateCase {
                name: name.to_string(),
                containing,
            },
            issued,
        );
        Ok(())
    }

    /// Merge `param_list` over the current parameters and persist the result.
    pub fn change_parameters(
        &mut self,
        ctx: &mut CaseContext<'_>,
        param_list: BTreeMap<String, String>,
    ) -> CaseResult<()> {
        self.check_usable()?;
        self.check_case_state("change_parameters", &[CaseState::Ready])?;
        let case_type = self.my_type.clone().ok_or(CaseError::UnknownType)?;
        if let Some((stage, _)) = self
            .stage_states
            .iter()
            .find(|(_, s)| **s == StageState::Running)
        {
            return Err(CaseError::WrongStageState {
                op: "change_parameters",
                stage: stage.clone(),
                state: StageState::Running,
            });
        }

        for (name, value) in &param_list {
            let def = case_type
                .parameter(name)
                .ok_or_else(|| CaseError::UnknownParameter { name: name.clone() })?;
            let stage_state = self.stage_state(&def.stage).unwrap_or(StageState::Loading);
            if !stage_state.params_editable() {
                return Err(CaseError::ParameterFrozen {
                    name: name.clone(),
                    stage: def.stage.clone(),
                    state: stage_state,
                });
            }
            def.check(value)
                .map_err(|reason| CaseError::InvalidParameter {
                    name: name.clone(),
                    reason,
                })?;
        }

        let folder = self.folder_path()?;
        let guard = self.acquire()?;

        let mut merged = self.current_params.clone();
        merged.extend(param_list);
        let document = ParamDocument::new(case_type.name.clone(), merged.clone());
        info!(case = %self.id, count = merged.len(), "writing parameters");
        let issued = ctx.remote.write_parameters(&folder, &document);
        self.start(
            ctx,
            guard,
            Operation::ChangeParameters { written: merged },
            issued,
        );
        Ok(())
    }

    /// Submit the mesh job, optionally pointing it at a geometry file.
    pub fn mesh(&mut self, ctx: &mut CaseContext<'_>, geo_file: Option<NodeId>) -> CaseResult<()> {
        self.check_usable()?;
        let stage = self.stage_id_of(StageKind::Mesh)?;
        let state = self.stage_state(&stage).unwrap_or(StageState::Loading);
        if !matches!(state, StageState::Unrun | StageState::Error) {
            return Err(CaseError::WrongStageState {
                op: "mesh",
                stage,
                state,
            });
        }
        let mut extra = BTreeMap::new();
        if let Some(node) = geo_file {
            let geo = ctx.tree.node(node).ok_or(CaseError::MissingNode {
                what: "geometry file",
            })?;
            extra.insert("geo_file".to_string(), geo.path.to_string());
        }
        self.submit_stage(ctx, "mesh", stage, extra)
    }

    /// Submit the solver job.
    pub fn open_foam(&mut self, ctx: &mut CaseContext<'_>) -> CaseResult<()> {
        self.check_usable()?;
        let stage = self.stage_id_of(StageKind::Solve)?;
        self.check_ready_to_run("open_foam", &stage)?;
        self.submit_stage(ctx, "open_foam", stage, BTreeMap::new())
    }

    /// Submit the post-processing job.
    pub fn post_process(&mut self, ctx: &mut CaseContext<'_>) -> CaseResult<()> {
        self.check_usable()?;
        let stage = self.stage_id_of(StageKind::Post)?;
        self.check_ready_to_run("post_process", &stage)?;
        self.submit_stage(ctx, "post_process", stage, BTreeMap::new())
    }

    /// Delete the output of `stage_to_delete` and of every later stage.
    pub fn roll_back(&mut self, ctx: &mut CaseContext<'_>, stage_to_delete: &str) -> CaseResult<()> {
        self.check_usable()?;
        self.check_case_state("roll_back", &[CaseState::Ready, CaseState::Error])?;
        let case_type = self.my_type.clone().ok_or(CaseError::UnknownType)?;
        if case_type.stage(stage_to_delete).is_none() {
            return Err(CaseError::MissingStage {
                what: stage_to_delete.to_string(),
            });
        }
        let state = self
            .stage_state(stage_to_delete)
            .unwrap_or(StageState::Loading);
        if !state.can_roll_back() {
            return Err(CaseError::WrongStageState {
                op: "roll_back",
                stage: stage_to_delete.to_string(),
                state,
            });
        }
        let folder = self.folder_path()?;
        let guard = self.acquire()?;

        let reverted = case_type.stages_from(stage_to_delete);
        let mut artifacts = Vec::new();
        for stage in reverted {
            artifacts.extend(stage.outputs.iter().cloned());
            artifacts.push(stage.error_marker());
        }
        let stages: Vec<String> = reverted.iter().map(|s| s.id.clone()).collect();
        info!(case = %self.id, stage = stage_to_delete, ?stages, "rolling back");
        let issued = ctx
            .remote
            .delete_artifacts(&folder, stage_to_delete, &artifacts);
        self.start(ctx, guard, Operation::RollBack { stages }, issued);
        Ok(())
    }

    /// Sever every tie to the file tree and go inert without notifying.
    pub fn kill_case_connection(&mut self, tree: &mut FileTree) {
        if self.defunct {
            return;
        }
        debug!(case = %self.id, "killing case connection");
        tree.unwatch_all(self.id);
        self.defunct = true;
        self.pending = None;
        self.reads_in_flight.clear();
        self.old_state = CaseState::Defunct;
        self.observers.clear();
    }

    /// Forget read bookkeeping and re-list the case folder. A latched error
    /// is cleared when nothing is in flight.
    pub fn force_info_refresh(&mut self, ctx: &mut CaseContext<'_>) {
        if self.defunct {
            return;
        }
        self.reads_in_flight.clear();
        if self.pending.is_none() {
            self.error_latched = false;
        }
        if let Some(path) = self.case_path.clone() {
            self.request_read(ctx, ReadNeed::Listing(path));
        }
        self.refresh(ctx);
    }

    /// Give up on the in-flight operation, as when a watchdog fires.
    pub fn abandon_pending(&mut self, ctx: &mut CaseContext<'_>, reason: &str) {
        if self.defunct || self.pending.is_none() {
            return;
        }
        self.fail(ctx.tree, reason.to_string());
        self.refresh(ctx);
    }

    // ---- event entry points ----

    /// A watched folder has new content.
    pub fn underlying_files_updated(&mut self, ctx: &mut CaseContext<'_>, force_refresh: bool) {
        if self.defunct {
            return;
        }
        if force_refresh {
            self.reads_in_flight.clear();
            if let Some(path) = self.case_path.clone() {
                self.request_read(ctx, ReadNeed::Listing(path));
            }
        }
        self.refresh(ctx);
    }

    /// Any remote request finished. Requests this case did not issue are
    /// ignored. The tree must already reflect `outcome`.
    pub fn on_remote_completed(
        &mut self,
        ctx: &mut CaseContext<'_>,
        request: RequestId,
        outcome: &Result<RemoteReply, RemoteError>,
    ) {
        if self.defunct {
            return;
        }
        let mut relevant = self.reads_in_flight.remove(&request).is_some();

        let awaiting_reply = matches!(
            self.pending.as_ref().map(|p| &p.phase),
            Some(Phase::AwaitingReply(expected)) if *expected == request
        );
        if awaiting_reply {
            relevant = true;
            self.handle_reply(ctx, outcome);
        } else if let Some(PendingOp {
            phase: Phase::AwaitingRefresh(outstanding),
            ..
        }) = self.pending.as_mut()
            && outstanding.remove(&request)
        {
            relevant = true;
            let drained = outstanding.is_empty();
            match outcome {
                Err(e) if !matches!(e, RemoteError::NotFound { .. }) => {
                    self.fail(ctx.tree, format!("refresh failed: {e}"));
                }
                _ if drained => self.try_resolve(ctx),
                _ => {}
            }
        }

        if relevant {
            self.refresh(ctx);
        }
    }

    /// A remote job finished.
    pub fn remote_app_done(&mut self, ctx: &mut CaseContext<'_>, job: &JobHandle, status: &JobStatus) {
        if self.defunct {
            return;
        }
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        let Operation::RunStage { stage, job_status } = &mut pending.op else {
            return;
        };
        match &pending.phase {
            Phase::AwaitingJob(expected) if expected == job => {}
            Phase::AwaitingReply(_) => {
                debug!(case = %self.id, %job, "job done before its submission was acknowledged");
                pending.early_job = Some((job.clone(), status.clone()));
                return;
            }
            _ => return,
        }
        info!(case = %self.id, %job, stage = %stage, success = status.is_success(), "job done");
        *job_status = Some(status.clone());
        let stage = stage.clone();
        self.begin_refresh(ctx, &[stage]);
        self.refresh(ctx);
    }

    /// The backing folder vanished from the remote.
    pub fn case_folder_removed(&mut self, ctx: &mut CaseContext<'_>) {
        if self.defunct {
            return;
        }
        warn!(case = %self.id, path = ?self.case_path, "case folder removed");
        self.pending = None;
        self.defunct = true;
        self.emit_new_state();
        self.observers.notify(CaseEvent::Detach);
        ctx.tree.unwatch_all(self.id);
        self.reads_in_flight.clear();
        self.observers.clear();
    }

    // ---- internals ----

    fn check_usable(&self) -> CaseResult<()> {
        if self.defunct {
            return Err(CaseError::Defunct);
        }
        if self.lock.is_held() {
            return Err(CaseError::Busy);
        }
        Ok(())
    }

    fn check_case_state(&self, op: &'static str, allowed: &[CaseState]) -> CaseResult<()> {
        if allowed.contains(&self.old_state) {
            Ok(())
        } else {
            Err(CaseError::WrongCaseState {
                op,
                state: self.old_state,
            })
        }
    }

    fn check_ready_to_run(&self, op: &'static str, stage: &str) -> CaseResult<()> {
        let state = self.stage_state(stage).unwrap_or(StageState::Loading);
        if state != StageState::Unrun {
            return Err(CaseError::WrongStageState {
                op,
                stage: stage.to_string(),
                state,
            });
        }
        let case_type = self.my_type.as_ref().ok_or(CaseError::UnknownType)?;
        for earlier in case_type.stages_before(stage) {
            if self.stage_state(&earlier.id) != Some(StageState::Finished) {
                return Err(CaseError::PrerequisiteNotFinished {
                    stage: stage.to_string(),
                    prerequisite: earlier.id.clone(),
                });
            }
        }
        Ok(())
    }

    fn stage_id_of(&self, kind: StageKind) -> CaseResult<String> {
        let case_type = self.my_type.as_ref().ok_or(CaseError::UnknownType)?;
        case_type
            .stage_of_kind(kind)
            .map(|s| s.id.clone())
            .ok_or_else(|| CaseError::MissingStage {
                what: kind.as_str().to_string(),
            })
    }

    fn folder_path(&self) -> CaseResult<RemotePath> {
        self.case_path.clone().ok_or(CaseError::MissingNode {
            what: "case folder",
        })
    }

    fn acquire(&self) -> CaseResult<OpGuard> {
        self.lock.try_acquire().ok_or(CaseError::Busy)
    }

    fn submit_stage(
        &mut self,
        ctx: &mut CaseContext<'_>,
        op: &'static str,
        stage: String,
        extra_inputs: BTreeMap<String, String>,
    ) -> CaseResult<()> {
        self.check_case_state(op, &[CaseState::Ready, CaseState::Error])?;
        let case_type = self.my_type.clone().ok_or(CaseError::UnknownType)?;
        let app = case_type
            .stage(&stage)
            .map(|s| s.app.clone())
            .ok_or_else(|| CaseError::MissingStage {
                what: stage.clone(),
            })?;
        let folder = self.folder_path()?;
        let guard = self.acquire()?;

        let mut inputs = self.current_params.clone();
        inputs.extend(extra_inputs);
        inputs.insert("stage".to_string(), stage.clone());
        info!(case = %self.id, stage = %stage, app = %app, "submitting job");

        self.stage_faults.remove(&stage);
        let issued = ctx.remote.submit_job(&app, &folder, &inputs);
        self.start(
            ctx,
            guard,
            Operation::RunStage {
                stage,
                job_status: None,
            },
            issued,
        );
        Ok(())
    }

    /// Track `op` as in flight, or fail straight away when its request could
    /// not be issued. Either way the resulting state is emitted.
    fn start(
        &mut self,
        ctx: &mut CaseContext<'_>,
        guard: OpGuard,
        op: Operation,
        issued: RemoteResult<RequestId>,
    ) {
        self.error_latched = false;
        match issued {
            Ok(request) => {
                debug!(case = %self.id, op = op.label(), %request, "operation issued");
                self.pending = Some(PendingOp {
                    _guard: guard,
                    op,
                    phase: Phase::AwaitingReply(request),
                    started: Instant::now(),
                    early_job: None,
                });
            }
            Err(e) => {
                drop(guard);
                warn!(case = %self.id, op = op.label(), error = %e, "request could not be issued");
                self.record_failure(ctx.tree, op);
            }
        }
        self.refresh(ctx);
    }

    fn handle_reply(&mut self, ctx: &mut CaseContext<'_>, outcome: &Result<RemoteReply, RemoteError>) {
        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) => {
                self.fail(ctx.tree, format!("remote call failed: {e}"));
                return;
            }
        };
        let Some(op) = self.pending.as_ref().map(|p| p.op.clone()) else {
            return;
        };
        match (op, reply) {
            (Operation::RunStage { stage, .. }, RemoteReply::JobAccepted { job }) => {
                debug!(case = %self.id, %job, "job accepted");
                let Some(pending) = self.pending.as_mut() else {
                    return;
                };
                pending.phase = Phase::AwaitingJob(job.clone());
                let early = pending.early_job.take().filter(|(done, _)| done == job);
                if let Some((_, status)) = early
                    && let Operation::RunStage { job_status, .. } = &mut pending.op
                {
                    info!(case = %self.id, %job, stage = %stage, success = status.is_success(), "job done");
                    *job_status = Some(status);
                    self.begin_refresh(ctx, &[stage]);
                }
            }
            (Operation::CreateCase { .. }, RemoteReply::FolderCreated { path }) => {
                self.stamp_new_folder(ctx, path);
            }
            (Operation::CreateCase { containing, .. }, RemoteReply::ParametersWritten { folder }) => {
                let parent = ctx.tree.node(containing).map(|n| n.path.clone());
                match (parent, folder.join(PARAM_FILE_NAME)) {
                    (Some(parent), Ok(param_path)) => self.begin_refresh_reads(
                        ctx,
                        vec![ReadNeed::Listing(parent), ReadNeed::Buffer(param_path)],
                    ),
                    (None, _) => self.fail(ctx.tree, "containing folder vanished".to_string()),
                    (_, Err(e)) => self.fail(ctx.tree, format!("bad parameter path: {e}")),
                }
            }
            (Operation::ChangeParameters { .. }, RemoteReply::ParametersWritten { folder }) => {
                match folder.join(PARAM_FILE_NAME) {
                    Ok(param_path) => {
                        self.begin_refresh_reads(ctx, vec![ReadNeed::Buffer(param_path)])
                    }
                    Err(e) => self.fail(ctx.tree, format!("bad parameter path: {e}")),
                }
            }
            (Operation::RollBack { stages }, RemoteReply::ArtifactsDeleted { .. }) => {
                self.begin_refresh(ctx, &stages);
            }
            (op, other) => {
                let reason = format!("unexpected reply to {}: {other:?}", op.label());
                self.fail(ctx.tree, reason);
            }
        }
    }

    /// Write the type's default parameter file into a folder that was just
    /// created, so the case can be recognised when it is opened again.
    fn stamp_new_folder(&mut self, ctx: &mut CaseContext<'_>, folder: &RemotePath) {
        let Some(case_type) = self.my_type.clone() else {
            self.fail(ctx.tree, "case has no type".to_string());
            return;
        };
        let document = ParamDocument::new(case_type.name.clone(), case_type.default_params());
        match ctx.remote.write_parameters(folder, &document) {
            Ok(request) => {
                debug!(case = %self.id, %request, folder = %folder, "writing initial parameters");
                if let Some(pending) = self.pending.as_mut() {
                    pending.phase = Phase::AwaitingReply(request);
                }
            }
            Err(e) => self.fail(ctx.tree, format!("initial parameters could not be written: {e}")),
        }
    }

    /// Re-list the case folder and every folder holding `stages`' outputs.
    fn begin_refresh(&mut self, ctx: &mut CaseContext<'_>, stages: &[String]) {
        let (Some(case_path), Some(case_type)) = (self.case_path.clone(), self.my_type.clone())
        else {
            self.fail(ctx.tree, "case has no folder or type".to_string());
            return;
        };
        let mut needs = vec![ReadNeed::Listing(case_path.clone())];
        for stage in stages.iter().filter_map(|id| case_type.stage(id)) {
            needs.extend(
                output_folders(&case_path, stage)
                    .into_iter()
                    .map(ReadNeed::Listing),
            );
        }
        needs.sort();
        needs.dedup();
        self.begin_refresh_reads(ctx, needs);
    }

    fn begin_refresh_reads(&mut self, ctx: &mut CaseContext<'_>, needs: Vec<ReadNeed>) {
        let mut outstanding = BTreeSet::new();
        for need in needs {
            match issue_read(ctx.remote, &need) {
                Ok(request) => {
                    outstanding.insert(request);
                    let (ReadNeed::Listing(path) | ReadNeed::Buffer(path)) = need;
                    self.reads_in_flight.insert(request, path);
                }
                Err(e) => {
                    self.fail(ctx.tree, format!("refresh could not be issued: {e}"));
                    return;
                }
            }
        }
        if let Some(pending) = self.pending.as_mut() {
            pending.phase = Phase::AwaitingRefresh(outstanding);
        }
    }

    /// Every refresh read of the pending operation has landed; decide.
    fn try_resolve(&mut self, ctx: &mut CaseContext<'_>) {
        let Some(op) = self.pending.as_ref().map(|p| p.op.clone()) else {
            return;
        };
        let resolution = match op {
            Operation::CreateCase { name, containing } => {
                let created = ctx
                    .tree
                    .child_named(containing, &name)
                    .filter(|child| child.is_folder())
                    .map(|child| (child.id, child.path.clone()));
                match created {
                    Some((child, path)) => match self.check_stamp(ctx.tree, &path) {
                        Ok(()) => {
                            ctx.tree.unwatch(containing, self.id);
                            self.bind_created_folder(ctx, child, path);
                            Resolution::Success
                        }
                        Err(reason) => Resolution::Failure(reason),
                    },
                    None => Resolution::Failure(format!("new case folder '{name}' did not appear")),
                }
            }
            Operation::ChangeParameters { written } => {
                let buffer = self
                    .case_path
                    .as_ref()
                    .and_then(|p| p.join(PARAM_FILE_NAME).ok())
                    .and_then(|p| ctx.tree.lookup(&p))
                    .and_then(|id| ctx.tree.node(id))
                    .and_then(|n| n.buffer());
                match buffer.map(ParamDocument::from_json_bytes) {
                    Some(Ok(doc)) if written.iter().all(|(k, v)| doc.vars.get(k) == Some(v)) => {
                        Resolution::Success
                    }
                    Some(Ok(_)) => Resolution::Failure(
                        "parameter file does not show the written values".to_string(),
                    ),
                    Some(Err(e)) => Resolution::Failure(format!("unreadable parameter file: {e}")),
                    None => Resolution::Failure("parameter file missing after write".to_string()),
                }
            }
            Operation::RunStage { stage, job_status } => {
                let job_ok = job_status.as_ref().is_some_and(JobStatus::is_success);
                let job_message = match &job_status {
                    Some(JobStatus::Failed { message }) => message.clone(),
                    _ => "job reported failure".to_string(),
                };
                self.resolve_from_files(ctx.tree, std::slice::from_ref(&stage), |state| {
                    match state {
                        StageState::Finished if job_ok => Ok(()),
                        _ if !job_ok => Err(job_message.clone()),
                        other => Err(format!("stage '{stage}' is {other} after its job finished")),
                    }
                })
            }
            Operation::RollBack { stages } => {
                self.resolve_from_files(ctx.tree, &stages, |state| match state {
                    StageState::Unrun => Ok(()),
                    other => Err(format!("stage still {other} after rollback")),
                })
            }
        };

        match resolution {
            Resolution::Wait(needs) => {
                debug!(case = %self.id, count = needs.len(), "operation needs more listings");
                self.begin_refresh_reads(ctx, needs);
            }
            Resolution::Success => self.succeed(),
            Resolution::Failure(reason) => self.fail(ctx.tree, reason),
        }
    }

    fn resolve_from_files(
        &self,
        tree: &FileTree,
        stages: &[String],
        judge: impl Fn(StageState) -> Result<(), String>,
    ) -> Resolution {
        let Some(folder) = self.case_folder else {
            return Resolution::Failure("case folder is gone".to_string());
        };
        let view = derive_folder(
            tree,
            folder,
            self.my_type.as_ref(),
            &self.types,
            self.fresh_folder,
        );
        if let FolderValidity::Invalid(reason) = view.validity {
            return Resolution::Failure(reason);
        }
        let mut waiting = false;
        for stage in stages {
            match view.stages.get(stage).copied() {
                Some(StageState::Loading) | None => waiting = true,
                Some(state) => {
                    if let Err(reason) = judge(state) {
                        return Resolution::Failure(reason);
                    }
                }
            }
        }
        if waiting && !view.needs.is_empty() {
            Resolution::Wait(view.needs)
        } else if waiting {
            Resolution::Failure("stage state could not be determined".to_string())
        } else {
            Resolution::Success
        }
    }

    /// The parameter file of a new folder must name this case's type.
    fn check_stamp(&self, tree: &FileTree, folder: &RemotePath) -> Result<(), String> {
        let buffer = folder
            .join(PARAM_FILE_NAME)
            .ok()
            .and_then(|p| tree.lookup(&p))
            .and_then(|id| tree.node(id))
            .and_then(|n| n.buffer());
        let expected = self.my_type.as_ref().map(|t| t.name.as_str());
        match buffer.map(ParamDocument::from_json_bytes) {
            Some(Ok(doc)) if Some(doc.case_type.as_str()) == expected => Ok(()),
            Some(Ok(doc)) => Err(format!("new case folder is stamped '{}'", doc.case_type)),
            Some(Err(e)) => Err(format!("unreadable parameter file: {e}")),
            None => Err("new case folder has no parameter file".to_string()),
        }
    }

    fn bind_created_folder(&mut self, ctx: &mut CaseContext<'_>, folder: NodeId, path: RemotePath) {
        info!(case = %self.id, path = %path, "case folder created");
        self.fresh_folder = ctx.tree.node(folder).is_some_and(|n| !n.children_loaded());
        self.case_folder = Some(folder);
        self.case_name = Some(path.file_name().to_string());
        self.case_path = Some(path.clone());
        self.expected_new_case_folder = None;
        ctx.tree.watch(folder, self.id);
        self.request_read(ctx, ReadNeed::Listing(path));
    }

    fn succeed(&mut self) {
        if let Some(pending) = self.pending.take() {
            info!(
                case = %self.id,
                op = pending.op.label(),
                elapsed_s = pending.started.elapsed().as_secs_f64(),
                "operation confirmed"
            );
            if let Operation::RollBack { stages } = &pending.op {
                for stage in stages {
                    self.stage_faults.remove(stage);
                }
            }
        }
        self.error_latched = false;
    }

    /// Drop the pending operation, releasing the lock, and latch `ERROR`.
    fn fail(&mut self, tree: &mut FileTree, reason: String) {
        if let Some(pending) = self.pending.take() {
            warn!(case = %self.id, op = pending.op.label(), %reason, "operation failed");
            self.record_failure(tree, pending.op);
        }
    }

    fn record_failure(&mut self, tree: &mut FileTree, op: Operation) {
        match op {
            Operation::RunStage { stage, .. } => {
                self.stage_faults.insert(stage);
            }
            Operation::CreateCase { containing, .. } => {
                self.expected_new_case_folder = None;
                tree.unwatch(containing, self.id);
            }
            Operation::ChangeParameters { .. } | Operation::RollBack { .. } => {}
        }
        self.error_latched = true;
    }

    /// Issue a read unless one for the same path is already in flight.
    fn request_read(&mut self, ctx: &mut CaseContext<'_>, need: ReadNeed) {
        let path = match &need {
            ReadNeed::Listing(p) | ReadNeed::Buffer(p) => p.clone(),
        };
        if self.reads_in_flight.values().any(|p| *p == path) {
            return;
        }
        match issue_read(ctx.remote, &need) {
            Ok(request) => {
                debug!(case = %self.id, %request, path = %path, "requested read");
                self.reads_in_flight.insert(request, path);
            }
            Err(e) => warn!(case = %self.id, path = %path, error = %e, "read could not be issued"),
        }
    }

    fn set_stage_state(&mut self, stage: &str, next: StageState) {
        match self.stage_states.get(stage).copied() {
            Some(current) if current == next => {}
            Some(current) if !current.can_transition_to(next) => {
                warn!(case = %self.id, stage, from = %current, to = %next, "rejected stage transition");
            }
            _ => {
                self.stage_states.insert(stage.to_string(), next);
            }
        }
    }

    /// Recompute everything derivable from the tree, request missing reads
    /// and emit the resulting case state.
    fn refresh(&mut self, ctx: &mut CaseContext<'_>) {
        if self.defunct {
            return;
        }
        if let Some(folder) = self.case_folder {
            let Some(node) = ctx.tree.node(folder) else {
                self.case_folder_removed(ctx);
                return;
            };
            if node.children_loaded() {
                self.fresh_folder = false;
            }
            let view = derive_folder(
                ctx.tree,
                folder,
                self.my_type.as_ref(),
                &self.types,
                self.fresh_folder,
            );
            for need in view.needs.iter().cloned() {
                self.request_read(ctx, need);
            }
            if let FolderValidity::Invalid(reason) = &view.validity
                && self.validity != view.validity
            {
                info!(case = %self.id, %reason, "folder is not a valid case");
            }
            self.apply_view(view);
        }
        self.emit_new_state();
    }

    fn apply_view(&mut self, view: FolderView) {
        if self.my_type.is_none() {
            self.my_type = view.case_type.clone();
        }
        if view.case_type.is_some() {
            self.current_params = view.params;
        }
        // A stage stays RUNNING until its operation resolves.
        let running = match &self.pending {
            Some(PendingOp {
                op: Operation::RunStage { stage, .. },
                ..
            }) => Some(stage.clone()),
            _ => None,
        };

        let mut next = view.stages;
        for (stage, state) in next.iter_mut() {
            if running.as_deref() == Some(stage.as_str()) {
                *state = StageState::Running;
            } else if self.stage_faults.contains(stage) {
                *state = StageState::Error;
            }
        }
        self.stage_states.retain(|id, _| next.contains_key(id));
        for (stage, state) in next {
            self.set_stage_state(&stage, state);
        }
        self.validity = view.validity;
    }

    fn compute_state(&self) -> CaseState {
        if self.defunct {
            CaseState::Defunct
        } else if self.pending.is_some() {
            CaseState::AgaveInvoke
        } else if self.error_latched {
            CaseState::Error
        } else if self.case_folder.is_none() {
            CaseState::Loading
        } else {
            match self.validity {
                FolderValidity::Loading => CaseState::Loading,
                FolderValidity::Invalid(_) => CaseState::Invalid,
                FolderValidity::Ready => CaseState::Ready,
            }
        }
    }

    /// Notify listeners when the case state differs from the last emitted one.
    fn emit_new_state(&mut self) {
        let new = self.compute_state();
        let old = self.old_state;
        if new == old {
            return;
        }
        if !old.can_transition_to(new) {
            warn!(case = %self.id, from = %old, to = %new, "rejected case transition");
            return;
        }
        debug!(case = %self.id, from = %old, to = %new, "case state changed");
        self.old_state = new;
        self.observers.notify(CaseEvent::NewState { old, new });
    }
}

fn issue_read(remote: &mut dyn RemoteDataInterface, need: &ReadNeed) -> RemoteResult<RequestId> {
    match need {
        ReadNeed::Listing(path) => remote.list_folder(path),
        ReadNeed::Buffer(path) => remote.fetch_buffer(path),
    }
}
