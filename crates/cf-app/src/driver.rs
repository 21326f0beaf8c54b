//! Event loop tying the file tree, a remote backend and open cases together.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use cf_case::{
    CaseContext, CaseEvent, CaseResult, CaseState, CfdCaseInstance, StageState,
};
use cf_core::{CaseId, IdAllocator, NodeId, RemotePath, RequestId};
use cf_remote::{FileTree, LocalDirRemote, RemoteDataInterface, RemoteEvent, TreeNotice};
use cf_types::CaseTypeRegistry;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::error::{AppError, AppResult};

/// Snapshot of one case for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseSummary {
    pub name: Option<String>,
    pub folder: Option<String>,
    pub case_type: Option<String>,
    pub state: CaseState,
    pub stages: Vec<(String, StageState)>,
    pub params: BTreeMap<String, String>,
}

pub struct CaseDriver<R> {
    tree: FileTree,
    remote: R,
    types: Arc<CaseTypeRegistry>,
    cases: BTreeMap<CaseId, CfdCaseInstance>,
    ids: IdAllocator,
    /// Listings the driver itself asked for, to locate folders.
    driver_reads: BTreeMap<RequestId, RemotePath>,
    invoke_timeout: Option<Duration>,
}

pub fn load_case_types(dir: &Path) -> AppResult<Arc<CaseTypeRegistry>> {
    let registry = CaseTypeRegistry::load_dir(dir)?;
    info!(dir = %dir.display(), count = registry.len(), "loaded case types");
    Ok(Arc::new(registry))
}

/// A driver over the local-directory backend described by `config`.
pub fn local_driver(config: &DriverConfig) -> AppResult<CaseDriver<LocalDirRemote>> {
    let types = load_case_types(&config.case_types_dir)?;
    let remote = LocalDirRemote::new(config.remote_root.clone(), config.apps.clone())?;
    Ok(CaseDriver::new(remote, types)?.with_invoke_timeout(config.invoke_timeout()))
}

impl<R: RemoteDataInterface> CaseDriver<R> {
    pub fn new(remote: R, types: Arc<CaseTypeRegistry>) -> AppResult<Self> {
        Ok(Self {
            tree: FileTree::new()?,
            remote,
            types,
            cases: BTreeMap::new(),
            ids: IdAllocator::new(),
            driver_reads: BTreeMap::new(),
            invoke_timeout: None,
        })
    }

    pub fn with_invoke_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    pub fn tree(&self) -> &FileTree {
        &self.tree
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn remote_mut(&mut self) -> &mut R {
        &mut self.remote
    }

    pub fn types(&self) -> &Arc<CaseTypeRegistry> {
        &self.types
    }

    pub fn case(&self, id: CaseId) -> AppResult<&CfdCaseInstance> {
        self.cases
            .get(&id)
            .ok_or_else(|| AppError::CaseNotFound(id.to_string()))
    }

    pub fn case_ids(&self) -> impl Iterator<Item = CaseId> + '_ {
        self.cases.keys().copied()
    }

    pub fn summary(&self, id: CaseId) -> AppResult<CaseSummary> {
        let case = self.case(id)?;
        let order: Vec<String> = case
            .my_type()
            .map(|t| t.stages.iter().map(|s| s.id.clone()).collect())
            .unwrap_or_default();
        let stages = order
            .into_iter()
            .filter_map(|stage| case.stage_state(&stage).map(|state| (stage, state)))
            .collect();
        Ok(CaseSummary {
            name: case.case_name().map(str::to_string),
            folder: case.case_folder().map(ToString::to_string),
            case_type: case.my_type().map(|t| t.name.clone()),
            state: case.case_state(),
            stages,
            params: case.current_params().clone(),
        })
    }

    /// Walk `path` down from the root and request the first listing still
    /// missing. Returns the node once the tree knows it.
    pub fn ensure_path_loaded(&mut self, path: &RemotePath) -> AppResult<Option<NodeId>> {
        if let Some(id) = self.tree.lookup(path) {
            return Ok(Some(id));
        }
        let mut current = self.tree.root();
        for part in path.components() {
            let node = self
                .tree
                .node(current)
                .ok_or_else(|| AppError::PathNotFound(path.to_string()))?;
            if !node.children_loaded() {
                let folder = node.path.clone();
                self.request_listing(&folder)?;
                return Ok(None);
            }
            current = self
                .tree
                .child_named(current, part)
                .map(|child| child.id)
                .ok_or_else(|| AppError::PathNotFound(path.to_string()))?;
        }
        Ok(Some(current))
    }

    fn request_listing(&mut self, path: &RemotePath) -> AppResult<()> {
        if self.driver_reads.values().any(|p| p == path) {
            return Ok(());
        }
        let request = self.remote.list_folder(path)?;
        debug!(%request, path = %path, "driver listing");
        self.driver_reads.insert(request, path.clone());
        Ok(())
    }

    /// Open the case stored in `folder`.
    pub fn open_case(&mut self, folder: NodeId) -> AppResult<CaseId> {
        let id = self.ids.next_listener()?;
        let mut ctx = CaseContext::new(&mut self.tree, &mut self.remote);
        let case = CfdCaseInstance::open(id, &mut ctx, folder, Arc::clone(&self.types))?;
        self.cases.insert(id, case);
        Ok(id)
    }

    /// Start a case of `type_name` that has no folder yet.
    pub fn new_case(&mut self, type_name: &str) -> AppResult<CaseId> {
        let case_type = self
            .types
            .get(type_name)
            .ok_or_else(|| AppError::UnknownCaseType(type_name.to_string()))?;
        let id = self.ids.next_listener()?;
        self.cases.insert(
            id,
            CfdCaseInstance::for_type(id, case_type, Arc::clone(&self.types)),
        );
        Ok(id)
    }

    fn with_case<T>(
        &mut self,
        id: CaseId,
        f: impl FnOnce(&mut CfdCaseInstance, &mut CaseContext<'_>) -> CaseResult<T>,
    ) -> AppResult<T> {
        let case = self
            .cases
            .get_mut(&id)
            .ok_or_else(|| AppError::CaseNotFound(id.to_string()))?;
        let mut ctx = CaseContext::new(&mut self.tree, &mut self.remote);
        Ok(f(case, &mut ctx)?)
    }

    pub fn create_case(&mut self, id: CaseId, name: &str, containing: NodeId) -> AppResult<()> {
        self.with_case(id, |case, ctx| case.create_case(ctx, name, containing))
    }

    pub fn change_parameters(
        &mut self,
        id: CaseId,
        params: BTreeMap<String, String>,
    ) -> AppResult<()> {
        self.with_case(id, |case, ctx| case.change_parameters(ctx, params))
    }

    pub fn mesh(&mut self, id: CaseId, geo_file: Option<NodeId>) -> AppResult<()> {
        self.with_case(id, |case, ctx| case.mesh(ctx, geo_file))
    }

    pub fn open_foam(&mut self, id: CaseId) -> AppResult<()> {
        self.with_case(id, |case, ctx| case.open_foam(ctx))
    }

    pub fn post_process(&mut self, id: CaseId) -> AppResult<()> {
        self.with_case(id, |case, ctx| case.post_process(ctx))
    }

    pub fn roll_back(&mut self, id: CaseId, stage: &str) -> AppResult<()> {
        self.with_case(id, |case, ctx| case.roll_back(ctx, stage))
    }

    pub fn force_refresh(&mut self, id: CaseId) -> AppResult<()> {
        self.with_case(id, |case, ctx| {
            case.force_info_refresh(ctx);
            Ok(())
        })
    }

    pub fn subscribe(&mut self, id: CaseId) -> AppResult<Receiver<CaseEvent>> {
        self.cases
            .get_mut(&id)
            .map(CfdCaseInstance::subscribe)
            .ok_or_else(|| AppError::CaseNotFound(id.to_string()))
    }

    /// Disconnect and forget a case.
    pub fn close_case(&mut self, id: CaseId) -> AppResult<()> {
        let mut case = self
            .cases
            .remove(&id)
            .ok_or_else(|| AppError::CaseNotFound(id.to_string()))?;
        case.kill_case_connection(&mut self.tree);
        Ok(())
    }

    /// Forget every case that went defunct, returning their ids.
    pub fn remove_defunct(&mut self) -> Vec<CaseId> {
        let gone: Vec<CaseId> = self
            .cases
            .iter()
            .filter(|(_, case)| case.is_defunct())
            .map(|(id, _)| *id)
            .collect();
        for id in &gone {
            self.cases.remove(id);
        }
        gone
    }

    /// Deliver every queued remote event, then run the watchdog. Returns the
    /// number of events handled.
    pub fn pump(&mut self) -> AppResult<usize> {
        let events = self.remote.drain_events();
        let count = events.len();
        for event in events {
            // A bad event still completes its request so nobody waits on it.
            match self.tree.apply_event(&event) {
                Ok(notices) => self.deliver_notices(&notices),
                Err(e) => warn!(error = %e, "remote event could not be applied to the file tree"),
            }

            let mut ctx = CaseContext::new(&mut self.tree, &mut self.remote);
            match &event {
                RemoteEvent::Completed { request, outcome } => {
                    if let Some(path) = self.driver_reads.remove(request)
                        && let Err(e) = outcome
                    {
                        warn!(path = %path, error = %e, "driver listing failed");
                    }
                    for case in self.cases.values_mut() {
                        case.on_remote_completed(&mut ctx, *request, outcome);
                    }
                }
                RemoteEvent::JobDone { job, status } => {
                    for case in self.cases.values_mut() {
                        case.remote_app_done(&mut ctx, job, status);
                    }
                }
            }
        }
        self.check_watchdog();
        Ok(count)
    }

    fn deliver_notices(&mut self, notices: &[TreeNotice]) {
        let mut ctx = CaseContext::new(&mut self.tree, &mut self.remote);
        for notice in notices {
            let Some(case) = self.cases.get_mut(&notice.listener()) else {
                continue;
            };
            match notice {
                TreeNotice::Removed { node, .. } if Some(*node) == case.case_folder_node() => {
                    case.case_folder_removed(&mut ctx);
                }
                _ => case.underlying_files_updated(&mut ctx, false),
            }
        }
    }

    fn check_watchdog(&mut self) {
        let Some(limit) = self.invoke_timeout else {
            return;
        };
        let mut ctx = CaseContext::new(&mut self.tree, &mut self.remote);
        for case in self.cases.values_mut() {
            if let Some(since) = case.pending_since()
                && since.elapsed() >= limit
            {
                warn!(case = %case.id(), timeout_s = limit.as_secs_f64(), "remote operation timed out");
                case.abandon_pending(
                    &mut ctx,
                    &format!("no completion within {:.1}s", limit.as_secs_f64()),
                );
            }
        }
    }

    /// Pump until `done` holds, sleeping `poll` between rounds without
    /// events. Fails once `limit` has passed.
    pub fn run_until(
        &mut self,
        what: &str,
        poll: Duration,
        limit: Duration,
        mut done: impl FnMut(&mut Self) -> AppResult<bool>,
    ) -> AppResult<()> {
        let started = Instant::now();
        loop {
            let handled = self.pump()?;
            if done(self)? {
                return Ok(());
            }
            if started.elapsed() >= limit {
                return Err(AppError::Timeout {
                    what: what.to_string(),
                    seconds: limit.as_secs_f64(),
                });
            }
            if handled == 0 {
                std::thread::sleep(poll);
            }
        }
    }

    /// Block until `path` is known to the tree.
    pub fn locate(&mut self, path: &RemotePath, poll: Duration, limit: Duration) -> AppResult<NodeId> {
        let mut found = None;
        self.run_until(&format!("listing of {path}"), poll, limit, |driver| {
            found = driver.ensure_path_loaded(path)?;
            Ok(found.is_some())
        })?;
        found.ok_or_else(|| AppError::PathNotFound(path.to_string()))
    }

    /// Block until the case leaves `LOADING` and `AGAVE_INVOKE`.
    pub fn settle(&mut self, id: CaseId, poll: Duration, limit: Duration) -> AppResult<CaseState> {
        self.run_until(&format!("case {id}"), poll, limit, |driver| {
            Ok(!driver.case(id)?.case_state().is_transitional())
        })?;
        Ok(self.case(id)?.case_state())
    }
}
