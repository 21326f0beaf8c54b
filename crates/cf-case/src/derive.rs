//! Reading case state out of cached folder content.
//!
//! Everything here is a pure function of the file tree. Missing data is
//! reported as [`ReadNeed`]s for the caller to request; nothing is fetched
//! from here.

use std::collections::BTreeMap;
use std::sync::Arc;

use cf_core::{NodeId, RemotePath};
use cf_remote::{FileTree, PARAM_FILE_NAME, ParamDocument};
use cf_types::{CaseTypeDef, CaseTypeRegistry, StageDef};

use crate::state::StageState;

/// Data the derivation could not see yet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadNeed {
    Listing(RemotePath),
    Buffer(RemotePath),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FolderValidity {
    Loading,
    /// Structural mismatch, with a reason for the log.
    Invalid(String),
    Ready,
}

#[derive(Debug, Clone)]
pub struct FolderView {
    pub validity: FolderValidity,
    pub case_type: Option<Arc<CaseTypeDef>>,
    pub params: BTreeMap<String, String>,
    pub stages: BTreeMap<String, StageState>,
    pub needs: Vec<ReadNeed>,
}

impl FolderView {
    fn loading(needs: Vec<ReadNeed>) -> Self {
        Self {
            validity: FolderValidity::Loading,
            case_type: None,
            params: BTreeMap::new(),
            stages: BTreeMap::new(),
            needs,
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            validity: FolderValidity::Invalid(reason.into()),
            case_type: None,
            params: BTreeMap::new(),
            stages: BTreeMap::new(),
            needs: Vec::new(),
        }
    }
}

/// Presence of one path below the case folder.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Presence {
    Present,
    Absent,
    Unknown(ReadNeed),
}

fn presence(tree: &FileTree, folder: NodeId, relative: &str) -> Presence {
    let mut current = folder;
    for part in relative.split('/').filter(|p| !p.is_empty()) {
        let Some(node) = tree.node(current) else {
            return Presence::Absent;
        };
        if !node.children_loaded() {
            if !node.is_folder() {
                return Presence::Absent;
            }
            return Presence::Unknown(ReadNeed::Listing(node.path.clone()));
        }
        match tree.child_named(current, part) {
            Some(child) => current = child.id,
            None => return Presence::Absent,
        }
    }
    Presence::Present
}

/// Stage state as seen purely from files: an error marker wins, then all
/// outputs present means finished.
pub fn stage_from_files(
    tree: &FileTree,
    folder: NodeId,
    stage: &StageDef,
    needs: &mut Vec<ReadNeed>,
) -> StageState {
    match presence(tree, folder, &stage.error_marker()) {
        Presence::Present => return StageState::Error,
        Presence::Unknown(need) => {
            needs.push(need);
            return StageState::Loading;
        }
        Presence::Absent => {}
    }

    let mut all_present = true;
    let mut loading = false;
    for output in &stage.outputs {
        match presence(tree, folder, output) {
            Presence::Present => {}
            Presence::Absent => all_present = false,
            Presence::Unknown(need) => {
                loading = true;
                needs.push(need);
            }
        }
    }
    if loading {
        StageState::Loading
    } else if all_present {
        StageState::Finished
    } else {
        StageState::Unrun
    }
}

/// Derive the view of a case folder.
///
/// `known_type` is the type the case was created with, if any. `assume_empty`
/// treats a not yet listed folder as empty; it is set for a folder this case
/// just created.
pub fn derive_folder(
    tree: &FileTree,
    folder: NodeId,
    known_type: Option<&Arc<CaseTypeDef>>,
    registry: &CaseTypeRegistry,
    assume_empty: bool,
) -> FolderView {
    let Some(node) = tree.node(folder) else {
        return FolderView::invalid("case folder is not in the file tree");
    };
    if !node.is_folder() {
        return FolderView::invalid("case path is not a folder");
    }

    let listed = node.children_loaded();
    if !listed && !assume_empty {
        return FolderView::loading(vec![ReadNeed::Listing(node.path.clone())]);
    }

    let mut needs = Vec::new();
    let document = if listed {
        match tree.child_named(folder, PARAM_FILE_NAME) {
            Some(param) => match param.buffer() {
                Some(data) => match ParamDocument::from_json_bytes(data) {
                    Ok(doc) => Some(doc),
                    Err(e) => return FolderView::invalid(format!("unreadable parameter file: {e}")),
                },
                None => {
                    return FolderView::loading(vec![ReadNeed::Buffer(param.path.clone())]);
                }
            },
            None => None,
        }
    } else {
        None
    };

    let case_type = match (known_type, &document) {
        (Some(known), Some(doc)) if doc.case_type != known.name => {
            return FolderView::invalid(format!(
                "parameter file names type '{}' but case is '{}'",
                doc.case_type, known.name
            ));
        }
        (Some(known), _) => Arc::clone(known),
        (None, Some(doc)) => match registry.get(&doc.case_type) {
            Some(found) => found,
            None => return FolderView::invalid(format!("unknown case type '{}'", doc.case_type)),
        },
        (None, None) => return FolderView::invalid("no parameter file and no known type"),
    };

    let mut params = case_type.default_params();
    if let Some(doc) = document {
        params.extend(doc.vars);
    }

    let mut stages = BTreeMap::new();
    for stage in &case_type.stages {
        let state = if listed {
            stage_from_files(tree, folder, stage, &mut needs)
        } else {
            StageState::Unrun
        };
        stages.insert(stage.id.clone(), state);
    }

    let validity = if stages.values().any(|s| *s == StageState::Loading) {
        FolderValidity::Loading
    } else {
        FolderValidity::Ready
    };
    needs.sort();
    needs.dedup();

    FolderView {
        validity,
        case_type: Some(case_type),
        params,
        stages,
        needs,
    }
}

/// Folders that must be re-listed to observe `stage`'s outputs afresh.
pub fn output_folders(case_path: &RemotePath, stage: &StageDef) -> Vec<RemotePath> {
    let mut folders = vec![case_path.clone()];
    let marker = stage.error_marker();
    for output in stage.outputs.iter().chain(std::iter::once(&marker)) {
        let parts: Vec<&str> = output.split('/').filter(|p| !p.is_empty()).collect();
        let mut current = case_path.clone();
        for part in parts.iter().take(parts.len().saturating_sub(1)) {
            match current.join(part) {
                Ok(next) => current = next,
                Err(_) => break,
            }
            folders.push(current.clone());
        }
    }
    folders.sort();
    folders.dedup();
    folders
}
