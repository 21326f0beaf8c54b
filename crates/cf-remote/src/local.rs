//! Remote backend over a local directory.
//!
//! Remote path `/a/b` maps to `<root>/a/b`. File operations run eagerly when
//! requested but their completions are queued and only surface through
//! `drain_events`, so callers see the same asynchronous shape as a real
//! platform. Jobs run the shell command registered for their app on a worker
//! thread inside the case folder.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;

use cf_core::{IdAllocator, RemotePath, RequestId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::interface::{
    JobHandle, JobStatus, RemoteDataInterface, RemoteEntry, RemoteEvent, RemoteReply,
};
use crate::params::{PARAM_FILE_NAME, ParamDocument};
use crate::{RemoteError, RemoteResult};

const JOB_DIR: &str = ".cfdflow/jobs";

/// Persisted record of one job run, written next to the remote root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: JobHandle,
    pub app: String,
    pub folder: RemotePath,
    pub command: String,
    pub submitted_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub output: String,
}

pub struct LocalDirRemote {
    root: PathBuf,
    apps: BTreeMap<String, String>,
    ids: IdAllocator,
    queued: VecDeque<RemoteEvent>,
    job_tx: Sender<RemoteEvent>,
    job_rx: Receiver<RemoteEvent>,
}

impl LocalDirRemote {
    pub fn new(root: PathBuf, apps: BTreeMap<String, String>) -> RemoteResult<Self> {
        if !root.exists() {
            fs::create_dir_all(&root)?;
        }
        let (job_tx, job_rx) = channel();
        Ok(Self {
            root,
            apps,
            ids: IdAllocator::new(),
            queued: VecDeque::new(),
            job_tx,
            job_rx,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn local_path(&self, path: &RemotePath) -> PathBuf {
        let mut local = self.root.clone();
        for part in path.components() {
            local.push(part);
        }
        local
    }

    fn job_dir(&self) -> PathBuf {
        self.root.join(JOB_DIR)
    }

    pub fn load_job_record(&self, job: &JobHandle) -> RemoteResult<JobRecord> {
        let path = self.job_dir().join(format!("{}.json", job.0));
        if !path.exists() {
            return Err(RemoteError::NotFound {
                path: path.display().to_string(),
            });
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn enqueue(&mut self, outcome: RemoteResult<RemoteReply>) -> RemoteResult<RequestId> {
        let request = self.ids.next_request()?;
        if let Err(err) = &outcome {
            debug!(%request, error = %err, "local remote request failed");
        }
        self.queued
            .push_back(RemoteEvent::Completed { request, outcome });
        Ok(request)
    }

    fn read_listing(&self, path: &RemotePath) -> RemoteResult<RemoteReply> {
        let local = self.local_path(path);
        if !local.is_dir() {
            return Err(RemoteError::NotFound {
                path: path.to_string(),
            });
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&local)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_root() && name == ".cfdflow" {
                continue;
            }
            let meta = entry.metadata()?;
            if meta.is_dir() {
                entries.push(RemoteEntry::folder(name));
            } else {
                entries.push(RemoteEntry::file(name, meta.len()));
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(RemoteReply::Listing {
            path: path.clone(),
            entries,
        })
    }

    fn read_buffer(&self, path: &RemotePath) -> RemoteResult<RemoteReply> {
        let local = self.local_path(path);
        if !local.is_file() {
            return Err(RemoteError::NotFound {
                path: path.to_string(),
            });
        }
        Ok(RemoteReply::Buffer {
            path: path.clone(),
            data: fs::read(local)?,
        })
    }

    fn make_folder(&self, parent: &RemotePath, name: &str) -> RemoteResult<RemoteReply> {
        let path = parent.join(name)?;
        let parent_local = self.local_path(parent);
        if !parent_local.is_dir() {
            return Err(RemoteError::NotFound {
                path: parent.to_string(),
            });
        }
        let local = self.local_path(&path);
        if local.exists() {
            return Err(RemoteError::AlreadyExists {
                path: path.to_string(),
            });
        }
        fs::create_dir(&local)?;
        Ok(RemoteReply::FolderCreated { path })
    }

    fn store_parameters(
        &self,
        folder: &RemotePath,
        document: &ParamDocument,
    ) -> RemoteResult<RemoteReply> {
        let local = self.local_path(folder);
        if !local.is_dir() {
            return Err(RemoteError::NotFound {
                path: folder.to_string(),
            });
        }
        fs::write(local.join(PARAM_FILE_NAME), document.to_json_bytes()?)?;
        Ok(RemoteReply::ParametersWritten {
            folder: folder.clone(),
        })
    }

    fn remove_artifacts(
        &self,
        folder: &RemotePath,
        artifacts: &[String],
    ) -> RemoteResult<RemoteReply> {
        let local = self.local_path(folder);
        if !local.is_dir() {
            return Err(RemoteError::NotFound {
                path: folder.to_string(),
            });
        }
        for artifact in artifacts {
            // Reuse remote path validation to refuse `..` escapes.
            let relative = RemotePath::parse(artifact)?;
            if relative.is_root() {
                return Err(RemoteError::Rejected {
                    message: format!("refusing to delete case folder via artifact {artifact:?}"),
                });
            }
            let mut target = local.clone();
            for part in relative.components() {
                target.push(part);
            }
            if target.is_dir() {
                fs::remove_dir_all(&target)?;
            } else if target.exists() {
                fs::remove_file(&target)?;
            }
        }
        Ok(RemoteReply::ArtifactsDeleted {
            folder: folder.clone(),
        })
    }

    fn start_job(
        &self,
        app: &str,
        folder: &RemotePath,
        inputs: &BTreeMap<String, String>,
    ) -> RemoteResult<RemoteReply> {
        let command = self
            .apps
            .get(app)
            .cloned()
            .ok_or_else(|| RemoteError::Rejected {
                message: format!("no command registered for app '{app}'"),
            })?;
        let workdir = self.local_path(folder);
        if !workdir.is_dir() {
            return Err(RemoteError::NotFound {
                path: folder.to_string(),
            });
        }

        let job = JobHandle(uuid::Uuid::new_v4().to_string());
        let mut record = JobRecord {
            job: job.clone(),
            app: app.to_string(),
            folder: folder.clone(),
            command: command.clone(),
            submitted_at: chrono::Utc::now().to_rfc3339(),
            finished_at: None,
            status: None,
            output: String::new(),
        };
        let job_dir = self.job_dir();
        fs::create_dir_all(&job_dir)?;
        write_record(&job_dir, &record)?;

        let env: Vec<(String, String)> = inputs
            .iter()
            .map(|(k, v)| (format!("CFD_{}", env_key(k)), v.clone()))
            .collect();
        let tx = self.job_tx.clone();
        info!(%job, app, folder = %folder, "starting local job");

        thread::spawn(move || {
            let status = match Command::new("sh")
                .arg("-c")
                .arg(&command)
                .current_dir(&workdir)
                .envs(env)
                .output()
            {
                Ok(output) => {
                    record.output = String::from_utf8_lossy(&output.stdout).to_string();
                    record
                        .output
                        .push_str(&String::from_utf8_lossy(&output.stderr));
                    if output.status.success() {
                        JobStatus::Finished
                    } else {
                        JobStatus::Failed {
                            message: format!("command exited with {}", output.status),
                        }
                    }
                }
                Err(e) => JobStatus::Failed {
                    message: format!("failed to spawn job: {e}"),
                },
            };
            record.finished_at = Some(chrono::Utc::now().to_rfc3339());
            record.status = Some(status.clone());
            if let Err(e) = write_record(&job_dir, &record) {
                warn!(job = %record.job, error = %e, "could not persist job record");
            }
            let _ = tx.send(RemoteEvent::JobDone {
                job: record.job.clone(),
                status,
            });
        });

        Ok(RemoteReply::JobAccepted { job })
    }
}

fn write_record(job_dir: &Path, record: &JobRecord) -> RemoteResult<()> {
    let content = serde_json::to_string_pretty(record)?;
    fs::write(job_dir.join(format!("{}.json", record.job.0)), content)?;
    Ok(())
}

fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl RemoteDataInterface for LocalDirRemote {
    fn list_folder(&mut self, path: &RemotePath) -> RemoteResult<RequestId> {
        let outcome = self.read_listing(path);
        self.enqueue(outcome)
    }

    fn fetch_buffer(&mut self, path: &RemotePath) -> RemoteResult<RequestId> {
        let outcome = self.read_buffer(path);
        self.enqueue(outcome)
    }

    fn create_folder(&mut self, parent: &RemotePath, name: &str) -> RemoteResult<RequestId> {
        let outcome = self.make_folder(parent, name);
        self.enqueue(outcome)
    }

    fn write_parameters(
        &mut self,
        folder: &RemotePath,
        document: &ParamDocument,
    ) -> RemoteResult<RequestId> {
        let outcome = self.store_parameters(folder, document);
        self.enqueue(outcome)
    }

    fn submit_job(
        &mut self,
        app: &str,
        folder: &RemotePath,
        inputs: &BTreeMap<String, String>,
    ) -> RemoteResult<RequestId> {
        let outcome = self.start_job(app, folder, inputs);
        self.enqueue(outcome)
    }

    fn delete_artifacts(
        &mut self,
        folder: &RemotePath,
        stage: &str,
        artifacts: &[String],
    ) -> RemoteResult<RequestId> {
        debug!(folder = %folder, stage, count = artifacts.len(), "deleting stage artifacts");
        let outcome = self.remove_artifacts(folder, artifacts);
        self.enqueue(outcome)
    }

    fn drain_events(&mut self) -> Vec<RemoteEvent> {
        let mut events: Vec<RemoteEvent> = self.queued.drain(..).collect();
        events.extend(self.job_rx.try_iter());
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_keys_are_shell_safe() {
        assert_eq!(env_key("inflow-velocity"), "INFLOW_VELOCITY");
        assert_eq!(env_key("geo_file"), "GEO_FILE");
    }

    #[test]
    fn job_record_folder_is_a_checked_path() {
        let record = JobRecord {
            job: JobHandle("j1".to_string()),
            app: "mesh".to_string(),
            folder: RemotePath::parse("/projects/cyl").unwrap(),
            command: "true".to_string(),
            submitted_at: "2026-01-01T00:00:00Z".to_string(),
            finished_at: None,
            status: None,
            output: String::new(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["folder"], "/projects/cyl");

        let mut tampered = json;
        tampered["folder"] = "projects/../cyl".into();
        assert!(serde_json::from_value::<JobRecord>(tampered).is_err());
    }
}
