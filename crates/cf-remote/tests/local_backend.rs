use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use cf_core::RemotePath;
use cf_remote::*;

fn fresh_root(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(name);
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn path(s: &str) -> RemotePath {
    RemotePath::parse(s).unwrap()
}

fn single_completion(remote: &mut LocalDirRemote) -> Result<RemoteReply, RemoteError> {
    let mut events = remote.drain_events();
    assert_eq!(events.len(), 1, "expected exactly one queued completion");
    match events.remove(0) {
        RemoteEvent::Completed { outcome, .. } => outcome,
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn completions_wait_for_drain() {
    let root = fresh_root("cf_remote_local_async");
    let mut remote = LocalDirRemote::new(root, BTreeMap::new()).unwrap();

    let request = remote.create_folder(&RemotePath::root(), "cases").unwrap();
    let events = remote.drain_events();
    assert_eq!(
        events,
        vec![RemoteEvent::Completed {
            request,
            outcome: Ok(RemoteReply::FolderCreated {
                path: path("/cases")
            })
        }]
    );
    assert!(remote.drain_events().is_empty());
}

#[test]
fn create_list_and_write_parameters() {
    let root = fresh_root("cf_remote_local_params");
    let mut remote = LocalDirRemote::new(root.clone(), BTreeMap::new()).unwrap();

    remote.create_folder(&RemotePath::root(), "run1").unwrap();
    single_completion(&mut remote).unwrap();

    let doc = ParamDocument::new(
        "2D Shape",
        BTreeMap::from([("inflow_velocity".to_string(), "12.5".to_string())]),
    );
    remote.write_parameters(&path("/run1"), &doc).unwrap();
    single_completion(&mut remote).unwrap();

    remote.list_folder(&path("/run1")).unwrap();
    match single_completion(&mut remote).unwrap() {
        RemoteReply::Listing { entries, .. } => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].name, PARAM_FILE_NAME);
            assert_eq!(entries[0].kind, EntryKind::File);
        }
        other => panic!("unexpected reply {other:?}"),
    }

    remote
        .fetch_buffer(&path("/run1").join(PARAM_FILE_NAME).unwrap())
        .unwrap();
    match single_completion(&mut remote).unwrap() {
        RemoteReply::Buffer { data, .. } => {
            assert_eq!(ParamDocument::from_json_bytes(&data).unwrap(), doc);
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

#[test]
fn duplicate_folder_is_reported_through_completion() {
    let root = fresh_root("cf_remote_local_dup");
    let mut remote = LocalDirRemote::new(root, BTreeMap::new()).unwrap();
    remote.create_folder(&RemotePath::root(), "a").unwrap();
    remote.create_folder(&RemotePath::root(), "a").unwrap();
    let events = remote.drain_events();
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[1],
        RemoteEvent::Completed {
            outcome: Err(RemoteError::AlreadyExists { .. }),
            ..
        }
    ));
}

#[test]
fn listing_missing_folder_is_not_found() {
    let root = fresh_root("cf_remote_local_missing");
    let mut remote = LocalDirRemote::new(root, BTreeMap::new()).unwrap();
    remote.list_folder(&path("/nope")).unwrap();
    assert!(matches!(
        single_completion(&mut remote),
        Err(RemoteError::NotFound { .. })
    ));
}

#[test]
fn delete_artifacts_refuses_escapes() {
    let root = fresh_root("cf_remote_local_escape");
    let mut remote = LocalDirRemote::new(root, BTreeMap::new()).unwrap();
    remote.create_folder(&RemotePath::root(), "c").unwrap();
    single_completion(&mut remote).unwrap();

    remote
        .delete_artifacts(&path("/c"), "mesh", &["../other".to_string()])
        .unwrap();
    assert!(single_completion(&mut remote).is_err());
}

#[test]
fn job_runs_command_and_reports_done() {
    let root = fresh_root("cf_remote_local_job");
    let apps = BTreeMap::from([(
        "mesh".to_string(),
        "mkdir -p constant/polyMesh && echo \"$CFD_GEO_FILE\" > constant/polyMesh/geo".to_string(),
    )]);
    let mut remote = LocalDirRemote::new(root.clone(), apps).unwrap();
    remote.create_folder(&RemotePath::root(), "case").unwrap();
    single_completion(&mut remote).unwrap();

    let inputs = BTreeMap::from([("geo_file".to_string(), "/shapes/cyl.geo".to_string())]);
    remote.submit_job("mesh", &path("/case"), &inputs).unwrap();
    let job = match single_completion(&mut remote).unwrap() {
        RemoteReply::JobAccepted { job } => job,
        other => panic!("unexpected reply {other:?}"),
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        let done = remote.drain_events().into_iter().find_map(|e| match e {
            RemoteEvent::JobDone { job: j, status } if j == job => Some(status),
            _ => None,
        });
        if let Some(status) = done {
            break status;
        }
        assert!(Instant::now() < deadline, "job did not finish in time");
        std::thread::sleep(Duration::from_millis(20));
    };

    assert_eq!(status, JobStatus::Finished);
    let geo = std::fs::read_to_string(root.join("case/constant/polyMesh/geo")).unwrap();
    assert_eq!(geo.trim(), "/shapes/cyl.geo");

    let record = remote.load_job_record(&job).unwrap();
    assert_eq!(record.app, "mesh");
    assert_eq!(record.folder, path("/case"));
    assert_eq!(record.status, Some(JobStatus::Finished));
    assert!(record.finished_at.is_some());
}

#[test]
fn unknown_app_is_rejected() {
    let root = fresh_root("cf_remote_local_noapp");
    let mut remote = LocalDirRemote::new(root, BTreeMap::new()).unwrap();
    remote.create_folder(&RemotePath::root(), "case").unwrap();
    single_completion(&mut remote).unwrap();
    remote
        .submit_job("solve", &path("/case"), &BTreeMap::new())
        .unwrap();
    assert!(matches!(
        single_completion(&mut remote),
        Err(RemoteError::Rejected { .. })
    ));
}
