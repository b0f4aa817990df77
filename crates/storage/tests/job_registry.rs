#![forbid(unsafe_code)]

use calc_core::JobRegistry;
use calc_core::RegistryError;
use calc_core::ids::CalcId;
use calc_core::model::{JobFilter, JobStatus, JobUpdate, NewJob, OutputRecord, TerminalStatus};
use calc_storage::SqliteStore;
use std::path::PathBuf;

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("calc_storage_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn setup(test_name: &str) -> SqliteStore {
    SqliteStore::open(temp_dir(test_name)).expect("open store")
}

fn new_job(description: &str) -> NewJob {
    NewJob {
        description: description.to_string(),
        params_json: "{}".to_string(),
        ..NewJob::default()
    }
}

#[test]
fn ids_are_assigned_in_increasing_order() {
    let store = setup("ids_increasing");
    let a = store.create(new_job("a")).expect("create a");
    let b = store.create(new_job("b")).expect("create b");
    let c = store.create(new_job("c")).expect("create c");
    assert!(a < b && b < c);

    let job = store.get(b).expect("get").expect("job exists");
    assert_eq!(job.status, JobStatus::Created);
    assert_eq!(job.pid, 0);
    assert_eq!(job.description, "b");
}

#[test]
fn parent_must_exist() {
    let store = setup("parent_exists");
    let err = store
        .create(NewJob {
            parent_id: Some(CalcId::from(999)),
            ..new_job("orphan")
        })
        .expect_err("unknown parent");
    assert_eq!(err, RegistryError::UnknownJob(CalcId::from(999)));

    let parent = store.create(new_job("parent")).expect("parent");
    let child = store
        .create(NewJob {
            parent_id: Some(parent),
            ..new_job("child")
        })
        .expect("child");
    let child = store.get(child).expect("get").expect("child exists");
    assert_eq!(child.parent_id, Some(parent));
}

#[test]
fn update_moves_forward_only() {
    let store = setup("forward_only");
    let id = store.create(new_job("job")).expect("create");

    store
        .update(id, JobUpdate::status(JobStatus::Submitted, 4242))
        .expect("submit");
    store
        .update(id, JobUpdate::status(JobStatus::Executing, 4242))
        .expect("execute");

    let err = store
        .update(id, JobUpdate::status(JobStatus::Submitted, 4242))
        .expect_err("backwards");
    assert!(matches!(
        err,
        RegistryError::InvalidTransition {
            from: JobStatus::Executing,
            to: JobStatus::Submitted,
            ..
        }
    ));

    let job = store.get(id).expect("get").expect("exists");
    assert_eq!(job.status, JobStatus::Executing);
    assert_eq!(job.pid, 4242);
}

#[test]
fn finish_twice_is_a_no_op() {
    let store = setup("finish_idempotent");
    let id = store.create(new_job("job")).expect("create");
    store
        .update(id, JobUpdate::status(JobStatus::Executing, 7))
        .expect("execute");

    store.finish(id, TerminalStatus::Complete).expect("finish");
    let first = store.get(id).expect("get").expect("exists");
    store.finish(id, TerminalStatus::Failed).expect("finish again");
    let second = store.get(id).expect("get").expect("exists");

    assert_eq!(first.status, JobStatus::Complete);
    assert_eq!(second.status, JobStatus::Complete);
    assert_eq!(first.completed_at_ms, second.completed_at_ms);
}

#[test]
fn executing_job_cannot_be_aborted() {
    let store = setup("no_abort_after_start");
    let id = store.create(new_job("job")).expect("create");
    store
        .update(id, JobUpdate::status(JobStatus::Executing, 7))
        .expect("execute");
    assert!(store.finish(id, TerminalStatus::Aborted).is_err());
}

#[test]
fn in_flight_query_respects_window_and_owner() {
    let store = setup("in_flight_query");
    let ids = (0..5)
        .map(|i| store.create(new_job(&format!("job {i}"))).expect("create"))
        .collect::<Vec<_>>();

    store
        .update(ids[0], JobUpdate::status(JobStatus::Executing, 11))
        .expect("execute 0");
    store
        .update(ids[1], JobUpdate::status(JobStatus::Submitted, 12))
        .expect("submit 1");
    // Active status but no owning process: does not hold a slot.
    store
        .update(ids[2], JobUpdate::status(JobStatus::Submitted, 0))
        .expect("submit 2");
    store
        .update(ids[3], JobUpdate::status(JobStatus::Executing, 14))
        .expect("execute 3");
    store.finish(ids[3], TerminalStatus::Complete).expect("finish 3");

    let in_flight = store
        .query(&JobFilter::in_flight_below(ids[4].get()))
        .expect("query");
    let found = in_flight.iter().map(|job| job.calc_id).collect::<Vec<_>>();
    assert_eq!(found, vec![ids[0], ids[1]]);

    let narrow = store
        .query(&JobFilter::in_flight_below(ids[1].get()))
        .expect("query");
    assert_eq!(narrow.len(), 1);
    assert_eq!(narrow[0].calc_id, ids[0]);
}

#[test]
fn outputs_are_listed_by_key() {
    let store = setup("outputs");
    let id = store.create(new_job("job")).expect("create");
    store
        .create_outputs(
            id,
            &[
                OutputRecord {
                    key: "hcurves".to_string(),
                    size_mb: 1.5,
                },
                OutputRecord {
                    key: "empty".to_string(),
                    size_mb: 0.0,
                },
                OutputRecord {
                    key: "avg_losses".to_string(),
                    size_mb: -1.0,
                },
            ],
            3.0,
        )
        .expect("create outputs");

    let lines = store.list_outputs(id).expect("list outputs");
    assert_eq!(
        lines,
        vec![
            format!("{id} | avg_losses | size unknown"),
            format!("{id} | hcurves | 1.50 MB"),
        ]
    );
}

#[test]
fn recent_lists_newest_first() {
    let store = setup("recent");
    let a = store.create(new_job("a")).expect("create");
    let b = store.create(new_job("b")).expect("create");
    let recent = store.jobs_recent(10).expect("recent");
    assert_eq!(
        recent.iter().map(|j| j.calc_id).collect::<Vec<_>>(),
        vec![b, a]
    );
}

#[test]
fn store_reopens_existing_database() {
    let dir = temp_dir("reopen");
    let id = {
        let store = SqliteStore::open(&dir).expect("open");
        store.create(new_job("persisted")).expect("create")
    };
    let store = SqliteStore::open(&dir).expect("reopen");
    let job = store.get(id).expect("get").expect("exists");
    assert_eq!(job.description, "persisted");
}

#[test]
fn concurrent_processes_share_the_ledger_without_lock_errors() {
    let dir = temp_dir("concurrent_writers");
    SqliteStore::open(&dir).expect("create ledger");

    let writers = (0..8u32)
        .map(|worker| {
            let dir = dir.clone();
            std::thread::spawn(move || -> Result<Vec<CalcId>, RegistryError> {
                // One connection per writer, as separate job processes would hold.
                let store = SqliteStore::open(&dir).expect("open store");
                let mut ids = Vec::new();
                for i in 0..50 {
                    let id = store.create(new_job(&format!("w{worker}-{i}")))?;
                    store.update(id, JobUpdate::status(JobStatus::Executing, 100 + worker))?;
                    store.finish(id, TerminalStatus::Complete)?;
                    ids.push(id);
                }
                Ok(ids)
            })
        })
        .collect::<Vec<_>>();

    let mut all = Vec::new();
    for writer in writers {
        all.extend(writer.join().expect("join").expect("no lock errors"));
    }

    let store = SqliteStore::open(&dir).expect("reopen");
    assert_eq!(all.len(), 400);
    for id in all {
        let job = store.get(id).expect("get").expect("job exists");
        assert_eq!(job.status, JobStatus::Complete);
    }
}
