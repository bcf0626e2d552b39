//! Integration tests for the Postgres store
//!
//! These tests require a running PostgreSQL instance (`DATABASE_URL`) and
//! skip themselves otherwise. Each test uses its own job type so rows left
//! by other tests never become lease candidates.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use resonance_worker::queue::{JobState, JobType, NewJob};
use resonance_worker::scan::{FileDescriptor, NewScanRun, ScanCounters, ScanState};
use resonance_worker::store::{JobStore, PgStore, ScanStore};
use resonance_worker::WorkerError;
use serde_json::json;
use uuid::Uuid;

use common::try_create_test_pool;

/// Macro to skip tests if the database is not available
macro_rules! require_db {
    ($store_var:ident) => {
        let $store_var = match try_create_test_pool().await {
            Some(pool) => PgStore::new(pool),
            None => {
                eprintln!("Skipping test: database not available");
                return;
            }
        };
    };
}

fn unique_type() -> JobType {
    JobType::new(format!("test.pg.{}", Uuid::new_v4().simple()))
}

fn new_job(job_type: &JobType, max_attempts: i32) -> NewJob {
    NewJob {
        job_id: Uuid::new_v4(),
        job_type: job_type.clone(),
        payload: json!({"n": 1}),
        max_attempts,
        run_after: None,
    }
}

fn descriptor(path: &str, size: u64) -> FileDescriptor {
    FileDescriptor {
        path: PathBuf::from(path),
        size_bytes: size,
        mtime_ms: 1_700_000_000_000,
        extension: "flac".to_string(),
    }
}

async fn insert_scan_run(store: &PgStore) -> (String, Uuid) {
    let job_type = unique_type();
    let job = new_job(&job_type, 3);
    let job_id = job.job_id;
    assert!(store.insert_job_bounded(job, i64::MAX).await.unwrap());

    let scan_id = format!("scan_{}", Uuid::new_v4().simple());
    store
        .create_scan_run(NewScanRun {
            scan_id: scan_id.clone(),
            job_id,
            user_id: "user-pg".to_string(),
            root_path: "/music".to_string(),
        })
        .await
        .unwrap();
    (scan_id, job_id)
}

// =============================================================================
// Job queue
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_leases_have_one_winner() {
    require_db!(store);
    let store = Arc::new(store);
    let job_type = unique_type();
    let job = new_job(&job_type, 3);
    let job_id = job.job_id;
    assert!(store.insert_job_bounded(job, i64::MAX).await.unwrap());

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let types = vec![job_type.clone()];
        handles.push(tokio::spawn(async move {
            store.lease(&format!("pg-worker-{}", i), &types, 30).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if let Some(leased) = handle.await.unwrap() {
            assert_eq!(leased.job_id, job_id);
            assert_eq!(leased.attempts, 1);
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Running);
    assert!(job.leased_until.is_some());
}

#[tokio::test]
async fn test_bounded_insert_rejects_when_full() {
    require_db!(store);
    let job_type = unique_type();
    let job = new_job(&job_type, 3);
    let job_id = job.job_id;

    assert!(!store.insert_job_bounded(job, 0).await.unwrap());
    assert!(store.get_job(job_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_writes_are_guarded_by_lease_owner() {
    require_db!(store);
    let job_type = unique_type();
    let job = new_job(&job_type, 3);
    let job_id = job.job_id;
    store.insert_job_bounded(job, i64::MAX).await.unwrap();

    let leased = store
        .lease("owner-a", &[job_type.clone()], 30)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leased.lease_owner, "owner-a");

    assert!(store.heartbeat(job_id, "owner-b", 30).await.unwrap().is_none());
    assert!(!store
        .update_progress(job_id, "owner-b", json!({"n": 2}))
        .await
        .unwrap());
    assert!(!store
        .complete(job_id, "owner-b", JobState::Succeeded, None)
        .await
        .unwrap());
    assert!(!store.fail(job_id, "owner-b", "nope", Some(5)).await.unwrap());

    assert!(store.heartbeat(job_id, "owner-a", 30).await.unwrap().is_some());
    assert!(store
        .complete(job_id, "owner-a", JobState::Succeeded, Some(json!({"ok": true})))
        .await
        .unwrap());
    assert!(!store
        .complete(job_id, "owner-a", JobState::Succeeded, None)
        .await
        .unwrap());

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert!(job.lease_owner.is_none());
    assert_eq!(job.result, Some(json!({"ok": true})));
}

#[tokio::test]
async fn test_failure_requeues_then_fails() {
    require_db!(store);
    let job_type = unique_type();
    let job = new_job(&job_type, 2);
    let job_id = job.job_id;
    store.insert_job_bounded(job, i64::MAX).await.unwrap();
    let types = [job_type.clone()];

    store.lease("w", &types, 30).await.unwrap().unwrap();
    assert!(store.fail(job_id, "w", "first", Some(0)).await.unwrap());
    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.last_error.as_deref(), Some("first"));

    let leased = store.lease("w", &types, 30).await.unwrap().unwrap();
    assert_eq!(leased.attempts, 2);
    assert!(store.fail(job_id, "w", "second", None).await.unwrap());
    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(store.lease("w", &types, 30).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_request_is_sticky_only_for_live_jobs() {
    require_db!(store);
    let job_type = unique_type();
    let job = new_job(&job_type, 3);
    let job_id = job.job_id;
    store.insert_job_bounded(job, i64::MAX).await.unwrap();

    assert_eq!(
        store.request_cancel(job_id).await.unwrap(),
        Some(JobState::Queued)
    );
    assert!(store.cancel_requested(job_id).await.unwrap());

    let leased = store.lease("w", &[job_type], 30).await.unwrap().unwrap();
    assert!(leased.cancel_requested);

    assert!(store
        .complete(job_id, "w", JobState::Cancelled, None)
        .await
        .unwrap());
    assert_eq!(
        store.request_cancel(job_id).await.unwrap(),
        Some(JobState::Cancelled)
    );
    assert_eq!(store.request_cancel(Uuid::new_v4()).await.unwrap(), None);
}

// =============================================================================
// Scan runs and files
// =============================================================================

#[tokio::test]
async fn test_upsert_is_idempotent_per_path() {
    require_db!(store);
    let (scan_id, _) = insert_scan_run(&store).await;

    let batch = vec![descriptor("/music/a.flac", 10), descriptor("/music/b.flac", 20)];
    assert_eq!(store.upsert_scan_files(&scan_id, &batch).await.unwrap(), 2);
    let first = store.list_scan_files(&scan_id).await.unwrap();

    let replay = vec![
        descriptor("/music/a.flac", 11),
        descriptor("/music/b.flac", 20),
        descriptor("/music/a.flac", 12),
    ];
    store.upsert_scan_files(&scan_id, &replay).await.unwrap();
    let second = store.list_scan_files(&scan_id).await.unwrap();

    assert_eq!(second.len(), 2);
    assert_eq!(second[0].path, "/music/a.flac");
    assert_eq!(second[0].size_bytes, 12);
    assert_eq!(second[0].scan_file_id, first[0].scan_file_id);
    assert_eq!(second[1].scan_file_id, first[1].scan_file_id);
}

#[tokio::test]
async fn test_upsert_for_unknown_run_is_not_found() {
    require_db!(store);
    let result = store
        .upsert_scan_files("scan_missing", &[descriptor("/music/x.flac", 1)])
        .await;
    assert!(matches!(result, Err(WorkerError::ScanRunNotFound(_))));
}

#[tokio::test]
async fn test_scan_run_for_unknown_job_is_rejected() {
    require_db!(store);
    let scan_id = format!("scan_{}", Uuid::new_v4().simple());
    let result = store
        .create_scan_run(NewScanRun {
            scan_id: scan_id.clone(),
            job_id: Uuid::new_v4(),
            user_id: "user-pg".to_string(),
            root_path: "/music".to_string(),
        })
        .await;

    assert!(matches!(result, Err(WorkerError::InvalidJobData(_))));
    assert!(store.get_scan_run(&scan_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_scan_run_finishes_only_once() {
    require_db!(store);
    let (scan_id, job_id) = insert_scan_run(&store).await;

    assert!(store.mark_scan_running(&scan_id).await.unwrap());
    let counters = ScanCounters {
        files_discovered: 4,
        files_persisted: 4,
        batches_flushed: 2,
        errors: 1,
    };
    assert!(store.update_scan_counters(&scan_id, &counters).await.unwrap());

    assert!(store
        .finish_scan_run(&scan_id, ScanState::Cancelled, &counters, None)
        .await
        .unwrap());
    assert!(!store
        .finish_scan_run(&scan_id, ScanState::Succeeded, &counters, None)
        .await
        .unwrap());
    assert!(!store.mark_scan_running(&scan_id).await.unwrap());

    let run = store.get_scan_run(&scan_id).await.unwrap().unwrap();
    assert_eq!(run.job_id, job_id);
    assert_eq!(run.state, ScanState::Cancelled);
    assert_eq!(run.counters, counters);
    assert!(run.started_at.is_some());
    assert!(run.finished_at.is_some());
    assert!(run.cancelled_at.is_some());
}
