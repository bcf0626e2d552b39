//! Integration tests for the worker loop
//!
//! This test module covers:
//! - Per-type and global inflight ceilings during dispatch
//! - The long-running loop draining the queue and stopping on shutdown

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use resonance_worker::queue::{EnqueueOptions, JobState, SchemaRegistry};
use resonance_worker::store::MemoryStore;
use resonance_worker::{
    InflightLimiter, JobContext, JobHandler, JobOutcome, JobQueueService, JobType, WorkerLoop,
    WorkerResult,
};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::queue_config;

const SLOW: &str = "test.slow";
const FAST: &str = "test.fast";

fn accept_any(_: &serde_json::Value) -> WorkerResult<()> {
    Ok(())
}

/// Blocks until a permit is added to `gate`
struct GatedHandler {
    job_type: JobType,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl JobHandler for GatedHandler {
    fn job_type(&self) -> JobType {
        self.job_type.clone()
    }

    async fn run(&self, ctx: &JobContext) -> WorkerResult<JobOutcome> {
        let permit = self.gate.acquire().await;
        drop(permit);
        Ok(JobOutcome::Succeeded(json!({ "jobId": ctx.job_id() })))
    }
}

struct Fixture {
    queue: JobQueueService,
    limiter: Arc<InflightLimiter>,
    worker: WorkerLoop,
    slow_gate: Arc<Semaphore>,
}

fn fixture(global_cap: usize, type_caps: &[(&str, usize)]) -> Fixture {
    let mut schemas = SchemaRegistry::new();
    schemas.register(JobType::from(SLOW), accept_any);
    schemas.register(JobType::from(FAST), accept_any);
    let queue = JobQueueService::new(Arc::new(MemoryStore::new()), queue_config(100), schemas);

    let caps: HashMap<JobType, usize> = type_caps
        .iter()
        .map(|(name, cap)| (JobType::from(*name), *cap))
        .collect();
    let limiter = Arc::new(InflightLimiter::new(global_cap, caps));

    let slow_gate = Arc::new(Semaphore::new(0));
    let mut worker = WorkerLoop::new("worker-loop-test", queue.clone(), limiter.clone());
    worker
        .register(Arc::new(GatedHandler {
            job_type: JobType::from(SLOW),
            gate: slow_gate.clone(),
        }))
        .register(Arc::new(GatedHandler {
            job_type: JobType::from(FAST),
            gate: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
        }));

    Fixture {
        queue,
        limiter,
        worker,
        slow_gate,
    }
}

async fn enqueue(queue: &JobQueueService, job_type: &str) -> Uuid {
    queue
        .enqueue(&JobType::from(job_type), json!({}), EnqueueOptions::default())
        .await
        .unwrap()
        .job_id()
        .unwrap()
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }
}

// =============================================================================
// Inflight ceilings
// =============================================================================

#[tokio::test]
async fn test_type_cap_throttles_one_type_while_others_dispatch() {
    let fx = fixture(3, &[(SLOW, 1)]);
    let slow_a = enqueue(&fx.queue, SLOW).await;
    let slow_b = enqueue(&fx.queue, SLOW).await;
    let fast_a = enqueue(&fx.queue, FAST).await;
    let fast_b = enqueue(&fx.queue, FAST).await;

    let mut tasks = JoinSet::new();
    assert_eq!(fx.worker.poll_once(&mut tasks).await.unwrap(), 2);
    assert_eq!(fx.limiter.inflight_for(&JobType::from(SLOW)), 1);

    // The slow type is at its cap; the fast type still has room
    assert_eq!(fx.worker.poll_once(&mut tasks).await.unwrap(), 1);
    assert_eq!(fx.limiter.inflight_for(&JobType::from(SLOW)), 1);
    assert_eq!(fx.queue.stats().await.unwrap().queued, 1);
    assert_eq!(
        fx.queue.get_job(slow_b).await.unwrap().unwrap().state,
        JobState::Queued
    );

    fx.slow_gate.add_permits(2);
    join_all(&mut tasks).await;
    assert_eq!(fx.limiter.inflight(), 0);

    assert_eq!(fx.worker.poll_once(&mut tasks).await.unwrap(), 1);
    join_all(&mut tasks).await;

    for job_id in [slow_a, slow_b, fast_a, fast_b] {
        let job = fx.queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Succeeded);
    }
}

#[tokio::test]
async fn test_global_cap_blocks_every_type() {
    let fx = fixture(1, &[]);
    enqueue(&fx.queue, SLOW).await;
    let fast = enqueue(&fx.queue, FAST).await;

    let mut tasks = JoinSet::new();
    assert_eq!(fx.worker.poll_once(&mut tasks).await.unwrap(), 1);
    assert_eq!(fx.worker.poll_once(&mut tasks).await.unwrap(), 0);
    assert_eq!(fx.limiter.inflight(), 1);
    assert_eq!(
        fx.queue.get_job(fast).await.unwrap().unwrap().state,
        JobState::Queued
    );

    fx.slow_gate.add_permits(1);
    join_all(&mut tasks).await;
    assert_eq!(fx.worker.poll_once(&mut tasks).await.unwrap(), 1);
    join_all(&mut tasks).await;
    assert_eq!(fx.queue.stats().await.unwrap().succeeded, 2);
}

// =============================================================================
// Run loop
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_run_drains_queue_and_stops_on_shutdown() {
    let fx = fixture(2, &[]);
    fx.slow_gate.add_permits(Semaphore::MAX_PERMITS);
    let mut job_ids = Vec::new();
    for _ in 0..3 {
        job_ids.push(enqueue(&fx.queue, SLOW).await);
        job_ids.push(enqueue(&fx.queue, FAST).await);
    }

    let shutdown = CancellationToken::new();
    let queue = fx.queue.clone();
    let worker = fx.worker;
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(token).await });

    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if queue.stats().await.unwrap().succeeded == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "queue was not drained in time");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not stop")
        .unwrap();

    assert_eq!(fx.limiter.inflight(), 0);
    for job_id in job_ids {
        let job = fx.queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.attempts, 1);
    }
}
