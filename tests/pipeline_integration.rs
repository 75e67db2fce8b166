//! End-to-end pipeline tests against an in-memory database:
//! schedule → scheduler poll → job queue → worker pool → workflow engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use dealerwatch::config::{QueueConfig, SchedulerConfig, WorkflowConfig};
use dealerwatch::dispatch::WorkflowJobDispatcher;
use dealerwatch::error::WorkflowError;
use dealerwatch::queue::{JobQueue, JobStatus, WorkerPool};
use dealerwatch::scheduler::{Scheduler, ScheduleStatus, workflow_id_from_task};
use dealerwatch::store::{Database, LibSqlBackend};
use dealerwatch::workflow::{StepExecutor, WorkflowEngine, WorkflowStatus, WorkflowStep};

/// Executor that counts invocations and always succeeds.
struct CountingExecutor {
    calls: AtomicU32,
}

#[async_trait]
impl StepExecutor for CountingExecutor {
    async fn execute(
        &self,
        step: &WorkflowStep,
        _context: &serde_json::Map<String, Value>,
    ) -> Result<Value, WorkflowError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({ "step": step.id }))
    }
}

struct Harness {
    db: Arc<dyn Database>,
    queue: Arc<JobQueue>,
    workflows: Arc<WorkflowEngine>,
    scheduler: Arc<Scheduler>,
    executor: Arc<CountingExecutor>,
    queue_config: QueueConfig,
}

async fn harness() -> Harness {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let executor = Arc::new(CountingExecutor {
        calls: AtomicU32::new(0),
    });
    let workflows = Arc::new(WorkflowEngine::new(
        Arc::clone(&db),
        Arc::clone(&executor) as Arc<dyn StepExecutor>,
        WorkflowConfig {
            lock_lease: Duration::from_secs(600),
            step_retry_base: Duration::from_millis(1),
        },
    ));
    let queue_config = QueueConfig {
        concurrency: 2,
        starts_per_second: 100,
        poll_interval: Duration::from_millis(50),
        max_attempts: 2,
        backoff_base: Duration::ZERO,
    };
    let queue = Arc::new(JobQueue::new(Arc::clone(&db), queue_config.clone()));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&db),
        Arc::clone(&queue),
        Arc::clone(&workflows),
        SchedulerConfig {
            poll_interval: Duration::from_secs(60),
            failure_threshold: 3,
        },
    ));
    Harness {
        db,
        queue,
        workflows,
        scheduler,
        executor,
        queue_config,
    }
}

/// Force a schedule due by pushing its next fire time into the past.
async fn force_due(db: &Arc<dyn Database>, id: uuid::Uuid) {
    db.update_schedule_status(
        id,
        ScheduleStatus::Active,
        0,
        Some(Utc::now() - chrono::Duration::minutes(1)),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn scheduled_run_flows_through_queue_and_workflow() {
    let h = harness().await;

    let schedule_id = h
        .scheduler
        .create_schedule("daily_sales_report", "VinSolutions", "0 0 6 * * *", None)
        .await
        .unwrap();
    force_due(&h.db, schedule_id).await;

    // Poll: a fresh workflow instance is created and a high-priority job
    // enqueued.
    assert_eq!(h.scheduler.poll_once().await, 1);
    assert_eq!(h.queue.pending_count().await.unwrap(), 1);

    // The worker claims the job and drives the workflow to completion.
    let dispatcher = Arc::new(WorkflowJobDispatcher::new(
        Arc::clone(&h.workflows),
        Arc::clone(&h.scheduler),
    ));
    let pool = WorkerPool::new(Arc::clone(&h.queue), dispatcher, h.queue_config.clone());
    assert_eq!(pool.poll_once().await, 1);

    // The job runs on a spawned task; wait for the three pipeline steps.
    let mut done = false;
    for _ in 0..200 {
        if h.executor.calls.load(Ordering::SeqCst) >= 3 {
            done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(done, "workflow steps never ran");
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 3);

    // The schedule advanced to a future fire time.
    let schedule = h.db.get_schedule(schedule_id).await.unwrap().unwrap();
    assert!(schedule.last_run_at.is_some());
    assert!(schedule.next_run_at.unwrap() > Utc::now());
}

#[tokio::test]
async fn concurrent_claims_are_exclusive() {
    let h = harness().await;
    h.queue.enqueue("workflow:test", 0).await.unwrap();

    let claims = futures::future::join_all((0..10).map(|_| {
        let queue = Arc::clone(&h.queue);
        async move { queue.claim_due().await.unwrap() }
    }))
    .await;

    let won: Vec<_> = claims.into_iter().flatten().collect();
    assert_eq!(won.len(), 1, "exactly one claimer may win");
    assert_eq!(won[0].status, JobStatus::Processing);
}

#[tokio::test]
async fn locked_workflow_schedule_is_skipped_without_advancing() {
    let h = harness().await;

    let wf_id = h
        .workflows
        .create(
            vec![WorkflowStep::new(
                "ingest",
                dealerwatch::workflow::StepType::EmailIngestion,
                "fetch",
                serde_json::json!({ "vendor": "VinSolutions" }),
            )],
            None,
        )
        .await
        .unwrap();

    let schedule_id = h
        .scheduler
        .create_schedule("daily_sales_report", "VinSolutions", "0 0 6 * * *", Some(wf_id))
        .await
        .unwrap();
    force_due(&h.db, schedule_id).await;
    let before = h.db.get_schedule(schedule_id).await.unwrap().unwrap();

    // Another worker holds the workflow lock.
    let now = Utc::now();
    let stale = now - chrono::Duration::seconds(600);
    assert!(h.db.try_lock_workflow(wf_id, now, stale).await.unwrap());

    assert_eq!(h.scheduler.poll_once().await, 0);
    assert_eq!(h.queue.pending_count().await.unwrap(), 0);

    // next_run_at untouched — the next poll will retry this schedule.
    let after = h.db.get_schedule(schedule_id).await.unwrap().unwrap();
    assert_eq!(after.next_run_at, before.next_run_at);
}

#[tokio::test]
async fn failed_job_reschedules_then_goes_terminal() {
    let h = harness().await;
    let job_id = h.queue.enqueue("workflow:bogus", 0).await.unwrap();

    // First failure: attempts 1 of 2, rescheduled as pending.
    let job = h.queue.claim_due().await.unwrap().unwrap();
    let status = h.queue.fail(&job, "handler error").await.unwrap();
    assert_eq!(status, JobStatus::Pending);

    // Second failure exhausts the budget.
    let job = h.queue.claim_due().await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    let status = h.queue.fail(&job, "handler error again").await.unwrap();
    assert_eq!(status, JobStatus::Failed);

    // Terminal: nothing left to claim until a manual retry.
    assert!(h.queue.claim_due().await.unwrap().is_none());
    h.queue.retry_job(job_id).await.unwrap();
    let revived = h.queue.claim_due().await.unwrap().unwrap();
    assert_eq!(revived.attempts, 0);
    assert_eq!(revived.task_id, "workflow:bogus");
}

#[tokio::test]
async fn workflow_task_ids_round_trip() {
    let h = harness().await;
    let schedule_id = h
        .scheduler
        .create_schedule("inventory_report", "DealerSocket", "0 30 7 * * *", None)
        .await
        .unwrap();
    force_due(&h.db, schedule_id).await;
    h.scheduler.poll_once().await;

    let job = h.queue.claim_due().await.unwrap().unwrap();
    let wf_id = workflow_id_from_task(&job.task_id).expect("workflow task id");
    let workflow = h.workflows.get(wf_id).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Pending);
    assert_eq!(workflow.steps.len(), 3);
}
