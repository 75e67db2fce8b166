//! Bounded worker pool over the job queue.
//!
//! Claims due jobs and dispatches them with configurable concurrency and a
//! per-second job-start throttle. Handler success/failure is recorded back
//! through the queue — the pool itself never decides retry policy.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::QueueConfig;
use crate::queue::job_queue::{Job, JobQueue};

/// Executes one claimed job. Implementations map `task_id` to real work.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, job: &Job) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Claims and executes due jobs.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    dispatcher: Arc<dyn JobDispatcher>,
    config: QueueConfig,
    slots: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, dispatcher: Arc<dyn JobDispatcher>, config: QueueConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            queue,
            dispatcher,
            config,
            slots,
        }
    }

    /// One poll cycle: claim and start due jobs while slots and the start
    /// budget allow. Returns the number of jobs started.
    pub async fn poll_once(&self) -> usize {
        let start_gap = Duration::from_millis(1_000 / u64::from(self.config.starts_per_second.max(1)));
        let mut started = 0;

        loop {
            // Respect concurrency before claiming, so a claimed job is never
            // left waiting in `processing` behind a full pool.
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                break;
            };

            let job = match self.queue.claim_due().await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!("Job claim failed: {e}");
                    break;
                }
            };

            if started > 0 {
                tokio::time::sleep(start_gap).await;
            }
            started += 1;

            let queue = Arc::clone(&self.queue);
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                let _permit = permit;
                run_job(&queue, dispatcher.as_ref(), job).await;
            });
        }

        started
    }
}

/// Execute one claimed job and record the outcome.
async fn run_job(queue: &JobQueue, dispatcher: &dyn JobDispatcher, job: Job) {
    debug!(job_id = %job.id, task_id = %job.task_id, "Executing job");

    match dispatcher.dispatch(&job).await {
        Ok(()) => {
            if let Err(e) = queue.complete(job.id).await {
                error!(job_id = %job.id, "Failed to mark job completed: {e}");
            }
        }
        Err(err) => {
            if let Err(e) = queue.fail(&job, &err.to_string()).await {
                error!(job_id = %job.id, "Failed to record job failure: {e}");
            }
        }
    }
}

/// Spawn the worker pool loop as a background task.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling;
/// in-flight jobs finish (coarse cancellation only — new work is prevented,
/// running work is not aborted).
pub fn spawn_worker_pool(pool: WorkerPool) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            concurrency = pool.config.concurrency,
            "Worker pool started — polling every {:?}",
            pool.config.poll_interval
        );

        let mut tick = tokio::time::interval(pool.config.poll_interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Worker pool shutting down");
                return;
            }

            pool.poll_once().await;
        }
    });

    (handle, shutdown_flag)
}
