//! Durable job queue backed by the `jobs` table.
//!
//! Claiming is an atomic conditional update in the backend — two workers can
//! never execute the same job. A failed attempt reschedules with exponential
//! backoff until `max_attempts`, which is terminal; only an explicit
//! `retry_job` resurrects a terminal job.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::store::Database;

/// Priority for routine work.
pub const PRIORITY_DEFAULT: i32 = 0;
/// Priority for scheduler-triggered workflow runs.
pub const PRIORITY_HIGH: i32 = 10;

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A queued task (`jobs` row).
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub task_id: String,
    pub priority: i32,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Queue operations over the persistence collaborator.
pub struct JobQueue {
    db: Arc<dyn Database>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(db: Arc<dyn Database>, config: QueueConfig) -> Self {
        Self { db, config }
    }

    /// Insert a pending job due immediately. Returns the job id.
    pub async fn enqueue(&self, task_id: &str, priority: i32) -> Result<Uuid, QueueError> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            task_id: task_id.to_string(),
            priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.config.max_attempts,
            last_error: None,
            next_run_at: now,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_job(&job).await?;
        tracing::debug!(job_id = %job.id, task_id = %task_id, priority, "Enqueued job");
        Ok(job.id)
    }

    /// Claim the highest-priority due job, if any.
    pub async fn claim_due(&self) -> Result<Option<Job>, QueueError> {
        Ok(self.db.claim_due_job(Utc::now()).await?)
    }

    /// Mark a claimed job completed.
    pub async fn complete(&self, id: Uuid) -> Result<(), QueueError> {
        self.db.mark_job_completed(id, Utc::now()).await?;
        tracing::debug!(job_id = %id, "Job completed");
        Ok(())
    }

    /// Record a failed execution attempt.
    ///
    /// Attempts under budget reschedule with exponential backoff and stay
    /// pending; exhausting `max_attempts` is terminal. Returns the job's new
    /// status.
    pub async fn fail(&self, job: &Job, error: &str) -> Result<JobStatus, QueueError> {
        let attempts = job.attempts + 1;

        let (status, next_run_at) = if attempts < job.max_attempts {
            let delay = backoff_delay(self.config.backoff_base, attempts);
            (JobStatus::Pending, Some(Utc::now() + delay))
        } else {
            (JobStatus::Failed, None)
        };

        self.db
            .mark_job_failed(job.id, attempts, error, status, next_run_at)
            .await?;

        match status {
            JobStatus::Pending => {
                tracing::warn!(
                    job_id = %job.id,
                    attempts,
                    "Job attempt failed, rescheduled: {error}"
                );
            }
            _ => {
                tracing::error!(
                    job_id = %job.id,
                    attempts,
                    "Job failed terminally: {error}"
                );
            }
        }
        Ok(status)
    }

    /// Manually reset a terminal failed job back to pending.
    pub async fn retry_job(&self, id: Uuid) -> Result<(), QueueError> {
        let job = self
            .db
            .get_job(id)
            .await?
            .ok_or(QueueError::NotFound { id })?;

        if job.status != JobStatus::Failed {
            return Err(QueueError::InvalidState {
                id,
                state: job.status.to_string(),
                expected: JobStatus::Failed.to_string(),
            });
        }

        self.db.reset_job(id, Utc::now()).await?;
        tracing::info!(job_id = %id, "Job manually reset to pending");
        Ok(())
    }

    /// Pending-job count — the backpressure signal read by ingestion.
    pub async fn pending_count(&self) -> Result<u64, QueueError> {
        Ok(self.db.count_pending_jobs().await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        Ok(self.db.get_job(id).await?)
    }
}

/// Backoff after the nth failed attempt: base doubling per attempt.
fn backoff_delay(base: std::time::Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(10);
    Duration::from_std(base * 2u32.pow(exponent)).unwrap_or_else(|_| Duration::seconds(3600))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let parsed: JobStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = std::time::Duration::from_secs(30);
        assert_eq!(backoff_delay(base, 1), Duration::seconds(30));
        assert_eq!(backoff_delay(base, 2), Duration::seconds(60));
        assert_eq!(backoff_delay(base, 3), Duration::seconds(120));
    }
}
