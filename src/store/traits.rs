//! Unified `Database` trait — single async interface for all persistence.
//!
//! This crate performs plain row-level CRUD against its own table set
//! (`imap_filters`, `failed_emails`, `health_checks`, `jobs`, `workflows`,
//! `schedules`, `email_logs`). The two operations with concurrency teeth —
//! job claim and workflow lock — are single conditional updates so the
//! backend's transactional guarantees make them exclusive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::ingest::failed_mail::{FailedEmail, FailedEmailStatus};
use crate::ingest::filters::IngestionFilter;
use crate::ingest::health::HealthCheckRecord;
use crate::queue::job_queue::{Job, JobStatus};
use crate::scheduler::schedule::{Schedule, ScheduleStatus};
use crate::workflow::model::Workflow;

/// Audit row for a successfully processed report email.
#[derive(Debug, Clone)]
pub struct EmailLogEntry {
    pub id: Uuid,
    pub vendor: String,
    pub message_id: String,
    pub subject: Option<String>,
    pub from_address: Option<String>,
    pub attachment_count: u32,
    pub processed_at: DateTime<Utc>,
}

/// Backend-agnostic database trait covering the whole pipeline table set.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── IMAP filters ────────────────────────────────────────────────

    /// All filters with `active = true`.
    async fn list_active_filters(&self) -> Result<Vec<IngestionFilter>, DatabaseError>;

    /// The active filter for a vendor, if configured.
    async fn get_active_filter(&self, vendor: &str)
    -> Result<Option<IngestionFilter>, DatabaseError>;

    /// Stamp a filter's `last_used` timestamp.
    async fn touch_filter_last_used(
        &self,
        vendor: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Insert or replace a vendor's filter (administrative surface).
    async fn upsert_filter(&self, filter: &IngestionFilter) -> Result<(), DatabaseError>;

    // ── Failed emails ───────────────────────────────────────────────

    async fn insert_failed_email(&self, failed: &FailedEmail) -> Result<(), DatabaseError>;

    async fn get_failed_email(&self, id: Uuid) -> Result<Option<FailedEmail>, DatabaseError>;

    /// Rows with `status = retry_scheduled` and `next_retry_at <= now`.
    async fn list_due_failed_retries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<FailedEmail>, DatabaseError>;

    /// All archived failures for a vendor, newest first (operator surface).
    async fn list_failed_emails(&self, vendor: &str) -> Result<Vec<FailedEmail>, DatabaseError>;

    /// Persist a retry-state change on a failed email.
    async fn update_failed_email_retry(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        status: FailedEmailStatus,
    ) -> Result<(), DatabaseError>;

    /// Remove a failed email after successful reprocessing.
    async fn delete_failed_email(&self, id: Uuid) -> Result<(), DatabaseError>;

    // ── Health checks ───────────────────────────────────────────────

    /// Insert-or-update the single row for a monitored component.
    async fn upsert_health_check(&self, record: &HealthCheckRecord) -> Result<(), DatabaseError>;

    async fn get_health_check(
        &self,
        component: &str,
    ) -> Result<Option<HealthCheckRecord>, DatabaseError>;

    async fn list_health_checks(&self) -> Result<Vec<HealthCheckRecord>, DatabaseError>;

    // ── Email logs ──────────────────────────────────────────────────

    async fn insert_email_log(&self, entry: &EmailLogEntry) -> Result<(), DatabaseError>;

    /// Whether a message id has already been processed in any prior run.
    async fn has_email_log(&self, message_id: &str) -> Result<bool, DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Claim the highest-priority due job with a single conditional update.
    /// Returns `None` when nothing is due. Two concurrent callers can never
    /// claim the same job.
    async fn claim_due_job(&self, now: DateTime<Utc>) -> Result<Option<Job>, DatabaseError>;

    async fn mark_job_completed(
        &self,
        id: Uuid,
        finished_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Persist a failed attempt: new attempt count, error, terminal or
    /// rescheduled status, and the next due time when rescheduled.
    async fn mark_job_failed(
        &self,
        id: Uuid,
        attempts: u32,
        last_error: &str,
        status: JobStatus,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    /// Reset a terminal failed job back to pending with `attempts = 0`.
    async fn reset_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Count of jobs in `pending` status (backpressure signal).
    async fn count_pending_jobs(&self) -> Result<u64, DatabaseError>;

    // ── Workflows ───────────────────────────────────────────────────

    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), DatabaseError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, DatabaseError>;

    /// Acquire the advisory lock with a single conditional update. Succeeds
    /// when the workflow is unlocked, or its lock is older than
    /// `stale_before` (crashed-owner recovery). Also moves status to
    /// `running`. Returns whether the lock was acquired.
    async fn try_lock_workflow(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Best-effort lock release without touching other fields.
    async fn unlock_workflow(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Persist step progress — `current_step`, `context`, `status`,
    /// `last_error`, step retry counters, and `locked = false` — as one
    /// atomic update.
    async fn persist_workflow_progress(&self, workflow: &Workflow) -> Result<(), DatabaseError>;

    /// Clear locks older than `stale_before` (startup recovery).
    /// Returns the number of workflows unlocked.
    async fn clear_stale_workflow_locks(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<usize, DatabaseError>;

    // ── Schedules ───────────────────────────────────────────────────

    async fn insert_schedule(&self, schedule: &Schedule) -> Result<(), DatabaseError>;

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, DatabaseError>;

    /// Schedules bound to the given workflow instance.
    async fn get_schedule_by_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<Schedule>, DatabaseError>;

    /// Active, enabled schedules with `next_run_at <= now`.
    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, DatabaseError>;

    /// Persist a successful trigger: `last_run_at` and the next fire time.
    async fn update_schedule_run(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    /// Persist status / retry-count changes.
    async fn update_schedule_status(
        &self,
        id: Uuid,
        status: ScheduleStatus,
        retry_count: u32,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;
}
