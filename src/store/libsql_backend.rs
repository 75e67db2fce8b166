//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are written
//! as RFC 3339 text in UTC, so lexicographic SQL comparisons order
//! correctly.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::ingest::failed_mail::{FailedEmail, FailedEmailStatus};
use crate::ingest::filters::IngestionFilter;
use crate::ingest::health::{HealthCheckRecord, HealthStatus};
use crate::queue::job_queue::{Job, JobStatus};
use crate::scheduler::schedule::{Schedule, ScheduleStatus};
use crate::store::migrations;
use crate::store::traits::{Database, EmailLogEntry};
use crate::workflow::model::{Workflow, WorkflowStatus, WorkflowStep};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn query_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Convert an optional timestamp to libsql Value.
fn opt_datetime(dt: Option<&DateTime<Utc>>) -> libsql::Value {
    opt_text_owned(dt.map(fmt_datetime))
}

/// Convert `Option<i64>` to libsql Value.
fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str, entity: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| {
        DatabaseError::Serialization(format!("invalid uuid for {entity}: {s}: {e}"))
    })
}

// ── Row mappers ─────────────────────────────────────────────────────

const FILTER_COLUMNS: &str =
    "vendor, from_address, subject_regex, days_back, file_pattern, active, last_used";

fn row_to_filter(row: &libsql::Row) -> Result<IngestionFilter, DatabaseError> {
    let last_used: Option<String> = row.get(6).ok();
    Ok(IngestionFilter {
        vendor: row.get(0).map_err(query_err)?,
        from_address: row.get(1).ok(),
        subject_regex: row.get(2).ok(),
        days_back: row.get::<i64>(3).map_err(query_err)? as u32,
        file_pattern: row.get(4).map_err(query_err)?,
        active: row.get::<i64>(5).map_err(query_err)? != 0,
        last_used: parse_optional_datetime(&last_used),
    })
}

const FAILED_EMAIL_COLUMNS: &str = "id, vendor, message_id, subject, from_address, received_date, \
     error_message, error_stack, retry_count, max_retries, next_retry_at, status, raw_content, created_at";

fn row_to_failed_email(row: &libsql::Row) -> Result<FailedEmail, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let received: Option<String> = row.get(5).ok();
    let next_retry: Option<String> = row.get(10).ok();
    let status: String = row.get(11).map_err(query_err)?;
    Ok(FailedEmail {
        id: parse_uuid(&id, "failed_email")?,
        vendor: row.get(1).map_err(query_err)?,
        message_id: row.get(2).ok(),
        subject: row.get(3).ok(),
        from_address: row.get(4).ok(),
        received_date: parse_optional_datetime(&received),
        error_message: row.get(6).map_err(query_err)?,
        error_stack: row.get(7).ok(),
        retry_count: row.get::<i64>(8).map_err(query_err)? as u32,
        max_retries: row.get::<i64>(9).map_err(query_err)? as u32,
        next_retry_at: parse_optional_datetime(&next_retry),
        status: status
            .parse()
            .map_err(|e: String| DatabaseError::Serialization(e))?,
        raw_content: row.get(12).map_err(query_err)?,
        created_at: parse_datetime(&row.get::<String>(13).map_err(query_err)?),
    })
}

const HEALTH_COLUMNS: &str = "component, status, response_time_ms, last_checked, message, details";

fn row_to_health(row: &libsql::Row) -> Result<HealthCheckRecord, DatabaseError> {
    let status: String = row.get(1).map_err(query_err)?;
    let details: String = row.get(5).map_err(query_err)?;
    Ok(HealthCheckRecord {
        component: row.get(0).map_err(query_err)?,
        status: status
            .parse::<HealthStatus>()
            .map_err(DatabaseError::Serialization)?,
        response_time_ms: row.get::<i64>(2).ok().map(|v| v as u64),
        last_checked: parse_datetime(&row.get::<String>(3).map_err(query_err)?),
        message: row.get(4).ok(),
        details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
    })
}

const JOB_COLUMNS: &str = "id, task_id, priority, status, attempts, max_attempts, last_error, \
     next_run_at, last_run_at, created_at, updated_at";

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let status: String = row.get(3).map_err(query_err)?;
    let last_run: Option<String> = row.get(8).ok();
    Ok(Job {
        id: parse_uuid(&id, "job")?,
        task_id: row.get(1).map_err(query_err)?,
        priority: row.get::<i64>(2).map_err(query_err)? as i32,
        status: status
            .parse::<JobStatus>()
            .map_err(DatabaseError::Serialization)?,
        attempts: row.get::<i64>(4).map_err(query_err)? as u32,
        max_attempts: row.get::<i64>(5).map_err(query_err)? as u32,
        last_error: row.get(6).ok(),
        next_run_at: parse_datetime(&row.get::<String>(7).map_err(query_err)?),
        last_run_at: parse_optional_datetime(&last_run),
        created_at: parse_datetime(&row.get::<String>(9).map_err(query_err)?),
        updated_at: parse_datetime(&row.get::<String>(10).map_err(query_err)?),
    })
}

const WORKFLOW_COLUMNS: &str = "id, user_id, steps, current_step, context, status, last_error, \
     locked, locked_at, created_at, updated_at";

fn row_to_workflow(row: &libsql::Row) -> Result<Workflow, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let steps_json: String = row.get(2).map_err(query_err)?;
    let context_json: String = row.get(4).map_err(query_err)?;
    let status: String = row.get(5).map_err(query_err)?;
    let locked_at: Option<String> = row.get(8).ok();

    let steps: Vec<WorkflowStep> = serde_json::from_str(&steps_json)
        .map_err(|e| DatabaseError::Serialization(format!("workflow steps: {e}")))?;
    let context: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&context_json)
        .map_err(|e| DatabaseError::Serialization(format!("workflow context: {e}")))?;

    Ok(Workflow {
        id: parse_uuid(&id, "workflow")?,
        user_id: row.get(1).ok(),
        steps,
        current_step: row.get::<i64>(3).map_err(query_err)? as usize,
        context,
        status: status
            .parse::<WorkflowStatus>()
            .map_err(DatabaseError::Serialization)?,
        last_error: row.get(6).ok(),
        locked: row.get::<i64>(7).map_err(query_err)? != 0,
        locked_at: parse_optional_datetime(&locked_at),
        created_at: parse_datetime(&row.get::<String>(9).map_err(query_err)?),
        updated_at: parse_datetime(&row.get::<String>(10).map_err(query_err)?),
    })
}

const SCHEDULE_COLUMNS: &str = "id, workflow_id, intent, platform, cron, next_run_at, \
     last_run_at, status, retry_count, enabled, created_at, updated_at";

fn row_to_schedule(row: &libsql::Row) -> Result<Schedule, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let workflow_id: Option<String> = row.get(1).ok();
    let next_run: Option<String> = row.get(5).ok();
    let last_run: Option<String> = row.get(6).ok();
    let status: String = row.get(7).map_err(query_err)?;
    Ok(Schedule {
        id: parse_uuid(&id, "schedule")?,
        workflow_id: workflow_id
            .map(|s| parse_uuid(&s, "schedule.workflow_id"))
            .transpose()?,
        intent: row.get(2).map_err(query_err)?,
        platform: row.get(3).map_err(query_err)?,
        cron: row.get(4).map_err(query_err)?,
        next_run_at: parse_optional_datetime(&next_run),
        last_run_at: parse_optional_datetime(&last_run),
        status: status
            .parse::<ScheduleStatus>()
            .map_err(DatabaseError::Serialization)?,
        retry_count: row.get::<i64>(8).map_err(query_err)? as u32,
        enabled: row.get::<i64>(9).map_err(query_err)? != 0,
        created_at: parse_datetime(&row.get::<String>(10).map_err(query_err)?),
        updated_at: parse_datetime(&row.get::<String>(11).map_err(query_err)?),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── IMAP filters ────────────────────────────────────────────────

    async fn list_active_filters(&self) -> Result<Vec<IngestionFilter>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {FILTER_COLUMNS} FROM imap_filters WHERE active = 1 ORDER BY vendor"
                ),
                (),
            )
            .await
            .map_err(query_err)?;

        let mut filters = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            filters.push(row_to_filter(&row)?);
        }
        Ok(filters)
    }

    async fn get_active_filter(
        &self,
        vendor: &str,
    ) -> Result<Option<IngestionFilter>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {FILTER_COLUMNS} FROM imap_filters WHERE vendor = ?1 AND active = 1"
                ),
                params![vendor],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_filter(&row)?)),
            None => Ok(None),
        }
    }

    async fn touch_filter_last_used(
        &self,
        vendor: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE imap_filters SET last_used = ?2, updated_at = ?2 WHERE vendor = ?1",
                params![vendor, fmt_datetime(&at)],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn upsert_filter(&self, filter: &IngestionFilter) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO imap_filters \
                 (vendor, from_address, subject_regex, days_back, file_pattern, active, last_used) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(vendor) DO UPDATE SET \
                 from_address = ?2, subject_regex = ?3, days_back = ?4, file_pattern = ?5, \
                 active = ?6, last_used = ?7, updated_at = datetime('now')",
                params![
                    filter.vendor.clone(),
                    opt_text_owned(filter.from_address.clone()),
                    opt_text_owned(filter.subject_regex.clone()),
                    filter.days_back as i64,
                    filter.file_pattern.clone(),
                    filter.active as i64,
                    opt_datetime(filter.last_used.as_ref()),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Failed emails ───────────────────────────────────────────────

    async fn insert_failed_email(&self, failed: &FailedEmail) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO failed_emails ({FAILED_EMAIL_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    failed.id.to_string(),
                    failed.vendor.clone(),
                    opt_text_owned(failed.message_id.clone()),
                    opt_text_owned(failed.subject.clone()),
                    opt_text_owned(failed.from_address.clone()),
                    opt_datetime(failed.received_date.as_ref()),
                    failed.error_message.clone(),
                    opt_text_owned(failed.error_stack.clone()),
                    failed.retry_count as i64,
                    failed.max_retries as i64,
                    opt_datetime(failed.next_retry_at.as_ref()),
                    failed.status.to_string(),
                    failed.raw_content.clone(),
                    fmt_datetime(&failed.created_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_failed_email(&self, id: Uuid) -> Result<Option<FailedEmail>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {FAILED_EMAIL_COLUMNS} FROM failed_emails WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_failed_email(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_due_failed_retries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<FailedEmail>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {FAILED_EMAIL_COLUMNS} FROM failed_emails \
                     WHERE status = 'retry_scheduled' AND next_retry_at IS NOT NULL \
                     AND next_retry_at <= ?1 ORDER BY next_retry_at"
                ),
                params![fmt_datetime(&now)],
            )
            .await
            .map_err(query_err)?;

        let mut due = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            due.push(row_to_failed_email(&row)?);
        }
        Ok(due)
    }

    async fn list_failed_emails(&self, vendor: &str) -> Result<Vec<FailedEmail>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {FAILED_EMAIL_COLUMNS} FROM failed_emails \
                     WHERE vendor = ?1 ORDER BY created_at DESC"
                ),
                params![vendor],
            )
            .await
            .map_err(query_err)?;

        let mut failures = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            failures.push(row_to_failed_email(&row)?);
        }
        Ok(failures)
    }

    async fn update_failed_email_retry(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        status: FailedEmailStatus,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE failed_emails SET retry_count = ?2, next_retry_at = ?3, status = ?4 \
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    retry_count as i64,
                    opt_datetime(next_retry_at.as_ref()),
                    status.to_string(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn delete_failed_email(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM failed_emails WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Health checks ───────────────────────────────────────────────

    async fn upsert_health_check(&self, record: &HealthCheckRecord) -> Result<(), DatabaseError> {
        let details = serde_json::to_string(&record.details)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO health_checks \
                 (component, status, response_time_ms, last_checked, message, details) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(component) DO UPDATE SET \
                 status = ?2, response_time_ms = ?3, last_checked = ?4, message = ?5, details = ?6",
                params![
                    record.component.clone(),
                    record.status.to_string(),
                    opt_int(record.response_time_ms.map(|v| v as i64)),
                    fmt_datetime(&record.last_checked),
                    opt_text_owned(record.message.clone()),
                    details,
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_health_check(
        &self,
        component: &str,
    ) -> Result<Option<HealthCheckRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {HEALTH_COLUMNS} FROM health_checks WHERE component = ?1"),
                params![component],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_health(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_health_checks(&self) -> Result<Vec<HealthCheckRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {HEALTH_COLUMNS} FROM health_checks ORDER BY component"),
                (),
            )
            .await
            .map_err(query_err)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            records.push(row_to_health(&row)?);
        }
        Ok(records)
    }

    // ── Email logs ──────────────────────────────────────────────────

    async fn insert_email_log(&self, entry: &EmailLogEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO email_logs \
                 (id, vendor, message_id, subject, from_address, attachment_count, processed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.id.to_string(),
                    entry.vendor.clone(),
                    entry.message_id.clone(),
                    opt_text_owned(entry.subject.clone()),
                    opt_text_owned(entry.from_address.clone()),
                    entry.attachment_count as i64,
                    fmt_datetime(&entry.processed_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn has_email_log(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM email_logs WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(query_err)?;

        let count: i64 = rows
            .next()
            .await
            .map_err(query_err)?
            .map(|row| row.get(0).unwrap_or(0))
            .unwrap_or(0);
        Ok(count > 0)
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    job.id.to_string(),
                    job.task_id.clone(),
                    job.priority as i64,
                    job.status.to_string(),
                    job.attempts as i64,
                    job.max_attempts as i64,
                    opt_text_owned(job.last_error.clone()),
                    fmt_datetime(&job.next_run_at),
                    opt_datetime(job.last_run_at.as_ref()),
                    fmt_datetime(&job.created_at),
                    fmt_datetime(&job.updated_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn claim_due_job(&self, now: DateTime<Utc>) -> Result<Option<Job>, DatabaseError> {
        let now_str = fmt_datetime(&now);

        // Pick a candidate, then claim it with a conditional update. The
        // status guard makes the claim exclusive — a concurrent claimer
        // changes zero rows and moves on to the next candidate.
        loop {
            let mut rows = self
                .conn()
                .query(
                    "SELECT id FROM jobs WHERE status = 'pending' AND next_run_at <= ?1 \
                     ORDER BY priority DESC, next_run_at ASC LIMIT 1",
                    params![now_str.clone()],
                )
                .await
                .map_err(query_err)?;

            let Some(row) = rows.next().await.map_err(query_err)? else {
                return Ok(None);
            };
            let candidate: String = row.get(0).map_err(query_err)?;

            let claimed = self
                .conn()
                .execute(
                    "UPDATE jobs SET status = 'processing', last_run_at = ?2, updated_at = ?2 \
                     WHERE id = ?1 AND status = 'pending'",
                    params![candidate.clone(), now_str.clone()],
                )
                .await
                .map_err(query_err)?;

            if claimed == 1 {
                return self.get_job(parse_uuid(&candidate, "job")?).await;
            }
            // Lost the race for this candidate; try the next one.
        }
    }

    async fn mark_job_completed(
        &self,
        id: Uuid,
        finished_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE jobs SET status = 'completed', updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), fmt_datetime(&finished_at)],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn mark_job_failed(
        &self,
        id: Uuid,
        attempts: u32,
        last_error: &str,
        status: JobStatus,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        match next_run_at {
            Some(next) => {
                self.conn()
                    .execute(
                        "UPDATE jobs SET status = ?2, attempts = ?3, last_error = ?4, \
                         next_run_at = ?5, updated_at = datetime('now') WHERE id = ?1",
                        params![
                            id.to_string(),
                            status.to_string(),
                            attempts as i64,
                            last_error,
                            fmt_datetime(&next),
                        ],
                    )
                    .await
                    .map_err(query_err)?;
            }
            None => {
                self.conn()
                    .execute(
                        "UPDATE jobs SET status = ?2, attempts = ?3, last_error = ?4, \
                         updated_at = datetime('now') WHERE id = ?1",
                        params![
                            id.to_string(),
                            status.to_string(),
                            attempts as i64,
                            last_error,
                        ],
                    )
                    .await
                    .map_err(query_err)?;
            }
        }
        Ok(())
    }

    async fn reset_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE jobs SET status = 'pending', attempts = 0, last_error = NULL, \
                 next_run_at = ?2, updated_at = ?2 WHERE id = ?1",
                params![id.to_string(), fmt_datetime(&now)],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn count_pending_jobs(&self) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM jobs WHERE status = 'pending'", ())
            .await
            .map_err(query_err)?;

        let count: i64 = rows
            .next()
            .await
            .map_err(query_err)?
            .map(|row| row.get(0).unwrap_or(0))
            .unwrap_or(0);
        Ok(count as u64)
    }

    // ── Workflows ───────────────────────────────────────────────────

    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), DatabaseError> {
        let steps = serde_json::to_string(&workflow.steps)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let context = serde_json::to_string(&workflow.context)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO workflows ({WORKFLOW_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    workflow.id.to_string(),
                    opt_text_owned(workflow.user_id.clone()),
                    steps,
                    workflow.current_step as i64,
                    context,
                    workflow.status.to_string(),
                    opt_text_owned(workflow.last_error.clone()),
                    workflow.locked as i64,
                    opt_datetime(workflow.locked_at.as_ref()),
                    fmt_datetime(&workflow.created_at),
                    fmt_datetime(&workflow.updated_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_workflow(&row)?)),
            None => Ok(None),
        }
    }

    async fn try_lock_workflow(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE workflows SET locked = 1, locked_at = ?2, status = 'running', \
                 updated_at = ?2 \
                 WHERE id = ?1 AND status NOT IN ('completed', 'failed') \
                 AND (locked = 0 OR locked_at IS NULL OR locked_at <= ?3)",
                params![
                    id.to_string(),
                    fmt_datetime(&now),
                    fmt_datetime(&stale_before),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(changed == 1)
    }

    async fn unlock_workflow(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE workflows SET locked = 0, locked_at = NULL, \
                 updated_at = datetime('now') WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn persist_workflow_progress(&self, workflow: &Workflow) -> Result<(), DatabaseError> {
        let steps = serde_json::to_string(&workflow.steps)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let context = serde_json::to_string(&workflow.context)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "UPDATE workflows SET steps = ?2, current_step = ?3, context = ?4, \
                 status = ?5, last_error = ?6, locked = 0, locked_at = NULL, updated_at = ?7 \
                 WHERE id = ?1",
                params![
                    workflow.id.to_string(),
                    steps,
                    workflow.current_step as i64,
                    context,
                    workflow.status.to_string(),
                    opt_text_owned(workflow.last_error.clone()),
                    fmt_datetime(&workflow.updated_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn clear_stale_workflow_locks(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE workflows SET locked = 0, locked_at = NULL, \
                 updated_at = datetime('now') \
                 WHERE locked = 1 AND (locked_at IS NULL OR locked_at <= ?1)",
                params![fmt_datetime(&stale_before)],
            )
            .await
            .map_err(query_err)?;
        Ok(changed as usize)
    }

    // ── Schedules ───────────────────────────────────────────────────

    async fn insert_schedule(&self, schedule: &Schedule) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO schedules ({SCHEDULE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    schedule.id.to_string(),
                    opt_text_owned(schedule.workflow_id.map(|id| id.to_string())),
                    schedule.intent.clone(),
                    schedule.platform.clone(),
                    schedule.cron.clone(),
                    opt_datetime(schedule.next_run_at.as_ref()),
                    opt_datetime(schedule.last_run_at.as_ref()),
                    schedule.status.to_string(),
                    schedule.retry_count as i64,
                    schedule.enabled as i64,
                    fmt_datetime(&schedule.created_at),
                    fmt_datetime(&schedule.updated_at),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_schedule(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_schedule_by_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<Schedule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE workflow_id = ?1"),
                params![workflow_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_schedule(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules \
                     WHERE status = 'active' AND enabled = 1 \
                     AND next_run_at IS NOT NULL AND next_run_at <= ?1 \
                     ORDER BY next_run_at"
                ),
                params![fmt_datetime(&now)],
            )
            .await
            .map_err(query_err)?;

        let mut due = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            due.push(row_to_schedule(&row)?);
        }
        Ok(due)
    }

    async fn update_schedule_run(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE schedules SET last_run_at = ?2, next_run_at = ?3, \
                 updated_at = ?2 WHERE id = ?1",
                params![
                    id.to_string(),
                    fmt_datetime(&last_run_at),
                    opt_datetime(next_run_at.as_ref()),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn update_schedule_status(
        &self,
        id: Uuid,
        status: ScheduleStatus,
        retry_count: u32,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE schedules SET status = ?2, retry_count = ?3, next_run_at = ?4, \
                 updated_at = datetime('now') WHERE id = ?1",
                params![
                    id.to_string(),
                    status.to_string(),
                    retry_count as i64,
                    opt_datetime(next_run_at.as_ref()),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn job(task_id: &str, priority: i32) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            task_id: task_id.to_string(),
            priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: 2,
            last_error: None,
            next_run_at: now,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn filter_upsert_and_lookup() {
        let db = backend().await;
        let filter = IngestionFilter {
            vendor: "VinSolutions".into(),
            from_address: Some("reports@vinsolutions.com".into()),
            subject_regex: Some(r"Daily Sales".into()),
            days_back: 3,
            file_pattern: r"\.csv$".into(),
            active: true,
            last_used: None,
        };
        db.upsert_filter(&filter).await.unwrap();

        let loaded = db.get_active_filter("VinSolutions").await.unwrap().unwrap();
        assert_eq!(
            loaded.from_address.as_deref(),
            Some("reports@vinsolutions.com")
        );
        assert_eq!(loaded.days_back, 3);
        assert!(loaded.last_used.is_none());

        db.touch_filter_last_used("VinSolutions", Utc::now())
            .await
            .unwrap();
        let stamped = db.get_active_filter("VinSolutions").await.unwrap().unwrap();
        assert!(stamped.last_used.is_some());

        // Inactive filters are invisible.
        let mut inactive = filter.clone();
        inactive.active = false;
        db.upsert_filter(&inactive).await.unwrap();
        assert!(db.get_active_filter("VinSolutions").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_priority_ordered() {
        let db = backend().await;
        db.insert_job(&job("low", 0)).await.unwrap();
        db.insert_job(&job("high", 10)).await.unwrap();

        let first = db.claim_due_job(Utc::now()).await.unwrap().unwrap();
        assert_eq!(first.task_id, "high");
        assert_eq!(first.status, JobStatus::Processing);

        let second = db.claim_due_job(Utc::now()).await.unwrap().unwrap();
        assert_eq!(second.task_id, "low");

        // Nothing left to claim.
        assert!(db.claim_due_job(Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn future_jobs_are_not_due() {
        let db = backend().await;
        let mut future = job("later", 0);
        future.next_run_at = Utc::now() + chrono::Duration::hours(1);
        db.insert_job(&future).await.unwrap();

        assert!(db.claim_due_job(Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_count_reflects_status() {
        let db = backend().await;
        db.insert_job(&job("a", 0)).await.unwrap();
        db.insert_job(&job("b", 0)).await.unwrap();
        assert_eq!(db.count_pending_jobs().await.unwrap(), 2);

        let claimed = db.claim_due_job(Utc::now()).await.unwrap().unwrap();
        assert_eq!(db.count_pending_jobs().await.unwrap(), 1);

        db.mark_job_completed(claimed.id, Utc::now()).await.unwrap();
        assert_eq!(db.count_pending_jobs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn workflow_lock_cycle() {
        let db = backend().await;
        let wf = Workflow::new(vec![], None);
        let id = wf.id;
        db.insert_workflow(&wf).await.unwrap();

        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(600);

        assert!(db.try_lock_workflow(id, now, stale).await.unwrap());
        // A second fresh lock attempt fails.
        assert!(!db.try_lock_workflow(id, now, stale).await.unwrap());

        db.unlock_workflow(id).await.unwrap();
        assert!(db.try_lock_workflow(id, now, stale).await.unwrap());

        // A stale lock (cutoff in the future) is reclaimable.
        let future_cutoff = now + chrono::Duration::seconds(1);
        assert!(db.try_lock_workflow(id, now, future_cutoff).await.unwrap());
    }

    #[tokio::test]
    async fn terminal_workflow_cannot_be_locked() {
        let db = backend().await;
        let mut wf = Workflow::new(vec![], None);
        wf.status = WorkflowStatus::Completed;
        let id = wf.id;
        db.insert_workflow(&wf).await.unwrap();

        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(600);
        assert!(!db.try_lock_workflow(id, now, stale).await.unwrap());
    }

    #[tokio::test]
    async fn workflow_roundtrip_preserves_steps_and_context() {
        let db = backend().await;
        let mut wf = Workflow::new(
            vec![WorkflowStep::new(
                "ingest",
                crate::workflow::model::StepType::EmailIngestion,
                "fetch reports",
                serde_json::json!({ "vendor": "VinSolutions" }),
            )],
            Some("dealer-42".into()),
        );
        wf.context.insert("seed".into(), serde_json::json!({ "n": 1 }));
        db.insert_workflow(&wf).await.unwrap();

        let loaded = db.get_workflow(wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.user_id.as_deref(), Some("dealer-42"));
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.steps[0].config["vendor"], "VinSolutions");
        assert_eq!(loaded.context["seed"]["n"], 1);
    }

    #[tokio::test]
    async fn email_log_dedup() {
        let db = backend().await;
        let entry = EmailLogEntry {
            id: Uuid::new_v4(),
            vendor: "VinSolutions".into(),
            message_id: "m1@vin".into(),
            subject: Some("Daily Sales".into()),
            from_address: Some("reports@vinsolutions.com".into()),
            attachment_count: 1,
            processed_at: Utc::now(),
        };
        assert!(!db.has_email_log("m1@vin").await.unwrap());
        db.insert_email_log(&entry).await.unwrap();
        assert!(db.has_email_log("m1@vin").await.unwrap());

        // Duplicate insert is ignored, not an error.
        let dup = EmailLogEntry {
            id: Uuid::new_v4(),
            ..entry
        };
        db.insert_email_log(&dup).await.unwrap();
    }

    #[tokio::test]
    async fn schedule_due_listing() {
        let db = backend().await;
        let mut due = Schedule::new("daily_sales_report", "VinSolutions", "0 0 6 * * *", None)
            .unwrap();
        due.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
        db.insert_schedule(&due).await.unwrap();

        let mut not_due =
            Schedule::new("weekly_leads", "DealerSocket", "0 0 7 * * 2", None).unwrap();
        not_due.next_run_at = Some(Utc::now() + chrono::Duration::hours(1));
        db.insert_schedule(&not_due).await.unwrap();

        let listed = db.list_due_schedules(Utc::now()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].intent, "daily_sales_report");
    }

    #[tokio::test]
    async fn health_upsert_replaces() {
        let db = backend().await;
        let record = HealthCheckRecord {
            component: "imap".into(),
            status: HealthStatus::Ok,
            response_time_ms: Some(120),
            last_checked: Utc::now(),
            message: Some("healthy".into()),
            details: serde_json::json!({}),
        };
        db.upsert_health_check(&record).await.unwrap();

        let errored = HealthCheckRecord {
            status: HealthStatus::Error,
            message: Some("connection refused".into()),
            ..record
        };
        db.upsert_health_check(&errored).await.unwrap();

        let all = db.list_health_checks().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, HealthStatus::Error);
    }

    #[tokio::test]
    async fn failed_email_roundtrip() {
        let db = backend().await;
        let failed = FailedEmail {
            id: Uuid::new_v4(),
            vendor: "VinSolutions".into(),
            message_id: Some("m9@vin".into()),
            subject: Some("Daily Sales".into()),
            from_address: Some("reports@vinsolutions.com".into()),
            received_date: Some(Utc::now()),
            error_message: "parse error".into(),
            error_stack: None,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            status: FailedEmailStatus::Failed,
            raw_content: "From: x\r\n\r\nbody".into(),
            created_at: Utc::now(),
        };
        db.insert_failed_email(&failed).await.unwrap();

        let loaded = db.get_failed_email(failed.id).await.unwrap().unwrap();
        assert_eq!(loaded.message_id.as_deref(), Some("m9@vin"));
        assert_eq!(loaded.status, FailedEmailStatus::Failed);
        assert!(loaded.next_retry_at.is_none());

        // Schedule a retry in the past → due.
        db.update_failed_email_retry(
            failed.id,
            1,
            Some(Utc::now() - chrono::Duration::minutes(1)),
            FailedEmailStatus::RetryScheduled,
        )
        .await
        .unwrap();
        let due = db.list_due_failed_retries(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(db.list_failed_emails("VinSolutions").await.unwrap().len(), 1);

        db.delete_failed_email(failed.id).await.unwrap();
        assert!(db.get_failed_email(failed.id).await.unwrap().is_none());
    }
}
