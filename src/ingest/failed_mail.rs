//! Failed-message archive.
//!
//! A per-message processing error never aborts the batch — the raw message
//! is archived here with its error, and an operator loop can replay it
//! later. Retries are budgeted: once `retry_count` reaches `max_retries`
//! the row stays terminal and no further `next_retry_at` is scheduled.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::error::{DatabaseError, IngestError};
use crate::ingest::EmailMessage;
use crate::store::Database;

/// Default retry budget for an archived message.
const DEFAULT_MAX_RETRIES: u32 = 3;
/// Base delay for the retry schedule; doubles per attempt.
const RETRY_BASE_MINUTES: i64 = 15;

/// Archive row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedEmailStatus {
    /// Archived, no retry scheduled.
    Failed,
    /// A reprocessing attempt is scheduled at `next_retry_at`.
    RetryScheduled,
}

impl std::fmt::Display for FailedEmailStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailedEmailStatus::Failed => write!(f, "failed"),
            FailedEmailStatus::RetryScheduled => write!(f, "retry_scheduled"),
        }
    }
}

impl FromStr for FailedEmailStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "failed" => Ok(FailedEmailStatus::Failed),
            "retry_scheduled" => Ok(FailedEmailStatus::RetryScheduled),
            other => Err(format!("unknown failed email status: {other}")),
        }
    }
}

/// An unprocessable email (`failed_emails` row).
#[derive(Debug, Clone)]
pub struct FailedEmail {
    pub id: Uuid,
    pub vendor: String,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from_address: Option<String>,
    pub received_date: Option<DateTime<Utc>>,
    pub error_message: String,
    pub error_stack: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: FailedEmailStatus,
    pub raw_content: String,
    pub created_at: DateTime<Utc>,
}

impl FailedEmail {
    /// Whether another retry may be scheduled.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Persists and schedules retries for unprocessable emails.
pub struct FailedMailArchive {
    db: Arc<dyn Database>,
}

impl FailedMailArchive {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Archive a message that failed processing. Returns the archive row id.
    pub async fn archive(
        &self,
        vendor: &str,
        message: Option<&EmailMessage>,
        raw_content: &[u8],
        error: &IngestError,
    ) -> Result<Uuid, DatabaseError> {
        let failed = FailedEmail {
            id: Uuid::new_v4(),
            vendor: vendor.to_string(),
            message_id: message.map(|m| m.message_id.clone()),
            subject: message.map(|m| m.subject.clone()),
            from_address: message.map(|m| m.from.clone()),
            received_date: message.and_then(|m| m.date),
            error_message: error.to_string(),
            error_stack: Some(format!("{error:?}")),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            next_retry_at: None,
            status: FailedEmailStatus::Failed,
            raw_content: String::from_utf8_lossy(raw_content).into_owned(),
            created_at: Utc::now(),
        };

        self.db.insert_failed_email(&failed).await?;
        tracing::warn!(
            vendor = %vendor,
            archive_id = %failed.id,
            message_id = failed.message_id.as_deref().unwrap_or("(none)"),
            "Archived unprocessable email: {}", failed.error_message
        );
        Ok(failed.id)
    }

    /// Schedule the next reprocessing attempt for an archived message.
    ///
    /// Returns `false` when the retry budget is exhausted — the row stays
    /// terminal and `next_retry_at` is left unset.
    pub async fn schedule_retry(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let Some(failed) = self.db.get_failed_email(id).await? else {
            return Err(DatabaseError::NotFound {
                entity: "failed_email".to_string(),
                id: id.to_string(),
            });
        };

        if !failed.has_retry_budget() {
            self.db
                .update_failed_email_retry(id, failed.retry_count, None, FailedEmailStatus::Failed)
                .await?;
            return Ok(false);
        }

        let retry_count = failed.retry_count + 1;
        let next_retry_at = next_retry_time(retry_count, Utc::now());
        self.db
            .update_failed_email_retry(
                id,
                retry_count,
                Some(next_retry_at),
                FailedEmailStatus::RetryScheduled,
            )
            .await?;
        Ok(true)
    }

    /// Archived messages due for reprocessing.
    pub async fn due_retries(&self, now: DateTime<Utc>) -> Result<Vec<FailedEmail>, DatabaseError> {
        self.db.list_due_failed_retries(now).await
    }

    /// Remove an archived message after successful reprocessing.
    pub async fn resolve(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.db.delete_failed_email(id).await
    }
}

/// Doubling backoff from a 15-minute base, with up to a minute of jitter so
/// a batch of archived messages doesn't retry in lockstep.
fn next_retry_time(retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let exponent = retry_count.saturating_sub(1).min(8);
    let delay = Duration::minutes(RETRY_BASE_MINUTES << exponent);
    let jitter = Duration::seconds(rand::thread_rng().gen_range(0..60));
    now + delay + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [FailedEmailStatus::Failed, FailedEmailStatus::RetryScheduled] {
            let parsed: FailedEmailStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn retry_budget() {
        let mut failed = FailedEmail {
            id: Uuid::new_v4(),
            vendor: "VinSolutions".into(),
            message_id: None,
            subject: None,
            from_address: None,
            received_date: None,
            error_message: "parse error".into(),
            error_stack: None,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            status: FailedEmailStatus::Failed,
            raw_content: String::new(),
            created_at: Utc::now(),
        };
        assert!(failed.has_retry_budget());
        failed.retry_count = 3;
        assert!(!failed.has_retry_budget());
    }

    #[test]
    fn retry_delays_double() {
        let now = Utc::now();
        let first = next_retry_time(1, now) - now;
        let second = next_retry_time(2, now) - now;
        let third = next_retry_time(3, now) - now;

        // 15m, 30m, 60m — each within the minute of jitter.
        assert!(first >= Duration::minutes(15) && first < Duration::minutes(16));
        assert!(second >= Duration::minutes(30) && second < Duration::minutes(31));
        assert!(third >= Duration::minutes(60) && third < Duration::minutes(61));
    }
}
