//! IMAP ingestion — fetch, deduplicate, and persist vendor report
//! attachments to disk.

pub mod engine;
pub mod failed_mail;
pub mod filters;
pub mod health;
pub mod imap_client;

use std::path::PathBuf;

use chrono::{DateTime, Utc};

pub use engine::{FetchOptions, IngestEngine};
pub use failed_mail::FailedMailArchive;
pub use filters::FilterRegistry;
pub use health::{HealthMonitor, ImapHealthCheck};

/// Extracted envelope for one processed message. Transient — only the
/// `email_logs` audit row is persisted.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    /// Server UID within the fetch session.
    pub id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
    /// Dedup key.
    pub message_id: String,
    pub vendor: String,
}

/// A decoded attachment. Transient.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
}

/// One successfully ingested message: files written plus its envelope.
#[derive(Debug, Clone)]
pub struct FetchedReport {
    pub file_paths: Vec<PathBuf>,
    pub metadata: EmailMessage,
}
