//! Error types for dealerwatch.

use uuid::Uuid;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Ingestion-related errors.
///
/// `ReportNotFound` is an expected outcome (empty mailbox, nothing matched)
/// and is classified as terminal by the retry policy — it must not burn the
/// retry budget or count toward circuit-breaker trips.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("No matching report emails found for vendor {vendor}")]
    ReportNotFound { vendor: String },

    #[error("Rate limit exceeded for operation {operation}")]
    RateLimitExceeded { operation: String },

    #[error("Operation {operation} paused: {reason}")]
    Paused { operation: String, reason: String },

    #[error("Circuit breaker open for operation {operation}")]
    CircuitOpen { operation: String },

    #[error("Backpressure: {pending} pending jobs exceeds limit {limit}")]
    Backpressure { pending: u64, limit: u64 },

    #[error("IMAP connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("IMAP authentication failed for {username}")]
    Auth { username: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("Failed to process message {message_id}: {reason}")]
    MessageProcessing { message_id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Whether the retry policy should re-attempt after this error.
    ///
    /// Connection, protocol, and IO failures are transient; everything else
    /// (not-found, rate-limit, backpressure, open breaker, auth) is terminal
    /// for the current run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::Connection { .. } | IngestError::Protocol(_) | IngestError::Io(_)
        )
    }

    /// Whether this error counts as a failure signal for the circuit breaker.
    pub fn counts_as_breaker_failure(&self) -> bool {
        !matches!(self, IngestError::ReportNotFound { .. })
    }
}

/// Job queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} is in state {state}, expected {expected}")]
    InvalidState {
        id: Uuid,
        state: String,
        expected: String,
    },

    #[error("Job {id} failed terminally after {attempts} attempts: {reason}")]
    Terminal {
        id: Uuid,
        attempts: u32,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Workflow engine errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow {id} not found")]
    NotFound { id: Uuid },

    #[error("Workflow {id} has no step at index {index}")]
    StepOutOfRange { id: Uuid, index: usize },

    #[error("Step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Invalid config for step '{step}': {reason}")]
    InvalidStepConfig { step: String, reason: String },

    #[error("Workflow {id} step '{step}' exhausted {max_retries} retries: {reason}")]
    RetriesExhausted {
        id: Uuid,
        step: String,
        max_retries: u32,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),
}

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Schedule {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Schedule {id} is disabled")]
    Disabled { id: Uuid },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Alert delivery errors. Never propagated past the sink — logged only.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("Failed to build alert message: {0}")]
    Build(String),

    #[error("Failed to send alert: {0}")]
    Send(String),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_not_found_is_terminal() {
        let err = IngestError::ReportNotFound {
            vendor: "VinSolutions".into(),
        };
        assert!(!err.is_retryable());
        assert!(!err.counts_as_breaker_failure());
    }

    #[test]
    fn connection_error_is_retryable() {
        let err = IngestError::Connection {
            host: "imap.example.com".into(),
            reason: "connection refused".into(),
        };
        assert!(err.is_retryable());
        assert!(err.counts_as_breaker_failure());
    }

    #[test]
    fn rate_limit_is_not_retryable() {
        let err = IngestError::RateLimitExceeded {
            operation: "imap_fetch".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn errors_convert_to_top_level() {
        let err: Error = DatabaseError::Query("boom".into()).into();
        assert!(matches!(err, Error::Database(_)));
    }
}
