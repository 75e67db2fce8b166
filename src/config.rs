//! Configuration types, built from environment variables.

use std::time::Duration;

/// IMAP mailbox connection settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Bounded connect/read timeout for the blocking IMAP socket.
    pub auth_timeout: Duration,
}

impl ImapConfig {
    /// Build config from environment variables.
    /// Returns `None` if `DEALERWATCH_IMAP_HOST` is not set (ingestion disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("DEALERWATCH_IMAP_HOST").ok()?;

        let port: u16 = std::env::var("DEALERWATCH_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let username = std::env::var("DEALERWATCH_IMAP_USERNAME").unwrap_or_default();
        let password = std::env::var("DEALERWATCH_IMAP_PASSWORD").unwrap_or_default();

        let auth_timeout_secs: u64 = std::env::var("DEALERWATCH_IMAP_AUTH_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Some(Self {
            host,
            port,
            username,
            password,
            auth_timeout: Duration::from_secs(auth_timeout_secs),
        })
    }
}

/// Ingestion engine settings.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Directory report attachments are written to.
    pub download_dir: String,
    /// Messages are processed in batches of this size.
    pub batch_size: usize,
    /// Mark processed messages `\Seen` (best-effort).
    pub mark_seen: bool,
    /// Pending-job count above which ingestion applies backpressure.
    pub max_queue_size: u64,
    /// Whether the backpressure check runs at all.
    pub backpressure_enabled: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            download_dir: "./downloads".to_string(),
            batch_size: 20,
            mark_seen: true,
            max_queue_size: 100,
            backpressure_enabled: true,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            download_dir: std::env::var("DEALERWATCH_DOWNLOAD_DIR")
                .unwrap_or(defaults.download_dir),
            batch_size: env_parse("DEALERWATCH_INGEST_BATCH_SIZE", defaults.batch_size),
            mark_seen: env_parse("DEALERWATCH_MARK_SEEN", defaults.mark_seen),
            max_queue_size: env_parse("DEALERWATCH_MAX_QUEUE_SIZE", defaults.max_queue_size),
            backpressure_enabled: env_parse(
                "DEALERWATCH_BACKPRESSURE_ENABLED",
                defaults.backpressure_enabled,
            ),
        }
    }
}

/// Job queue / worker pool settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum jobs executing concurrently.
    pub concurrency: usize,
    /// Maximum job starts per second.
    pub starts_per_second: u32,
    /// How often the worker pool polls for due jobs.
    pub poll_interval: Duration,
    /// Default attempt budget for new jobs.
    pub max_attempts: u32,
    /// Base delay for the failed-job backoff schedule.
    pub backoff_base: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            starts_per_second: 2,
            poll_interval: Duration::from_secs(5),
            max_attempts: 2,
            backoff_base: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            concurrency: env_parse("DEALERWATCH_WORKER_CONCURRENCY", defaults.concurrency),
            starts_per_second: env_parse(
                "DEALERWATCH_WORKER_STARTS_PER_SEC",
                defaults.starts_per_second,
            ),
            poll_interval: Duration::from_secs(env_parse(
                "DEALERWATCH_WORKER_POLL_SECS",
                defaults.poll_interval.as_secs(),
            )),
            max_attempts: env_parse("DEALERWATCH_JOB_MAX_ATTEMPTS", defaults.max_attempts),
            backoff_base: Duration::from_secs(env_parse(
                "DEALERWATCH_JOB_BACKOFF_SECS",
                defaults.backoff_base.as_secs(),
            )),
        }
    }
}

/// Workflow engine settings.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// A persisted lock older than this is stale and reclaimable.
    pub lock_lease: Duration,
    /// Base delay for step retry backoff (scaled by the step's backoff factor).
    pub step_retry_base: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            lock_lease: Duration::from_secs(600),
            step_retry_base: Duration::from_secs(1),
        }
    }
}

impl WorkflowConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            lock_lease: Duration::from_secs(env_parse(
                "DEALERWATCH_WORKFLOW_LOCK_LEASE_SECS",
                defaults.lock_lease.as_secs(),
            )),
            step_retry_base: Duration::from_secs(env_parse(
                "DEALERWATCH_STEP_RETRY_BASE_SECS",
                defaults.step_retry_base.as_secs(),
            )),
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the scheduler polls for due schedules.
    pub poll_interval: Duration,
    /// Consecutive run failures before a schedule is marked failed.
    pub failure_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            failure_threshold: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: Duration::from_secs(env_parse(
                "DEALERWATCH_SCHEDULER_POLL_SECS",
                defaults.poll_interval.as_secs(),
            )),
            failure_threshold: env_parse(
                "DEALERWATCH_SCHEDULE_FAILURE_THRESHOLD",
                defaults.failure_threshold,
            ),
        }
    }
}

/// Admin alert (SMTP) settings.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
    pub admin_address: String,
}

impl AlertConfig {
    /// Returns `None` if `DEALERWATCH_SMTP_HOST` is not set (alerts go to logs only).
    pub fn from_env() -> Option<Self> {
        let smtp_host = std::env::var("DEALERWATCH_SMTP_HOST").ok()?;

        let smtp_port: u16 = std::env::var("DEALERWATCH_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("DEALERWATCH_SMTP_USERNAME").unwrap_or_default();
        let password = std::env::var("DEALERWATCH_SMTP_PASSWORD").unwrap_or_default();
        let from_address =
            std::env::var("DEALERWATCH_ALERT_FROM").unwrap_or_else(|_| username.clone());
        let admin_address = std::env::var("DEALERWATCH_ALERT_TO").unwrap_or_else(|_| from_address.clone());

        Some(Self {
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            admin_address,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_defaults() {
        let cfg = IngestConfig::default();
        assert_eq!(cfg.batch_size, 20);
        assert_eq!(cfg.max_queue_size, 100);
        assert!(cfg.backpressure_enabled);
        assert!(cfg.mark_seen);
    }

    #[test]
    fn queue_defaults() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.concurrency, 2);
        assert_eq!(cfg.max_attempts, 2);
    }

    #[test]
    fn workflow_lease_default() {
        let cfg = WorkflowConfig::default();
        assert_eq!(cfg.lock_lease.as_secs(), 600);
    }

    #[test]
    fn imap_config_none_without_host() {
        // SAFETY: tests touching this var do not run concurrently with readers.
        unsafe { std::env::remove_var("DEALERWATCH_IMAP_HOST") };
        assert!(ImapConfig::from_env().is_none());
    }
}
