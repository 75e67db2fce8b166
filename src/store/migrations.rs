//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS imap_filters (
                vendor TEXT PRIMARY KEY,
                from_address TEXT,
                subject_regex TEXT,
                days_back INTEGER NOT NULL DEFAULT 7,
                file_pattern TEXT NOT NULL DEFAULT '\.csv$',
                active INTEGER NOT NULL DEFAULT 1,
                last_used TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_imap_filters_active ON imap_filters(active);

            CREATE TABLE IF NOT EXISTS failed_emails (
                id TEXT PRIMARY KEY,
                vendor TEXT NOT NULL,
                message_id TEXT,
                subject TEXT,
                from_address TEXT,
                received_date TEXT,
                error_message TEXT NOT NULL,
                error_stack TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                next_retry_at TEXT,
                status TEXT NOT NULL DEFAULT 'failed',
                raw_content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_failed_emails_status ON failed_emails(status);
            CREATE INDEX IF NOT EXISTS idx_failed_emails_next_retry ON failed_emails(next_retry_at);

            CREATE TABLE IF NOT EXISTS health_checks (
                component TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                response_time_ms INTEGER,
                last_checked TEXT NOT NULL,
                message TEXT,
                details TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 2,
                last_error TEXT,
                next_run_at TEXT NOT NULL,
                last_run_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status_due ON jobs(status, next_run_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_task ON jobs(task_id);

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                steps TEXT NOT NULL,
                current_step INTEGER NOT NULL DEFAULT 0,
                context TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'pending',
                last_error TEXT,
                locked INTEGER NOT NULL DEFAULT 0,
                locked_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status);
            CREATE INDEX IF NOT EXISTS idx_workflows_locked ON workflows(locked);

            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                workflow_id TEXT,
                intent TEXT NOT NULL,
                platform TEXT NOT NULL,
                cron TEXT NOT NULL,
                next_run_at TEXT,
                last_run_at TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                retry_count INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules(status, enabled, next_run_at);
            CREATE INDEX IF NOT EXISTS idx_schedules_workflow ON schedules(workflow_id);
        "#,
    },
    Migration {
        version: 2,
        name: "email_logs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS email_logs (
                id TEXT PRIMARY KEY,
                vendor TEXT NOT NULL,
                message_id TEXT NOT NULL UNIQUE,
                subject TEXT,
                from_address TEXT,
                attachment_count INTEGER NOT NULL DEFAULT 0,
                processed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_email_logs_vendor ON email_logs(vendor);
            CREATE INDEX IF NOT EXISTS idx_email_logs_message_id ON email_logs(message_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::info!(
        "Database migrations complete (at V{})",
        get_current_version(conn).await?
    );

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
