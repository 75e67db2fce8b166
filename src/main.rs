use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dealerwatch::alerts::{AlertSink, SmtpAlertSink, TracingAlertSink};
use dealerwatch::collaborators::{
    ApiCaller, BrowserRunner, CollaboratorError, CrmPusher, CustomStepRunner, InsightGenerator,
    InsightResult, ParsedReport, ReportParser,
};
use dealerwatch::config::{
    AlertConfig, ImapConfig, IngestConfig, QueueConfig, SchedulerConfig, WorkflowConfig,
};
use dealerwatch::dispatch::WorkflowJobDispatcher;
use dealerwatch::ingest::{HealthMonitor, ImapHealthCheck, IngestEngine};
use dealerwatch::queue::{JobQueue, WorkerPool, spawn_worker_pool};
use dealerwatch::resilience::{BreakerConfig, BreakerRegistry, LimiterConfig, LimiterRegistry};
use dealerwatch::scheduler::{Scheduler, spawn_scheduler_ticker};
use dealerwatch::store::{Database, LibSqlBackend};
use dealerwatch::workflow::{StepHandlerSet, WorkflowEngine};

/// Collaborators are injected by the deployment; the bare daemon fails the
/// corresponding steps with a clear message until they are wired in.
struct UnconfiguredCollaborator(&'static str);

#[async_trait::async_trait]
impl ReportParser for UnconfiguredCollaborator {
    async fn parse(
        &self,
        _file_path: &Path,
        _vendor: &str,
        _report_type: &str,
    ) -> Result<ParsedReport, CollaboratorError> {
        Err(CollaboratorError(format!("{} not configured", self.0)))
    }
}

#[async_trait::async_trait]
impl InsightGenerator for UnconfiguredCollaborator {
    async fn generate(
        &self,
        _records: &[serde_json::Value],
        _platform: &str,
        _options: &serde_json::Value,
    ) -> Result<InsightResult, CollaboratorError> {
        Err(CollaboratorError(format!("{} not configured", self.0)))
    }
}

#[async_trait::async_trait]
impl CrmPusher for UnconfiguredCollaborator {
    async fn push(
        &self,
        _action: &str,
        _payload: &serde_json::Value,
    ) -> Result<serde_json::Value, CollaboratorError> {
        Err(CollaboratorError(format!("{} not configured", self.0)))
    }
}

#[async_trait::async_trait]
impl ApiCaller for UnconfiguredCollaborator {
    async fn call(
        &self,
        _endpoint: &str,
        _method: &str,
        _payload: &serde_json::Value,
    ) -> Result<serde_json::Value, CollaboratorError> {
        Err(CollaboratorError(format!("{} not configured", self.0)))
    }
}

#[async_trait::async_trait]
impl BrowserRunner for UnconfiguredCollaborator {
    async fn run(
        &self,
        _action: &str,
        _params: &serde_json::Value,
    ) -> Result<serde_json::Value, CollaboratorError> {
        Err(CollaboratorError(format!("{} not configured", self.0)))
    }
}

#[async_trait::async_trait]
impl CustomStepRunner for UnconfiguredCollaborator {
    async fn run(
        &self,
        _name: &str,
        _config: &serde_json::Value,
        _context: &serde_json::Value,
    ) -> Result<serde_json::Value, CollaboratorError> {
        Err(CollaboratorError(format!("{} not configured", self.0)))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    init_tracing();

    let imap = ImapConfig::from_env().unwrap_or_else(|| {
        eprintln!("Error: DEALERWATCH_IMAP_HOST not set");
        eprintln!("  export DEALERWATCH_IMAP_HOST=imap.example.com");
        std::process::exit(1);
    });
    let ingest_config = IngestConfig::from_env();
    let queue_config = QueueConfig::from_env();
    let workflow_config = WorkflowConfig::from_env();
    let scheduler_config = SchedulerConfig::from_env();

    eprintln!("dealerwatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   IMAP: {}:{}", imap.host, imap.port);
    eprintln!("   Downloads: {}", ingest_config.download_dir);

    // ── Database ────────────────────────────────────────────────────
    let db_path = std::env::var("DEALERWATCH_DB_PATH")
        .unwrap_or_else(|_| "./data/dealerwatch.db".to_string());
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {db_path}: {e}");
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {db_path}");

    // ── Alerting ────────────────────────────────────────────────────
    let alerts: Arc<dyn AlertSink> = match AlertConfig::from_env() {
        Some(config) => Arc::new(SmtpAlertSink::new(config)),
        None => Arc::new(TracingAlertSink),
    };

    // ── Resilience registries ───────────────────────────────────────
    let alert_observer = Arc::clone(&alerts);
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()).with_observer(
        Arc::new(move |operation: &str, from, to| {
            let alerts = Arc::clone(&alert_observer);
            let operation = operation.to_string();
            tokio::spawn(async move {
                alerts
                    .send(dealerwatch::alerts::AdminAlert {
                        title: format!("Circuit breaker {operation}: {from} -> {to}"),
                        body: format!("Operation '{operation}' moved from {from} to {to}"),
                        severity: dealerwatch::alerts::AlertSeverity::Warning,
                        component: operation.clone(),
                        details: serde_json::json!({}),
                    })
                    .await;
            });
        }),
    ));
    let limiters = Arc::new(LimiterRegistry::new(LimiterConfig::default()));

    // The health probe shares the ingestion operation's guards.
    let imap_limiter = limiters.limiter("imap");
    let imap_breaker = breakers.breaker("imap");

    // ── Ingestion ───────────────────────────────────────────────────
    let health = Arc::new(HealthMonitor::new(Arc::clone(&db), Arc::clone(&alerts)));
    let engine = Arc::new(IngestEngine::new(
        imap.clone(),
        ingest_config.clone(),
        Arc::clone(&db),
        Arc::clone(&health),
        Arc::clone(&imap_limiter),
        Arc::clone(&imap_breaker),
    ));

    // ── Workflow engine ─────────────────────────────────────────────
    let handlers = Arc::new(StepHandlerSet::new(
        Arc::clone(&engine),
        PathBuf::from(&ingest_config.download_dir),
        Arc::new(UnconfiguredCollaborator("report parser")),
        Arc::new(UnconfiguredCollaborator("insight generator")),
        Arc::new(UnconfiguredCollaborator("CRM pusher")),
        Arc::new(UnconfiguredCollaborator("API caller")),
        Arc::new(UnconfiguredCollaborator("browser runner")),
        Arc::new(UnconfiguredCollaborator("custom step runner")),
    ));
    let workflows = Arc::new(WorkflowEngine::new(
        Arc::clone(&db),
        handlers,
        workflow_config,
    ));

    // Startup recovery: locks abandoned by a crashed process.
    match workflows.recover_stale_locks().await {
        Ok(0) => {}
        Ok(n) => eprintln!("   Recovered {n} stale workflow lock(s)"),
        Err(e) => tracing::error!("Stale lock recovery failed: {e}"),
    }

    // ── Queue, scheduler, workers ───────────────────────────────────
    let queue = Arc::new(JobQueue::new(Arc::clone(&db), queue_config.clone()));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&db),
        Arc::clone(&queue),
        Arc::clone(&workflows),
        scheduler_config.clone(),
    ));
    let dispatcher = Arc::new(WorkflowJobDispatcher::new(
        Arc::clone(&workflows),
        Arc::clone(&scheduler),
    ));

    let pool = WorkerPool::new(Arc::clone(&queue), dispatcher, queue_config);
    let (worker_handle, worker_shutdown) = spawn_worker_pool(pool);
    let (scheduler_handle, scheduler_shutdown) =
        spawn_scheduler_ticker(Arc::clone(&scheduler), scheduler_config.poll_interval);

    // Periodic connectivity probe.
    let health_check = ImapHealthCheck::new(imap, health, imap_limiter, imap_breaker);
    let ping_handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(300));
        tick.tick().await;
        loop {
            tick.tick().await;
            health_check.ping_connection().await;
        }
    });

    tracing::info!("dealerwatch running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    worker_shutdown.store(true, Ordering::Relaxed);
    scheduler_shutdown.store(true, Ordering::Relaxed);
    ping_handle.abort();
    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        let _ = worker_handle.await;
        let _ = scheduler_handle.await;
    })
    .await;

    Ok(())
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match std::env::var("DEALERWATCH_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "dealerwatch.log");
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(appender)
                .with_ansi(false)
                .with_target(false)
                .init();
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
    }
}
