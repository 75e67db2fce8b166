//! Connectivity health tracking with throttled alerting.
//!
//! One `health_checks` row per monitored subsystem, upserted after every
//! probe or ingestion attempt. Error alerts fire only on a state change or
//! after the throttle window — repeated failures never storm the admin
//! inbox.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::alerts::{AdminAlert, AlertSeverity, AlertSink};
use crate::config::ImapConfig;
use crate::error::IngestError;
use crate::ingest::imap_client;
use crate::resilience::{AdmitOptions, CircuitBreaker, RateLimiter, RetryPolicy, retry};
use crate::store::Database;

/// Component key for the IMAP subsystem row.
pub const IMAP_COMPONENT: &str = "imap";

/// Minimum gap between repeat alerts for a component already in error.
const ALERT_THROTTLE: Duration = Duration::from_secs(15 * 60);

/// Health states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Warning,
    Error,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Ok => write!(f, "ok"),
            HealthStatus::Warning => write!(f, "warning"),
            HealthStatus::Error => write!(f, "error"),
        }
    }
}

impl FromStr for HealthStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(HealthStatus::Ok),
            "warning" => Ok(HealthStatus::Warning),
            "error" => Ok(HealthStatus::Error),
            other => Err(format!("unknown health status: {other}")),
        }
    }
}

/// Latest probe result for one subsystem (`health_checks` row).
#[derive(Debug, Clone)]
pub struct HealthCheckRecord {
    pub component: String,
    pub status: HealthStatus,
    pub response_time_ms: Option<u64>,
    pub last_checked: DateTime<Utc>,
    pub message: Option<String>,
    pub details: serde_json::Value,
}

/// Records probe results and throttles alerting.
pub struct HealthMonitor {
    db: Arc<dyn Database>,
    alerts: Arc<dyn AlertSink>,
    last_alert: Mutex<HashMap<String, Instant>>,
}

impl HealthMonitor {
    pub fn new(db: Arc<dyn Database>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            db,
            alerts,
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    /// Upsert a healthy record for a component.
    pub async fn record_ok(&self, component: &str, response_time: Duration, message: &str) {
        let record = HealthCheckRecord {
            component: component.to_string(),
            status: HealthStatus::Ok,
            response_time_ms: Some(response_time.as_millis() as u64),
            last_checked: Utc::now(),
            message: Some(message.to_string()),
            details: serde_json::json!({}),
        };
        if let Err(e) = self.db.upsert_health_check(&record).await {
            tracing::warn!(component = %component, "Failed to upsert health record: {e}");
        }
    }

    /// Upsert an error record and raise a throttled admin alert.
    pub async fn record_error(&self, component: &str, message: &str, details: serde_json::Value) {
        let previous = self.db.get_health_check(component).await.ok().flatten();

        let record = HealthCheckRecord {
            component: component.to_string(),
            status: HealthStatus::Error,
            response_time_ms: None,
            last_checked: Utc::now(),
            message: Some(message.to_string()),
            details: details.clone(),
        };
        if let Err(e) = self.db.upsert_health_check(&record).await {
            tracing::warn!(component = %component, "Failed to upsert health record: {e}");
        }

        if self.should_alert(component, previous.as_ref()) {
            self.alerts
                .send(AdminAlert {
                    title: format!("{component} connection failure"),
                    body: message.to_string(),
                    severity: AlertSeverity::Critical,
                    component: component.to_string(),
                    details,
                })
                .await;
        } else {
            tracing::debug!(component = %component, "Alert suppressed (throttled)");
        }
    }

    /// Alert on a state change, or when the throttle window has elapsed for
    /// a component already in error.
    fn should_alert(&self, component: &str, previous: Option<&HealthCheckRecord>) -> bool {
        let was_error = previous.is_some_and(|r| r.status == HealthStatus::Error);
        let mut last_alert = self.last_alert.lock().expect("alert mutex poisoned");
        let now = Instant::now();

        let fire = if was_error {
            last_alert
                .get(component)
                .is_none_or(|at| now.duration_since(*at) >= ALERT_THROTTLE)
        } else {
            true
        };

        if fire {
            last_alert.insert(component.to_string(), now);
        }
        fire
    }

    /// Latest record per subsystem, for dashboard/alerting consumers.
    pub async fn summary(&self) -> Result<Vec<HealthCheckRecord>, IngestError> {
        Ok(self.db.list_health_checks().await?)
    }
}

/// Probes IMAP connectivity through the same guarded stack as ingestion.
pub struct ImapHealthCheck {
    imap: ImapConfig,
    monitor: Arc<HealthMonitor>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry_policy: RetryPolicy,
}

impl ImapHealthCheck {
    pub fn new(
        imap: ImapConfig,
        monitor: Arc<HealthMonitor>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            imap,
            monitor,
            limiter,
            breaker,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Lightweight connect + open-inbox probe. Upserts the `imap` health row
    /// and returns whether the mailbox is reachable.
    pub async fn ping_connection(&self) -> bool {
        match self.guarded_probe().await {
            Ok(elapsed) => {
                self.monitor
                    .record_ok(IMAP_COMPONENT, elapsed, "IMAP connection healthy")
                    .await;
                true
            }
            Err(err) => {
                self.monitor
                    .record_error(
                        IMAP_COMPONENT,
                        &err.to_string(),
                        serde_json::json!({ "host": self.imap.host }),
                    )
                    .await;
                false
            }
        }
    }

    /// The probe body, behind the same limiter → breaker → retry stack as
    /// ingestion. Returns the measured connect/select round-trip time.
    async fn guarded_probe(&self) -> Result<Duration, IngestError> {
        self.limiter
            .execute(AdmitOptions::default(), move || async move {
                self.breaker
                    .execute(move || async move {
                        retry(
                            &self.retry_policy,
                            IngestError::is_retryable,
                            |err, attempt| {
                                tracing::warn!(attempt, "IMAP probe attempt failed: {err}");
                            },
                            move || {
                                let imap = self.imap.clone();
                                async move {
                                    tokio::task::spawn_blocking(move || imap_client::probe(&imap))
                                        .await
                                        .map_err(|e| {
                                            IngestError::Protocol(format!(
                                                "probe task panicked: {e}"
                                            ))
                                        })?
                                }
                            },
                        )
                        .await
                    })
                    .await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::store::LibSqlBackend;

    #[test]
    fn status_roundtrip() {
        for status in [HealthStatus::Ok, HealthStatus::Warning, HealthStatus::Error] {
            let parsed: HealthStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    struct CountingSink {
        sent: AtomicU32,
    }

    #[async_trait]
    impl AlertSink for CountingSink {
        async fn send(&self, _alert: AdminAlert) {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn monitor_with_sink() -> (HealthMonitor, Arc<CountingSink>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let sink = Arc::new(CountingSink {
            sent: AtomicU32::new(0),
        });
        (HealthMonitor::new(db, Arc::clone(&sink) as Arc<dyn AlertSink>), sink)
    }

    #[tokio::test]
    async fn repeated_errors_alert_once() {
        let (monitor, sink) = monitor_with_sink().await;

        monitor
            .record_error("imap", "connection refused", serde_json::json!({}))
            .await;
        assert_eq!(sink.sent.load(Ordering::SeqCst), 1);

        // Still in error, inside the throttle window — suppressed.
        monitor
            .record_error("imap", "connection refused", serde_json::json!({}))
            .await;
        monitor
            .record_error("imap", "connection refused", serde_json::json!({}))
            .await;
        assert_eq!(sink.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn state_change_alerts_again() {
        let (monitor, sink) = monitor_with_sink().await;

        monitor
            .record_error("imap", "connection refused", serde_json::json!({}))
            .await;
        monitor
            .record_ok("imap", std::time::Duration::from_millis(50), "recovered")
            .await;
        // Error after a healthy record is a state change — alert fires.
        monitor
            .record_error("imap", "connection refused again", serde_json::json!({}))
            .await;
        assert_eq!(sink.sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn summary_lists_latest_records() {
        let (monitor, _sink) = monitor_with_sink().await;
        monitor
            .record_ok("imap", std::time::Duration::from_millis(10), "healthy")
            .await;

        let summary = monitor.summary().await.unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].component, "imap");
        assert_eq!(summary[0].status, HealthStatus::Ok);
    }
}
