//! Admin alerting — fire-and-forget, failures logged never propagated.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use crate::config::AlertConfig;
use crate::error::AlertError;

/// Alert severity, rendered into the subject line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// An operator-facing alert.
#[derive(Debug, Clone)]
pub struct AdminAlert {
    pub title: String,
    pub body: String,
    pub severity: AlertSeverity,
    pub component: String,
    pub details: serde_json::Value,
}

/// Alert delivery target. `send` must never propagate failures.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: AdminAlert);
}

/// Default sink — alerts land in the log stream only.
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send(&self, alert: AdminAlert) {
        tracing::warn!(
            component = %alert.component,
            severity = %alert.severity,
            title = %alert.title,
            "ADMIN ALERT: {}", alert.body
        );
    }
}

/// SMTP sink — emails the admin address.
pub struct SmtpAlertSink {
    config: AlertConfig,
}

impl SmtpAlertSink {
    pub fn new(config: AlertConfig) -> Self {
        Self { config }
    }

    fn send_email(&self, alert: &AdminAlert) -> Result<(), AlertError> {
        let creds = Credentials::new(self.config.username.clone(), self.config.password.clone());

        let transport = SmtpTransport::relay(&self.config.smtp_host)
            .map_err(|e| AlertError::Send(format!("SMTP relay error: {e}")))?
            .port(self.config.smtp_port)
            .credentials(creds)
            .build();

        let subject = format!("[{}] {}", alert.severity, alert.title);
        let body = format!(
            "Component: {}\n\n{}\n\nDetails:\n{}",
            alert.component,
            alert.body,
            serde_json::to_string_pretty(&alert.details).unwrap_or_else(|_| "{}".to_string())
        );

        let email = Message::builder()
            .from(
                self.config
                    .from_address
                    .parse()
                    .map_err(|e| AlertError::Build(format!("Invalid from address: {e}")))?,
            )
            .to(self
                .config
                .admin_address
                .parse()
                .map_err(|e| AlertError::Build(format!("Invalid admin address: {e}")))?)
            .subject(subject)
            .body(body)
            .map_err(|e| AlertError::Build(format!("Failed to build email: {e}")))?;

        transport
            .send(&email)
            .map_err(|e| AlertError::Send(format!("SMTP send failed: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl AlertSink for SmtpAlertSink {
    async fn send(&self, alert: AdminAlert) {
        let title = alert.title.clone();
        let config_host = self.config.smtp_host.clone();
        // lettre's SmtpTransport is blocking — keep it off the async runtime.
        let sink = SmtpAlertSink {
            config: self.config.clone(),
        };
        let result = tokio::task::spawn_blocking(move || sink.send_email(&alert)).await;

        match result {
            Ok(Ok(())) => {
                tracing::info!(%title, "Admin alert sent");
            }
            Ok(Err(e)) => {
                tracing::error!(%title, host = %config_host, "Failed to send admin alert: {e}");
            }
            Err(e) => {
                tracing::error!(%title, "Admin alert task panicked: {e}");
            }
        }
    }
}
