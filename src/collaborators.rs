//! External collaborator interfaces.
//!
//! Report parsing, insight generation, CRM pushes, API calls, and browser
//! automation are separate engines; this crate consumes them through these
//! traits and validates step configs at the boundary.

use std::path::Path;

use async_trait::async_trait;

/// Failure inside an external collaborator, surfaced as a step failure.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

/// A parsed report file.
#[derive(Debug, Clone)]
pub struct ParsedReport {
    pub id: String,
    pub records: Vec<serde_json::Value>,
    pub record_count: usize,
}

/// Per-format report parser (CSV/XLSX/PDF engines live elsewhere).
#[async_trait]
pub trait ReportParser: Send + Sync {
    async fn parse(
        &self,
        file_path: &Path,
        vendor: &str,
        report_type: &str,
    ) -> Result<ParsedReport, CollaboratorError>;
}

/// Generated insight over parsed records.
#[derive(Debug, Clone)]
pub struct InsightResult {
    pub insight_id: String,
    pub insight: serde_json::Value,
    pub metadata: serde_json::Value,
}

/// Insight-generation engine.
#[async_trait]
pub trait InsightGenerator: Send + Sync {
    async fn generate(
        &self,
        records: &[serde_json::Value],
        platform: &str,
        options: &serde_json::Value,
    ) -> Result<InsightResult, CollaboratorError>;
}

/// CRM-side actions (push records, update leads).
#[async_trait]
pub trait CrmPusher: Send + Sync {
    async fn push(
        &self,
        action: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, CollaboratorError>;
}

/// Outbound API calls made on behalf of a workflow step.
#[async_trait]
pub trait ApiCaller: Send + Sync {
    async fn call(
        &self,
        endpoint: &str,
        method: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, CollaboratorError>;
}

/// Browser automation runner.
#[async_trait]
pub trait BrowserRunner: Send + Sync {
    async fn run(
        &self,
        action: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, CollaboratorError>;
}

/// Escape hatch for deployment-specific steps.
#[async_trait]
pub trait CustomStepRunner: Send + Sync {
    async fn run(
        &self,
        name: &str,
        config: &serde_json::Value,
        context: &serde_json::Value,
    ) -> Result<serde_json::Value, CollaboratorError>;
}
