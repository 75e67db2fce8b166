//! Step execution — closed dispatch over the `StepType` vocabulary.
//!
//! Each variant owns a typed config shape, deserialized (and therefore
//! validated) at the boundary before any collaborator is invoked. The
//! `emailIngestion` step is the only one implemented in this crate; the
//! rest delegate to injected collaborator traits.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::collaborators::{
    ApiCaller, BrowserRunner, CollaboratorError, CrmPusher, CustomStepRunner, InsightGenerator,
    ReportParser,
};
use crate::error::WorkflowError;
use crate::ingest::{FetchOptions, IngestEngine};
use crate::workflow::model::{LAST_STEP_RESULT_KEY, StepType, WorkflowStep};

/// Executes one workflow step against the accumulated context.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        step: &WorkflowStep,
        context: &serde_json::Map<String, Value>,
    ) -> Result<Value, WorkflowError>;
}

// ── Typed step configs ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EmailIngestionConfig {
    vendor: String,
    #[serde(default)]
    download_dir: Option<PathBuf>,
    #[serde(default)]
    mark_seen: Option<bool>,
    #[serde(default)]
    batch_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct DataProcessingConfig {
    vendor: String,
    report_type: String,
    /// Explicit file list; defaults to the previous step's `filePaths`.
    #[serde(default)]
    file_paths: Option<Vec<PathBuf>>,
}

#[derive(Debug, Deserialize)]
struct InsightGenerationConfig {
    platform: String,
    #[serde(default)]
    options: Value,
}

#[derive(Debug, Deserialize)]
struct CrmConfig {
    action: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct ApiConfig {
    endpoint: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    payload: Value,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Deserialize)]
struct BrowserConfig {
    action: String,
    #[serde(default)]
    params: Value,
}

// ── Handler set ─────────────────────────────────────────────────────

/// The production step handlers.
pub struct StepHandlerSet {
    ingest: Arc<IngestEngine>,
    default_download_dir: PathBuf,
    parser: Arc<dyn ReportParser>,
    insights: Arc<dyn InsightGenerator>,
    crm: Arc<dyn CrmPusher>,
    api: Arc<dyn ApiCaller>,
    browser: Arc<dyn BrowserRunner>,
    custom: Arc<dyn CustomStepRunner>,
}

impl StepHandlerSet {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ingest: Arc<IngestEngine>,
        default_download_dir: PathBuf,
        parser: Arc<dyn ReportParser>,
        insights: Arc<dyn InsightGenerator>,
        crm: Arc<dyn CrmPusher>,
        api: Arc<dyn ApiCaller>,
        browser: Arc<dyn BrowserRunner>,
        custom: Arc<dyn CustomStepRunner>,
    ) -> Self {
        Self {
            ingest,
            default_download_dir,
            parser,
            insights,
            crm,
            api,
            browser,
            custom,
        }
    }

    fn parse_config<T: serde::de::DeserializeOwned>(
        step: &WorkflowStep,
    ) -> Result<T, WorkflowError> {
        serde_json::from_value(step.config.clone()).map_err(|e| WorkflowError::InvalidStepConfig {
            step: step.name.clone(),
            reason: e.to_string(),
        })
    }

    async fn run_email_ingestion(
        &self,
        step: &WorkflowStep,
    ) -> Result<Value, WorkflowError> {
        let config: EmailIngestionConfig = Self::parse_config(step)?;
        let download_dir = config
            .download_dir
            .unwrap_or_else(|| self.default_download_dir.clone());

        let reports = self
            .ingest
            .fetch_reports(
                &config.vendor,
                &download_dir,
                FetchOptions {
                    mark_seen: config.mark_seen,
                    batch_size: config.batch_size,
                },
            )
            .await?;

        let file_paths: Vec<String> = reports
            .iter()
            .flat_map(|r| r.file_paths.iter().map(|p| p.display().to_string()))
            .collect();
        let messages: Vec<Value> = reports
            .iter()
            .map(|r| {
                serde_json::json!({
                    "messageId": r.metadata.message_id,
                    "subject": r.metadata.subject,
                    "from": r.metadata.from,
                })
            })
            .collect();

        Ok(serde_json::json!({
            "vendor": config.vendor,
            "filePaths": file_paths,
            "messages": messages,
            "reportCount": reports.len(),
        }))
    }

    async fn run_data_processing(
        &self,
        step: &WorkflowStep,
        context: &serde_json::Map<String, Value>,
    ) -> Result<Value, WorkflowError> {
        let config: DataProcessingConfig = Self::parse_config(step)?;

        let file_paths: Vec<PathBuf> = match config.file_paths {
            Some(paths) => paths,
            None => file_paths_from_context(context).ok_or_else(|| {
                WorkflowError::InvalidStepConfig {
                    step: step.name.clone(),
                    reason: "no file_paths configured and no filePaths in context".to_string(),
                }
            })?,
        };

        let mut report_ids = Vec::new();
        let mut records = Vec::new();
        for path in &file_paths {
            let parsed = self
                .parser
                .parse(path, &config.vendor, &config.report_type)
                .await
                .map_err(|e| step_failed(step, &e))?;
            report_ids.push(parsed.id);
            records.extend(parsed.records);
        }

        Ok(serde_json::json!({
            "reportIds": report_ids,
            "recordCount": records.len(),
            "records": records,
        }))
    }

    async fn run_insight_generation(
        &self,
        step: &WorkflowStep,
        context: &serde_json::Map<String, Value>,
    ) -> Result<Value, WorkflowError> {
        let config: InsightGenerationConfig = Self::parse_config(step)?;

        let records = records_from_context(context).ok_or_else(|| {
            WorkflowError::InvalidStepConfig {
                step: step.name.clone(),
                reason: "no records in context — run a dataProcessing step first".to_string(),
            }
        })?;

        let result = self
            .insights
            .generate(&records, &config.platform, &config.options)
            .await
            .map_err(|e| step_failed(step, &e))?;

        Ok(serde_json::json!({
            "insightId": result.insight_id,
            "insight": result.insight,
            "metadata": result.metadata,
        }))
    }
}

#[async_trait]
impl StepExecutor for StepHandlerSet {
    async fn execute(
        &self,
        step: &WorkflowStep,
        context: &serde_json::Map<String, Value>,
    ) -> Result<Value, WorkflowError> {
        match step.step_type {
            StepType::EmailIngestion => self.run_email_ingestion(step).await,
            StepType::DataProcessing => self.run_data_processing(step, context).await,
            StepType::InsightGeneration => self.run_insight_generation(step, context).await,
            StepType::Crm => {
                let config: CrmConfig = Self::parse_config(step)?;
                self.crm
                    .push(&config.action, &config.payload)
                    .await
                    .map_err(|e| step_failed(step, &e))
            }
            StepType::Api => {
                let config: ApiConfig = Self::parse_config(step)?;
                self.api
                    .call(&config.endpoint, &config.method, &config.payload)
                    .await
                    .map_err(|e| step_failed(step, &e))
            }
            StepType::BrowserAction => {
                let config: BrowserConfig = Self::parse_config(step)?;
                self.browser
                    .run(&config.action, &config.params)
                    .await
                    .map_err(|e| step_failed(step, &e))
            }
            StepType::Custom => self
                .custom
                .run(&step.name, &step.config, &Value::Object(context.clone()))
                .await
                .map_err(|e| step_failed(step, &e)),
        }
    }
}

fn step_failed(step: &WorkflowStep, err: &CollaboratorError) -> WorkflowError {
    WorkflowError::StepFailed {
        step: step.name.clone(),
        reason: err.to_string(),
    }
}

/// `filePaths` array from the previous step's output.
fn file_paths_from_context(context: &serde_json::Map<String, Value>) -> Option<Vec<PathBuf>> {
    let paths = context
        .get(LAST_STEP_RESULT_KEY)?
        .get("filePaths")?
        .as_array()?;
    Some(
        paths
            .iter()
            .filter_map(|v| v.as_str().map(PathBuf::from))
            .collect(),
    )
}

/// `records` array from the previous step's output.
fn records_from_context(context: &serde_json::Map<String, Value>) -> Option<Vec<Value>> {
    Some(
        context
            .get(LAST_STEP_RESULT_KEY)?
            .get("records")?
            .as_array()?
            .clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_ingestion_config_requires_vendor() {
        let step = WorkflowStep::new(
            "ingest",
            StepType::EmailIngestion,
            "fetch",
            serde_json::json!({}),
        );
        let result: Result<EmailIngestionConfig, _> = StepHandlerSet::parse_config(&step);
        assert!(result.is_err());
    }

    #[test]
    fn email_ingestion_config_parses() {
        let step = WorkflowStep::new(
            "ingest",
            StepType::EmailIngestion,
            "fetch",
            serde_json::json!({ "vendor": "VinSolutions", "mark_seen": false }),
        );
        let config: EmailIngestionConfig = StepHandlerSet::parse_config(&step).unwrap();
        assert_eq!(config.vendor, "VinSolutions");
        assert_eq!(config.mark_seen, Some(false));
        assert!(config.download_dir.is_none());
    }

    #[test]
    fn api_config_defaults_method() {
        let step = WorkflowStep::new(
            "notify",
            StepType::Api,
            "notify",
            serde_json::json!({ "endpoint": "https://example.com/hook" }),
        );
        let config: ApiConfig = StepHandlerSet::parse_config(&step).unwrap();
        assert_eq!(config.method, "POST");
    }

    #[test]
    fn file_paths_read_from_last_result() {
        let mut context = serde_json::Map::new();
        context.insert(
            LAST_STEP_RESULT_KEY.to_string(),
            serde_json::json!({ "filePaths": ["/tmp/a.csv", "/tmp/b.csv"] }),
        );
        let paths = file_paths_from_context(&context).unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0], PathBuf::from("/tmp/a.csv"));
    }

    #[test]
    fn records_missing_from_context() {
        let context = serde_json::Map::new();
        assert!(records_from_context(&context).is_none());
    }
}
