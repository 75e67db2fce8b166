//! Core workflow types.
//!
//! Steps are a closed set: dispatch is a match over `StepType`, not a
//! string-keyed handler map, so an unknown type is a deserialization error
//! at the boundary instead of a runtime lookup miss.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Context key holding the most recent step output.
pub const LAST_STEP_RESULT_KEY: &str = "__lastStepResult";

/// Workflow lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Failed,
    Completed,
}

impl WorkflowStatus {
    /// Completed and failed workflows are never re-run.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Paused => write!(f, "paused"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "paused" => Ok(WorkflowStatus::Paused),
            "failed" => Ok(WorkflowStatus::Failed),
            "completed" => Ok(WorkflowStatus::Completed),
            other => Err(format!("unknown workflow status: {other}")),
        }
    }
}

/// The fixed step vocabulary. Serialized tags match the persisted format
/// (`emailIngestion`, `dataProcessing`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepType {
    EmailIngestion,
    BrowserAction,
    InsightGeneration,
    Crm,
    DataProcessing,
    Api,
    Custom,
}

impl StepType {
    pub fn type_tag(self) -> &'static str {
        match self {
            StepType::EmailIngestion => "emailIngestion",
            StepType::BrowserAction => "browserAction",
            StepType::InsightGeneration => "insightGeneration",
            StepType::Crm => "crm",
            StepType::DataProcessing => "dataProcessing",
            StepType::Api => "api",
            StepType::Custom => "custom",
        }
    }
}

/// One unit of a workflow pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Retries consumed so far (persisted with the workflow).
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl WorkflowStep {
    pub fn new(id: &str, step_type: StepType, name: &str, config: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            step_type,
            name: name.to_string(),
            config,
            retries: 0,
            max_retries: default_max_retries(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

/// A persisted workflow instance (`workflows` row).
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub steps: Vec<WorkflowStep>,
    pub current_step: usize,
    pub context: serde_json::Map<String, serde_json::Value>,
    pub status: WorkflowStatus,
    pub last_error: Option<String>,
    pub locked: bool,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(steps: Vec<WorkflowStep>, user_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            steps,
            current_step: 0,
            context: serde_json::Map::new(),
            status: WorkflowStatus::Pending,
            last_error: None,
            locked: false,
            locked_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The step the next `run_workflow` call will execute.
    pub fn current(&self) -> Option<&WorkflowStep> {
        self.steps.get(self.current_step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Paused,
            WorkflowStatus::Failed,
            WorkflowStatus::Completed,
        ] {
            let parsed: WorkflowStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn terminal_states() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
    }

    #[test]
    fn step_type_tags_round_trip_through_serde() {
        let step = WorkflowStep::new(
            "ingest",
            StepType::EmailIngestion,
            "Fetch VinSolutions reports",
            serde_json::json!({ "vendor": "VinSolutions" }),
        );
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["type"], "emailIngestion");

        let parsed: WorkflowStep = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.step_type, StepType::EmailIngestion);
        assert_eq!(parsed.max_retries, 2);
    }

    #[test]
    fn unknown_step_type_rejected_at_boundary() {
        let json = serde_json::json!({
            "id": "x",
            "type": "shellCommand",
            "name": "nope",
        });
        assert!(serde_json::from_value::<WorkflowStep>(json).is_err());
    }

    #[test]
    fn workflow_current_step() {
        let wf = Workflow::new(
            vec![WorkflowStep::new(
                "ingest",
                StepType::EmailIngestion,
                "fetch",
                serde_json::json!({}),
            )],
            None,
        );
        assert_eq!(wf.current().unwrap().id, "ingest");
        assert_eq!(wf.status, WorkflowStatus::Pending);
        assert!(!wf.locked);
    }
}
