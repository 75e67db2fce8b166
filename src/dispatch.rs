//! Bridges the job queue to the workflow engine.
//!
//! Workflow jobs carry `task_id = "workflow:{uuid}"`. The dispatcher drives
//! the workflow to completion; a workflow that ends failed surfaces as a job
//! failure (feeding the queue's attempt budget) and bumps the bound
//! schedule's consecutive-failure count.

use std::sync::Arc;

use async_trait::async_trait;

use crate::queue::job_queue::Job;
use crate::queue::worker::JobDispatcher;
use crate::scheduler::{Scheduler, workflow_id_from_task};
use crate::workflow::WorkflowEngine;
use crate::workflow::model::WorkflowStatus;

/// Production dispatcher for workflow-run jobs.
pub struct WorkflowJobDispatcher {
    workflows: Arc<WorkflowEngine>,
    scheduler: Arc<Scheduler>,
}

impl WorkflowJobDispatcher {
    pub fn new(workflows: Arc<WorkflowEngine>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            workflows,
            scheduler,
        }
    }
}

#[async_trait]
impl JobDispatcher for WorkflowJobDispatcher {
    async fn dispatch(&self, job: &Job) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Some(workflow_id) = workflow_id_from_task(&job.task_id) else {
            return Err(format!("unrecognized task id: {}", job.task_id).into());
        };

        let status = self.workflows.run_to_completion(workflow_id).await?;
        match status {
            WorkflowStatus::Completed => {
                if let Err(e) = self.scheduler.record_workflow_success(workflow_id).await {
                    tracing::warn!(
                        workflow_id = %workflow_id,
                        "Failed to clear schedule failure count: {e}"
                    );
                }
                Ok(())
            }
            WorkflowStatus::Failed => {
                if let Err(e) = self.scheduler.record_workflow_failure(workflow_id).await {
                    tracing::error!(
                        workflow_id = %workflow_id,
                        "Failed to record schedule failure: {e}"
                    );
                }
                let reason = self
                    .workflows
                    .get(workflow_id)
                    .await?
                    .and_then(|wf| wf.last_error)
                    .unwrap_or_else(|| "workflow failed".to_string());
                Err(reason.into())
            }
            // Another worker holds the workflow — this job is done.
            _ => Ok(()),
        }
    }
}
