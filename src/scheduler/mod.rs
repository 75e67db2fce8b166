//! Cron-driven scheduler — polls for due schedules and enqueues
//! high-priority workflow runs.
//!
//! A due schedule whose workflow is locked or running is skipped without
//! advancing `next_run_at`, so it is retried on the next poll. Repeated run
//! failures mark the schedule failed after a threshold; reactivation is a
//! manual `retry_schedule` call.

pub mod schedule;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::ScheduleError;
use crate::queue::{JobQueue, PRIORITY_HIGH};
use crate::store::Database;
use crate::workflow::model::{StepType, WorkflowStatus, WorkflowStep};
use crate::workflow::{Workflow, WorkflowEngine};

pub use schedule::{Schedule, ScheduleStatus, next_cron_fire};

/// Task id prefix for workflow-run jobs.
pub const WORKFLOW_TASK_PREFIX: &str = "workflow:";

/// Polls schedules and enqueues workflow runs.
pub struct Scheduler {
    db: Arc<dyn Database>,
    queue: Arc<JobQueue>,
    workflows: Arc<WorkflowEngine>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        db: Arc<dyn Database>,
        queue: Arc<JobQueue>,
        workflows: Arc<WorkflowEngine>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            db,
            queue,
            workflows,
            config,
        }
    }

    /// Register a new schedule.
    pub async fn create_schedule(
        &self,
        intent: &str,
        platform: &str,
        cron: &str,
        workflow_id: Option<Uuid>,
    ) -> Result<Uuid, ScheduleError> {
        let schedule = Schedule::new(intent, platform, cron, workflow_id)?;
        let id = schedule.id;
        self.db.insert_schedule(&schedule).await?;
        info!(schedule_id = %id, intent = %intent, cron = %cron, "Created schedule");
        Ok(id)
    }

    /// One poll cycle: trigger every due schedule. Returns the number of
    /// runs enqueued.
    pub async fn poll_once(&self) -> usize {
        let due = match self.db.list_due_schedules(Utc::now()).await {
            Ok(due) => due,
            Err(e) => {
                error!("Failed to load due schedules: {e}");
                return 0;
            }
        };

        let mut triggered = 0;
        for schedule in due {
            match self.trigger(&schedule).await {
                Ok(true) => triggered += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(schedule_id = %schedule.id, "Failed to trigger schedule: {e}");
                }
            }
        }
        triggered
    }

    /// Trigger one due schedule. Returns whether a run was enqueued.
    async fn trigger(&self, schedule: &Schedule) -> Result<bool, ScheduleError> {
        // A bound workflow that is locked or mid-run keeps its schedule
        // waiting: next_run_at is left unchanged and the next poll retries.
        let workflow_id = match schedule.workflow_id {
            Some(id) => {
                match self.workflows.get(id).await {
                    Ok(Some(wf)) if wf.locked || wf.status == WorkflowStatus::Running => {
                        debug!(
                            schedule_id = %schedule.id,
                            workflow_id = %id,
                            "Skipping cycle: workflow busy"
                        );
                        return Ok(false);
                    }
                    Ok(Some(_)) => id,
                    Ok(None) => {
                        warn!(
                            schedule_id = %schedule.id,
                            workflow_id = %id,
                            "Bound workflow missing, creating a fresh instance"
                        );
                        self.create_instance(schedule).await?
                    }
                    Err(e) => return Err(ScheduleError::Database(match e {
                        crate::error::WorkflowError::Database(db) => db,
                        other => crate::error::DatabaseError::Query(other.to_string()),
                    })),
                }
            }
            None => self.create_instance(schedule).await?,
        };

        self.queue
            .enqueue(&format!("{WORKFLOW_TASK_PREFIX}{workflow_id}"), PRIORITY_HIGH)
            .await?;

        let now = Utc::now();
        match next_cron_fire(&schedule.cron) {
            Ok(Some(next)) => {
                self.db.update_schedule_run(schedule.id, now, Some(next)).await?;
                info!(
                    schedule_id = %schedule.id,
                    workflow_id = %workflow_id,
                    next_run_at = %next,
                    "Triggered scheduled run"
                );
            }
            Ok(None) | Err(_) => {
                // An active schedule must always have a computable future
                // fire time; one without is parked as failed.
                warn!(
                    schedule_id = %schedule.id,
                    cron = %schedule.cron,
                    "No computable next fire time, marking schedule failed"
                );
                self.db
                    .update_schedule_status(
                        schedule.id,
                        ScheduleStatus::Failed,
                        schedule.retry_count,
                        None,
                    )
                    .await?;
            }
        }

        Ok(true)
    }

    /// Build the standard report pipeline for this schedule's intent.
    async fn create_instance(&self, schedule: &Schedule) -> Result<Uuid, ScheduleError> {
        let steps = report_pipeline_steps(&schedule.intent, &schedule.platform);
        self.workflows
            .create(steps, None)
            .await
            .map_err(|e| ScheduleError::Database(crate::error::DatabaseError::Query(e.to_string())))
    }

    /// Clear the consecutive-failure count for the schedule bound to a
    /// workflow after a successful run.
    pub async fn record_workflow_success(&self, workflow_id: Uuid) -> Result<(), ScheduleError> {
        let Some(schedule) = self.db.get_schedule_by_workflow(workflow_id).await? else {
            return Ok(());
        };
        if schedule.retry_count > 0 {
            self.db
                .update_schedule_status(schedule.id, schedule.status, 0, schedule.next_run_at)
                .await?;
        }
        Ok(())
    }

    /// Record a failed run for the schedule bound to a workflow. Past the
    /// consecutive-failure threshold the schedule is marked failed.
    pub async fn record_workflow_failure(&self, workflow_id: Uuid) -> Result<(), ScheduleError> {
        let Some(schedule) = self.db.get_schedule_by_workflow(workflow_id).await? else {
            return Ok(());
        };

        let retry_count = schedule.retry_count + 1;
        let status = if retry_count >= self.config.failure_threshold {
            warn!(
                schedule_id = %schedule.id,
                retry_count,
                "Schedule exceeded failure threshold, marking failed"
            );
            ScheduleStatus::Failed
        } else {
            schedule.status
        };

        self.db
            .update_schedule_status(schedule.id, status, retry_count, schedule.next_run_at)
            .await?;
        Ok(())
    }

    /// Manually reactivate a failed schedule.
    pub async fn retry_schedule(&self, id: Uuid) -> Result<(), ScheduleError> {
        let schedule = self
            .db
            .get_schedule(id)
            .await?
            .ok_or(ScheduleError::NotFound { id })?;

        if !schedule.enabled {
            return Err(ScheduleError::Disabled { id });
        }

        let next = next_cron_fire(&schedule.cron)?;
        self.db
            .update_schedule_status(id, ScheduleStatus::Active, 0, next)
            .await?;
        info!(schedule_id = %id, "Schedule reactivated");
        Ok(())
    }
}

/// The standard ingestion → parse → insights pipeline.
pub fn report_pipeline_steps(intent: &str, platform: &str) -> Vec<WorkflowStep> {
    vec![
        WorkflowStep::new(
            "ingest",
            StepType::EmailIngestion,
            &format!("Fetch {platform} report emails"),
            serde_json::json!({ "vendor": platform }),
        ),
        WorkflowStep::new(
            "parse",
            StepType::DataProcessing,
            &format!("Parse {platform} reports"),
            serde_json::json!({ "vendor": platform, "report_type": intent }),
        ),
        WorkflowStep::new(
            "insights",
            StepType::InsightGeneration,
            &format!("Generate {intent} insights"),
            serde_json::json!({ "platform": platform, "options": { "intent": intent } }),
        ),
    ]
}

/// Spawn the scheduler poll loop as a background task.
pub fn spawn_scheduler_ticker(
    scheduler: Arc<Scheduler>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Scheduler started — polling every {:?}", interval);
        let mut tick = tokio::time::interval(interval);
        // Skip the immediate first tick.
        tick.tick().await;

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Scheduler shutting down");
                return;
            }

            scheduler.poll_once().await;
        }
    });

    (handle, shutdown_flag)
}

/// Parse a `workflow:{uuid}` task id.
pub fn workflow_id_from_task(task_id: &str) -> Option<Uuid> {
    task_id
        .strip_prefix(WORKFLOW_TASK_PREFIX)
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// Whether a workflow looks runnable to the scheduler right now.
pub fn workflow_is_busy(workflow: &Workflow) -> bool {
    workflow.locked || workflow.status == WorkflowStatus::Running
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_task_id_roundtrip() {
        let id = Uuid::new_v4();
        let task = format!("{WORKFLOW_TASK_PREFIX}{id}");
        assert_eq!(workflow_id_from_task(&task), Some(id));
        assert_eq!(workflow_id_from_task("cleanup:old-files"), None);
        assert_eq!(workflow_id_from_task("workflow:not-a-uuid"), None);
    }

    #[test]
    fn report_pipeline_shape() {
        let steps = report_pipeline_steps("daily_sales_report", "VinSolutions");
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].step_type, StepType::EmailIngestion);
        assert_eq!(steps[1].step_type, StepType::DataProcessing);
        assert_eq!(steps[2].step_type, StepType::InsightGeneration);
        assert_eq!(steps[0].config["vendor"], "VinSolutions");
    }

    #[test]
    fn busy_detection() {
        let mut wf = Workflow::new(vec![], None);
        assert!(!workflow_is_busy(&wf));
        wf.locked = true;
        assert!(workflow_is_busy(&wf));
        wf.locked = false;
        wf.status = WorkflowStatus::Running;
        assert!(workflow_is_busy(&wf));
    }
}
