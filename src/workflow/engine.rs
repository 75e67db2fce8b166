//! Workflow execution — one step per call, resumable across restarts.
//!
//! `run_workflow` loads the workflow, takes the advisory lock, executes the
//! current step, persists progress, and releases the lock — every exit path
//! releases it. The lock is a lease: a row locked longer than
//! `WorkflowConfig::lock_lease` is treated as abandoned by a crashed worker
//! and reclaimed on the next call.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::config::WorkflowConfig;
use crate::error::WorkflowError;
use crate::store::Database;
use crate::workflow::handlers::StepExecutor;
use crate::workflow::model::{
    LAST_STEP_RESULT_KEY, Workflow, WorkflowStatus, WorkflowStep,
};

/// Result of one `run_workflow` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The final step succeeded.
    Completed,
    /// A step succeeded (or will be retried) and more work remains.
    Paused,
    /// The current step exhausted its retries.
    Failed,
    /// Another worker holds a fresh lock — nothing was changed.
    SkippedLocked,
    /// The workflow was already completed or failed — idempotent no-op.
    AlreadyTerminal,
}

/// Drives persisted workflows one step at a time.
pub struct WorkflowEngine {
    db: Arc<dyn Database>,
    executor: Arc<dyn StepExecutor>,
    config: WorkflowConfig,
}

impl WorkflowEngine {
    pub fn new(
        db: Arc<dyn Database>,
        executor: Arc<dyn StepExecutor>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            db,
            executor,
            config,
        }
    }

    /// Create and persist a new pending workflow. Returns its id.
    pub async fn create(
        &self,
        steps: Vec<WorkflowStep>,
        user_id: Option<String>,
    ) -> Result<Uuid, WorkflowError> {
        let workflow = Workflow::new(steps, user_id);
        let id = workflow.id;
        self.db.insert_workflow(&workflow).await?;
        tracing::info!(workflow_id = %id, steps = workflow.steps.len(), "Created workflow");
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Workflow>, WorkflowError> {
        Ok(self.db.get_workflow(id).await?)
    }

    /// Execute the current step of a workflow.
    ///
    /// Exactly one step runs per call; callers loop while the outcome is
    /// `Paused`. A step failure with retry budget left increments the step's
    /// retry counter and leaves `current_step` unchanged, so the next call
    /// re-invokes the same step after the backoff delay taken here.
    pub async fn run_workflow(&self, id: Uuid) -> Result<RunOutcome, WorkflowError> {
        let workflow = self
            .db
            .get_workflow(id)
            .await?
            .ok_or(WorkflowError::NotFound { id })?;

        if workflow.status.is_terminal() {
            return Ok(RunOutcome::AlreadyTerminal);
        }

        let now = Utc::now();
        let stale_before = now
            - chrono::Duration::from_std(self.config.lock_lease)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));

        if !self.db.try_lock_workflow(id, now, stale_before).await? {
            tracing::debug!(workflow_id = %id, "Skipped: locked by another worker");
            return Ok(RunOutcome::SkippedLocked);
        }

        // Reload under the lock — another worker may have advanced the
        // workflow between our first read and the lock acquisition.
        let mut workflow = self
            .db
            .get_workflow(id)
            .await?
            .ok_or(WorkflowError::NotFound { id })?;
        workflow.status = WorkflowStatus::Running;

        let (outcome, retry_delay) = match self.execute_current_step(&mut workflow).await {
            Ok(result) => result,
            Err(err) => {
                // Infrastructure error mid-step: release the lock before
                // propagating so the workflow stays runnable.
                let _ = self.db.unlock_workflow(id).await;
                return Err(err);
            }
        };

        workflow.locked = false;
        workflow.locked_at = None;
        workflow.updated_at = Utc::now();
        if let Err(err) = self.db.persist_workflow_progress(&workflow).await {
            let _ = self.db.unlock_workflow(id).await;
            return Err(err.into());
        }

        if let Some(delay) = retry_delay {
            tracing::info!(
                workflow_id = %id,
                ?delay,
                "Step will be retried after backoff"
            );
            tokio::time::sleep(delay).await;
        }

        Ok(outcome)
    }

    /// Run the step at `current_step`, mutating the workflow in place.
    /// Returns the outcome and an optional backoff delay for a retryable
    /// step failure.
    async fn execute_current_step(
        &self,
        workflow: &mut Workflow,
    ) -> Result<(RunOutcome, Option<Duration>), WorkflowError> {
        if workflow.current_step >= workflow.steps.len() {
            workflow.status = WorkflowStatus::Completed;
            return Ok((RunOutcome::Completed, None));
        }

        let step = workflow.steps[workflow.current_step].clone();
        tracing::info!(
            workflow_id = %workflow.id,
            step = %step.name,
            step_type = step.step_type.type_tag(),
            index = workflow.current_step,
            "Executing step"
        );

        match self.executor.execute(&step, &workflow.context).await {
            Ok(output) => {
                workflow
                    .context
                    .insert(step.id.clone(), output.clone());
                workflow
                    .context
                    .insert(LAST_STEP_RESULT_KEY.to_string(), output);
                workflow.current_step += 1;
                workflow.last_error = None;

                if workflow.current_step >= workflow.steps.len() {
                    workflow.status = WorkflowStatus::Completed;
                    tracing::info!(workflow_id = %workflow.id, "Workflow completed");
                    Ok((RunOutcome::Completed, None))
                } else {
                    workflow.status = WorkflowStatus::Paused;
                    Ok((RunOutcome::Paused, None))
                }
            }
            Err(err) => {
                let reason = err.to_string();
                let step_state = &mut workflow.steps[workflow.current_step];

                if step_state.retries < step_state.max_retries {
                    step_state.retries += 1;
                    let delay = step_retry_delay(
                        self.config.step_retry_base,
                        step_state.backoff_factor,
                        step_state.retries,
                    );
                    workflow.status = WorkflowStatus::Paused;
                    workflow.last_error = Some(reason.clone());
                    tracing::warn!(
                        workflow_id = %workflow.id,
                        step = %step.name,
                        retries = step_state.retries,
                        max_retries = step_state.max_retries,
                        "Step failed, will retry: {reason}"
                    );
                    Ok((RunOutcome::Paused, Some(delay)))
                } else {
                    workflow.status = WorkflowStatus::Failed;
                    workflow.last_error = Some(reason.clone());
                    tracing::error!(
                        workflow_id = %workflow.id,
                        step = %step.name,
                        "Step exhausted retries, workflow failed: {reason}"
                    );
                    Ok((RunOutcome::Failed, None))
                }
            }
        }
    }

    /// Drive a workflow until it leaves `paused`.
    pub async fn run_to_completion(&self, id: Uuid) -> Result<WorkflowStatus, WorkflowError> {
        loop {
            match self.run_workflow(id).await? {
                RunOutcome::Paused => continue,
                RunOutcome::Completed | RunOutcome::AlreadyTerminal | RunOutcome::Failed
                | RunOutcome::SkippedLocked => {
                    let workflow = self
                        .db
                        .get_workflow(id)
                        .await?
                        .ok_or(WorkflowError::NotFound { id })?;
                    return Ok(workflow.status);
                }
            }
        }
    }

    /// Clear locks abandoned by crashed workers (startup recovery).
    pub async fn recover_stale_locks(&self) -> Result<usize, WorkflowError> {
        let stale_before = Utc::now()
            - chrono::Duration::from_std(self.config.lock_lease)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let cleared = self.db.clear_stale_workflow_locks(stale_before).await?;
        if cleared > 0 {
            tracing::warn!(cleared, "Recovered stale workflow locks");
        }
        Ok(cleared)
    }
}

/// Backoff for the nth retry of a step: base scaled by `factor^(n-1)`.
fn step_retry_delay(base: Duration, factor: f64, retries: u32) -> Duration {
    let scale = factor.max(1.0).powi(retries.saturating_sub(1).min(16) as i32);
    base.mul_f64(scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::store::LibSqlBackend;
    use crate::workflow::model::StepType;

    /// Executor that replays a scripted sequence of results.
    struct ScriptedExecutor {
        script: Mutex<VecDeque<Result<Value, String>>>,
    }

    impl ScriptedExecutor {
        fn new(script: Vec<Result<Value, String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl StepExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            step: &WorkflowStep,
            _context: &serde_json::Map<String, Value>,
        ) -> Result<Value, WorkflowError> {
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(value)) => Ok(value),
                Some(Err(reason)) => Err(WorkflowError::StepFailed {
                    step: step.name.clone(),
                    reason,
                }),
                None => panic!("executor script exhausted"),
            }
        }
    }

    fn steps(n: usize) -> Vec<WorkflowStep> {
        (0..n)
            .map(|i| {
                WorkflowStep::new(
                    &format!("step{i}"),
                    StepType::Custom,
                    &format!("step {i}"),
                    serde_json::json!({}),
                )
            })
            .collect()
    }

    async fn engine_with(
        script: Vec<Result<Value, String>>,
        config: WorkflowConfig,
    ) -> WorkflowEngine {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        WorkflowEngine::new(db, ScriptedExecutor::new(script), config)
    }

    fn fast_config() -> WorkflowConfig {
        WorkflowConfig {
            lock_lease: Duration::from_secs(600),
            step_retry_base: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn advances_one_step_per_call() {
        let engine = engine_with(
            vec![
                Ok(serde_json::json!({"n": 1})),
                Ok(serde_json::json!({"n": 2})),
            ],
            fast_config(),
        )
        .await;
        let id = engine.create(steps(2), None).await.unwrap();

        assert_eq!(engine.run_workflow(id).await.unwrap(), RunOutcome::Paused);
        let wf = engine.get(id).await.unwrap().unwrap();
        assert_eq!(wf.current_step, 1);
        assert_eq!(wf.status, WorkflowStatus::Paused);
        assert!(!wf.locked);

        assert_eq!(engine.run_workflow(id).await.unwrap(), RunOutcome::Completed);
        let wf = engine.get(id).await.unwrap().unwrap();
        assert_eq!(wf.current_step, 2);
        assert_eq!(wf.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn context_merged_under_step_id_and_last_result() {
        let engine = engine_with(vec![Ok(serde_json::json!({"files": 3}))], fast_config()).await;
        let id = engine.create(steps(2), None).await.unwrap();
        engine.run_workflow(id).await.unwrap();

        let wf = engine.get(id).await.unwrap().unwrap();
        assert_eq!(wf.context["step0"]["files"], 3);
        assert_eq!(wf.context[LAST_STEP_RESULT_KEY]["files"], 3);
    }

    #[tokio::test]
    async fn step_failure_with_budget_does_not_advance() {
        let engine = engine_with(
            vec![
                Err("collaborator timeout".to_string()),
                Ok(serde_json::json!({})),
            ],
            fast_config(),
        )
        .await;
        let id = engine.create(steps(1), None).await.unwrap();

        assert_eq!(engine.run_workflow(id).await.unwrap(), RunOutcome::Paused);
        let wf = engine.get(id).await.unwrap().unwrap();
        assert_eq!(wf.current_step, 0);
        assert!(!wf.locked);
        assert_eq!(wf.steps[0].retries, 1);
        assert!(wf.last_error.as_deref().unwrap().contains("timeout"));

        // Same step re-invoked, succeeds this time.
        assert_eq!(engine.run_workflow(id).await.unwrap(), RunOutcome::Completed);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_workflow() {
        let engine = engine_with(
            vec![
                Err("boom 1".to_string()),
                Err("boom 2".to_string()),
                Err("boom 3".to_string()),
            ],
            fast_config(),
        )
        .await;
        let id = engine.create(steps(1), None).await.unwrap();

        // max_retries = 2: two retryable failures, then terminal.
        assert_eq!(engine.run_workflow(id).await.unwrap(), RunOutcome::Paused);
        assert_eq!(engine.run_workflow(id).await.unwrap(), RunOutcome::Paused);
        assert_eq!(engine.run_workflow(id).await.unwrap(), RunOutcome::Failed);

        let wf = engine.get(id).await.unwrap().unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert_eq!(wf.current_step, 0);
        assert!(!wf.locked);
        assert!(wf.last_error.as_deref().unwrap().contains("boom 3"));
    }

    #[tokio::test]
    async fn terminal_workflow_is_idempotent_noop() {
        let engine = engine_with(vec![Ok(serde_json::json!({}))], fast_config()).await;
        let id = engine.create(steps(1), None).await.unwrap();
        engine.run_workflow(id).await.unwrap();

        assert_eq!(
            engine.run_workflow(id).await.unwrap(),
            RunOutcome::AlreadyTerminal
        );
    }

    #[tokio::test]
    async fn fresh_lock_skips() {
        let engine = engine_with(vec![Ok(serde_json::json!({}))], fast_config()).await;
        let id = engine.create(steps(1), None).await.unwrap();

        // Simulate another worker holding the lock.
        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(600);
        assert!(engine.db.try_lock_workflow(id, now, stale).await.unwrap());

        assert_eq!(
            engine.run_workflow(id).await.unwrap(),
            RunOutcome::SkippedLocked
        );
        let wf = engine.get(id).await.unwrap().unwrap();
        assert_eq!(wf.current_step, 0);
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let config = WorkflowConfig {
            lock_lease: Duration::ZERO,
            step_retry_base: Duration::from_millis(1),
        };
        let engine = engine_with(vec![Ok(serde_json::json!({}))], config).await;
        let id = engine.create(steps(1), None).await.unwrap();

        // A lock from a "crashed" worker; with a zero lease it is stale
        // immediately and the next run reclaims it.
        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(600);
        assert!(engine.db.try_lock_workflow(id, now, stale).await.unwrap());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(engine.run_workflow(id).await.unwrap(), RunOutcome::Completed);
    }

    #[tokio::test]
    async fn run_to_completion_loops_through_pauses() {
        let engine = engine_with(
            vec![
                Ok(serde_json::json!({"n": 1})),
                Ok(serde_json::json!({"n": 2})),
                Ok(serde_json::json!({"n": 3})),
            ],
            fast_config(),
        )
        .await;
        let id = engine.create(steps(3), None).await.unwrap();

        let status = engine.run_to_completion(id).await.unwrap();
        assert_eq!(status, WorkflowStatus::Completed);
    }

    #[test]
    fn retry_delay_scales_by_factor() {
        let base = Duration::from_secs(1);
        assert_eq!(step_retry_delay(base, 2.0, 1), Duration::from_secs(1));
        assert_eq!(step_retry_delay(base, 2.0, 2), Duration::from_secs(2));
        assert_eq!(step_retry_delay(base, 2.0, 3), Duration::from_secs(4));
    }
}
