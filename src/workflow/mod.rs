//! Workflow state machine — ordered step sequences with advisory locking,
//! per-step retry budgets, and resumable persisted context.

pub mod engine;
pub mod handlers;
pub mod model;

pub use engine::{RunOutcome, WorkflowEngine};
pub use handlers::{StepExecutor, StepHandlerSet};
pub use model::{LAST_STEP_RESULT_KEY, StepType, Workflow, WorkflowStatus, WorkflowStep};
