// Workflow controllers: given the persisted state of an execution, compute
// the next set of commands. Two flavours: direct (explicit transitions) and
// reverse (a target task with dependencies solved backward).
//
// Controllers are pure over a snapshot; the dispatcher owns all side
// effects, which keeps the ordering contract unit testable.

mod direct;
mod reverse;

use serde_json::Value;
use taskweave_core::context::{self, Context};
use taskweave_core::expr::Evaluator;
use taskweave_core::spec::{TaskSpec, WorkflowSpec, WorkflowType};
use taskweave_core::{EngineError, Result, State};
use taskweave_storage::{TaskExecutionRow, WorkflowExecutionRow};
use uuid::Uuid;

/// A side effect the dispatcher must perform.
#[derive(Debug, Clone)]
pub enum Command {
    RunTask(RunTaskCommand),
    PauseWorkflow,
    SucceedWorkflow { message: Option<String> },
    FailWorkflow { message: String },
    Noop,
}

#[derive(Debug, Clone)]
pub struct RunTaskCommand {
    pub task_name: String,
    pub context: Context,
    /// Park the task as a WAITING join placeholder instead of running it
    pub waiting: bool,
    /// Task execution whose completion produced this command; the
    /// idempotency key (task_name, triggered_by) lets the dispatcher skip
    /// duplicates while still allowing loops.
    pub triggered_by: Option<Uuid>,
}

/// Outcome of a controller pass: commands to dispatch plus the completed
/// task executions whose transitions were consumed (to be marked processed).
#[derive(Debug, Default)]
pub struct ContinueResult {
    pub commands: Vec<Command>,
    pub consumed: Vec<Uuid>,
}

/// Read-only view of one workflow execution.
pub struct WorkflowSnapshot<'a> {
    pub wf_ex: &'a WorkflowExecutionRow,
    pub tasks: &'a [TaskExecutionRow],
    pub spec: &'a WorkflowSpec,
}

impl<'a> WorkflowSnapshot<'a> {
    pub fn workflow_context(&self) -> Context {
        context::as_object(&self.wf_ex.context)
    }

    /// Most recent execution of a task name, if any.
    pub fn latest_task(&self, name: &str) -> Option<&'a TaskExecutionRow> {
        self.tasks
            .iter()
            .filter(|t| t.name == name)
            .max_by_key(|t| t.created_at)
    }

    /// Completed tasks the controller has not consumed yet, ordered by name
    /// for reproducible command ordering.
    pub fn completed_unprocessed(&self) -> Vec<&'a TaskExecutionRow> {
        let mut tasks: Vec<_> = self
            .tasks
            .iter()
            .filter(|t| t.state().is_completed() && !t.processed)
            .collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }
}

/// The effective task spec persisted on a task execution row.
pub fn task_spec_from_row(task: &TaskExecutionRow) -> Result<TaskSpec> {
    serde_json::from_value(task.spec.clone())
        .map_err(|e| EngineError::dsl(format!("Stored task spec is invalid: {}", e)))
}

/// Compute the next commands for a workflow execution.
pub fn continue_workflow(
    snapshot: &WorkflowSnapshot,
    evaluator: &dyn Evaluator,
) -> Result<ContinueResult> {
    if snapshot.wf_ex.state().is_paused_or_completed() {
        return Ok(ContinueResult::default());
    }

    match snapshot.spec.wf_type {
        WorkflowType::Direct => direct::continue_workflow(snapshot, evaluator),
        WorkflowType::Reverse => reverse::continue_workflow(snapshot, evaluator),
    }
}

/// True iff every ERROR task has a matching on-error transition.
pub fn all_errors_handled(snapshot: &WorkflowSnapshot, evaluator: &dyn Evaluator) -> bool {
    snapshot
        .tasks
        .iter()
        .filter(|t| t.state() == State::Error)
        .all(|t| is_error_handled_for(snapshot, t, evaluator))
}

pub fn is_error_handled_for(
    snapshot: &WorkflowSnapshot,
    task: &TaskExecutionRow,
    evaluator: &dyn Evaluator,
) -> bool {
    match snapshot.spec.wf_type {
        WorkflowType::Direct => direct::is_error_handled_for(task, evaluator),
        // The reverse DSL has no on-error clause.
        WorkflowType::Reverse => false,
    }
}

/// Reverse workflow target task name, from execution params.
pub(crate) fn reverse_target(wf_ex: &WorkflowExecutionRow) -> Option<String> {
    wf_ex
        .params
        .get("task_name")
        .and_then(Value::as_str)
        .map(String::from)
}
