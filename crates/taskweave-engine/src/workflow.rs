// Workflow driver: validated state transitions, controller re-entry,
// completion detection, and failure aggregation.
//
// All functions here assume the caller holds the workflow lock.

use std::time::Duration;

use serde_json::{json, Value};
use taskweave_core::spec::workflow_spec_from_json;
use taskweave_core::{states, EngineError, Result, State};
use taskweave_storage::WorkflowExecutionRow;
use tracing::{info, warn};
use uuid::Uuid;

use crate::controller::{self, WorkflowSnapshot};
use crate::dataflow;
use crate::dispatcher;
use crate::engine::{wf_auth, Engine};
use crate::scheduler;

impl Engine {
    /// Validated workflow state transition. An invalid transition fails
    /// without mutating the row. `accepted` is true only in terminal states.
    pub(crate) fn set_workflow_state(
        &self,
        wf_ex: &mut WorkflowExecutionRow,
        state: State,
        state_info: Option<String>,
    ) -> Result<()> {
        let current = wf_ex.state();

        if !states::is_valid_transition(current, state) {
            return Err(EngineError::invalid_state(format!(
                "Can't change workflow execution state from {} to {}. \
                 [workflow={}, execution_id={}]",
                current, state, wf_ex.workflow_name, wf_ex.id
            )));
        }

        info!(
            wf_ex_id = %wf_ex.id,
            workflow = %wf_ex.workflow_name,
            "Execution of workflow '{}' [{} -> {}]",
            wf_ex.workflow_name,
            current,
            state
        );

        wf_ex.set_state(state);
        wf_ex.state_info = state_info;

        // A workflow result is authoritative for parents only once terminal.
        wf_ex.accepted = state.is_completed();

        Ok(())
    }

    /// On resume/rerun, a sub-workflow re-entering RUNNING drags its parent
    /// task and workflow (recursively) back to RUNNING as well.
    pub(crate) async fn propagate_running_to_parents(
        &self,
        wf_ex: &WorkflowExecutionRow,
    ) -> Result<()> {
        let mut parent_task_id = wf_ex.task_execution_id;

        while let Some(task_id) = parent_task_id {
            let mut task = self.store.get_task_execution(task_id).await?;

            let _lock = self.workflow_lock(task.workflow_execution_id).await;

            task.set_state(State::Running);
            task.state_info = None;
            task.processed = false;
            self.store.save_task_execution(&task).await?;

            let mut parent_wf = self
                .store
                .get_workflow_execution(task.workflow_execution_id)
                .await?;

            self.set_workflow_state(&mut parent_wf, State::Running, None)?;
            self.store.save_workflow_execution(&parent_wf).await?;

            parent_task_id = parent_wf.task_execution_id;
        }

        Ok(())
    }

    /// One controller pass: compute commands, mark consumed tasks as
    /// processed, dispatch. Falls through to completion detection when the
    /// pass produced no effective work.
    pub(crate) async fn continue_workflow_after(
        &self,
        wf_ex_id: Uuid,
        filter_pause: bool,
    ) -> Result<()> {
        let wf_ex = self.store.get_workflow_execution(wf_ex_id).await?;

        if wf_ex.state().is_paused_or_completed() {
            return Ok(());
        }

        let tasks = self.store.list_task_executions(wf_ex_id).await?;
        let spec = workflow_spec_from_json(&wf_ex.spec)?;

        let snapshot = WorkflowSnapshot {
            wf_ex: &wf_ex,
            tasks: &tasks,
            spec: &spec,
        };

        let mut result = controller::continue_workflow(&snapshot, &*self.evaluator)?;

        // When resuming, the controller picks up tasks that completed while
        // the workflow was paused; their pause commands are obsolete.
        if filter_pause {
            result
                .commands
                .retain(|c| !matches!(c, controller::Command::PauseWorkflow));
        }

        for task_id in &result.consumed {
            let mut task = self.store.get_task_execution(*task_id).await?;
            task.processed = true;
            self.store.save_task_execution(&task).await?;
        }

        let effective = dispatcher::dispatch(self, &wf_ex, &spec, result.commands).await?;

        if effective == 0 {
            self.check_and_complete(wf_ex_id).await?;
        }

        Ok(())
    }

    /// The workflow completes when every incomplete task is WAITING: such
    /// tasks can never fire once nothing else is running.
    pub(crate) async fn check_and_complete(&self, wf_ex_id: Uuid) -> Result<()> {
        let wf_ex = self.store.get_workflow_execution(wf_ex_id).await?;

        if wf_ex.state().is_paused_or_completed() {
            return Ok(());
        }

        let tasks = self.store.list_task_executions(wf_ex_id).await?;

        let blocked = tasks
            .iter()
            .any(|t| !t.state().is_completed() && !t.state().is_waiting());

        if blocked {
            return Ok(());
        }

        let spec = workflow_spec_from_json(&wf_ex.spec)?;
        let snapshot = WorkflowSnapshot {
            wf_ex: &wf_ex,
            tasks: &tasks,
            spec: &spec,
        };

        if controller::all_errors_handled(&snapshot, &*self.evaluator) {
            self.succeed_workflow(wf_ex_id, None).await
        } else {
            let message = self.build_fail_info(&snapshot).await;
            self.fail_workflow(wf_ex_id, message).await
        }
    }

    pub(crate) async fn succeed_workflow(
        &self,
        wf_ex_id: Uuid,
        message: Option<String>,
    ) -> Result<()> {
        let mut wf_ex = self.store.get_workflow_execution(wf_ex_id).await?;
        let tasks = self.store.list_task_executions(wf_ex_id).await?;
        let spec = workflow_spec_from_json(&wf_ex.spec)?;

        let final_context = dataflow::evaluate_final_context(&wf_ex, &tasks);

        let output = match dataflow::evaluate_workflow_output(&spec, &final_context, &*self.evaluator)
        {
            Ok(output) => output,
            Err(e) => {
                return self
                    .fail_workflow(wf_ex_id, format!("Failed to evaluate workflow output: {}", e))
                    .await;
            }
        };

        // Output is evaluated before SUCCESS is persisted, so an oversized
        // result turns into a workflow error instead of a half-done state.
        wf_ex.output = Value::Object(output);
        self.set_workflow_state(&mut wf_ex, State::Success, message)?;

        match self.store.save_workflow_execution(&wf_ex).await {
            Ok(_) => {}
            Err(EngineError::SizeLimitExceeded { .. }) => {
                return self.fail_workflow(wf_ex_id, "result too large".to_string()).await;
            }
            Err(e) => return Err(e),
        }

        self.notify_parent_workflow(&wf_ex).await
    }

    pub(crate) async fn fail_workflow(
        &self,
        wf_ex_id: Uuid,
        message: String,
    ) -> Result<()> {
        let mut wf_ex = self.store.get_workflow_execution(wf_ex_id).await?;

        if wf_ex.state().is_completed() {
            return Ok(());
        }

        self.set_workflow_state(&mut wf_ex, State::Error, Some(message.clone()))?;
        wf_ex.output = json!({"result": message});

        self.store.save_workflow_execution(&wf_ex).await?;

        self.notify_parent_workflow(&wf_ex).await
    }

    /// A completed sub-workflow reports to its parent through a zero-delay
    /// delayed call, decoupling the parent advance from this one.
    async fn notify_parent_workflow(&self, wf_ex: &WorkflowExecutionRow) -> Result<()> {
        if wf_ex.task_execution_id.is_none() {
            return Ok(());
        }

        scheduler::schedule_call(
            &*self.store,
            &wf_auth(wf_ex),
            scheduler::TARGET_SEND_RESULT_TO_PARENT,
            json!({"wf_ex_id": wf_ex.id}),
            Duration::ZERO,
        )
        .await?;

        Ok(())
    }

    /// Deliver a terminal sub-workflow result to the owning task.
    pub(crate) async fn send_result_to_parent_workflow(
        &self,
        wf_ex_id: Uuid,
    ) -> Result<()> {
        let wf_ex = self.store.get_workflow_execution(wf_ex_id).await?;

        let Some(task_ex_id) = wf_ex.task_execution_id else {
            return Ok(());
        };

        if !wf_ex.state().is_completed() {
            warn!(
                wf_ex_id = %wf_ex.id,
                state = %wf_ex.state,
                "Sub-workflow reported completion in a non-terminal state"
            );
            return Ok(());
        }

        let task = self.store.get_task_execution(task_ex_id).await?;
        let _lock = self.workflow_lock(task.workflow_execution_id).await;

        self.on_task_subworkflow_complete(task_ex_id).await
    }

    /// Aggregated failure message: failed task names with their state_info
    /// and the outputs of their failed action executions.
    pub(crate) async fn build_fail_info(&self, snapshot: &WorkflowSnapshot<'_>) -> String {
        let mut failed: Vec<_> = snapshot
            .tasks
            .iter()
            .filter(|t| t.state() == State::Error)
            .filter(|t| !controller::is_error_handled_for(snapshot, t, &*self.evaluator))
            .collect();
        failed.sort_by(|a, b| a.name.cmp(&b.name));

        let names: Vec<&str> = failed.iter().map(|t| t.name.as_str()).collect();
        let mut message = format!("Failure caused by error in tasks: {}\n", names.join(", "));

        for task in failed {
            message.push_str(&format!(
                "\n  {} [task_ex_id={}] -> {}\n",
                task.name,
                task.id,
                task.state_info.as_deref().unwrap_or("Unknown")
            ));

            if let Ok(actions) = self.store.list_action_executions(task.id).await {
                for (idx, action) in actions.iter().enumerate() {
                    if action.state() == State::Error {
                        let output = action
                            .output
                            .get("result")
                            .cloned()
                            .unwrap_or_else(|| Value::String("Unknown".to_string()));
                        message.push_str(&format!(
                            "    [action_ex_id={}, idx={}]: {}\n",
                            action.id, idx, output
                        ));
                    }
                }
            }
        }

        message
    }
}
