// Task lifecycle: creation, policy chain, action fan-out (with-items),
// retry accounting, completion and publishing.
//
// The policy chain applies in a fixed order: wait-before -> retry ->
// timeout -> wait-after -> concurrency. All functions here assume the
// caller holds the owning workflow's lock.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use taskweave_core::context::{self, Context, ENV_KEY};
use taskweave_core::AuthContext;
use taskweave_core::expr::{evaluate_guard, evaluate_object};
use taskweave_core::spec::{parse_action_call, TaskSpec, WorkflowSpec};
use taskweave_core::{EngineError, Result, State};
use taskweave_storage::{
    ActionExecutionRow, CreateActionExecution, CreateTaskExecution, TaskExecutionRow,
    WorkflowExecutionRow,
};
use tracing::info;
use uuid::Uuid;

use crate::actions::ActionResult;
use crate::controller::{task_spec_from_row, RunTaskCommand};
use crate::dataflow;
use crate::engine::{wf_auth, Engine, StartParams};
use crate::policies::{evaluate_policies, TaskPolicies};
use crate::scheduler;

// Runtime-context keys tracking per-task engine state.
const RC_TRIGGERED_BY: &str = "triggered_by";
const RC_PAUSE_HANDLED: &str = "pause_handled";
const RC_WAIT_BEFORE_HANDLED: &str = "wait_before_handled";
const RC_WAIT_AFTER_HANDLED: &str = "wait_after_handled";
const RC_TIMEOUT_SCHEDULED: &str = "timeout_scheduled";
const RC_WITH_ITEMS: &str = "with_items";
const RC_RETRY_NO: &str = "retry_no";
const RC_INDEX: &str = "index";

fn rc_flag(task: &TaskExecutionRow, key: &str) -> bool {
    task.runtime_context
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn rc_set(task: &mut TaskExecutionRow, key: &str, value: Value) {
    let mut rc = context::as_object(&task.runtime_context);
    rc.insert(key.to_string(), value);
    task.runtime_context = Value::Object(rc);
}

fn with_items_meta(task: &TaskExecutionRow) -> Option<(usize, usize)> {
    let meta = task.runtime_context.get(RC_WITH_ITEMS)?;
    let count = meta.get("count")?.as_u64()? as usize;
    let submitted = meta.get("submitted").and_then(Value::as_u64).unwrap_or(0) as usize;
    Some((count, submitted))
}

fn set_with_items_meta(task: &mut TaskExecutionRow, count: usize, submitted: usize) {
    rc_set(
        task,
        RC_WITH_ITEMS,
        json!({"count": count, "submitted": submitted}),
    );
}

/// Result of one execution unit: a single action execution or one
/// sub-workflow execution (one per with-items index).
struct UnitResult {
    index: i64,
    completed: bool,
    accepted: bool,
    success: bool,
    output: Value,
    error: Option<String>,
}

impl Engine {
    /// Create (or upgrade) a task execution for a RunTask command. Returns
    /// whether any effective work was started.
    pub(crate) async fn run_new_task(
        &self,
        wf_ex: &WorkflowExecutionRow,
        wf_spec: &WorkflowSpec,
        cmd: &RunTaskCommand,
    ) -> Result<bool> {
        let task_spec = wf_spec.effective_task_spec(&cmd.task_name)?;

        let existing = self
            .store
            .list_task_executions(wf_ex.id)
            .await?
            .into_iter()
            .filter(|t| t.name == cmd.task_name)
            .max_by_key(|t| t.created_at);

        let mut task = match existing {
            Some(mut task) if task.state() == State::Waiting => {
                // Join placeholder: accumulate context, upgrade when ready.
                let mut in_ctx = context::as_object(&task.in_context);
                context::merge_into(&mut in_ctx, &cmd.context);
                task.in_context = Value::Object(in_ctx);

                if cmd.waiting {
                    self.store.save_task_execution(&task).await?;
                    return Ok(false);
                }

                task.set_state(State::Running);
                self.store.save_task_execution(&task).await?
            }
            Some(task) => {
                // Idempotency: one execution per (task name, trigger).
                let same_trigger = task.runtime_context.get(RC_TRIGGERED_BY)
                    == Some(&trigger_value(cmd.triggered_by));

                if cmd.triggered_by.is_none() || same_trigger {
                    return Ok(false);
                }

                self.create_task_execution(wf_ex, &task_spec, cmd).await?
            }
            None => self.create_task_execution(wf_ex, &task_spec, cmd).await?,
        };

        if cmd.waiting {
            return Ok(false);
        }

        if task.state() == State::Idle {
            // Parked by pause-before: the workflow pauses until resumed.
            let mut wf_ex = self.store.get_workflow_execution(wf_ex.id).await?;
            self.set_workflow_state(&mut wf_ex, State::Paused, None)?;
            self.store.save_workflow_execution(&wf_ex).await?;
            return Ok(true);
        }

        if self.before_start_policies(wf_ex, &task_spec, &mut task).await? {
            return Ok(true);
        }

        self.start_task_actions(wf_ex, &task_spec, &mut task).await?;

        Ok(true)
    }

    async fn create_task_execution(
        &self,
        wf_ex: &WorkflowExecutionRow,
        task_spec: &TaskSpec,
        cmd: &RunTaskCommand,
    ) -> Result<TaskExecutionRow> {
        let state = if cmd.waiting {
            State::Waiting
        } else if task_spec.pause_before {
            State::Idle
        } else {
            State::Running
        };

        let spec_json = serde_json::to_value(task_spec)
            .map_err(|e| EngineError::dsl(format!("Unserializable task spec: {}", e)))?;

        let mut runtime_context = serde_json::Map::new();
        runtime_context.insert(RC_TRIGGERED_BY.to_string(), trigger_value(cmd.triggered_by));
        if state == State::Idle {
            runtime_context.insert(RC_PAUSE_HANDLED.to_string(), json!(true));
        }

        info!(
            wf_ex_id = %wf_ex.id,
            task = %cmd.task_name,
            state = %state,
            "Creating task execution"
        );

        self.store
            .create_task_execution(CreateTaskExecution {
                name: cmd.task_name.clone(),
                workflow_execution_id: wf_ex.id,
                workflow_name: wf_ex.workflow_name.clone(),
                workflow_id: wf_ex.workflow_id,
                project_id: wf_ex.project_id.clone(),
                spec: spec_json,
                action_spec: json!({}),
                state,
                in_context: Value::Object(cmd.context.clone()),
                runtime_context: Value::Object(runtime_context),
            })
            .await
    }

    /// wait-before and timeout, in chain order. Returns true if the task
    /// was parked.
    async fn before_start_policies(
        &self,
        wf_ex: &WorkflowExecutionRow,
        task_spec: &TaskSpec,
        task: &mut TaskExecutionRow,
    ) -> Result<bool> {
        let ctx = context::as_object(&task.in_context);
        let policies = evaluate_policies(task_spec, &ctx, &*self.evaluator)?;

        if let Some(delay) = policies.wait_before {
            if delay > 0 && !rc_flag(task, RC_WAIT_BEFORE_HANDLED) {
                rc_set(task, RC_WAIT_BEFORE_HANDLED, json!(true));
                task.set_state(State::RunningDelayed);
                self.store.save_task_execution(task).await?;

                scheduler::schedule_call(
                    &*self.store,
                    &wf_auth(wf_ex),
                    scheduler::TARGET_RUN_DEFERRED_TASK,
                    json!({"task_ex_id": task.id}),
                    Duration::from_secs(delay),
                )
                .await?;

                return Ok(true);
            }
        }

        if let Some(timeout) = policies.timeout {
            if timeout > 0 && !rc_flag(task, RC_TIMEOUT_SCHEDULED) {
                rc_set(task, RC_TIMEOUT_SCHEDULED, json!(true));
                self.store.save_task_execution(task).await?;

                scheduler::schedule_call(
                    &*self.store,
                    &wf_auth(wf_ex),
                    scheduler::TARGET_FAIL_TASK_ON_TIMEOUT,
                    json!({"task_ex_id": task.id}),
                    Duration::from_secs(timeout),
                )
                .await?;
            }
        }

        Ok(false)
    }

    /// Resolve the action/sub-workflow and fan out the first invocations.
    pub(crate) async fn start_task_actions(
        &self,
        wf_ex: &WorkflowExecutionRow,
        task_spec: &TaskSpec,
        task: &mut TaskExecutionRow,
    ) -> Result<()> {
        let ctx = context::as_object(&task.in_context);

        if task_spec.with_items.is_some() {
            let items = self.evaluate_with_items(task_spec, &ctx)?;
            let count = items.first().map(|(_, arr)| arr.len()).unwrap_or(0);

            set_with_items_meta(task, count, 0);
            self.store.save_task_execution(task).await?;

            if count == 0 {
                // Fanning out over nothing succeeds immediately.
                return self
                    .complete_task(wf_ex.id, task.id, State::Success, json!([]), None)
                    .await;
            }

            let policies = evaluate_policies(task_spec, &ctx, &*self.evaluator)?;
            let cap = policies.concurrency.unwrap_or(count).max(1);

            for index in 0..count.min(cap) {
                self.submit_task_action(wf_ex, task_spec, task, Some(index as i64), 0)
                    .await?;
            }
        } else {
            self.submit_task_action(wf_ex, task_spec, task, None, 0)
                .await?;
        }

        Ok(())
    }

    fn evaluate_with_items(
        &self,
        task_spec: &TaskSpec,
        ctx: &Context,
    ) -> Result<Vec<(String, Vec<Value>)>> {
        let Some(with_items) = &task_spec.with_items else {
            return Ok(vec![]);
        };

        let mut items = Vec::new();

        for (var, expr) in with_items.bindings()? {
            let value = self.evaluator.evaluate(&expr, ctx)?;

            let array = value
                .as_array()
                .cloned()
                .ok_or_else(|| {
                    EngineError::invalid_input(format!(
                        "with-items expression must evaluate to a list: {}",
                        expr
                    ))
                })?;

            items.push((var, array));
        }

        let lengths: Vec<usize> = items.iter().map(|(_, arr)| arr.len()).collect();
        if lengths.windows(2).any(|w| w[0] != w[1]) {
            return Err(EngineError::invalid_input(format!(
                "with-items collections must have equal lengths, got {:?}",
                lengths
            )));
        }

        Ok(items)
    }

    /// Submit one invocation: an action execution, or a sub-workflow start.
    pub(crate) async fn submit_task_action(
        &self,
        wf_ex: &WorkflowExecutionRow,
        task_spec: &TaskSpec,
        task: &mut TaskExecutionRow,
        index: Option<i64>,
        retry_no: u32,
    ) -> Result<()> {
        let mut ctx = context::as_object(&task.in_context);

        if let Some(idx) = index {
            for (var, array) in self.evaluate_with_items(task_spec, &ctx)? {
                let item = array.get(idx as usize).cloned().unwrap_or(Value::Null);
                ctx.insert(var, item);
            }

            if let Some((count, submitted)) = with_items_meta(task) {
                set_with_items_meta(task, count, submitted.max(idx as usize + 1));
            }
        }

        if let Some(sub_wf_name) = &task_spec.workflow {
            let input = evaluate_object(&*self.evaluator, &task_spec.input, &ctx)?;

            self.store.save_task_execution(task).await?;

            let params = StartParams {
                env: ctx.get(ENV_KEY).cloned(),
                task_name: None,
                task_execution_id: Some(task.id),
                index,
            };

            // Boxed to break the start_workflow -> task -> start_workflow
            // recursion in the future types. The call is routed through a
            // free function so the boxed future's opaque type is registered
            // outside submit_task_action's own defining scope.
            let engine = self.handle();
            let sub_name = sub_wf_name.clone();
            let auth = wf_auth(wf_ex);
            start_sub_workflow_boxed(engine, sub_name, Value::Object(input), params, auth).await?;

            return Ok(());
        }

        let call_str = task_spec.action.clone().unwrap_or_else(|| "std.noop".to_string());
        let call = parse_action_call(&call_str)?;

        // Inline parameters first, the input mapping wins on collision.
        let mut input = evaluate_object(&*self.evaluator, &call.params, &ctx)?;
        let explicit = evaluate_object(&*self.evaluator, &task_spec.input, &ctx)?;
        context::merge_into(&mut input, &explicit);

        let (action_name, action_input) = self
            .resolve_action(&call.name, input, &wf_auth(wf_ex))
            .await?;

        if task.action_spec.as_object().map(|m| m.is_empty()).unwrap_or(true) {
            task.action_spec = json!({"name": action_name, "input": action_input});
        }
        self.store.save_task_execution(task).await?;

        let action_ex = self
            .store
            .create_action_execution(CreateActionExecution {
                name: action_name.clone(),
                description: None,
                task_execution_id: Some(task.id),
                project_id: wf_ex.project_id.clone(),
                input: Value::Object(action_input.clone()),
                state: State::Running,
                runtime_context: json!({RC_INDEX: index, RC_RETRY_NO: retry_no}),
            })
            .await?;

        self.executor
            .run_action(self.handle(), action_ex.id, action_name, action_input)
            .await;

        Ok(())
    }

    /// Route an action result to its owning task: retry accounting, result
    /// acceptance, with-items bookkeeping, after-task policies, completion.
    pub(crate) async fn on_task_action_complete(
        &self,
        task_ex_id: Uuid,
        mut action_ex: ActionExecutionRow,
        result: ActionResult,
    ) -> Result<()> {
        let mut task = self.store.get_task_execution(task_ex_id).await?;

        if task.state().is_completed() {
            // Late result (e.g. after a timeout): record it, change nothing.
            action_ex.set_state(if result.is_success() {
                State::Success
            } else {
                State::Error
            });
            action_ex.output = action_output(&result);
            self.store.save_action_execution(&action_ex).await?;
            return Ok(());
        }

        let task_spec = task_spec_from_row(&task)?;
        let ctx = context::as_object(&task.in_context);
        let policies = evaluate_policies(&task_spec, &ctx, &*self.evaluator)?;

        let success = result.is_success();
        let retry_no = action_ex
            .runtime_context
            .get(RC_RETRY_NO)
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let index = action_ex.runtime_context.get(RC_INDEX).and_then(Value::as_i64);

        if let Some(retry) = &policies.retry {
            if self.should_retry(&task, retry, &result, retry_no)? {
                // Superseded attempt: terminal but never authoritative.
                action_ex.set_state(if success { State::Success } else { State::Error });
                action_ex.accepted = false;
                action_ex.output = action_output(&result);
                action_ex.state_info = result.error.clone();
                self.store.save_action_execution(&action_ex).await?;

                let wf_ex = self
                    .store
                    .get_workflow_execution(task.workflow_execution_id)
                    .await?;

                match retry.delay {
                    Some(delay) if delay > 0 => {
                        scheduler::schedule_call(
                            &*self.store,
                            &wf_auth(&wf_ex),
                            scheduler::TARGET_RESUBMIT_TASK_ACTION,
                            json!({
                                "task_ex_id": task.id,
                                "index": index,
                                "retry_no": retry_no + 1,
                            }),
                            Duration::from_secs(delay),
                        )
                        .await?;
                    }
                    _ => {
                        self.submit_task_action(&wf_ex, &task_spec, &mut task, index, retry_no + 1)
                            .await?;
                    }
                }

                return Ok(());
            }
        }

        // The result becomes authoritative for the task.
        action_ex.accepted = true;
        action_ex.set_state(if success { State::Success } else { State::Error });
        action_ex.output = action_output(&result);
        action_ex.state_info = result.error.clone();

        match self.store.save_action_execution(&action_ex).await {
            Ok(_) => {}
            Err(EngineError::SizeLimitExceeded { .. }) => {
                action_ex.output = json!({"result": "result too large"});
                action_ex.set_state(State::Error);
                action_ex.state_info = Some("result too large".to_string());
                self.store.save_action_execution(&action_ex).await?;
            }
            Err(e) => return Err(e),
        }

        self.finalize_or_wait(task.id, &task_spec, &policies).await
    }

    /// Route a terminal sub-workflow result to its owning task. The result
    /// itself is re-derived from the persisted sub-workflow executions, so
    /// duplicate deliveries converge on the same outcome.
    pub(crate) async fn on_task_subworkflow_complete(&self, task_ex_id: Uuid) -> Result<()> {
        let task = self.store.get_task_execution(task_ex_id).await?;

        if task.state().is_completed() {
            return Ok(());
        }

        let task_spec = task_spec_from_row(&task)?;
        let ctx = context::as_object(&task.in_context);
        let policies = evaluate_policies(&task_spec, &ctx, &*self.evaluator)?;

        self.finalize_or_wait(task.id, &task_spec, &policies).await
    }

    fn should_retry(
        &self,
        task: &TaskExecutionRow,
        retry: &crate::policies::RetryPolicy,
        result: &ActionResult,
        retry_no: u32,
    ) -> Result<bool> {
        if retry_no >= retry.count {
            return Ok(false);
        }

        let mut ctx = context::as_object(&task.in_context);
        if let Some(data) = &result.data {
            ctx.insert(task.name.clone(), data.clone());
        }

        if let Some(break_on) = &retry.break_on {
            if evaluate_guard(&*self.evaluator, break_on, &ctx)? {
                return Ok(false);
            }
        }

        if result.is_success() {
            if let Some(continue_on) = &retry.continue_on {
                return evaluate_guard(&*self.evaluator, continue_on, &ctx);
            }
            return Ok(false);
        }

        Ok(true)
    }

    /// Submit pending with-items iterations, then either complete the task
    /// or keep waiting for outstanding units. wait-after parks the task one
    /// last time before completion.
    pub(crate) async fn finalize_or_wait(
        &self,
        task_ex_id: Uuid,
        task_spec: &TaskSpec,
        policies: &TaskPolicies,
    ) -> Result<()> {
        let mut task = self.store.get_task_execution(task_ex_id).await?;
        let wf_ex = self
            .store
            .get_workflow_execution(task.workflow_execution_id)
            .await?;

        let units = self.collect_units(&task, task_spec).await?;

        let (state, result_value, state_info) = if let Some((count, mut submitted)) =
            with_items_meta(&task)
        {
            let mut in_flight = units.iter().filter(|u| !u.completed).count();
            let cap = policies.concurrency.unwrap_or(count).max(1);

            while submitted < count && in_flight < cap {
                self.submit_task_action(
                    &wf_ex,
                    task_spec,
                    &mut task,
                    Some(submitted as i64),
                    0,
                )
                .await?;
                submitted += 1;
                in_flight += 1;
            }

            // Latest accepted unit per index is authoritative.
            let mut accepted: Vec<Option<&UnitResult>> = vec![None; count];
            for unit in &units {
                if unit.accepted && (unit.index as usize) < count {
                    accepted[unit.index as usize] = Some(unit);
                }
            }

            if accepted.iter().any(Option::is_none) {
                return Ok(());
            }

            let mut results = Vec::with_capacity(count);
            let mut errors = Vec::new();

            for unit in accepted.into_iter().flatten() {
                results.push(unit.output.clone());
                if !unit.success {
                    errors.push(
                        unit.error
                            .clone()
                            .unwrap_or_else(|| "Unknown error".to_string()),
                    );
                }
            }

            if errors.is_empty() {
                (State::Success, Value::Array(results), None)
            } else {
                (State::Error, Value::Array(results), Some(errors.join("; ")))
            }
        } else {
            let Some(unit) = units.iter().rev().find(|u| u.accepted) else {
                return Ok(());
            };

            if unit.success {
                (State::Success, unit.output.clone(), None)
            } else {
                (
                    State::Error,
                    Value::Null,
                    Some(unit.error.clone().unwrap_or_else(|| "Unknown error".to_string())),
                )
            }
        };

        if let Some(delay) = policies.wait_after {
            if delay > 0 && !rc_flag(&task, RC_WAIT_AFTER_HANDLED) {
                rc_set(&mut task, RC_WAIT_AFTER_HANDLED, json!(true));
                task.set_state(State::RunningDelayed);
                self.store.save_task_execution(&task).await?;

                scheduler::schedule_call(
                    &*self.store,
                    &wf_auth(&wf_ex),
                    scheduler::TARGET_COMPLETE_DEFERRED_TASK,
                    json!({"task_ex_id": task.id}),
                    Duration::from_secs(delay),
                )
                .await?;

                return Ok(());
            }
        }

        self.complete_task(wf_ex.id, task.id, state, result_value, state_info)
            .await
    }

    async fn collect_units(
        &self,
        task: &TaskExecutionRow,
        task_spec: &TaskSpec,
    ) -> Result<Vec<UnitResult>> {
        if task_spec.workflow.is_some() {
            let subs = self
                .store
                .list_workflow_executions_by_task(task.id)
                .await?;

            Ok(subs
                .iter()
                .map(|wf| UnitResult {
                    index: wf.with_items_index(),
                    completed: wf.state().is_completed(),
                    accepted: wf.accepted,
                    success: wf.state() == State::Success,
                    output: wf.output.clone(),
                    error: wf.state_info.clone(),
                })
                .collect())
        } else {
            let actions = self.store.list_action_executions(task.id).await?;

            Ok(actions
                .iter()
                .map(|a| UnitResult {
                    index: a.with_items_index(),
                    completed: a.state().is_completed(),
                    accepted: a.accepted,
                    success: a.state() == State::Success,
                    output: a.output.clone(),
                    error: a
                        .state_info
                        .clone()
                        .or_else(|| a.output.get("result").map(value_to_string)),
                })
                .collect())
        }
    }

    /// Terminal task transition: record the result, evaluate publish on
    /// success, then hand the completion to the workflow controller.
    pub(crate) async fn complete_task(
        &self,
        wf_ex_id: Uuid,
        task_ex_id: Uuid,
        state: State,
        result_value: Value,
        state_info: Option<String>,
    ) -> Result<()> {
        let mut task = self.store.get_task_execution(task_ex_id).await?;
        let task_spec = task_spec_from_row(&task)?;

        let mut state = state;
        let mut state_info = state_info;

        rc_set(&mut task, dataflow::RESULT_KEY, result_value);

        if state == State::Success {
            let publish_ctx = dataflow::task_post_context(&task);

            match evaluate_object(&*self.evaluator, &task_spec.publish, &publish_ctx) {
                Ok(published) => task.published = Value::Object(published),
                Err(e) => {
                    state = State::Error;
                    state_info = Some(format!("Failed to publish variables: {}", e));
                }
            }
        }

        let current = task.state();
        if !taskweave_core::states::is_valid_transition(current, state) {
            return Err(EngineError::invalid_state(format!(
                "Can't change task state from {} to {}. [task={}, task_ex_id={}]",
                current, state, task.name, task.id
            )));
        }

        info!(
            task = %task.name,
            task_ex_id = %task.id,
            "Task execution [{} -> {}]",
            current,
            state
        );

        task.set_state(state);
        task.state_info = state_info;

        match self.store.save_task_execution(&task).await {
            Ok(_) => {}
            Err(EngineError::SizeLimitExceeded { .. }) => {
                task.published = json!({});
                task.set_state(State::Error);
                task.state_info = Some("result too large".to_string());
                self.store.save_task_execution(&task).await?;
            }
            Err(e) => return Err(e),
        }

        // Boxed to break the task-completion -> controller -> new-task
        // recursion in the future types. The call is routed through a
        // free function so the boxed future's opaque type is registered
        // outside complete_task's own defining scope.
        continue_workflow_after_boxed(self.handle(), wf_ex_id).await
    }

    // ============================================
    // Deferred-call entry points
    // ============================================

    /// wait-before elapsed: resume the parked task.
    pub(crate) async fn run_deferred_task(&self, task_ex_id: Uuid) -> Result<()> {
        let task = self.store.get_task_execution(task_ex_id).await?;
        let _lock = self.workflow_lock(task.workflow_execution_id).await;

        let mut task = self.store.get_task_execution(task_ex_id).await?;

        if task.state() != State::RunningDelayed {
            return Ok(());
        }

        task.set_state(State::Running);
        self.store.save_task_execution(&task).await?;

        let wf_ex = self
            .store
            .get_workflow_execution(task.workflow_execution_id)
            .await?;
        let task_spec = task_spec_from_row(&task)?;

        if self.before_start_policies(&wf_ex, &task_spec, &mut task).await? {
            return Ok(());
        }

        self.start_task_actions(&wf_ex, &task_spec, &mut task).await
    }

    /// wait-after elapsed: finish the completion that was parked.
    pub(crate) async fn complete_deferred_task(&self, task_ex_id: Uuid) -> Result<()> {
        let task = self.store.get_task_execution(task_ex_id).await?;
        let _lock = self.workflow_lock(task.workflow_execution_id).await;

        let mut task = self.store.get_task_execution(task_ex_id).await?;

        if task.state() != State::RunningDelayed {
            return Ok(());
        }

        task.set_state(State::Running);
        self.store.save_task_execution(&task).await?;

        let task_spec = task_spec_from_row(&task)?;
        let ctx = context::as_object(&task.in_context);
        let policies = evaluate_policies(&task_spec, &ctx, &*self.evaluator)?;

        self.finalize_or_wait(task.id, &task_spec, &policies).await
    }

    /// Retry delay elapsed: submit the next attempt.
    pub(crate) async fn resubmit_task_action(
        &self,
        task_ex_id: Uuid,
        index: Option<i64>,
        retry_no: u32,
    ) -> Result<()> {
        let task = self.store.get_task_execution(task_ex_id).await?;
        let _lock = self.workflow_lock(task.workflow_execution_id).await;

        let mut task = self.store.get_task_execution(task_ex_id).await?;

        if task.state().is_completed() {
            return Ok(());
        }

        let wf_ex = self
            .store
            .get_workflow_execution(task.workflow_execution_id)
            .await?;
        let task_spec = task_spec_from_row(&task)?;

        self.submit_task_action(&wf_ex, &task_spec, &mut task, index, retry_no)
            .await
    }

    /// Timeout fired before completion: the task fails with "Timeout".
    pub(crate) async fn fail_task_on_timeout(&self, task_ex_id: Uuid) -> Result<()> {
        let task = self.store.get_task_execution(task_ex_id).await?;
        let _lock = self.workflow_lock(task.workflow_execution_id).await;

        let task = self.store.get_task_execution(task_ex_id).await?;

        if task.state().is_completed() {
            return Ok(());
        }

        info!(task_ex_id = %task.id, task = %task.name, "Task timed out");

        self.complete_task(
            task.workflow_execution_id,
            task.id,
            State::Error,
            Value::Null,
            Some("Timeout".to_string()),
        )
        .await
    }

    /// pause-before parked the task in IDLE; resume runs it.
    pub(crate) async fn resume_parked_task(
        &self,
        wf_ex: &WorkflowExecutionRow,
        task_ex_id: Uuid,
    ) -> Result<()> {
        let mut task = self.store.get_task_execution(task_ex_id).await?;

        if task.state() != State::Idle {
            return Ok(());
        }

        task.set_state(State::Running);
        self.store.save_task_execution(&task).await?;

        let task_spec = task_spec_from_row(&task)?;

        if self.before_start_policies(wf_ex, &task_spec, &mut task).await? {
            return Ok(());
        }

        self.start_task_actions(wf_ex, &task_spec, &mut task).await
    }

    /// Rerun support: reset action acceptance and re-enter the task.
    pub(crate) async fn reset_task_for_rerun(
        &self,
        wf_ex: &WorkflowExecutionRow,
        mut task: TaskExecutionRow,
        task_spec: &TaskSpec,
        reset: bool,
    ) -> Result<()> {
        let actions = self.store.list_action_executions(task.id).await?;

        for mut action in actions {
            if reset || action.state() == State::Error {
                action.accepted = false;
                self.store.save_action_execution(&action).await?;
            }
        }

        let mut rc = context::as_object(&task.runtime_context);
        rc.remove(dataflow::RESULT_KEY);
        if reset {
            rc.remove(RC_WITH_ITEMS);
        }
        task.runtime_context = Value::Object(rc);

        task.set_state(State::Running);
        task.state_info = None;
        task.processed = false;
        self.store.save_task_execution(&task).await?;

        if reset {
            self.start_task_actions(wf_ex, task_spec, &mut task).await
        } else {
            // Preserve succeeded iterations; resubmit only failed ones.
            let units = self.collect_units(&task, task_spec).await?;
            let (count, _) = with_items_meta(&task).unwrap_or((0, 0));

            let mut accepted = vec![false; count];
            for unit in &units {
                if unit.accepted && (unit.index as usize) < count {
                    accepted[unit.index as usize] = true;
                }
            }

            for (index, done) in accepted.iter().enumerate() {
                if !done {
                    self.submit_task_action(wf_ex, task_spec, &mut task, Some(index as i64), 0)
                        .await?;
                }
            }

            Ok(())
        }
    }
}

fn continue_workflow_after_boxed(engine: Arc<Engine>, wf_ex_id: Uuid) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move { engine.continue_workflow_after(wf_ex_id, false).await })
}

fn start_sub_workflow_boxed(
    engine: Arc<Engine>,
    wf_name: String,
    wf_input: Value,
    params: StartParams,
    auth: AuthContext,
) -> BoxFuture<'static, Result<WorkflowExecutionRow>> {
    Box::pin(async move {
        engine
            .start_workflow(&wf_name, wf_input, None, params, &auth)
            .await
    })
}

fn trigger_value(triggered_by: Option<Uuid>) -> Value {
    match triggered_by {
        Some(id) => json!(id.to_string()),
        None => Value::Null,
    }
}

fn action_output(result: &ActionResult) -> Value {
    match result {
        r if r.is_success() => r.data.clone().unwrap_or(Value::Null),
        r => json!({"result": r.error.clone().unwrap_or_default()}),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
