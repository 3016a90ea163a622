// Engine façade: the public operations over workflow executions.
//
// Every operation acquires the per-workflow lock before touching execution
// state, so task completions for the same workflow are serialized and the
// controller always observes a consistent set of completed tasks.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use taskweave_core::context::{self, Context};
use taskweave_core::expr::{Evaluator, PathEvaluator};
use taskweave_core::spec::{self, WorkflowType};
use taskweave_core::{AuthContext, EngineConfig, EngineError, Result, State};
use taskweave_storage::{
    ActionExecutionRow, CreateActionDefinition, CreateActionExecution, CreateWorkflowDefinition,
    CreateWorkflowExecution, StateStore, TaskExecutionRow, WorkflowDefinitionRow,
    WorkflowExecutionRow,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

use crate::actions::{ActionExecutor, ActionRegistry, ActionResult, LocalExecutor};
use crate::dataflow;

/// Workflow start parameters. `env` is canonical here; the `__env` context
/// key is a view derived from it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartParams {
    /// Inline environment mapping, or the name of a stored environment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Value>,
    /// Target task for reverse workflows
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    /// Parent task execution (set iff this is a sub-workflow)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_execution_id: Option<Uuid>,
    /// Position among siblings spawned by a with-items parent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,
}

impl StartParams {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

pub struct Engine {
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) executor: Arc<dyn ActionExecutor>,
    pub(crate) evaluator: Arc<dyn Evaluator>,
    pub(crate) config: EngineConfig,
    /// Per-workflow advance serialization
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    /// Self-handle for handing an owned engine to spawned work
    me: Weak<Engine>,
}

impl Engine {
    /// Engine with the std.* action registry and the builtin evaluator.
    pub fn new(store: Arc<dyn StateStore>, config: EngineConfig) -> Arc<Self> {
        Self::with_registry(store, config, Arc::new(ActionRegistry::with_std()))
    }

    /// Engine with a custom action registry.
    pub fn with_registry(
        store: Arc<dyn StateStore>,
        config: EngineConfig,
        registry: Arc<ActionRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Engine {
            store,
            executor: Arc::new(LocalExecutor::new(registry)),
            evaluator: Arc::new(PathEvaluator),
            config,
            locks: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    /// Owned handle to this engine. Engine methods are only reachable
    /// through the Arc, so the upgrade cannot fail while `self` is alive.
    pub(crate) fn handle(&self) -> Arc<Engine> {
        self.me.upgrade().expect("engine outlived its Arc")
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Acquire the workflow lock. Also touches the execution row, which is
    /// where a multi-node Postgres deployment contends on the row itself.
    pub(crate) async fn workflow_lock(&self, wf_ex_id: Uuid) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(wf_ex_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let guard = mutex.lock_owned().await;

        let touched = taskweave_storage::store::retry_transient(self.config.db_retry_count, || {
            self.store.touch_workflow_execution(wf_ex_id)
        })
        .await;

        if let Err(e) = touched {
            warn!(wf_ex_id = %wf_ex_id, error = %e, "Failed to touch workflow execution row");
        }

        guard
    }

    // ============================================
    // Definition services
    // ============================================

    /// Parse a DSL document and create (or update) one definition per
    /// workflow, plus any ad-hoc actions it declares.
    pub async fn create_workflows(
        &self,
        definition: &str,
        auth: &AuthContext,
    ) -> Result<Vec<WorkflowDefinitionRow>> {
        let list = spec::parse_workflow_list(definition)?;

        let mut created = Vec::with_capacity(list.workflows.len());

        for (name, wf_spec) in &list.workflows {
            let spec_json = serde_json::to_value(wf_spec)
                .map_err(|e| EngineError::dsl(format!("Unserializable workflow spec: {}", e)))?;

            let row = match self.store.load_workflow_definition(name, auth).await? {
                Some(_) => {
                    self.store
                        .update_workflow_definition(
                            name,
                            auth,
                            definition.to_string(),
                            spec_json,
                            vec![],
                        )
                        .await?
                }
                None => {
                    self.store
                        .create_workflow_definition(CreateWorkflowDefinition {
                            name: name.clone(),
                            project_id: auth.project_id.clone(),
                            scope: "private".to_string(),
                            definition: definition.to_string(),
                            spec: spec_json,
                            tags: vec![],
                            is_system: false,
                        })
                        .await?
                }
            };

            created.push(row);
        }

        for (name, action_spec) in &list.actions {
            if self.store.load_action_definition(name, auth).await?.is_some() {
                continue;
            }

            let spec_json = serde_json::to_value(action_spec)
                .map_err(|e| EngineError::dsl(format!("Unserializable action spec: {}", e)))?;

            self.store
                .create_action_definition(CreateActionDefinition {
                    name: name.clone(),
                    project_id: auth.project_id.clone(),
                    scope: "private".to_string(),
                    description: action_spec.description.clone(),
                    definition: Some(definition.to_string()),
                    spec: spec_json,
                    input: None,
                    action_class: None,
                    attributes: json!({}),
                    tags: vec![],
                    is_system: false,
                })
                .await?;
        }

        Ok(created)
    }

    // ============================================
    // Workflow operations
    // ============================================

    /// Start a workflow: validate input, resolve the environment, persist
    /// the execution in IDLE, transition to RUNNING, compute and dispatch
    /// the initial command set.
    pub async fn start_workflow(
        &self,
        wf_name: &str,
        wf_input: Value,
        description: Option<String>,
        mut params: StartParams,
        auth: &AuthContext,
    ) -> Result<WorkflowExecutionRow> {
        let def = self
            .store
            .load_workflow_definition(wf_name, auth)
            .await?
            .ok_or_else(|| {
                EngineError::not_found(format!("Workflow not found [workflow_name={}]", wf_name))
            })?;

        let wf_spec = spec::workflow_spec_from_json(&def.spec)?;

        let input = validate_input(wf_name, &wf_spec, wf_input)?;

        let env = self.resolve_environment(params.env.take(), auth).await?;
        params.env = Some(Value::Object(env.clone()));

        if wf_spec.wf_type == WorkflowType::Reverse && params.task_name.is_none() {
            return Err(EngineError::invalid_input(format!(
                "Reverse workflow '{}' requires a 'task_name' parameter",
                wf_name
            )));
        }

        let params_json = serde_json::to_value(&params)
            .map_err(|e| EngineError::invalid_input(format!("Unserializable params: {}", e)))?;

        let mut wf_ex = self
            .store
            .create_workflow_execution(CreateWorkflowExecution {
                name: def.name.clone(),
                description,
                workflow_name: def.name.clone(),
                workflow_id: Some(def.id),
                project_id: auth.project_id.clone(),
                spec: def.spec.clone(),
                state: State::Idle,
                input: Value::Object(input),
                params: params_json,
                context: json!({}),
                runtime_context: json!({"index": params.index.unwrap_or(0)}),
                task_execution_id: params.task_execution_id,
            })
            .await?;

        info!(
            wf_ex_id = %wf_ex.id,
            workflow = %wf_name,
            "Starting workflow"
        );

        dataflow::seed_workflow_context(&mut wf_ex, &wf_spec, &env, &*self.evaluator)?;
        wf_ex = self.store.save_workflow_execution(&wf_ex).await?;

        let _lock = self.workflow_lock(wf_ex.id).await;

        self.set_workflow_state(&mut wf_ex, State::Running, None)?;
        self.store.save_workflow_execution(&wf_ex).await?;

        self.continue_workflow_after(wf_ex.id, false).await?;

        self.store.get_workflow_execution(wf_ex.id).await
    }

    /// Run a single action outside any workflow. With `save_result=false`
    /// the row is deleted after a successful run.
    pub async fn start_action(
        &self,
        action_name: &str,
        action_input: Value,
        description: Option<String>,
        save_result: bool,
        auth: &AuthContext,
    ) -> Result<ActionExecutionRow> {
        let input = context::as_object(&action_input);

        let (final_name, final_input) = self.resolve_action(action_name, input, auth).await?;

        if !self.executor.has_action(&final_name).await {
            return Err(EngineError::not_found(format!(
                "Action not found [action_name={}]",
                action_name
            )));
        }

        let action_ex = self
            .store
            .create_action_execution(CreateActionExecution {
                name: final_name.clone(),
                description,
                task_execution_id: None,
                project_id: auth.project_id.clone(),
                input: Value::Object(final_input.clone()),
                state: State::Running,
                runtime_context: json!({"save_result": save_result}),
            })
            .await?;

        self.executor
            .run_action(self.handle(), action_ex.id, final_name, final_input)
            .await;

        Ok(action_ex)
    }

    /// Idempotent result sink: updates the action execution and routes the
    /// result to the owning task, which publishes variables and reports
    /// completion to the owning workflow.
    pub async fn on_action_complete(
        &self,
        action_ex_id: Uuid,
        result: ActionResult,
    ) -> Result<ActionExecutionRow> {
        let action_ex = self.store.get_action_execution(action_ex_id).await?;

        if action_ex.state().is_completed() {
            return Ok(action_ex);
        }

        match action_ex.task_execution_id {
            Some(task_ex_id) => {
                let task = self.store.get_task_execution(task_ex_id).await?;
                let _lock = self.workflow_lock(task.workflow_execution_id).await;

                // Re-check under the lock: a concurrent delivery may have
                // won the race.
                let action_ex = self.store.get_action_execution(action_ex_id).await?;
                if action_ex.state().is_completed() {
                    return Ok(action_ex);
                }

                self.on_task_action_complete(task_ex_id, action_ex, result)
                    .await?;

                self.store.get_action_execution(action_ex_id).await
            }
            None => self.complete_standalone_action(action_ex, result).await,
        }
    }

    pub async fn pause_workflow(&self, wf_ex_id: Uuid) -> Result<WorkflowExecutionRow> {
        let _lock = self.workflow_lock(wf_ex_id).await;

        let mut wf_ex = self.store.get_workflow_execution(wf_ex_id).await?;

        self.set_workflow_state(&mut wf_ex, State::Paused, None)?;
        self.store.save_workflow_execution(&wf_ex).await
    }

    /// Resume a paused workflow, picking up tasks that completed while
    /// paused and tasks parked by pause-before.
    pub async fn resume_workflow(
        &self,
        wf_ex_id: Uuid,
        env: Option<Value>,
    ) -> Result<WorkflowExecutionRow> {
        let _lock = self.workflow_lock(wf_ex_id).await;

        let mut wf_ex = self.store.get_workflow_execution(wf_ex_id).await?;

        if wf_ex.state() != State::Paused {
            return Err(EngineError::invalid_state(format!(
                "Workflow is not paused [execution_id={}, state={}]",
                wf_ex_id, wf_ex.state
            )));
        }

        self.update_execution_env(&mut wf_ex, env).await?;

        self.set_workflow_state(&mut wf_ex, State::Running, None)?;
        self.store.save_workflow_execution(&wf_ex).await?;
        self.propagate_running_to_parents(&wf_ex).await?;

        // Tasks parked by pause-before resume first.
        let parked: Vec<TaskExecutionRow> = self
            .store
            .list_task_executions(wf_ex_id)
            .await?
            .into_iter()
            .filter(|t| t.state() == State::Idle)
            .collect();

        for task in parked {
            self.resume_parked_task(&wf_ex, task.id).await?;
        }

        self.continue_workflow_after(wf_ex_id, true).await?;

        self.store.get_workflow_execution(wf_ex_id).await
    }

    /// Stop a workflow in SUCCESS or ERROR. In-flight actions are not
    /// interrupted; their results are still accepted but no further
    /// commands are emitted.
    pub async fn stop_workflow(
        &self,
        wf_ex_id: Uuid,
        state: State,
        message: Option<String>,
    ) -> Result<WorkflowExecutionRow> {
        let _lock = self.workflow_lock(wf_ex_id).await;

        match state {
            State::Success => self.succeed_workflow(wf_ex_id, message).await?,
            State::Error => {
                let message = message.unwrap_or_else(|| "Workflow is stopped".to_string());
                self.fail_workflow(wf_ex_id, message).await?;
            }
            other => {
                return Err(EngineError::invalid_state(format!(
                    "Cannot stop workflow with state {}",
                    other
                )))
            }
        }

        self.store.get_workflow_execution(wf_ex_id).await
    }

    /// Re-enter an ERROR workflow without resetting any task: the
    /// controller recomputes commands from the persisted graph.
    pub async fn rollback_workflow(
        &self,
        wf_ex_id: Uuid,
    ) -> Result<WorkflowExecutionRow> {
        let _lock = self.workflow_lock(wf_ex_id).await;

        let mut wf_ex = self.store.get_workflow_execution(wf_ex_id).await?;

        if wf_ex.state() != State::Error {
            return Err(EngineError::invalid_state(format!(
                "Only ERROR workflows can be rolled back [execution_id={}, state={}]",
                wf_ex_id, wf_ex.state
            )));
        }

        self.set_workflow_state(&mut wf_ex, State::Running, None)?;
        self.store.save_workflow_execution(&wf_ex).await?;

        self.continue_workflow_after(wf_ex_id, true).await?;

        self.store.get_workflow_execution(wf_ex_id).await
    }

    /// Rerun a failed task. `reset=false` is allowed only for with-items
    /// tasks and preserves already-succeeded iterations.
    pub async fn rerun_task(
        &self,
        task_ex_id: Uuid,
        reset: bool,
        env: Option<Value>,
    ) -> Result<TaskExecutionRow> {
        let task = self.store.get_task_execution(task_ex_id).await?;

        if task.state() != State::Error {
            return Err(EngineError::invalid_state(format!(
                "Only ERROR tasks can be rerun [task_ex_id={}, state={}]",
                task_ex_id, task.state
            )));
        }

        let _lock = self.workflow_lock(task.workflow_execution_id).await;

        let mut wf_ex = self
            .store
            .get_workflow_execution(task.workflow_execution_id)
            .await?;

        if !matches!(wf_ex.state(), State::Error | State::Paused) {
            return Err(EngineError::invalid_state(format!(
                "Workflow must be in ERROR or PAUSED to rerun a task [execution_id={}, state={}]",
                wf_ex.id, wf_ex.state
            )));
        }

        let task_spec = crate::controller::task_spec_from_row(&task)?;

        if !reset && task_spec.with_items.is_none() {
            return Err(EngineError::invalid_input(
                "Only with-items tasks can be rerun with reset=false".to_string(),
            ));
        }

        self.update_execution_env(&mut wf_ex, env).await?;
        self.store.save_workflow_execution(&wf_ex).await?;

        self.reset_task_for_rerun(&wf_ex, task, &task_spec, reset)
            .await?;

        // The workflow (and any parents) re-enter RUNNING.
        let mut wf_ex = self.store.get_workflow_execution(wf_ex.id).await?;
        self.set_workflow_state(&mut wf_ex, State::Running, None)?;
        self.store.save_workflow_execution(&wf_ex).await?;
        self.propagate_running_to_parents(&wf_ex).await?;

        self.store.get_task_execution(task_ex_id).await
    }

    // ============================================
    // Internal helpers
    // ============================================

    /// Resolve `env` from start params: inline mapping, or a named
    /// environment dereferenced from storage.
    async fn resolve_environment(
        &self,
        env: Option<Value>,
        auth: &AuthContext,
    ) -> Result<Context> {
        match env {
            None | Some(Value::Null) => Ok(Context::new()),
            Some(Value::Object(map)) => Ok(map),
            Some(Value::String(name)) => {
                let row = self
                    .store
                    .load_environment(&name, auth)
                    .await?
                    .ok_or_else(|| {
                        EngineError::invalid_input(format!("Environment is not found: {}", name))
                    })?;

                Ok(context::as_object(&row.variables))
            }
            Some(other) => Err(EngineError::invalid_input(format!(
                "Unexpected value type for environment: {}",
                other
            ))),
        }
    }

    /// Merge a new environment into params and the `__env` context view.
    pub(crate) async fn update_execution_env(
        &self,
        wf_ex: &mut WorkflowExecutionRow,
        env: Option<Value>,
    ) -> Result<()> {
        let Some(env) = env else {
            return Ok(());
        };

        let auth = wf_auth(wf_ex);
        let resolved = self.resolve_environment(Some(env), &auth).await?;

        let mut params = context::as_object(&wf_ex.params);
        let mut merged = params
            .get("env")
            .map(context::as_object)
            .unwrap_or_default();
        context::merge_into(&mut merged, &resolved);
        params.insert("env".to_string(), Value::Object(merged.clone()));
        wf_ex.params = Value::Object(params);

        dataflow::refresh_env_in_context(wf_ex, &merged);

        Ok(())
    }

    /// Custom (ad-hoc) actions resolve to their base action with the
    /// pre-bound base-input evaluated against the call input.
    pub(crate) async fn resolve_action(
        &self,
        name: &str,
        call_input: Context,
        auth: &AuthContext,
    ) -> Result<(String, Context)> {
        let Some(def) = self.store.load_action_definition(name, auth).await? else {
            return Ok((name.to_string(), call_input));
        };

        let Some(base) = def.spec.get("base").and_then(Value::as_str) else {
            return Ok((name.to_string(), call_input));
        };

        let base_input = def
            .spec
            .get("base-input")
            .map(context::as_object)
            .unwrap_or_default();

        let evaluated =
            taskweave_core::expr::evaluate_object(&*self.evaluator, &base_input, &call_input)?;

        Ok((base.to_string(), evaluated))
    }

    async fn complete_standalone_action(
        &self,
        mut action_ex: ActionExecutionRow,
        result: ActionResult,
    ) -> Result<ActionExecutionRow> {
        let success = result.is_success();

        action_ex.accepted = true;
        action_ex.set_state(if success { State::Success } else { State::Error });
        action_ex.output = match &result {
            r if r.is_success() => r.data.clone().unwrap_or(Value::Null),
            r => json!({"result": r.error.clone().unwrap_or_default()}),
        };
        action_ex.state_info = result.error.clone();

        let saved = match self.store.save_action_execution(&action_ex).await {
            Ok(saved) => saved,
            Err(EngineError::SizeLimitExceeded { .. }) => {
                action_ex.output = json!({"result": "result too large"});
                action_ex.set_state(State::Error);
                action_ex.state_info = Some("result too large".to_string());
                self.store.save_action_execution(&action_ex).await?
            }
            Err(e) => return Err(e),
        };

        let save_result = saved
            .runtime_context
            .get("save_result")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        if success && !save_result {
            self.store.delete_action_execution(saved.id).await?;
        }

        Ok(saved)
    }
}

/// Visibility context for operations the engine performs on behalf of a
/// running execution.
pub(crate) fn wf_auth(wf_ex: &WorkflowExecutionRow) -> AuthContext {
    AuthContext {
        project_id: wf_ex.project_id.clone(),
        is_admin: wf_ex.project_id.is_none(),
        ..Default::default()
    }
}

/// Validate provided input against declared workflow inputs: missing
/// required parameters and unknown keys are both errors; declared defaults
/// fill the gaps.
fn validate_input(
    wf_name: &str,
    wf_spec: &taskweave_core::spec::WorkflowSpec,
    wf_input: Value,
) -> Result<Context> {
    let provided = match wf_input {
        Value::Null => Context::new(),
        Value::Object(map) => map,
        other => {
            return Err(EngineError::invalid_input(format!(
                "Workflow input must be an object, got: {}",
                other
            )))
        }
    };

    let declared: Vec<&str> = wf_spec.input.iter().map(|p| p.name()).collect();

    let unknown: Vec<&String> = provided
        .keys()
        .filter(|k| !declared.contains(&k.as_str()))
        .collect();

    if !unknown.is_empty() {
        return Err(EngineError::invalid_input(format!(
            "Unexpected input parameters for workflow '{}': {:?}",
            wf_name, unknown
        )));
    }

    let missing: Vec<&str> = wf_spec
        .input
        .iter()
        .filter(|p| p.default().is_none() && !provided.contains_key(p.name()))
        .map(|p| p.name())
        .collect();

    if !missing.is_empty() {
        return Err(EngineError::invalid_input(format!(
            "Required input parameters for workflow '{}' are missing: {:?}",
            wf_name, missing
        )));
    }

    let mut input = provided;

    for param in &wf_spec.input {
        if let Some(default) = param.default() {
            input
                .entry(param.name().to_string())
                .or_insert_with(|| default.clone());
        }
    }

    Ok(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wf_spec(input: Value) -> taskweave_core::spec::WorkflowSpec {
        serde_json::from_value(json!({"input": input, "tasks": {}})).unwrap()
    }

    #[test]
    fn test_validate_input_defaults_and_required() {
        let spec = wf_spec(json!(["a", {"b": 7}]));

        let input = validate_input("wf", &spec, json!({"a": 1})).unwrap();
        assert_eq!(input["a"], json!(1));
        assert_eq!(input["b"], json!(7));

        let input = validate_input("wf", &spec, json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(input["b"], json!(2));
    }

    #[test]
    fn test_validate_input_missing_required() {
        let spec = wf_spec(json!(["a"]));

        let err = validate_input("wf", &spec, json!({})).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_validate_input_unknown_key() {
        let spec = wf_spec(json!(["a"]));

        let err = validate_input("wf", &spec, json!({"a": 1, "nope": 2})).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_start_params_round_trip() {
        let params = StartParams {
            env: Some(json!({"k": "v"})),
            task_name: None,
            task_execution_id: None,
            index: Some(3),
        };

        let value = serde_json::to_value(&params).unwrap();
        let parsed = StartParams::from_value(&value);

        assert_eq!(parsed.env, Some(json!({"k": "v"})));
        assert_eq!(parsed.index, Some(3));
    }
}
