// In-memory StateStore backend.
//
// All state lives in typed maps under one tokio Mutex, so the claim/advance
// operations are atomic by construction. This is the default backend for
// tests and single-process deployments; PgStore provides the same contract
// durably.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use taskweave_core::{AuthContext, EngineError, Result};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::limits::{cut_state_info, validate_long_field};
use crate::models::*;
use crate::store::{hash_json_object, visible_to, StateStore};

pub struct MemoryStore {
    field_size_limit_kb: i64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    workflow_defs: HashMap<Uuid, WorkflowDefinitionRow>,
    action_defs: HashMap<Uuid, ActionDefinitionRow>,
    environments: HashMap<Uuid, EnvironmentRow>,
    workflow_executions: HashMap<Uuid, WorkflowExecutionRow>,
    task_executions: HashMap<Uuid, TaskExecutionRow>,
    action_executions: HashMap<Uuid, ActionExecutionRow>,
    delayed_calls: HashMap<Uuid, DelayedCallRow>,
    cron_triggers: HashMap<Uuid, CronTriggerRow>,
}

impl MemoryStore {
    pub fn new(field_size_limit_kb: i64) -> Self {
        MemoryStore {
            field_size_limit_kb,
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new(1024)
    }
}

fn validate_execution_fields(limit_kb: i64, fields: &[(&str, &Value)]) -> Result<()> {
    for (name, value) in fields {
        validate_long_field(limit_kb, name, value)?;
    }
    Ok(())
}

/// Sort, page and trim a listing according to QueryParams.
fn paginate<T, K, F>(mut rows: Vec<T>, params: &QueryParams, id_of: K, sort_key: F) -> Vec<T>
where
    K: Fn(&T) -> Uuid,
    F: Fn(&T, &str) -> String,
{
    let key = params
        .sort_keys
        .first()
        .cloned()
        .unwrap_or_else(|| "created_at".to_string());
    let descending = params.sort_dirs.first().map(|d| d == "desc").unwrap_or(false);

    rows.sort_by(|a, b| {
        let ord = sort_key(a, &key).cmp(&sort_key(b, &key));
        if descending {
            ord.reverse()
        } else {
            ord
        }
    });

    if let Some(marker) = params.marker {
        if let Some(pos) = rows.iter().position(|r| id_of(r) == marker) {
            rows.drain(..=pos);
        }
    }

    if let Some(limit) = params.limit {
        rows.truncate(limit.max(0) as usize);
    }

    rows
}

// RFC 3339 with enough precision to sort correctly as a string
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

#[async_trait]
impl StateStore for MemoryStore {
    // ============================================
    // Workflow definitions
    // ============================================

    async fn create_workflow_definition(
        &self,
        input: CreateWorkflowDefinition,
    ) -> Result<WorkflowDefinitionRow> {
        let mut inner = self.inner.lock().await;

        if inner
            .workflow_defs
            .values()
            .any(|d| d.name == input.name && d.project_id == input.project_id)
        {
            return Err(EngineError::conflict(format!(
                "Duplicate entry for WorkflowDefinition: {}",
                input.name
            )));
        }

        let now = Utc::now();
        let row = WorkflowDefinitionRow {
            id: Uuid::now_v7(),
            name: input.name,
            project_id: input.project_id,
            scope: input.scope,
            definition: input.definition,
            spec: input.spec,
            tags: input.tags,
            is_system: input.is_system,
            created_at: now,
            updated_at: now,
        };

        inner.workflow_defs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_workflow_definition(
        &self,
        name: &str,
        auth: &AuthContext,
        definition: String,
        spec: Value,
        tags: Vec<String>,
    ) -> Result<WorkflowDefinitionRow> {
        let mut inner = self.inner.lock().await;

        let row = inner
            .workflow_defs
            .values_mut()
            .find(|d| d.name == name && visible_to(auth, &d.project_id, &d.scope))
            .ok_or_else(|| {
                EngineError::not_found(format!("Workflow not found [workflow_name={}]", name))
            })?;

        row.definition = definition;
        row.spec = spec;
        row.tags = tags;
        row.updated_at = Utc::now();

        Ok(row.clone())
    }

    async fn load_workflow_definition(
        &self,
        name: &str,
        auth: &AuthContext,
    ) -> Result<Option<WorkflowDefinitionRow>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .workflow_defs
            .values()
            .find(|d| d.name == name && visible_to(auth, &d.project_id, &d.scope))
            .cloned())
    }

    async fn list_workflow_definitions(
        &self,
        auth: &AuthContext,
        params: &QueryParams,
    ) -> Result<Vec<WorkflowDefinitionRow>> {
        let inner = self.inner.lock().await;

        let rows: Vec<_> = inner
            .workflow_defs
            .values()
            .filter(|d| visible_to(auth, &d.project_id, &d.scope))
            .cloned()
            .collect();

        Ok(paginate(rows, params, |r| r.id, |r, key| match key {
            "name" => r.name.clone(),
            "updated_at" => ts(&r.updated_at),
            _ => ts(&r.created_at),
        }))
    }

    async fn delete_workflow_definition(&self, name: &str, auth: &AuthContext) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let id = inner
            .workflow_defs
            .values()
            .find(|d| d.name == name && visible_to(auth, &d.project_id, &d.scope))
            .map(|d| d.id)
            .ok_or_else(|| {
                EngineError::not_found(format!("Workflow not found [workflow_name={}]", name))
            })?;

        if inner
            .cron_triggers
            .values()
            .any(|t| t.workflow_id == Some(id))
        {
            return Err(EngineError::invalid_state(format!(
                "Can't delete workflow '{}': cron triggers reference it",
                name
            )));
        }

        inner.workflow_defs.remove(&id);
        Ok(())
    }

    // ============================================
    // Action definitions
    // ============================================

    async fn create_action_definition(
        &self,
        input: CreateActionDefinition,
    ) -> Result<ActionDefinitionRow> {
        let mut inner = self.inner.lock().await;

        if inner
            .action_defs
            .values()
            .any(|d| d.name == input.name && d.project_id == input.project_id)
        {
            return Err(EngineError::conflict(format!(
                "Duplicate entry for ActionDefinition: {}",
                input.name
            )));
        }

        let now = Utc::now();
        let row = ActionDefinitionRow {
            id: Uuid::now_v7(),
            name: input.name,
            project_id: input.project_id,
            scope: input.scope,
            description: input.description,
            definition: input.definition,
            spec: input.spec,
            input: input.input,
            action_class: input.action_class,
            attributes: input.attributes,
            tags: input.tags,
            is_system: input.is_system,
            created_at: now,
            updated_at: now,
        };

        inner.action_defs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn load_action_definition(
        &self,
        name: &str,
        auth: &AuthContext,
    ) -> Result<Option<ActionDefinitionRow>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .action_defs
            .values()
            .find(|d| d.name == name && visible_to(auth, &d.project_id, &d.scope))
            .cloned())
    }

    async fn list_action_definitions(
        &self,
        auth: &AuthContext,
        params: &QueryParams,
    ) -> Result<Vec<ActionDefinitionRow>> {
        let inner = self.inner.lock().await;

        let rows: Vec<_> = inner
            .action_defs
            .values()
            .filter(|d| visible_to(auth, &d.project_id, &d.scope))
            .cloned()
            .collect();

        Ok(paginate(rows, params, |r| r.id, |r, key| match key {
            "name" => r.name.clone(),
            "updated_at" => ts(&r.updated_at),
            _ => ts(&r.created_at),
        }))
    }

    async fn delete_action_definition(&self, name: &str, auth: &AuthContext) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let id = inner
            .action_defs
            .values()
            .find(|d| d.name == name && visible_to(auth, &d.project_id, &d.scope))
            .map(|d| d.id)
            .ok_or_else(|| {
                EngineError::not_found(format!("Action not found [action_name={}]", name))
            })?;

        inner.action_defs.remove(&id);
        Ok(())
    }

    // ============================================
    // Environments
    // ============================================

    async fn create_environment(&self, input: CreateEnvironment) -> Result<EnvironmentRow> {
        let mut inner = self.inner.lock().await;

        if inner
            .environments
            .values()
            .any(|e| e.name == input.name && e.project_id == input.project_id)
        {
            return Err(EngineError::conflict(format!(
                "Duplicate entry for Environment: {}",
                input.name
            )));
        }

        let now = Utc::now();
        let row = EnvironmentRow {
            id: Uuid::now_v7(),
            name: input.name,
            project_id: input.project_id,
            scope: input.scope,
            description: input.description,
            variables: input.variables,
            created_at: now,
            updated_at: now,
        };

        inner.environments.insert(row.id, row.clone());
        Ok(row)
    }

    async fn load_environment(
        &self,
        name: &str,
        auth: &AuthContext,
    ) -> Result<Option<EnvironmentRow>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .environments
            .values()
            .find(|e| e.name == name && visible_to(auth, &e.project_id, &e.scope))
            .cloned())
    }

    async fn list_environments(
        &self,
        auth: &AuthContext,
        params: &QueryParams,
    ) -> Result<Vec<EnvironmentRow>> {
        let inner = self.inner.lock().await;

        let rows: Vec<_> = inner
            .environments
            .values()
            .filter(|e| visible_to(auth, &e.project_id, &e.scope))
            .cloned()
            .collect();

        Ok(paginate(rows, params, |r| r.id, |r, key| match key {
            "name" => r.name.clone(),
            "updated_at" => ts(&r.updated_at),
            _ => ts(&r.created_at),
        }))
    }

    async fn delete_environment(&self, name: &str, auth: &AuthContext) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let id = inner
            .environments
            .values()
            .find(|e| e.name == name && visible_to(auth, &e.project_id, &e.scope))
            .map(|e| e.id)
            .ok_or_else(|| {
                EngineError::not_found(format!("Environment not found [name={}]", name))
            })?;

        inner.environments.remove(&id);
        Ok(())
    }

    // ============================================
    // Workflow executions
    // ============================================

    async fn create_workflow_execution(
        &self,
        input: CreateWorkflowExecution,
    ) -> Result<WorkflowExecutionRow> {
        validate_execution_fields(
            self.field_size_limit_kb,
            &[
                ("input", &input.input),
                ("params", &input.params),
            ],
        )?;

        let mut inner = self.inner.lock().await;

        let now = Utc::now();
        let row = WorkflowExecutionRow {
            id: Uuid::now_v7(),
            name: input.name,
            description: input.description,
            workflow_name: input.workflow_name,
            workflow_id: input.workflow_id,
            project_id: input.project_id,
            spec: input.spec,
            state: input.state.to_string(),
            state_info: None,
            input: input.input,
            output: Value::Object(Default::default()),
            params: input.params,
            context: input.context,
            runtime_context: input.runtime_context,
            accepted: false,
            task_execution_id: input.task_execution_id,
            created_at: now,
            updated_at: now,
        };

        inner.workflow_executions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_workflow_execution(&self, id: Uuid) -> Result<WorkflowExecutionRow> {
        let inner = self.inner.lock().await;

        inner.workflow_executions.get(&id).cloned().ok_or_else(|| {
            EngineError::not_found(format!("Workflow execution not found [id={}]", id))
        })
    }

    async fn save_workflow_execution(
        &self,
        row: &WorkflowExecutionRow,
    ) -> Result<WorkflowExecutionRow> {
        validate_execution_fields(
            self.field_size_limit_kb,
            &[
                ("input", &row.input),
                ("output", &row.output),
                ("params", &row.params),
            ],
        )?;

        let mut inner = self.inner.lock().await;

        if !inner.workflow_executions.contains_key(&row.id) {
            return Err(EngineError::not_found(format!(
                "Workflow execution not found [id={}]",
                row.id
            )));
        }

        let mut saved = row.clone();
        saved.state_info = cut_state_info(saved.state_info);
        saved.updated_at = Utc::now();

        inner.workflow_executions.insert(saved.id, saved.clone());
        Ok(saved)
    }

    async fn list_workflow_executions(
        &self,
        params: &QueryParams,
    ) -> Result<Vec<WorkflowExecutionRow>> {
        let inner = self.inner.lock().await;

        let rows: Vec<_> = inner.workflow_executions.values().cloned().collect();

        Ok(paginate(rows, params, |r| r.id, |r, key| match key {
            "name" => r.name.clone(),
            "updated_at" => ts(&r.updated_at),
            "state" => r.state.clone(),
            _ => ts(&r.created_at),
        }))
    }

    async fn list_workflow_executions_by_task(
        &self,
        task_execution_id: Uuid,
    ) -> Result<Vec<WorkflowExecutionRow>> {
        let inner = self.inner.lock().await;

        let mut rows: Vec<_> = inner
            .workflow_executions
            .values()
            .filter(|w| w.task_execution_id == Some(task_execution_id))
            .cloned()
            .collect();
        rows.sort_by_key(|w| w.created_at);

        Ok(rows)
    }

    async fn delete_workflow_execution(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.workflow_executions.remove(&id).is_none() {
            return Err(EngineError::not_found(format!(
                "Workflow execution not found [id={}]",
                id
            )));
        }

        // Cascade to owned tasks and their action executions.
        let task_ids: Vec<Uuid> = inner
            .task_executions
            .values()
            .filter(|t| t.workflow_execution_id == id)
            .map(|t| t.id)
            .collect();

        for task_id in task_ids {
            inner.task_executions.remove(&task_id);
            inner
                .action_executions
                .retain(|_, a| a.task_execution_id != Some(task_id));
        }

        Ok(())
    }

    async fn touch_workflow_execution(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let row = inner.workflow_executions.get_mut(&id).ok_or_else(|| {
            EngineError::not_found(format!("Workflow execution not found [id={}]", id))
        })?;

        row.updated_at = Utc::now();
        Ok(())
    }

    // ============================================
    // Task executions
    // ============================================

    async fn create_task_execution(&self, input: CreateTaskExecution) -> Result<TaskExecutionRow> {
        let mut inner = self.inner.lock().await;

        if !inner
            .workflow_executions
            .contains_key(&input.workflow_execution_id)
        {
            return Err(EngineError::not_found(format!(
                "Workflow execution not found [id={}]",
                input.workflow_execution_id
            )));
        }

        let now = Utc::now();
        let row = TaskExecutionRow {
            id: Uuid::now_v7(),
            name: input.name,
            workflow_execution_id: input.workflow_execution_id,
            workflow_name: input.workflow_name,
            workflow_id: input.workflow_id,
            project_id: input.project_id,
            spec: input.spec,
            action_spec: input.action_spec,
            state: input.state.to_string(),
            state_info: None,
            in_context: input.in_context,
            published: Value::Object(Default::default()),
            processed: false,
            runtime_context: input.runtime_context,
            created_at: now,
            updated_at: now,
        };

        inner.task_executions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_task_execution(&self, id: Uuid) -> Result<TaskExecutionRow> {
        let inner = self.inner.lock().await;

        inner
            .task_executions
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("Task execution not found [id={}]", id)))
    }

    async fn save_task_execution(&self, row: &TaskExecutionRow) -> Result<TaskExecutionRow> {
        validate_execution_fields(self.field_size_limit_kb, &[("published", &row.published)])?;

        let mut inner = self.inner.lock().await;

        if !inner.task_executions.contains_key(&row.id) {
            return Err(EngineError::not_found(format!(
                "Task execution not found [id={}]",
                row.id
            )));
        }

        let mut saved = row.clone();
        saved.state_info = cut_state_info(saved.state_info);
        saved.updated_at = Utc::now();

        inner.task_executions.insert(saved.id, saved.clone());
        Ok(saved)
    }

    async fn list_task_executions(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecutionRow>> {
        let inner = self.inner.lock().await;

        let mut rows: Vec<_> = inner
            .task_executions
            .values()
            .filter(|t| t.workflow_execution_id == workflow_execution_id)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.created_at);

        Ok(rows)
    }

    // ============================================
    // Action executions
    // ============================================

    async fn create_action_execution(
        &self,
        input: CreateActionExecution,
    ) -> Result<ActionExecutionRow> {
        validate_execution_fields(self.field_size_limit_kb, &[("input", &input.input)])?;

        let mut inner = self.inner.lock().await;

        let now = Utc::now();
        let row = ActionExecutionRow {
            id: Uuid::now_v7(),
            name: input.name,
            description: input.description,
            task_execution_id: input.task_execution_id,
            project_id: input.project_id,
            input: input.input,
            output: Value::Null,
            state: input.state.to_string(),
            state_info: None,
            accepted: false,
            runtime_context: input.runtime_context,
            created_at: now,
            updated_at: now,
        };

        inner.action_executions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_action_execution(&self, id: Uuid) -> Result<ActionExecutionRow> {
        let inner = self.inner.lock().await;

        inner
            .action_executions
            .get(&id)
            .cloned()
            .ok_or_else(|| {
                EngineError::not_found(format!("Action execution not found [id={}]", id))
            })
    }

    async fn save_action_execution(&self, row: &ActionExecutionRow) -> Result<ActionExecutionRow> {
        validate_execution_fields(
            self.field_size_limit_kb,
            &[("input", &row.input), ("output", &row.output)],
        )?;

        let mut inner = self.inner.lock().await;

        if !inner.action_executions.contains_key(&row.id) {
            return Err(EngineError::not_found(format!(
                "Action execution not found [id={}]",
                row.id
            )));
        }

        let mut saved = row.clone();
        saved.state_info = cut_state_info(saved.state_info);
        saved.updated_at = Utc::now();

        inner.action_executions.insert(saved.id, saved.clone());
        Ok(saved)
    }

    async fn list_action_executions(
        &self,
        task_execution_id: Uuid,
    ) -> Result<Vec<ActionExecutionRow>> {
        let inner = self.inner.lock().await;

        let mut rows: Vec<_> = inner
            .action_executions
            .values()
            .filter(|a| a.task_execution_id == Some(task_execution_id))
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.created_at);

        Ok(rows)
    }

    async fn delete_action_execution(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;

        inner.action_executions.remove(&id).ok_or_else(|| {
            EngineError::not_found(format!("Action execution not found [id={}]", id))
        })?;

        Ok(())
    }

    // ============================================
    // Delayed calls
    // ============================================

    async fn create_delayed_call(&self, input: CreateDelayedCall) -> Result<DelayedCallRow> {
        let mut inner = self.inner.lock().await;

        let now = Utc::now();
        let row = DelayedCallRow {
            id: Uuid::now_v7(),
            factory_method_path: input.factory_method_path,
            target_method_name: input.target_method_name,
            method_arguments: input.method_arguments,
            serializers: input.serializers,
            auth_context: input.auth_context,
            execution_time: input.execution_time,
            processing: false,
            created_at: now,
            updated_at: now,
        };

        inner.delayed_calls.insert(row.id, row.clone());
        Ok(row)
    }

    async fn claim_due_delayed_calls(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DelayedCallRow>> {
        let mut inner = self.inner.lock().await;

        let mut due: Vec<Uuid> = inner
            .delayed_calls
            .values()
            .filter(|c| !c.processing && c.execution_time < now)
            .map(|c| c.id)
            .collect();
        due.sort_by_key(|id| {
            inner
                .delayed_calls
                .get(id)
                .map(|c| c.execution_time)
                .unwrap_or(now)
        });
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());

        for id in due {
            if let Some(call) = inner.delayed_calls.get_mut(&id) {
                // The mutex makes this compare-and-swap atomic.
                if !call.processing {
                    call.processing = true;
                    call.updated_at = Utc::now();
                    claimed.push(call.clone());
                }
            }
        }

        Ok(claimed)
    }

    async fn delete_delayed_call(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;

        inner.delayed_calls.remove(&id);
        Ok(())
    }

    async fn reset_stale_delayed_calls(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;

        let mut released = 0;

        for call in inner.delayed_calls.values_mut() {
            if call.processing && call.updated_at < older_than {
                call.processing = false;
                call.updated_at = Utc::now();
                released += 1;
            }
        }

        Ok(released)
    }

    // ============================================
    // Cron triggers
    // ============================================

    async fn create_cron_trigger(&self, input: CreateCronTrigger) -> Result<CronTriggerRow> {
        let mut inner = self.inner.lock().await;

        let input_hash = hash_json_object(&input.workflow_input);
        let params_hash = hash_json_object(&input.workflow_params);

        if inner
            .cron_triggers
            .values()
            .any(|t| t.name == input.name && t.project_id == input.project_id)
        {
            return Err(EngineError::conflict(format!(
                "Duplicate entry for CronTrigger: {}",
                input.name
            )));
        }

        // The wide tuple constraint prevents accidentally identical triggers.
        if inner.cron_triggers.values().any(|t| {
            t.workflow_input_hash == input_hash
                && t.workflow_name == input.workflow_name
                && t.pattern == input.pattern
                && t.project_id == input.project_id
                && t.workflow_params_hash == params_hash
                && t.remaining_executions == input.remaining_executions
                && t.first_execution_time == input.first_execution_time
        }) {
            return Err(EngineError::conflict(format!(
                "Duplicate cron trigger for workflow: {}",
                input.workflow_name
            )));
        }

        let now = Utc::now();
        let row = CronTriggerRow {
            id: Uuid::now_v7(),
            name: input.name,
            project_id: input.project_id,
            scope: input.scope,
            pattern: input.pattern,
            first_execution_time: input.first_execution_time,
            next_execution_time: input.next_execution_time,
            remaining_executions: input.remaining_executions,
            workflow_id: input.workflow_id,
            workflow_name: input.workflow_name,
            workflow_input: input.workflow_input,
            workflow_params: input.workflow_params,
            workflow_input_hash: input_hash,
            workflow_params_hash: params_hash,
            trust_id: input.trust_id,
            created_at: now,
            updated_at: now,
        };

        inner.cron_triggers.insert(row.id, row.clone());
        Ok(row)
    }

    async fn load_cron_trigger(
        &self,
        name: &str,
        auth: &AuthContext,
    ) -> Result<Option<CronTriggerRow>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .cron_triggers
            .values()
            .find(|t| t.name == name && visible_to(auth, &t.project_id, &t.scope))
            .cloned())
    }

    async fn list_cron_triggers(
        &self,
        auth: &AuthContext,
        params: &QueryParams,
    ) -> Result<Vec<CronTriggerRow>> {
        let inner = self.inner.lock().await;

        let rows: Vec<_> = inner
            .cron_triggers
            .values()
            .filter(|t| visible_to(auth, &t.project_id, &t.scope))
            .cloned()
            .collect();

        Ok(paginate(rows, params, |r| r.id, |r, key| match key {
            "name" => r.name.clone(),
            "next_execution_time" => ts(&r.next_execution_time),
            _ => ts(&r.created_at),
        }))
    }

    async fn list_due_cron_triggers(&self, now: DateTime<Utc>) -> Result<Vec<CronTriggerRow>> {
        let inner = self.inner.lock().await;

        let mut rows: Vec<_> = inner
            .cron_triggers
            .values()
            .filter(|t| t.next_execution_time < now)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.next_execution_time);

        Ok(rows)
    }

    async fn advance_cron_trigger(
        &self,
        id: Uuid,
        old_next: DateTime<Utc>,
        new_next: DateTime<Utc>,
        remaining_executions: Option<i32>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;

        match inner.cron_triggers.get_mut(&id) {
            Some(trigger) if trigger.next_execution_time == old_next => {
                trigger.next_execution_time = new_next;
                trigger.remaining_executions = remaining_executions;
                trigger.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_cron_trigger_if_due(&self, id: Uuid, old_next: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().await;

        match inner.cron_triggers.get(&id) {
            Some(trigger) if trigger.next_execution_time == old_next => {
                inner.cron_triggers.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_cron_trigger(&self, name: &str, auth: &AuthContext) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let id = inner
            .cron_triggers
            .values()
            .find(|t| t.name == name && visible_to(auth, &t.project_id, &t.scope))
            .map(|t| t.id)
            .ok_or_else(|| {
                EngineError::not_found(format!("Cron trigger not found [name={}]", name))
            })?;

        inner.cron_triggers.remove(&id);
        Ok(())
    }

    async fn cron_triggers_exist_for_workflow(&self, workflow_id: Uuid) -> Result<bool> {
        let inner = self.inner.lock().await;

        Ok(inner
            .cron_triggers
            .values()
            .any(|t| t.workflow_id == Some(workflow_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use taskweave_core::State;

    fn call_input(seconds_ago: i64) -> CreateDelayedCall {
        CreateDelayedCall {
            factory_method_path: None,
            target_method_name: "run_deferred_task".to_string(),
            method_arguments: json!({"task_ex_id": Uuid::now_v7()}),
            serializers: Value::Null,
            auth_context: Value::Null,
            execution_time: Utc::now() - chrono::Duration::seconds(seconds_ago),
        }
    }

    #[tokio::test]
    async fn test_delayed_call_claimed_exactly_once() {
        let store = Arc::new(MemoryStore::default());
        store.create_delayed_call(call_input(5)).await.unwrap();

        // Two sweepers race for the same due row.
        let (a, b) = tokio::join!(
            store.claim_due_delayed_calls(Utc::now(), 10),
            store.claim_due_delayed_calls(Utc::now(), 10),
        );

        let total = a.unwrap().len() + b.unwrap().len();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_future_calls_not_claimed() {
        let store = MemoryStore::default();
        store.create_delayed_call(call_input(-3600)).await.unwrap();

        let claimed = store.claim_due_delayed_calls(Utc::now(), 10).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_stale_claims_are_released() {
        let store = MemoryStore::default();
        store.create_delayed_call(call_input(5)).await.unwrap();

        let claimed = store.claim_due_delayed_calls(Utc::now(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // Handler died: nothing deleted the row. Reap claims older than a
        // threshold in the future relative to the claim time.
        let released = store
            .reset_stale_delayed_calls(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(released, 1);

        let reclaimed = store.claim_due_delayed_calls(Utc::now(), 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
    }

    fn trigger_input(name: &str) -> CreateCronTrigger {
        CreateCronTrigger {
            name: name.to_string(),
            project_id: None,
            scope: "private".to_string(),
            pattern: "* * * * *".to_string(),
            first_execution_time: None,
            next_execution_time: Utc::now() - chrono::Duration::seconds(1),
            remaining_executions: None,
            workflow_id: None,
            workflow_name: "wf".to_string(),
            workflow_input: json!({}),
            workflow_params: json!({}),
            trust_id: None,
        }
    }

    #[tokio::test]
    async fn test_cron_advance_cas_wins_once() {
        let store = MemoryStore::default();
        let trigger = store.create_cron_trigger(trigger_input("t1")).await.unwrap();

        let old_next = trigger.next_execution_time;
        let new_next = old_next + chrono::Duration::minutes(1);

        let first = store
            .advance_cron_trigger(trigger.id, old_next, new_next, None)
            .await
            .unwrap();
        let second = store
            .advance_cron_trigger(trigger.id, old_next, new_next, None)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn test_cron_duplicate_tuple_rejected() {
        let store = MemoryStore::default();

        let mut a = trigger_input("t1");
        let mut b = trigger_input("t2");
        let due = Utc::now();
        a.next_execution_time = due;
        b.next_execution_time = due;
        a.first_execution_time = Some(due);
        b.first_execution_time = Some(due);

        store.create_cron_trigger(a).await.unwrap();
        let err = store.create_cron_trigger(b).await.unwrap_err();

        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_oversized_published_rejected() {
        let store = MemoryStore::new(1);
        let wf = store
            .create_workflow_execution(CreateWorkflowExecution {
                name: "wf".to_string(),
                description: None,
                workflow_name: "wf".to_string(),
                workflow_id: None,
                project_id: None,
                spec: json!({}),
                state: State::Idle,
                input: json!({}),
                params: json!({}),
                context: json!({}),
                runtime_context: json!({}),
                task_execution_id: None,
            })
            .await
            .unwrap();

        let task = store
            .create_task_execution(CreateTaskExecution {
                name: "task1".to_string(),
                workflow_execution_id: wf.id,
                workflow_name: "wf".to_string(),
                workflow_id: None,
                project_id: None,
                spec: json!({}),
                action_spec: json!({}),
                state: State::Running,
                in_context: json!({}),
                runtime_context: json!({}),
            })
            .await
            .unwrap();

        let mut oversized = task.clone();
        oversized.published = json!({"blob": "x".repeat(4096)});

        let err = store.save_task_execution(&oversized).await.unwrap_err();
        assert!(matches!(err, EngineError::SizeLimitExceeded { .. }));

        // The failed write must not have mutated the row.
        let reread = store.get_task_execution(task.id).await.unwrap();
        assert_eq!(reread.published, json!({}));
    }

    #[tokio::test]
    async fn test_state_info_truncation() {
        let store = MemoryStore::default();
        let wf = store
            .create_workflow_execution(CreateWorkflowExecution {
                name: "wf".to_string(),
                description: None,
                workflow_name: "wf".to_string(),
                workflow_id: None,
                project_id: None,
                spec: json!({}),
                state: State::Idle,
                input: json!({}),
                params: json!({}),
                context: json!({}),
                runtime_context: json!({}),
                task_execution_id: None,
            })
            .await
            .unwrap();

        let mut updated = wf.clone();
        updated.state_info = Some("e".repeat(100_000));

        let saved = store.save_workflow_execution(&updated).await.unwrap();
        assert_eq!(
            saved.state_info.unwrap().len(),
            crate::limits::STATE_INFO_MAX_BYTES
        );
    }

    #[tokio::test]
    async fn test_cascade_delete() {
        let store = MemoryStore::default();
        let wf = store
            .create_workflow_execution(CreateWorkflowExecution {
                name: "wf".to_string(),
                description: None,
                workflow_name: "wf".to_string(),
                workflow_id: None,
                project_id: None,
                spec: json!({}),
                state: State::Idle,
                input: json!({}),
                params: json!({}),
                context: json!({}),
                runtime_context: json!({}),
                task_execution_id: None,
            })
            .await
            .unwrap();

        let task = store
            .create_task_execution(CreateTaskExecution {
                name: "task1".to_string(),
                workflow_execution_id: wf.id,
                workflow_name: "wf".to_string(),
                workflow_id: None,
                project_id: None,
                spec: json!({}),
                action_spec: json!({}),
                state: State::Running,
                in_context: json!({}),
                runtime_context: json!({}),
            })
            .await
            .unwrap();

        let action = store
            .create_action_execution(CreateActionExecution {
                name: "std.noop".to_string(),
                description: None,
                task_execution_id: Some(task.id),
                project_id: None,
                input: json!({}),
                state: State::Running,
                runtime_context: json!({}),
            })
            .await
            .unwrap();

        store.delete_workflow_execution(wf.id).await.unwrap();

        assert!(store.get_task_execution(task.id).await.is_err());
        assert!(store.get_action_execution(action.id).await.is_err());
    }

    #[tokio::test]
    async fn test_definition_scoping_and_pagination() {
        let store = MemoryStore::default();

        for (name, project, scope) in [
            ("wf_a", Some("p1"), "private"),
            ("wf_b", Some("p1"), "private"),
            ("wf_c", Some("p2"), "private"),
            ("wf_d", Some("p2"), "public"),
        ] {
            store
                .create_workflow_definition(CreateWorkflowDefinition {
                    name: name.to_string(),
                    project_id: project.map(String::from),
                    scope: scope.to_string(),
                    definition: String::new(),
                    spec: json!({}),
                    tags: vec![],
                    is_system: false,
                })
                .await
                .unwrap();
        }

        let auth = AuthContext::for_project("p1");
        let all = store
            .list_workflow_definitions(&auth, &QueryParams::default())
            .await
            .unwrap();
        let names: Vec<_> = all.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["wf_a", "wf_b", "wf_d"]);

        let page = store
            .list_workflow_definitions(
                &auth,
                &QueryParams {
                    limit: Some(2),
                    marker: None,
                    sort_keys: vec!["name".to_string()],
                    sort_dirs: vec!["asc".to_string()],
                },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 2);

        let next = store
            .list_workflow_definitions(
                &auth,
                &QueryParams {
                    limit: Some(2),
                    marker: Some(page[1].id),
                    sort_keys: vec!["name".to_string()],
                    sort_dirs: vec!["asc".to_string()],
                },
            )
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].name, "wf_d");
    }

    #[tokio::test]
    async fn test_definition_delete_blocked_by_cron_trigger() {
        let store = MemoryStore::default();
        let auth = AuthContext::admin();

        let def = store
            .create_workflow_definition(CreateWorkflowDefinition {
                name: "wf".to_string(),
                project_id: None,
                scope: "private".to_string(),
                definition: String::new(),
                spec: json!({}),
                tags: vec![],
                is_system: false,
            })
            .await
            .unwrap();

        let mut trigger = trigger_input("t1");
        trigger.workflow_id = Some(def.id);
        store.create_cron_trigger(trigger).await.unwrap();

        let err = store.delete_workflow_definition("wf", &auth).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));

        store.delete_cron_trigger("t1", &auth).await.unwrap();
        store.delete_workflow_definition("wf", &auth).await.unwrap();
    }
}
