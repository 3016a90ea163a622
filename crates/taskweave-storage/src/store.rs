// StateStore: the persistence boundary of the engine.
//
// Two backends implement it: MemoryStore (tests and single-process runs) and
// PgStore (sqlx/Postgres). All cross-worker coordination goes through this
// trait, so the claim/advance operations below are the only concurrency
// primitives the engine relies on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use taskweave_core::{AuthContext, Result};
use uuid::Uuid;

use crate::models::*;

#[async_trait]
pub trait StateStore: Send + Sync {
    // ============================================
    // Workflow definitions
    // ============================================

    async fn create_workflow_definition(
        &self,
        input: CreateWorkflowDefinition,
    ) -> Result<WorkflowDefinitionRow>;

    async fn update_workflow_definition(
        &self,
        name: &str,
        auth: &AuthContext,
        definition: String,
        spec: Value,
        tags: Vec<String>,
    ) -> Result<WorkflowDefinitionRow>;

    /// Load a definition visible to the caller, or None.
    async fn load_workflow_definition(
        &self,
        name: &str,
        auth: &AuthContext,
    ) -> Result<Option<WorkflowDefinitionRow>>;

    async fn list_workflow_definitions(
        &self,
        auth: &AuthContext,
        params: &QueryParams,
    ) -> Result<Vec<WorkflowDefinitionRow>>;

    /// Refused while any cron trigger references the definition.
    async fn delete_workflow_definition(&self, name: &str, auth: &AuthContext) -> Result<()>;

    // ============================================
    // Action definitions
    // ============================================

    async fn create_action_definition(
        &self,
        input: CreateActionDefinition,
    ) -> Result<ActionDefinitionRow>;

    async fn load_action_definition(
        &self,
        name: &str,
        auth: &AuthContext,
    ) -> Result<Option<ActionDefinitionRow>>;

    async fn list_action_definitions(
        &self,
        auth: &AuthContext,
        params: &QueryParams,
    ) -> Result<Vec<ActionDefinitionRow>>;

    async fn delete_action_definition(&self, name: &str, auth: &AuthContext) -> Result<()>;

    // ============================================
    // Environments
    // ============================================

    async fn create_environment(&self, input: CreateEnvironment) -> Result<EnvironmentRow>;

    async fn load_environment(
        &self,
        name: &str,
        auth: &AuthContext,
    ) -> Result<Option<EnvironmentRow>>;

    async fn list_environments(
        &self,
        auth: &AuthContext,
        params: &QueryParams,
    ) -> Result<Vec<EnvironmentRow>>;

    async fn delete_environment(&self, name: &str, auth: &AuthContext) -> Result<()>;

    // ============================================
    // Workflow executions
    // ============================================

    async fn create_workflow_execution(
        &self,
        input: CreateWorkflowExecution,
    ) -> Result<WorkflowExecutionRow>;

    async fn get_workflow_execution(&self, id: Uuid) -> Result<WorkflowExecutionRow>;

    /// Persist all mutable fields of the row. Long fields are size-checked;
    /// state_info is truncated.
    async fn save_workflow_execution(
        &self,
        row: &WorkflowExecutionRow,
    ) -> Result<WorkflowExecutionRow>;

    async fn list_workflow_executions(
        &self,
        params: &QueryParams,
    ) -> Result<Vec<WorkflowExecutionRow>>;

    /// Sub-workflow executions owned by a task (with-items spawns several).
    async fn list_workflow_executions_by_task(
        &self,
        task_execution_id: Uuid,
    ) -> Result<Vec<WorkflowExecutionRow>>;

    /// Deletes the execution and cascades to its tasks and their actions.
    async fn delete_workflow_execution(&self, id: Uuid) -> Result<()>;

    /// Row-lock emulation: bump updated_at on the execution row. On Postgres
    /// this conflicts with concurrent writers the way the original's
    /// acquire_lock does; the engine also serializes advances in-process.
    async fn touch_workflow_execution(&self, id: Uuid) -> Result<()>;

    // ============================================
    // Task executions
    // ============================================

    async fn create_task_execution(&self, input: CreateTaskExecution) -> Result<TaskExecutionRow>;

    async fn get_task_execution(&self, id: Uuid) -> Result<TaskExecutionRow>;

    async fn save_task_execution(&self, row: &TaskExecutionRow) -> Result<TaskExecutionRow>;

    /// All tasks of a workflow execution, ordered by creation time.
    async fn list_task_executions(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecutionRow>>;

    // ============================================
    // Action executions
    // ============================================

    async fn create_action_execution(
        &self,
        input: CreateActionExecution,
    ) -> Result<ActionExecutionRow>;

    async fn get_action_execution(&self, id: Uuid) -> Result<ActionExecutionRow>;

    async fn save_action_execution(&self, row: &ActionExecutionRow) -> Result<ActionExecutionRow>;

    /// All action executions of a task, ordered by creation time.
    async fn list_action_executions(
        &self,
        task_execution_id: Uuid,
    ) -> Result<Vec<ActionExecutionRow>>;

    async fn delete_action_execution(&self, id: Uuid) -> Result<()>;

    // ============================================
    // Delayed calls
    // ============================================

    async fn create_delayed_call(&self, input: CreateDelayedCall) -> Result<DelayedCallRow>;

    /// Atomically claim due calls: for each row with
    /// `execution_time < now AND processing = false`, CAS processing to true.
    /// Only rows whose CAS succeeded are returned.
    async fn claim_due_delayed_calls(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DelayedCallRow>>;

    async fn delete_delayed_call(&self, id: Uuid) -> Result<()>;

    /// Reaper: release claims whose handler died. Returns released count.
    async fn reset_stale_delayed_calls(&self, older_than: DateTime<Utc>) -> Result<u64>;

    // ============================================
    // Cron triggers
    // ============================================

    async fn create_cron_trigger(&self, input: CreateCronTrigger) -> Result<CronTriggerRow>;

    async fn load_cron_trigger(
        &self,
        name: &str,
        auth: &AuthContext,
    ) -> Result<Option<CronTriggerRow>>;

    async fn list_cron_triggers(
        &self,
        auth: &AuthContext,
        params: &QueryParams,
    ) -> Result<Vec<CronTriggerRow>>;

    /// Triggers with `next_execution_time < now`, ordered by that column.
    async fn list_due_cron_triggers(&self, now: DateTime<Utc>) -> Result<Vec<CronTriggerRow>>;

    /// Optimistic advance: update next/remaining guarded by
    /// `WHERE next_execution_time = old_next`. True iff this caller won.
    async fn advance_cron_trigger(
        &self,
        id: Uuid,
        old_next: DateTime<Utc>,
        new_next: DateTime<Utc>,
        remaining_executions: Option<i32>,
    ) -> Result<bool>;

    /// Optimistic delete for the last remaining execution; the delete count
    /// doubles as the CAS. True iff this caller won.
    async fn delete_cron_trigger_if_due(&self, id: Uuid, old_next: DateTime<Utc>) -> Result<bool>;

    async fn delete_cron_trigger(&self, name: &str, auth: &AuthContext) -> Result<()>;

    async fn cron_triggers_exist_for_workflow(&self, workflow_id: Uuid) -> Result<bool>;
}

/// Project-scope visibility: own project, public scope, or admin.
pub fn visible_to(auth: &AuthContext, project_id: &Option<String>, scope: &str) -> bool {
    auth.is_admin || scope == "public" || *project_id == auth.project_id
}

/// Retry an operation a bounded number of times on transient database
/// errors. Anything else surfaces immediately.
pub async fn retry_transient<T, F, Fut>(attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last = None;

    for _ in 0..attempts.max(1) {
        match op().await {
            Err(e) if e.is_transient() => last = Some(e),
            other => return other,
        }
    }

    Err(last.unwrap_or_else(|| taskweave_core::EngineError::db("retries exhausted")))
}

/// Deterministic hash of a JSON mapping, used by the cron trigger
/// duplicate-prevention constraint.
pub fn hash_json_object(value: &Value) -> String {
    let canonical = match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(k, _)| k.as_str());
            serde_json::to_string(&entries).unwrap_or_default()
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    };

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
