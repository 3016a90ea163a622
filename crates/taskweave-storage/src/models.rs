// Database models (internal, may differ from public DTOs)

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use taskweave_core::State;
use uuid::Uuid;

// ============================================
// Definition models
// ============================================

/// Workflow definition row
#[derive(Debug, Clone, FromRow)]
pub struct WorkflowDefinitionRow {
    pub id: Uuid,
    pub name: String,
    pub project_id: Option<String>,
    pub scope: String,
    /// Raw DSL text
    pub definition: String,
    /// Parsed workflow spec as JSON
    pub spec: Value,
    pub tags: Vec<String>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateWorkflowDefinition {
    pub name: String,
    pub project_id: Option<String>,
    pub scope: String,
    pub definition: String,
    pub spec: Value,
    pub tags: Vec<String>,
    pub is_system: bool,
}

/// Registered action definition row
#[derive(Debug, Clone, FromRow)]
pub struct ActionDefinitionRow {
    pub id: Uuid,
    pub name: String,
    pub project_id: Option<String>,
    pub scope: String,
    pub description: Option<String>,
    pub definition: Option<String>,
    pub spec: Value,
    /// Declared input signature, e.g. `url, method="GET"`
    pub input: Option<String>,
    /// Executor-side implementation key for system actions
    pub action_class: Option<String>,
    pub attributes: Value,
    pub tags: Vec<String>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateActionDefinition {
    pub name: String,
    pub project_id: Option<String>,
    pub scope: String,
    pub description: Option<String>,
    pub definition: Option<String>,
    pub spec: Value,
    pub input: Option<String>,
    pub action_class: Option<String>,
    pub attributes: Value,
    pub tags: Vec<String>,
    pub is_system: bool,
}

/// Named environment referenced from start_workflow params
#[derive(Debug, Clone, FromRow)]
pub struct EnvironmentRow {
    pub id: Uuid,
    pub name: String,
    pub project_id: Option<String>,
    pub scope: String,
    pub description: Option<String>,
    pub variables: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateEnvironment {
    pub name: String,
    pub project_id: Option<String>,
    pub scope: String,
    pub description: Option<String>,
    pub variables: Value,
}

// ============================================
// Execution models
// ============================================

/// Workflow execution row.
/// `task_execution_id` is set iff this is a sub-workflow.
#[derive(Debug, Clone, FromRow)]
pub struct WorkflowExecutionRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub workflow_name: String,
    pub workflow_id: Option<Uuid>,
    pub project_id: Option<String>,
    pub spec: Value,
    pub state: String,
    pub state_info: Option<String>,
    pub input: Value,
    pub output: Value,
    pub params: Value,
    pub context: Value,
    pub runtime_context: Value,
    /// True only in SUCCESS/ERROR: the result is authoritative for a parent
    pub accepted: bool,
    pub task_execution_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateWorkflowExecution {
    pub name: String,
    pub description: Option<String>,
    pub workflow_name: String,
    pub workflow_id: Option<Uuid>,
    pub project_id: Option<String>,
    pub spec: Value,
    pub state: State,
    pub input: Value,
    pub params: Value,
    pub context: Value,
    pub runtime_context: Value,
    pub task_execution_id: Option<Uuid>,
}

/// Task execution row
#[derive(Debug, Clone, FromRow)]
pub struct TaskExecutionRow {
    pub id: Uuid,
    pub name: String,
    pub workflow_execution_id: Uuid,
    pub workflow_name: String,
    pub workflow_id: Option<Uuid>,
    pub project_id: Option<String>,
    pub spec: Value,
    /// Resolved action call (name + evaluated input shape)
    pub action_spec: Value,
    pub state: String,
    pub state_info: Option<String>,
    pub in_context: Value,
    pub published: Value,
    /// True once the controller has consumed this task's completion
    pub processed: bool,
    pub runtime_context: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateTaskExecution {
    pub name: String,
    pub workflow_execution_id: Uuid,
    pub workflow_name: String,
    pub workflow_id: Option<Uuid>,
    pub project_id: Option<String>,
    pub spec: Value,
    pub action_spec: Value,
    pub state: State,
    pub in_context: Value,
    pub runtime_context: Value,
}

/// Action execution row.
/// `accepted=true` means the result is authoritative for the owning task.
#[derive(Debug, Clone, FromRow)]
pub struct ActionExecutionRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub task_execution_id: Option<Uuid>,
    pub project_id: Option<String>,
    pub input: Value,
    pub output: Value,
    pub state: String,
    pub state_info: Option<String>,
    pub accepted: bool,
    pub runtime_context: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateActionExecution {
    pub name: String,
    pub description: Option<String>,
    pub task_execution_id: Option<Uuid>,
    pub project_id: Option<String>,
    pub input: Value,
    pub state: State,
    pub runtime_context: Value,
}

// ============================================
// Scheduling models
// ============================================

/// A persisted function invocation scheduled for a future time.
/// Claim discipline: a sweeper CASes `processing false -> true`; the winner
/// owns the call and deletes the row once the target returns.
#[derive(Debug, Clone, FromRow)]
pub struct DelayedCallRow {
    pub id: Uuid,
    pub factory_method_path: Option<String>,
    pub target_method_name: String,
    pub method_arguments: Value,
    pub serializers: Value,
    pub auth_context: Value,
    pub execution_time: DateTime<Utc>,
    pub processing: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateDelayedCall {
    pub factory_method_path: Option<String>,
    pub target_method_name: String,
    pub method_arguments: Value,
    pub serializers: Value,
    pub auth_context: Value,
    pub execution_time: DateTime<Utc>,
}

/// Cron trigger row
#[derive(Debug, Clone, FromRow)]
pub struct CronTriggerRow {
    pub id: Uuid,
    pub name: String,
    pub project_id: Option<String>,
    pub scope: String,
    pub pattern: String,
    pub first_execution_time: Option<DateTime<Utc>>,
    pub next_execution_time: DateTime<Utc>,
    pub remaining_executions: Option<i32>,
    pub workflow_id: Option<Uuid>,
    pub workflow_name: String,
    pub workflow_input: Value,
    pub workflow_params: Value,
    pub workflow_input_hash: String,
    pub workflow_params_hash: String,
    pub trust_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateCronTrigger {
    pub name: String,
    pub project_id: Option<String>,
    pub scope: String,
    pub pattern: String,
    pub first_execution_time: Option<DateTime<Utc>>,
    pub next_execution_time: DateTime<Utc>,
    pub remaining_executions: Option<i32>,
    pub workflow_id: Option<Uuid>,
    pub workflow_name: String,
    pub workflow_input: Value,
    pub workflow_params: Value,
    pub trust_id: Option<String>,
}

// ============================================
// Query parameters
// ============================================

/// Pagination and sorting for list operations
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub limit: Option<i64>,
    /// Last id of the previous page
    pub marker: Option<Uuid>,
    pub sort_keys: Vec<String>,
    pub sort_dirs: Vec<String>,
}

impl QueryParams {
    pub fn limited(limit: i64) -> Self {
        QueryParams {
            limit: Some(limit),
            ..Default::default()
        }
    }
}

// ============================================
// Typed state accessors
// ============================================

macro_rules! impl_state_accessors {
    ($row:ty) => {
        impl $row {
            pub fn state(&self) -> State {
                self.state.parse().unwrap_or(State::Error)
            }

            pub fn set_state(&mut self, state: State) {
                self.state = state.to_string();
            }
        }
    };
}

impl_state_accessors!(WorkflowExecutionRow);
impl_state_accessors!(TaskExecutionRow);
impl_state_accessors!(ActionExecutionRow);

impl WorkflowExecutionRow {
    /// Position among siblings spawned by a with-items parent task
    pub fn with_items_index(&self) -> i64 {
        self.runtime_context
            .get("index")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }
}

impl ActionExecutionRow {
    /// Position among iterations of a with-items task
    pub fn with_items_index(&self) -> i64 {
        self.runtime_context
            .get("index")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }
}
