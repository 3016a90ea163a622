// Postgres StateStore backend (sqlx).
//
// Claims use UPDATE .. WHERE processing = false guarded by SKIP LOCKED, and
// the cron advance is an optimistic UPDATE guarded on the old
// next_execution_time, so any number of engine replicas can poll the same
// tables safely.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPool;
use taskweave_core::{AuthContext, EngineError, Result};
use uuid::Uuid;

use crate::limits::{cut_state_info, validate_long_field};
use crate::models::*;
use crate::store::{hash_json_object, StateStore};

pub struct PgStore {
    pool: PgPool,
    field_size_limit_kb: i64,
}

impl PgStore {
    pub fn new(pool: PgPool, field_size_limit_kb: i64) -> Self {
        PgStore {
            pool,
            field_size_limit_kb,
        }
    }

    /// Connect and run migrations.
    pub async fn from_url(database_url: &str, field_size_limit_kb: i64) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| EngineError::db(format!("Failed to connect: {}", e)))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| EngineError::db(format!("Failed to run migrations: {}", e)))?;

        Ok(PgStore::new(pool, field_size_limit_kb))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_db_err(entity: &str) -> impl Fn(sqlx::Error) -> EngineError + '_ {
    move |e| match &e {
        sqlx::Error::RowNotFound => EngineError::not_found(format!("{} not found", entity)),
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            EngineError::conflict(format!("Duplicate entry for {}: {}", entity, db.message()))
        }
        _ => EngineError::db(format!("{}: {}", entity, e)),
    }
}

/// ORDER BY + keyset-marker SQL fragments from whitelisted sort parameters.
/// Only known column names ever reach the query text.
fn page_fragments(params: &QueryParams, allowed: &[&str]) -> (String, String) {
    let key = params
        .sort_keys
        .first()
        .map(String::as_str)
        .filter(|k| allowed.contains(k))
        .unwrap_or("created_at");
    let dir = match params.sort_dirs.first().map(String::as_str) {
        Some("desc") => "DESC",
        _ => "ASC",
    };
    let cmp = if dir == "DESC" { "<" } else { ">" };

    let order = format!("ORDER BY {key} {dir}, id {dir}");
    let marker = format!(
        "AND (({key}, id) {cmp} (SELECT {key}, id FROM marker_row) OR $marker::uuid IS NULL)"
    );

    (order, marker)
}

const WF_DEF_COLUMNS: &str = "id, name, project_id, scope, definition, spec, tags, is_system, \
                              created_at, updated_at";

const ACTION_DEF_COLUMNS: &str = "id, name, project_id, scope, description, definition, spec, \
                                  input, action_class, attributes, tags, is_system, created_at, \
                                  updated_at";

const ENVIRONMENT_COLUMNS: &str = "id, name, project_id, scope, description, variables, \
                                   created_at, updated_at";

const WF_EX_COLUMNS: &str = "id, name, description, workflow_name, workflow_id, project_id, \
                             spec, state, state_info, input, output, params, context, \
                             runtime_context, accepted, task_execution_id, created_at, updated_at";

const TASK_EX_COLUMNS: &str = "id, name, workflow_execution_id, workflow_name, workflow_id, \
                               project_id, spec, action_spec, state, state_info, in_context, \
                               published, processed, runtime_context, created_at, updated_at";

const ACTION_EX_COLUMNS: &str = "id, name, description, task_execution_id, project_id, input, \
                                 output, state, state_info, accepted, runtime_context, \
                                 created_at, updated_at";

const DELAYED_CALL_COLUMNS: &str = "id, factory_method_path, target_method_name, \
                                    method_arguments, serializers, auth_context, execution_time, \
                                    processing, created_at, updated_at";

const CRON_TRIGGER_COLUMNS: &str = "id, name, project_id, scope, pattern, first_execution_time, \
                                    next_execution_time, remaining_executions, workflow_id, \
                                    workflow_name, workflow_input, workflow_params, \
                                    workflow_input_hash, workflow_params_hash, trust_id, \
                                    created_at, updated_at";

#[async_trait]
impl StateStore for PgStore {
    // ============================================
    // Workflow definitions
    // ============================================

    async fn create_workflow_definition(
        &self,
        input: CreateWorkflowDefinition,
    ) -> Result<WorkflowDefinitionRow> {
        let sql = format!(
            "INSERT INTO workflow_definitions \
             (id, name, project_id, scope, definition, spec, tags, is_system) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {WF_DEF_COLUMNS}"
        );

        sqlx::query_as::<_, WorkflowDefinitionRow>(&sql)
            .bind(Uuid::now_v7())
            .bind(&input.name)
            .bind(&input.project_id)
            .bind(&input.scope)
            .bind(&input.definition)
            .bind(&input.spec)
            .bind(&input.tags)
            .bind(input.is_system)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err("WorkflowDefinition"))
    }

    async fn update_workflow_definition(
        &self,
        name: &str,
        auth: &AuthContext,
        definition: String,
        spec: Value,
        tags: Vec<String>,
    ) -> Result<WorkflowDefinitionRow> {
        let sql = format!(
            "UPDATE workflow_definitions \
             SET definition = $2, spec = $3, tags = $4, updated_at = NOW() \
             WHERE name = $1 AND (project_id = $5 OR scope = 'public' OR $6) \
             RETURNING {WF_DEF_COLUMNS}"
        );

        sqlx::query_as::<_, WorkflowDefinitionRow>(&sql)
            .bind(name)
            .bind(&definition)
            .bind(&spec)
            .bind(&tags)
            .bind(&auth.project_id)
            .bind(auth.is_admin)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err("WorkflowDefinition"))?
            .ok_or_else(|| {
                EngineError::not_found(format!("Workflow not found [workflow_name={}]", name))
            })
    }

    async fn load_workflow_definition(
        &self,
        name: &str,
        auth: &AuthContext,
    ) -> Result<Option<WorkflowDefinitionRow>> {
        let sql = format!(
            "SELECT {WF_DEF_COLUMNS} FROM workflow_definitions \
             WHERE name = $1 AND (project_id = $2 OR scope = 'public' OR $3)"
        );

        sqlx::query_as::<_, WorkflowDefinitionRow>(&sql)
            .bind(name)
            .bind(&auth.project_id)
            .bind(auth.is_admin)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err("WorkflowDefinition"))
    }

    async fn list_workflow_definitions(
        &self,
        auth: &AuthContext,
        params: &QueryParams,
    ) -> Result<Vec<WorkflowDefinitionRow>> {
        let (order, marker) = page_fragments(params, &["name", "created_at", "updated_at"]);
        let marker = marker.replace("$marker", "$3");

        let sql = format!(
            "WITH marker_row AS \
             (SELECT * FROM workflow_definitions WHERE id = $3) \
             SELECT {WF_DEF_COLUMNS} FROM workflow_definitions \
             WHERE (project_id = $1 OR scope = 'public' OR $2) {marker} \
             {order} LIMIT $4"
        );

        sqlx::query_as::<_, WorkflowDefinitionRow>(&sql)
            .bind(&auth.project_id)
            .bind(auth.is_admin)
            .bind(params.marker)
            .bind(params.limit.unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_err("WorkflowDefinition"))
    }

    async fn delete_workflow_definition(&self, name: &str, auth: &AuthContext) -> Result<()> {
        let def = self
            .load_workflow_definition(name, auth)
            .await?
            .ok_or_else(|| {
                EngineError::not_found(format!("Workflow not found [workflow_name={}]", name))
            })?;

        if self.cron_triggers_exist_for_workflow(def.id).await? {
            return Err(EngineError::invalid_state(format!(
                "Can't delete workflow '{}': cron triggers reference it",
                name
            )));
        }

        sqlx::query("DELETE FROM workflow_definitions WHERE id = $1")
            .bind(def.id)
            .execute(&self.pool)
            .await
            .map_err(map_db_err("WorkflowDefinition"))?;

        Ok(())
    }

    // ============================================
    // Action definitions
    // ============================================

    async fn create_action_definition(
        &self,
        input: CreateActionDefinition,
    ) -> Result<ActionDefinitionRow> {
        let sql = format!(
            "INSERT INTO action_definitions \
             (id, name, project_id, scope, description, definition, spec, input, action_class, \
              attributes, tags, is_system) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             RETURNING {ACTION_DEF_COLUMNS}"
        );

        sqlx::query_as::<_, ActionDefinitionRow>(&sql)
            .bind(Uuid::now_v7())
            .bind(&input.name)
            .bind(&input.project_id)
            .bind(&input.scope)
            .bind(&input.description)
            .bind(&input.definition)
            .bind(&input.spec)
            .bind(&input.input)
            .bind(&input.action_class)
            .bind(&input.attributes)
            .bind(&input.tags)
            .bind(input.is_system)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err("ActionDefinition"))
    }

    async fn load_action_definition(
        &self,
        name: &str,
        auth: &AuthContext,
    ) -> Result<Option<ActionDefinitionRow>> {
        let sql = format!(
            "SELECT {ACTION_DEF_COLUMNS} FROM action_definitions \
             WHERE name = $1 AND (project_id = $2 OR scope = 'public' OR $3)"
        );

        sqlx::query_as::<_, ActionDefinitionRow>(&sql)
            .bind(name)
            .bind(&auth.project_id)
            .bind(auth.is_admin)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err("ActionDefinition"))
    }

    async fn list_action_definitions(
        &self,
        auth: &AuthContext,
        params: &QueryParams,
    ) -> Result<Vec<ActionDefinitionRow>> {
        let (order, marker) = page_fragments(params, &["name", "created_at", "updated_at"]);
        let marker = marker.replace("$marker", "$3");

        let sql = format!(
            "WITH marker_row AS \
             (SELECT * FROM action_definitions WHERE id = $3) \
             SELECT {ACTION_DEF_COLUMNS} FROM action_definitions \
             WHERE (project_id = $1 OR scope = 'public' OR $2) {marker} \
             {order} LIMIT $4"
        );

        sqlx::query_as::<_, ActionDefinitionRow>(&sql)
            .bind(&auth.project_id)
            .bind(auth.is_admin)
            .bind(params.marker)
            .bind(params.limit.unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_err("ActionDefinition"))
    }

    async fn delete_action_definition(&self, name: &str, auth: &AuthContext) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM action_definitions \
             WHERE name = $1 AND (project_id = $2 OR scope = 'public' OR $3)",
        )
        .bind(name)
        .bind(&auth.project_id)
        .bind(auth.is_admin)
        .execute(&self.pool)
        .await
        .map_err(map_db_err("ActionDefinition"))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!(
                "Action not found [action_name={}]",
                name
            )));
        }

        Ok(())
    }

    // ============================================
    // Environments
    // ============================================

    async fn create_environment(&self, input: CreateEnvironment) -> Result<EnvironmentRow> {
        let sql = format!(
            "INSERT INTO environments (id, name, project_id, scope, description, variables) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {ENVIRONMENT_COLUMNS}"
        );

        sqlx::query_as::<_, EnvironmentRow>(&sql)
            .bind(Uuid::now_v7())
            .bind(&input.name)
            .bind(&input.project_id)
            .bind(&input.scope)
            .bind(&input.description)
            .bind(&input.variables)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err("Environment"))
    }

    async fn load_environment(
        &self,
        name: &str,
        auth: &AuthContext,
    ) -> Result<Option<EnvironmentRow>> {
        let sql = format!(
            "SELECT {ENVIRONMENT_COLUMNS} FROM environments \
             WHERE name = $1 AND (project_id = $2 OR scope = 'public' OR $3)"
        );

        sqlx::query_as::<_, EnvironmentRow>(&sql)
            .bind(name)
            .bind(&auth.project_id)
            .bind(auth.is_admin)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err("Environment"))
    }

    async fn list_environments(
        &self,
        auth: &AuthContext,
        params: &QueryParams,
    ) -> Result<Vec<EnvironmentRow>> {
        let (order, marker) = page_fragments(params, &["name", "created_at", "updated_at"]);
        let marker = marker.replace("$marker", "$3");

        let sql = format!(
            "WITH marker_row AS (SELECT * FROM environments WHERE id = $3) \
             SELECT {ENVIRONMENT_COLUMNS} FROM environments \
             WHERE (project_id = $1 OR scope = 'public' OR $2) {marker} \
             {order} LIMIT $4"
        );

        sqlx::query_as::<_, EnvironmentRow>(&sql)
            .bind(&auth.project_id)
            .bind(auth.is_admin)
            .bind(params.marker)
            .bind(params.limit.unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_err("Environment"))
    }

    async fn delete_environment(&self, name: &str, auth: &AuthContext) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM environments \
             WHERE name = $1 AND (project_id = $2 OR scope = 'public' OR $3)",
        )
        .bind(name)
        .bind(&auth.project_id)
        .bind(auth.is_admin)
        .execute(&self.pool)
        .await
        .map_err(map_db_err("Environment"))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!(
                "Environment not found [name={}]",
                name
            )));
        }

        Ok(())
    }

    // ============================================
    // Workflow executions
    // ============================================

    async fn create_workflow_execution(
        &self,
        input: CreateWorkflowExecution,
    ) -> Result<WorkflowExecutionRow> {
        validate_long_field(self.field_size_limit_kb, "input", &input.input)?;
        validate_long_field(self.field_size_limit_kb, "params", &input.params)?;

        let sql = format!(
            "INSERT INTO workflow_executions \
             (id, name, description, workflow_name, workflow_id, project_id, spec, state, input, \
              output, params, context, runtime_context, accepted, task_execution_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, '{{}}', $10, $11, $12, false, $13) \
             RETURNING {WF_EX_COLUMNS}"
        );

        sqlx::query_as::<_, WorkflowExecutionRow>(&sql)
            .bind(Uuid::now_v7())
            .bind(&input.name)
            .bind(&input.description)
            .bind(&input.workflow_name)
            .bind(input.workflow_id)
            .bind(&input.project_id)
            .bind(&input.spec)
            .bind(input.state.as_str())
            .bind(&input.input)
            .bind(&input.params)
            .bind(&input.context)
            .bind(&input.runtime_context)
            .bind(input.task_execution_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err("WorkflowExecution"))
    }

    async fn get_workflow_execution(&self, id: Uuid) -> Result<WorkflowExecutionRow> {
        let sql = format!("SELECT {WF_EX_COLUMNS} FROM workflow_executions WHERE id = $1");

        sqlx::query_as::<_, WorkflowExecutionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err("WorkflowExecution"))?
            .ok_or_else(|| {
                EngineError::not_found(format!("Workflow execution not found [id={}]", id))
            })
    }

    async fn save_workflow_execution(
        &self,
        row: &WorkflowExecutionRow,
    ) -> Result<WorkflowExecutionRow> {
        validate_long_field(self.field_size_limit_kb, "input", &row.input)?;
        validate_long_field(self.field_size_limit_kb, "output", &row.output)?;
        validate_long_field(self.field_size_limit_kb, "params", &row.params)?;

        let sql = format!(
            "UPDATE workflow_executions \
             SET state = $2, state_info = $3, input = $4, output = $5, params = $6, context = $7, \
                 runtime_context = $8, accepted = $9, description = $10, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {WF_EX_COLUMNS}"
        );

        sqlx::query_as::<_, WorkflowExecutionRow>(&sql)
            .bind(row.id)
            .bind(&row.state)
            .bind(cut_state_info(row.state_info.clone()))
            .bind(&row.input)
            .bind(&row.output)
            .bind(&row.params)
            .bind(&row.context)
            .bind(&row.runtime_context)
            .bind(row.accepted)
            .bind(&row.description)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err("WorkflowExecution"))?
            .ok_or_else(|| {
                EngineError::not_found(format!("Workflow execution not found [id={}]", row.id))
            })
    }

    async fn list_workflow_executions(
        &self,
        params: &QueryParams,
    ) -> Result<Vec<WorkflowExecutionRow>> {
        let (order, marker) =
            page_fragments(params, &["name", "created_at", "updated_at", "state"]);
        let marker = marker.replace("$marker", "$1");

        let sql = format!(
            "WITH marker_row AS (SELECT * FROM workflow_executions WHERE id = $1) \
             SELECT {WF_EX_COLUMNS} FROM workflow_executions \
             WHERE true {marker} \
             {order} LIMIT $2"
        );

        sqlx::query_as::<_, WorkflowExecutionRow>(&sql)
            .bind(params.marker)
            .bind(params.limit.unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_err("WorkflowExecution"))
    }

    async fn list_workflow_executions_by_task(
        &self,
        task_execution_id: Uuid,
    ) -> Result<Vec<WorkflowExecutionRow>> {
        let sql = format!(
            "SELECT {WF_EX_COLUMNS} FROM workflow_executions \
             WHERE task_execution_id = $1 ORDER BY created_at"
        );

        sqlx::query_as::<_, WorkflowExecutionRow>(&sql)
            .bind(task_execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_err("WorkflowExecution"))
    }

    async fn delete_workflow_execution(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM workflow_executions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_db_err("WorkflowExecution"))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!(
                "Workflow execution not found [id={}]",
                id
            )));
        }

        Ok(())
    }

    async fn touch_workflow_execution(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("UPDATE workflow_executions SET updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_db_err("WorkflowExecution"))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!(
                "Workflow execution not found [id={}]",
                id
            )));
        }

        Ok(())
    }

    // ============================================
    // Task executions
    // ============================================

    async fn create_task_execution(&self, input: CreateTaskExecution) -> Result<TaskExecutionRow> {
        let sql = format!(
            "INSERT INTO task_executions \
             (id, name, workflow_execution_id, workflow_name, workflow_id, project_id, spec, \
              action_spec, state, in_context, published, processed, runtime_context) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, '{{}}', false, $11) \
             RETURNING {TASK_EX_COLUMNS}"
        );

        sqlx::query_as::<_, TaskExecutionRow>(&sql)
            .bind(Uuid::now_v7())
            .bind(&input.name)
            .bind(input.workflow_execution_id)
            .bind(&input.workflow_name)
            .bind(input.workflow_id)
            .bind(&input.project_id)
            .bind(&input.spec)
            .bind(&input.action_spec)
            .bind(input.state.as_str())
            .bind(&input.in_context)
            .bind(&input.runtime_context)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err("TaskExecution"))
    }

    async fn get_task_execution(&self, id: Uuid) -> Result<TaskExecutionRow> {
        let sql = format!("SELECT {TASK_EX_COLUMNS} FROM task_executions WHERE id = $1");

        sqlx::query_as::<_, TaskExecutionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err("TaskExecution"))?
            .ok_or_else(|| EngineError::not_found(format!("Task execution not found [id={}]", id)))
    }

    async fn save_task_execution(&self, row: &TaskExecutionRow) -> Result<TaskExecutionRow> {
        validate_long_field(self.field_size_limit_kb, "published", &row.published)?;

        let sql = format!(
            "UPDATE task_executions \
             SET state = $2, state_info = $3, in_context = $4, published = $5, processed = $6, \
                 runtime_context = $7, action_spec = $8, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {TASK_EX_COLUMNS}"
        );

        sqlx::query_as::<_, TaskExecutionRow>(&sql)
            .bind(row.id)
            .bind(&row.state)
            .bind(cut_state_info(row.state_info.clone()))
            .bind(&row.in_context)
            .bind(&row.published)
            .bind(row.processed)
            .bind(&row.runtime_context)
            .bind(&row.action_spec)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err("TaskExecution"))?
            .ok_or_else(|| {
                EngineError::not_found(format!("Task execution not found [id={}]", row.id))
            })
    }

    async fn list_task_executions(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecutionRow>> {
        let sql = format!(
            "SELECT {TASK_EX_COLUMNS} FROM task_executions \
             WHERE workflow_execution_id = $1 ORDER BY created_at"
        );

        sqlx::query_as::<_, TaskExecutionRow>(&sql)
            .bind(workflow_execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_err("TaskExecution"))
    }

    // ============================================
    // Action executions
    // ============================================

    async fn create_action_execution(
        &self,
        input: CreateActionExecution,
    ) -> Result<ActionExecutionRow> {
        validate_long_field(self.field_size_limit_kb, "input", &input.input)?;

        let sql = format!(
            "INSERT INTO action_executions \
             (id, name, description, task_execution_id, project_id, input, output, state, \
              accepted, runtime_context) \
             VALUES ($1, $2, $3, $4, $5, $6, 'null', $7, false, $8) \
             RETURNING {ACTION_EX_COLUMNS}"
        );

        sqlx::query_as::<_, ActionExecutionRow>(&sql)
            .bind(Uuid::now_v7())
            .bind(&input.name)
            .bind(&input.description)
            .bind(input.task_execution_id)
            .bind(&input.project_id)
            .bind(&input.input)
            .bind(input.state.as_str())
            .bind(&input.runtime_context)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err("ActionExecution"))
    }

    async fn get_action_execution(&self, id: Uuid) -> Result<ActionExecutionRow> {
        let sql = format!("SELECT {ACTION_EX_COLUMNS} FROM action_executions WHERE id = $1");

        sqlx::query_as::<_, ActionExecutionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err("ActionExecution"))?
            .ok_or_else(|| {
                EngineError::not_found(format!("Action execution not found [id={}]", id))
            })
    }

    async fn save_action_execution(&self, row: &ActionExecutionRow) -> Result<ActionExecutionRow> {
        validate_long_field(self.field_size_limit_kb, "input", &row.input)?;
        validate_long_field(self.field_size_limit_kb, "output", &row.output)?;

        let sql = format!(
            "UPDATE action_executions \
             SET state = $2, state_info = $3, input = $4, output = $5, accepted = $6, \
                 runtime_context = $7, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {ACTION_EX_COLUMNS}"
        );

        sqlx::query_as::<_, ActionExecutionRow>(&sql)
            .bind(row.id)
            .bind(&row.state)
            .bind(cut_state_info(row.state_info.clone()))
            .bind(&row.input)
            .bind(&row.output)
            .bind(row.accepted)
            .bind(&row.runtime_context)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err("ActionExecution"))?
            .ok_or_else(|| {
                EngineError::not_found(format!("Action execution not found [id={}]", row.id))
            })
    }

    async fn list_action_executions(
        &self,
        task_execution_id: Uuid,
    ) -> Result<Vec<ActionExecutionRow>> {
        let sql = format!(
            "SELECT {ACTION_EX_COLUMNS} FROM action_executions \
             WHERE task_execution_id = $1 ORDER BY created_at"
        );

        sqlx::query_as::<_, ActionExecutionRow>(&sql)
            .bind(task_execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_err("ActionExecution"))
    }

    async fn delete_action_execution(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM action_executions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_db_err("ActionExecution"))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!(
                "Action execution not found [id={}]",
                id
            )));
        }

        Ok(())
    }

    // ============================================
    // Delayed calls
    // ============================================

    async fn create_delayed_call(&self, input: CreateDelayedCall) -> Result<DelayedCallRow> {
        let sql = format!(
            "INSERT INTO delayed_calls \
             (id, factory_method_path, target_method_name, method_arguments, serializers, \
              auth_context, execution_time, processing) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, false) \
             RETURNING {DELAYED_CALL_COLUMNS}"
        );

        sqlx::query_as::<_, DelayedCallRow>(&sql)
            .bind(Uuid::now_v7())
            .bind(&input.factory_method_path)
            .bind(&input.target_method_name)
            .bind(&input.method_arguments)
            .bind(&input.serializers)
            .bind(&input.auth_context)
            .bind(input.execution_time)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err("DelayedCall"))
    }

    async fn claim_due_delayed_calls(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DelayedCallRow>> {
        let sql = format!(
            "UPDATE delayed_calls SET processing = true, updated_at = NOW() \
             WHERE id IN ( \
                 SELECT id FROM delayed_calls \
                 WHERE processing = false AND execution_time < $1 \
                 ORDER BY execution_time \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {DELAYED_CALL_COLUMNS}"
        );

        sqlx::query_as::<_, DelayedCallRow>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_err("DelayedCall"))
    }

    async fn delete_delayed_call(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM delayed_calls WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_db_err("DelayedCall"))?;

        Ok(())
    }

    async fn reset_stale_delayed_calls(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE delayed_calls SET processing = false, updated_at = NOW() \
             WHERE processing = true AND updated_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(map_db_err("DelayedCall"))?;

        Ok(result.rows_affected())
    }

    // ============================================
    // Cron triggers
    // ============================================

    async fn create_cron_trigger(&self, input: CreateCronTrigger) -> Result<CronTriggerRow> {
        let sql = format!(
            "INSERT INTO cron_triggers \
             (id, name, project_id, scope, pattern, first_execution_time, next_execution_time, \
              remaining_executions, workflow_id, workflow_name, workflow_input, workflow_params, \
              workflow_input_hash, workflow_params_hash, trust_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             RETURNING {CRON_TRIGGER_COLUMNS}"
        );

        sqlx::query_as::<_, CronTriggerRow>(&sql)
            .bind(Uuid::now_v7())
            .bind(&input.name)
            .bind(&input.project_id)
            .bind(&input.scope)
            .bind(&input.pattern)
            .bind(input.first_execution_time)
            .bind(input.next_execution_time)
            .bind(input.remaining_executions)
            .bind(input.workflow_id)
            .bind(&input.workflow_name)
            .bind(&input.workflow_input)
            .bind(&input.workflow_params)
            .bind(hash_json_object(&input.workflow_input))
            .bind(hash_json_object(&input.workflow_params))
            .bind(&input.trust_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err("CronTrigger"))
    }

    async fn load_cron_trigger(
        &self,
        name: &str,
        auth: &AuthContext,
    ) -> Result<Option<CronTriggerRow>> {
        let sql = format!(
            "SELECT {CRON_TRIGGER_COLUMNS} FROM cron_triggers \
             WHERE name = $1 AND (project_id = $2 OR scope = 'public' OR $3)"
        );

        sqlx::query_as::<_, CronTriggerRow>(&sql)
            .bind(name)
            .bind(&auth.project_id)
            .bind(auth.is_admin)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err("CronTrigger"))
    }

    async fn list_cron_triggers(
        &self,
        auth: &AuthContext,
        params: &QueryParams,
    ) -> Result<Vec<CronTriggerRow>> {
        let (order, marker) =
            page_fragments(params, &["name", "created_at", "next_execution_time"]);
        let marker = marker.replace("$marker", "$3");

        let sql = format!(
            "WITH marker_row AS (SELECT * FROM cron_triggers WHERE id = $3) \
             SELECT {CRON_TRIGGER_COLUMNS} FROM cron_triggers \
             WHERE (project_id = $1 OR scope = 'public' OR $2) {marker} \
             {order} LIMIT $4"
        );

        sqlx::query_as::<_, CronTriggerRow>(&sql)
            .bind(&auth.project_id)
            .bind(auth.is_admin)
            .bind(params.marker)
            .bind(params.limit.unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_err("CronTrigger"))
    }

    async fn list_due_cron_triggers(&self, now: DateTime<Utc>) -> Result<Vec<CronTriggerRow>> {
        let sql = format!(
            "SELECT {CRON_TRIGGER_COLUMNS} FROM cron_triggers \
             WHERE next_execution_time < $1 ORDER BY next_execution_time"
        );

        sqlx::query_as::<_, CronTriggerRow>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_err("CronTrigger"))
    }

    async fn advance_cron_trigger(
        &self,
        id: Uuid,
        old_next: DateTime<Utc>,
        new_next: DateTime<Utc>,
        remaining_executions: Option<i32>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE cron_triggers \
             SET next_execution_time = $3, remaining_executions = $4, updated_at = NOW() \
             WHERE id = $1 AND next_execution_time = $2",
        )
        .bind(id)
        .bind(old_next)
        .bind(new_next)
        .bind(remaining_executions)
        .execute(&self.pool)
        .await
        .map_err(map_db_err("CronTrigger"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_cron_trigger_if_due(&self, id: Uuid, old_next: DateTime<Utc>) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM cron_triggers WHERE id = $1 AND next_execution_time = $2")
                .bind(id)
                .bind(old_next)
                .execute(&self.pool)
                .await
                .map_err(map_db_err("CronTrigger"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_cron_trigger(&self, name: &str, auth: &AuthContext) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM cron_triggers \
             WHERE name = $1 AND (project_id = $2 OR scope = 'public' OR $3)",
        )
        .bind(name)
        .bind(&auth.project_id)
        .bind(auth.is_admin)
        .execute(&self.pool)
        .await
        .map_err(map_db_err("CronTrigger"))?;

        if result.rows_affected() == 0 {
            return Err(EngineError::not_found(format!(
                "Cron trigger not found [name={}]",
                name
            )));
        }

        Ok(())
    }

    async fn cron_triggers_exist_for_workflow(&self, workflow_id: Uuid) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM cron_triggers WHERE workflow_id = $1")
                .bind(workflow_id)
                .fetch_one(&self.pool)
                .await
                .map_err(map_db_err("CronTrigger"))?;

        Ok(count > 0)
    }
}
