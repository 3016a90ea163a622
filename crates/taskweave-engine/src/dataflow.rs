// Data flow: context seeding, per-task context propagation, variable
// publishing, and workflow output evaluation.
//
// Context flows along transitions: a task's inbound context is the outbound
// context of the task that triggered it, so parallel branches stay isolated
// until a join or the final context merge brings them together.

use serde_json::{json, Value};
use taskweave_core::context::{self, Context, ENV_KEY, EXECUTION_KEY, TASK_EXECUTION_ID_KEY};
use taskweave_core::expr::{self, Evaluator};
use taskweave_core::spec::{TaskSpec, WorkflowSpec};
use taskweave_core::Result;
use taskweave_storage::{TaskExecutionRow, WorkflowExecutionRow};

/// Key under which a task's raw result lives in its runtime context.
pub const RESULT_KEY: &str = "result";

/// Seed the execution context of a freshly created workflow execution:
/// input, then workflow vars (input wins on collision), then the reserved
/// `__env` / `__execution` keys.
pub fn seed_workflow_context(
    wf_ex: &mut WorkflowExecutionRow,
    spec: &WorkflowSpec,
    env: &Context,
    evaluator: &dyn Evaluator,
) -> Result<()> {
    let mut ctx = context::as_object(&wf_ex.input);

    ctx.insert(ENV_KEY.to_string(), Value::Object(env.clone()));

    for (name, value) in &spec.vars {
        if !ctx.contains_key(name) {
            ctx.insert(name.clone(), expr::evaluate_recursively(evaluator, value, &ctx)?);
        }
    }

    ctx.insert(
        EXECUTION_KEY.to_string(),
        json!({
            "id": wf_ex.id,
            "name": wf_ex.name,
            "workflow_name": wf_ex.workflow_name,
            "input": wf_ex.input,
            "params": wf_ex.params,
        }),
    );

    if let Some(task_ex_id) = wf_ex.task_execution_id {
        ctx.insert(TASK_EXECUTION_ID_KEY.to_string(), json!(task_ex_id));
    }

    wf_ex.context = Value::Object(ctx);
    Ok(())
}

/// Replace the `__env` view after a resume/rerun supplied a new environment.
pub fn refresh_env_in_context(wf_ex: &mut WorkflowExecutionRow, env: &Context) {
    let mut ctx = context::as_object(&wf_ex.context);
    ctx.insert(ENV_KEY.to_string(), Value::Object(env.clone()));
    wf_ex.context = Value::Object(ctx);
}

/// The task's raw result, as recorded at completion.
pub fn task_result(task: &TaskExecutionRow) -> Option<Value> {
    task.runtime_context.get(RESULT_KEY).cloned()
}

/// Context against which `publish`, guards and policies of a completed task
/// are evaluated: inbound context plus the task result under the task name.
pub fn task_post_context(task: &TaskExecutionRow) -> Context {
    let mut ctx = context::as_object(&task.in_context);

    if let Some(result) = task_result(task) {
        ctx.insert(task.name.clone(), result);
    }

    ctx
}

/// Outbound context handed to transition targets: inbound context, the task
/// result under the task name (unless keep-result is false), and the
/// published variables.
pub fn task_outbound_context(task: &TaskExecutionRow, task_spec: &TaskSpec) -> Context {
    let mut ctx = context::as_object(&task.in_context);

    if task_spec.keep_result {
        if let Some(result) = task_result(task) {
            ctx.insert(task.name.clone(), result);
        }
    }

    context::merge_into(&mut ctx, &context::as_object(&task.published));

    ctx
}

/// Final workflow context: the workflow's own context plus the published
/// variables of successful tasks, merged in completion order so later
/// publishes win on key collision.
pub fn evaluate_final_context(
    wf_ex: &WorkflowExecutionRow,
    tasks: &[TaskExecutionRow],
) -> Context {
    let mut ctx = context::as_object(&wf_ex.context);

    let mut successful: Vec<&TaskExecutionRow> = tasks
        .iter()
        .filter(|t| t.state() == taskweave_core::State::Success)
        .collect();
    successful.sort_by_key(|t| t.updated_at);

    for task in successful {
        context::merge_into(&mut ctx, &context::as_object(&task.published));
    }

    ctx
}

/// Workflow output: the declared `output` mapping evaluated against the
/// final context, or the final context itself (reserved keys stripped) when
/// nothing is declared.
pub fn evaluate_workflow_output(
    spec: &WorkflowSpec,
    final_context: &Context,
    evaluator: &dyn Evaluator,
) -> Result<Context> {
    if spec.output.is_empty() {
        Ok(context::strip_reserved(final_context))
    } else {
        expr::evaluate_object(evaluator, &spec.output, final_context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use taskweave_core::expr::PathEvaluator;
    use taskweave_core::State;
    use uuid::Uuid;

    fn wf_ex(input: Value) -> WorkflowExecutionRow {
        WorkflowExecutionRow {
            id: Uuid::now_v7(),
            name: "wf".to_string(),
            description: None,
            workflow_name: "wf".to_string(),
            workflow_id: None,
            project_id: None,
            spec: json!({}),
            state: State::Idle.to_string(),
            state_info: None,
            input,
            output: json!({}),
            params: json!({}),
            context: json!({}),
            runtime_context: json!({}),
            accepted: false,
            task_execution_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn task_ex(name: &str, in_context: Value, published: Value, state: State) -> TaskExecutionRow {
        TaskExecutionRow {
            id: Uuid::now_v7(),
            name: name.to_string(),
            workflow_execution_id: Uuid::now_v7(),
            workflow_name: "wf".to_string(),
            workflow_id: None,
            project_id: None,
            spec: json!({}),
            action_spec: json!({}),
            state: state.to_string(),
            state_info: None,
            in_context,
            published,
            processed: false,
            runtime_context: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_seed_context_vars_and_env() {
        let mut wf = wf_ex(json!({"a": 1}));
        let spec: WorkflowSpec = serde_json::from_value(json!({
            "vars": {"greeting": "<% env().from %>", "a": 99}
        }))
        .unwrap();

        let env = context::as_object(&json!({"from": "Neo"}));
        seed_workflow_context(&mut wf, &spec, &env, &PathEvaluator).unwrap();

        let ctx = context::as_object(&wf.context);
        // Input wins over a colliding var.
        assert_eq!(ctx["a"], json!(1));
        assert_eq!(ctx["greeting"], json!("Neo"));
        assert_eq!(ctx[ENV_KEY], json!({"from": "Neo"}));
        assert_eq!(ctx[EXECUTION_KEY]["workflow_name"], json!("wf"));
    }

    #[test]
    fn test_outbound_context_respects_keep_result() {
        let mut task = task_ex(
            "task1",
            json!({"x": 1}),
            json!({"hi": "Hi"}),
            State::Success,
        );
        task.runtime_context = json!({RESULT_KEY: "Hi"});

        let keep: TaskSpec = serde_json::from_value(json!({})).unwrap();
        let ctx = task_outbound_context(&task, &keep);
        assert_eq!(ctx["task1"], json!("Hi"));
        assert_eq!(ctx["hi"], json!("Hi"));

        let drop: TaskSpec = serde_json::from_value(json!({"keep-result": false})).unwrap();
        let ctx = task_outbound_context(&task, &drop);
        assert!(!ctx.contains_key("task1"));
        assert_eq!(ctx["hi"], json!("Hi"));
    }

    #[test]
    fn test_final_context_merges_successful_tasks_only() {
        let mut wf = wf_ex(json!({}));
        wf.context = json!({"base": true});

        let mut t1 = task_ex("t1", json!({}), json!({"v": 1, "only1": "a"}), State::Success);
        let mut t2 = task_ex("t2", json!({}), json!({"v": 2}), State::Success);
        let t3 = task_ex("t3", json!({}), json!({"bad": true}), State::Error);

        t1.updated_at = Utc::now() - chrono::Duration::seconds(10);
        t2.updated_at = Utc::now();

        let ctx = evaluate_final_context(&wf, &[t1, t2, t3]);

        assert_eq!(ctx["base"], json!(true));
        // Later publish wins.
        assert_eq!(ctx["v"], json!(2));
        assert_eq!(ctx["only1"], json!("a"));
        assert!(!ctx.contains_key("bad"));
    }

    #[test]
    fn test_workflow_output_declared_mapping() {
        let spec: WorkflowSpec = serde_json::from_value(json!({
            "output": {"final": "<% $.v %>"}
        }))
        .unwrap();

        let ctx = context::as_object(&json!({"v": 42, "__env": {}}));
        let output = evaluate_workflow_output(&spec, &ctx, &PathEvaluator).unwrap();

        assert_eq!(Value::Object(output), json!({"final": 42}));
    }

    #[test]
    fn test_workflow_output_default_strips_reserved() {
        let spec: WorkflowSpec = serde_json::from_value(json!({})).unwrap();

        let ctx = context::as_object(&json!({"v": 42, "__env": {"k": 1}}));
        let output = evaluate_workflow_output(&spec, &ctx, &PathEvaluator).unwrap();

        assert_eq!(Value::Object(output), json!({"v": 42}));
    }
}
