// Task policies: wait-before, retry, timeout, wait-after, concurrency.
//
// Policy configuration may contain expressions; each value is evaluated
// against the task's current context and then validated, so a bad type
// surfaces as InvalidInput naming the policy rather than a panic deep in
// the engine.

use serde_json::Value;
use taskweave_core::context::Context;
use taskweave_core::expr::{evaluate_recursively, Evaluator};
use taskweave_core::spec::TaskSpec;
use taskweave_core::{EngineError, Result};

/// Evaluated, validated policy set for one task execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPolicies {
    pub pause_before: bool,
    pub wait_before: Option<u64>,
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<u64>,
    pub wait_after: Option<u64>,
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub count: u32,
    /// Seconds between attempts
    pub delay: Option<u64>,
    /// Stop retrying when this evaluates true
    pub break_on: Option<String>,
    /// Keep retrying while this evaluates true, even on success
    pub continue_on: Option<String>,
}

/// Evaluate the policy fields of a task spec against its context.
pub fn evaluate_policies(
    task_spec: &TaskSpec,
    ctx: &Context,
    evaluator: &dyn Evaluator,
) -> Result<TaskPolicies> {
    let retry = match &task_spec.retry {
        Some(retry_spec) => Some(RetryPolicy {
            count: eval_number(evaluator, "retry.count", &retry_spec.count, ctx)? as u32,
            delay: retry_spec
                .delay
                .as_ref()
                .map(|d| eval_number(evaluator, "retry.delay", d, ctx))
                .transpose()?,
            break_on: retry_spec.break_on.clone(),
            continue_on: retry_spec.continue_on.clone(),
        }),
        None => None,
    };

    Ok(TaskPolicies {
        pause_before: task_spec.pause_before,
        wait_before: eval_optional_number(evaluator, "wait-before", &task_spec.wait_before, ctx)?,
        retry,
        timeout: eval_optional_number(evaluator, "timeout", &task_spec.timeout, ctx)?,
        wait_after: eval_optional_number(evaluator, "wait-after", &task_spec.wait_after, ctx)?,
        concurrency: eval_optional_number(evaluator, "concurrency", &task_spec.concurrency, ctx)?
            .map(|n| n as usize),
    })
}

fn eval_optional_number(
    evaluator: &dyn Evaluator,
    policy: &str,
    value: &Option<Value>,
    ctx: &Context,
) -> Result<Option<u64>> {
    value
        .as_ref()
        .map(|v| eval_number(evaluator, policy, v, ctx))
        .transpose()
}

fn eval_number(
    evaluator: &dyn Evaluator,
    policy: &str,
    value: &Value,
    ctx: &Context,
) -> Result<u64> {
    let evaluated = evaluate_recursively(evaluator, value, ctx)?;

    evaluated.as_u64().ok_or_else(|| {
        EngineError::invalid_input(format!(
            "Invalid data type in {} policy: expected a non-negative integer, got {}",
            policy, evaluated
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskweave_core::context::as_object;
    use taskweave_core::expr::PathEvaluator;

    fn spec(value: Value) -> TaskSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_literal_policies() {
        let task_spec = spec(json!({
            "wait-before": 2,
            "wait-after": 3,
            "timeout": 60,
            "concurrency": 4,
            "retry": {"count": 5, "delay": 1},
        }));

        let policies = evaluate_policies(&task_spec, &Context::new(), &PathEvaluator).unwrap();

        assert_eq!(policies.wait_before, Some(2));
        assert_eq!(policies.wait_after, Some(3));
        assert_eq!(policies.timeout, Some(60));
        assert_eq!(policies.concurrency, Some(4));

        let retry = policies.retry.unwrap();
        assert_eq!(retry.count, 5);
        assert_eq!(retry.delay, Some(1));
    }

    #[test]
    fn test_expression_policies() {
        let task_spec = spec(json!({
            "timeout": "<% $.limit %>",
            "retry": {"count": "<% $.attempts %>"},
        }));

        let ctx = as_object(&json!({"limit": 30, "attempts": 2}));
        let policies = evaluate_policies(&task_spec, &ctx, &PathEvaluator).unwrap();

        assert_eq!(policies.timeout, Some(30));
        assert_eq!(policies.retry.unwrap().count, 2);
    }

    #[test]
    fn test_bad_type_is_invalid_input() {
        let task_spec = spec(json!({"wait-before": "not a number"}));

        let err = evaluate_policies(&task_spec, &Context::new(), &PathEvaluator).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        let task_spec = spec(json!({"timeout": -5}));
        let err = evaluate_policies(&task_spec, &Context::new(), &PathEvaluator).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_absent_policies() {
        let policies =
            evaluate_policies(&spec(json!({})), &Context::new(), &PathEvaluator).unwrap();

        assert_eq!(policies, TaskPolicies::default());
    }
}
