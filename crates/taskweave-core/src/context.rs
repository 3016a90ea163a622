// Execution context: the nested mapping expressions are evaluated against.
//
// Reserved top-level keys carry engine-provided data; everything else is
// workflow input, workflow variables, and task-published variables.

use serde_json::{Map, Value};

/// A workflow/task execution context
pub type Context = Map<String, Value>;

/// Environment variables supplied at start time (`env().key` in expressions)
pub const ENV_KEY: &str = "__env";
/// Metadata about the owning workflow execution
pub const EXECUTION_KEY: &str = "__execution";
/// Parent task execution id for sub-workflows
pub const TASK_EXECUTION_ID_KEY: &str = "__task_execution_id";

/// Whether a context key is engine-reserved (stripped from user-visible output)
pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with("__")
}

/// Merge `src` into `dst`, overwriting on key collision.
pub fn merge_into(dst: &mut Context, src: &Context) {
    for (k, v) in src {
        dst.insert(k.clone(), v.clone());
    }
}

/// A copy of `ctx` without reserved keys.
pub fn strip_reserved(ctx: &Context) -> Context {
    ctx.iter()
        .filter(|(k, _)| !is_reserved_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Context value as an object, or an empty map for anything else.
pub fn as_object(value: &Value) -> Context {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_overwrites_on_collision() {
        let mut dst = as_object(&json!({"a": 1, "b": 2}));
        let src = as_object(&json!({"b": 3, "c": 4}));

        merge_into(&mut dst, &src);

        assert_eq!(Value::Object(dst), json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn test_strip_reserved() {
        let ctx = as_object(&json!({"a": 1, "__env": {"x": 1}, "__execution": {}}));

        let stripped = strip_reserved(&ctx);

        assert_eq!(Value::Object(stripped), json!({"a": 1}));
    }
}
