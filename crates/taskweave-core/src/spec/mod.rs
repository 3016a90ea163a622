// Workflow DSL: YAML documents with `version: '2.0'`, a `workflows:` mapping
// and an optional `actions:` mapping of ad-hoc actions.

mod action;
mod task;
mod workflow;

pub use action::{parse_action_call, ActionCall, AdhocActionSpec};
pub use task::{
    JoinSpec, RetrySpec, TaskDefaults, TaskSpec, TransitionSpec, WithItemsSpec, RESERVED_TARGETS,
};
pub use workflow::{InputParam, WorkflowListSpec, WorkflowSpec, WorkflowType};

use crate::error::{EngineError, Result};

const SUPPORTED_VERSIONS: &[&str] = &["2.0"];

/// Parse a complete DSL document (version + workflows + actions).
pub fn parse_workflow_list(text: &str) -> Result<WorkflowListSpec> {
    let spec: WorkflowListSpec = serde_yaml::from_str(text)
        .map_err(|e| EngineError::dsl(format!("Definition could not be parsed: {}", e)))?;

    validate_version(&spec.version)?;

    for (name, wf) in &spec.workflows {
        wf.validate(name)?;
    }

    Ok(spec)
}

/// Parse a single workflow spec from its stored JSON form.
pub fn workflow_spec_from_json(value: &serde_json::Value) -> Result<WorkflowSpec> {
    serde_json::from_value(value.clone())
        .map_err(|e| EngineError::dsl(format!("Stored workflow spec is invalid: {}", e)))
}

fn validate_version(version: &str) -> Result<()> {
    if SUPPORTED_VERSIONS.contains(&version) {
        Ok(())
    } else {
        Err(EngineError::dsl(format!(
            "Unsupported DSL version: {}",
            version
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINEAR_WF: &str = r#"
version: '2.0'

workflows:
  wf:
    type: direct
    tasks:
      task1:
        action: std.echo output="Hi"
        publish:
          hi: <% $.task1 %>
        on-success:
          - task2
      task2:
        action: std.echo output="Morpheus"
        publish:
          to: <% $.task2 %>
        on-success:
          - task3
      task3:
        publish:
          result: "<% $.hi %>, <% $.to %>! Your <% env().from %>."
"#;

    #[test]
    fn test_parse_linear_workflow() {
        let spec = parse_workflow_list(LINEAR_WF).unwrap();

        assert_eq!(spec.version, "2.0");
        let wf = spec.workflows.get("wf").unwrap();
        assert_eq!(wf.wf_type, WorkflowType::Direct);
        assert_eq!(wf.tasks.len(), 3);

        let task1 = wf.tasks.get("task1").unwrap();
        assert_eq!(task1.action.as_deref(), Some(r#"std.echo output="Hi""#));
        assert_eq!(task1.on_success.len(), 1);
        assert_eq!(task1.on_success[0].target, "task2");
        assert!(task1.on_success[0].guard.is_none());
    }

    #[test]
    fn test_parse_serialize_reparse_round_trip() {
        let spec = parse_workflow_list(LINEAR_WF).unwrap();

        let serialized = serde_yaml::to_string(&spec).unwrap();
        let reparsed = parse_workflow_list(&serialized).unwrap();

        assert_eq!(spec, reparsed);
    }

    #[test]
    fn test_unsupported_version_fails() {
        let text = LINEAR_WF.replace("version: '2.0'", "version: '3.0'");

        let err = parse_workflow_list(&text).unwrap_err();
        assert!(matches!(err, EngineError::DslParse(_)));
    }

    #[test]
    fn test_unquoted_numeric_version() {
        let text = LINEAR_WF.replace("version: '2.0'", "version: 2.0");

        assert!(parse_workflow_list(&text).is_ok());
    }

    #[test]
    fn test_guarded_transitions() {
        let text = r#"
version: '2.0'

workflows:
  wf:
    tasks:
      task1:
        action: std.noop
        on-success:
          - task2: <% $.go %>
          - task3
      task2:
        action: std.noop
      task3:
        action: std.noop
"#;

        let spec = parse_workflow_list(text).unwrap();
        let task1 = &spec.workflows["wf"].tasks["task1"];

        assert_eq!(task1.on_success[0].target, "task2");
        assert_eq!(task1.on_success[0].guard.as_deref(), Some("<% $.go %>"));
        assert_eq!(task1.on_success[1].target, "task3");
        assert!(task1.on_success[1].guard.is_none());
    }

    #[test]
    fn test_transition_to_unknown_task_fails() {
        let text = r#"
version: '2.0'

workflows:
  wf:
    tasks:
      task1:
        action: std.noop
        on-success:
          - nowhere
"#;

        assert!(parse_workflow_list(text).is_err());
    }

    #[test]
    fn test_task_with_action_and_workflow_fails() {
        let text = r#"
version: '2.0'

workflows:
  wf:
    tasks:
      task1:
        action: std.noop
        workflow: sub_wf
"#;

        assert!(parse_workflow_list(text).is_err());
    }

    #[test]
    fn test_with_items_and_policies() {
        let text = r#"
version: '2.0'

workflows:
  wf:
    tasks:
      task1:
        action: std.echo output=<% $.i %>
        with-items: i in <% $.items %>
        concurrency: 2
        retry:
          count: 3
          delay: 1
        wait-before: 2
        timeout: 60
"#;

        let spec = parse_workflow_list(text).unwrap();
        let task1 = &spec.workflows["wf"].tasks["task1"];

        let bindings = task1.with_items.as_ref().unwrap().bindings().unwrap();
        assert_eq!(bindings, vec![("i".to_string(), "<% $.items %>".to_string())]);
        assert_eq!(task1.concurrency, Some(serde_json::json!(2)));
        assert!(task1.retry.is_some());
    }
}
