// Façade operations: pause/resume, rerun, stop, idempotent completion
// delivery, input validation, environment resolution.

mod common;

use serde_json::json;
use taskweave_core::{EngineError, State};
use taskweave_engine::{ActionResult, StartParams};
use taskweave_storage::CreateEnvironment;

use common::*;

#[tokio::test]
async fn test_pause_then_resume_matches_uninterrupted_run() {
    let env = setup().await;

    let (gate_action, gate) = GateAction::new();
    env.registry.register("test.gate", gate_action).await;

    let definition = r#"
version: '2.0'

workflows:
  wf:
    type: direct
    tasks:
      task1:
        action: test.gate output="first"
        publish:
          first: <% $.task1 %>
        on-success:
          - task2

      task2:
        action: std.echo output="second"
        publish:
          second: <% $.task2 %>
"#;

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    let wf_ex = env
        .engine
        .start_workflow("wf", json!({}), None, StartParams::default(), &admin())
        .await
        .unwrap();

    // Pause while task1 is still blocked on the gate.
    env.engine.pause_workflow(wf_ex.id).await.unwrap();

    // The in-flight action completes while paused: its result is accepted
    // but no further commands are emitted.
    gate.add_permits(1);

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let tasks = tasks_of(&env.engine, wf_ex.id).await;
        if single_task(&tasks, "task1").state() == State::Success {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "task1 never completed");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    let wf_mid = env.engine.store().get_workflow_execution(wf_ex.id).await.unwrap();
    assert_eq!(wf_mid.state(), State::Paused);

    let tasks = tasks_of(&env.engine, wf_ex.id).await;
    assert!(tasks.iter().all(|t| t.name != "task2"));

    // Resume picks up the completion that happened while paused.
    env.engine.resume_workflow(wf_ex.id, None).await.unwrap();

    let wf_ex = await_workflow_state(&env.engine, wf_ex.id, State::Success).await;

    assert_eq!(wf_ex.output.get("first"), Some(&json!("first")));
    assert_eq!(wf_ex.output.get("second"), Some(&json!("second")));
}

#[tokio::test]
async fn test_rerun_failed_task_completes_workflow() {
    let env = setup().await;

    // Fails once, then succeeds: the rerun's fresh attempt recovers.
    env.registry
        .register("test.flaky", FlakyAction::failing(1))
        .await;

    let definition = r#"
version: '2.0'

workflows:
  wf:
    type: direct
    tasks:
      task1:
        action: test.flaky
        publish:
          first: <% $.task1 %>
        on-success:
          - task2

      task2:
        publish:
          second: true
"#;

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    let wf_ex = env
        .engine
        .start_workflow("wf", json!({}), None, StartParams::default(), &admin())
        .await
        .unwrap();

    let failed = await_workflow_state(&env.engine, wf_ex.id, State::Error).await;
    assert!(failed
        .state_info
        .unwrap()
        .contains("Failure caused by error in tasks: task1"));

    let tasks = tasks_of(&env.engine, wf_ex.id).await;
    let task1 = single_task(&tasks, "task1");
    assert_eq!(task1.state(), State::Error);

    let task1 = env.engine.rerun_task(task1.id, true, None).await.unwrap();
    assert_eq!(task1.state(), State::Running);

    let wf_ex = await_workflow_state(&env.engine, wf_ex.id, State::Success).await;

    assert_eq!(wf_ex.output.get("first"), Some(&json!("recovered")));
    assert_eq!(wf_ex.output.get("second"), Some(&json!(true)));

    // The first (failed) attempt was reset to non-authoritative.
    let actions = env
        .engine
        .store()
        .list_action_executions(task1.id)
        .await
        .unwrap();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions.iter().filter(|a| a.accepted).count(), 1);
}

#[tokio::test]
async fn test_rerun_preconditions() {
    let env = setup().await;

    let definition = r#"
version: '2.0'

workflows:
  wf:
    type: direct
    tasks:
      task1:
        action: std.echo output="ok"
"#;

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    let wf_ex = env
        .engine
        .start_workflow("wf", json!({}), None, StartParams::default(), &admin())
        .await
        .unwrap();

    await_workflow_state(&env.engine, wf_ex.id, State::Success).await;

    let tasks = tasks_of(&env.engine, wf_ex.id).await;
    let task1 = single_task(&tasks, "task1");

    // A successful task cannot be rerun.
    let err = env.engine.rerun_task(task1.id, true, None).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
}

#[tokio::test]
async fn test_on_action_complete_is_idempotent() {
    let env = setup().await;

    let definition = r#"
version: '2.0'

workflows:
  wf:
    type: direct
    tasks:
      task1:
        action: std.echo output="Hi"
        publish:
          hi: <% $.task1 %>
"#;

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    let wf_ex = env
        .engine
        .start_workflow("wf", json!({}), None, StartParams::default(), &admin())
        .await
        .unwrap();

    let wf_ex = await_workflow_state(&env.engine, wf_ex.id, State::Success).await;

    let tasks = tasks_of(&env.engine, wf_ex.id).await;
    let task1 = single_task(&tasks, "task1");
    let actions = env
        .engine
        .store()
        .list_action_executions(task1.id)
        .await
        .unwrap();
    let action = &actions[0];

    // A duplicate delivery (even with a different payload) changes nothing.
    let replay = env
        .engine
        .on_action_complete(action.id, ActionResult::err("late duplicate"))
        .await
        .unwrap();

    assert_eq!(replay.state(), State::Success);
    assert_eq!(replay.output, json!("Hi"));

    let after = env.engine.store().get_workflow_execution(wf_ex.id).await.unwrap();
    assert_eq!(after.state(), State::Success);
    assert_eq!(after.output, wf_ex.output);

    let tasks = tasks_of(&env.engine, wf_ex.id).await;
    assert_eq!(published_of(single_task(&tasks, "task1")), json!({"hi": "Hi"}));
}

#[tokio::test]
async fn test_input_validation() {
    let env = setup().await;

    let definition = r#"
version: '2.0'

workflows:
  wf:
    type: direct
    input:
      - required_one
      - optional_one: "default"
    tasks:
      task1:
        action: std.echo output=<% $.required_one %>
        publish:
          got: <% $.task1 %>
          opt: <% $.optional_one %>
"#;

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    // Missing required input.
    let err = env
        .engine
        .start_workflow("wf", json!({}), None, StartParams::default(), &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    // Unknown key.
    let err = env
        .engine
        .start_workflow(
            "wf",
            json!({"required_one": 1, "surprise": 2}),
            None,
            StartParams::default(),
            &admin(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    // Unknown workflow.
    let err = env
        .engine
        .start_workflow("nope", json!({}), None, StartParams::default(), &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    // Valid input with a default filled in.
    let wf_ex = env
        .engine
        .start_workflow(
            "wf",
            json!({"required_one": "yes"}),
            None,
            StartParams::default(),
            &admin(),
        )
        .await
        .unwrap();

    let wf_ex = await_workflow_state(&env.engine, wf_ex.id, State::Success).await;
    assert_eq!(wf_ex.output.get("got"), Some(&json!("yes")));
    assert_eq!(wf_ex.output.get("opt"), Some(&json!("default")));
}

#[tokio::test]
async fn test_named_environment_resolution() {
    let env = setup().await;

    env.engine
        .store()
        .create_environment(CreateEnvironment {
            name: "production".to_string(),
            project_id: None,
            scope: "public".to_string(),
            description: None,
            variables: json!({"from": "Trinity"}),
        })
        .await
        .unwrap();

    let definition = r#"
version: '2.0'

workflows:
  wf:
    type: direct
    tasks:
      task1:
        publish:
          greeting: "Hello <% env().from %>"
"#;

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    let wf_ex = env
        .engine
        .start_workflow(
            "wf",
            json!({}),
            None,
            StartParams {
                env: Some(json!("production")),
                ..Default::default()
            },
            &admin(),
        )
        .await
        .unwrap();

    let wf_ex = await_workflow_state(&env.engine, wf_ex.id, State::Success).await;
    assert_eq!(wf_ex.output.get("greeting"), Some(&json!("Hello Trinity")));

    // Unknown environment name fails up front.
    let err = env
        .engine
        .start_workflow(
            "wf",
            json!({}),
            None,
            StartParams {
                env: Some(json!("staging")),
                ..Default::default()
            },
            &admin(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn test_stop_workflow_emits_no_further_commands() {
    let env = setup().await;

    let (gate_action, gate) = GateAction::new();
    env.registry.register("test.gate", gate_action).await;

    let definition = r#"
version: '2.0'

workflows:
  wf:
    type: direct
    tasks:
      task1:
        action: test.gate output="slow"
        on-success:
          - task2

      task2:
        publish:
          ran: true
"#;

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    let wf_ex = env
        .engine
        .start_workflow("wf", json!({}), None, StartParams::default(), &admin())
        .await
        .unwrap();

    let stopped = env
        .engine
        .stop_workflow(wf_ex.id, State::Error, Some("operator stop".to_string()))
        .await
        .unwrap();
    assert_eq!(stopped.state(), State::Error);
    assert!(stopped.accepted);

    // The in-flight action still lands, but the terminal workflow ignores it.
    gate.add_permits(1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let after = env.engine.store().get_workflow_execution(wf_ex.id).await.unwrap();
    assert_eq!(after.state(), State::Error);

    let tasks = tasks_of(&env.engine, wf_ex.id).await;
    assert!(tasks.iter().all(|t| t.name != "task2"));
}

#[tokio::test]
async fn test_unregistered_action_fails_workflow() {
    let env = setup().await;

    let definition = r#"
version: '2.0'

workflows:
  wf:
    type: direct
    tasks:
      task1:
        action: std.nonexistent
"#;

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    let wf_ex = env
        .engine
        .start_workflow("wf", json!({}), None, StartParams::default(), &admin())
        .await
        .unwrap();

    let wf_ex = await_workflow_state(&env.engine, wf_ex.id, State::Error).await;

    let info = wf_ex.state_info.unwrap();
    assert!(info.contains("task1"));
    assert!(info.contains("Action is not registered"));
}

#[tokio::test]
async fn test_adhoc_action_resolves_to_base() {
    let env = setup().await;

    let definition = r#"
version: '2.0'

actions:
  greet:
    base: std.echo
    base-input:
      output: "Hello <% $.name %>"

workflows:
  wf:
    type: direct
    tasks:
      task1:
        action: greet
        input:
          name: "Zion"
        publish:
          greeting: <% $.task1 %>
"#;

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    let wf_ex = env
        .engine
        .start_workflow("wf", json!({}), None, StartParams::default(), &admin())
        .await
        .unwrap();

    let wf_ex = await_workflow_state(&env.engine, wf_ex.id, State::Success).await;
    assert_eq!(wf_ex.output.get("greeting"), Some(&json!("Hello Zion")));
}

#[tokio::test]
async fn test_standalone_action() {
    let env = setup().await;

    let action_ex = env
        .engine
        .start_action("std.echo", json!({"output": "solo"}), None, true, &admin())
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    let final_row = loop {
        let row = env
            .engine
            .store()
            .get_action_execution(action_ex.id)
            .await
            .unwrap();
        if row.state().is_completed() {
            break row;
        }
        assert!(tokio::time::Instant::now() < deadline, "action never completed");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    };

    assert_eq!(final_row.state(), State::Success);
    assert!(final_row.accepted);
    assert_eq!(final_row.output, json!("solo"));

    // Unknown actions are rejected up front.
    let err = env
        .engine
        .start_action("std.nope", json!({}), None, true, &admin())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}
