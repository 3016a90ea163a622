// End-to-end data flow scenarios over the in-memory store.

mod common;

use serde_json::json;
use taskweave_core::State;
use taskweave_engine::StartParams;

use common::*;

#[tokio::test]
async fn test_linear_dataflow() {
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

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    let wf_ex = env
        .engine
        .start_workflow(
            "wf",
            json!({}),
            None,
            StartParams {
                env: Some(json!({"from": "Neo"})),
                ..Default::default()
            },
            &admin(),
        )
        .await
        .unwrap();

    let wf_ex = await_workflow_state(&env.engine, wf_ex.id, State::Success).await;

    let tasks = tasks_of(&env.engine, wf_ex.id).await;

    let task1 = single_task(&tasks, "task1");
    let task2 = single_task(&tasks, "task2");
    let task3 = single_task(&tasks, "task3");

    assert_eq!(task3.state(), State::Success);
    assert_eq!(published_of(task1), json!({"hi": "Hi"}));
    assert_eq!(published_of(task2), json!({"to": "Morpheus"}));
    assert_eq!(
        published_of(task3),
        json!({"result": "Hi, Morpheus! Your Neo."})
    );

    assert_eq!(wf_ex.output.get("result"), Some(&json!("Hi, Morpheus! Your Neo.")));
}

#[tokio::test]
async fn test_parallel_branches_with_notify() {
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
          progress: "completed task1"
        on-success:
          - notify
          - task2

      task2:
        action: std.echo output="Morpheus"
        publish:
          to: <% $.task2 %>
          progress: "completed task2"
        on-success:
          - notify
          - task3

      task3:
        publish:
          result: "<% $.hi %>, <% $.to %>! Your <% env().from %>."
          progress: "completed task3"
        on-success:
          - notify

      notify:
        action: std.echo output=<% $.progress %>
        publish:
          progress: <% $.notify %>
"#;

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    let wf_ex = env
        .engine
        .start_workflow(
            "wf",
            json!({}),
            None,
            StartParams {
                env: Some(json!({"from": "Neo"})),
                ..Default::default()
            },
            &admin(),
        )
        .await
        .unwrap();

    let wf_ex = await_workflow_state(&env.engine, wf_ex.id, State::Success).await;

    let tasks = tasks_of(&env.engine, wf_ex.id).await;

    let notifications: Vec<_> = tasks.iter().filter(|t| t.name == "notify").collect();
    assert_eq!(notifications.len(), 3);

    let progress: Vec<&str> = notifications
        .iter()
        .filter_map(|t| t.published.get("progress").and_then(|v| v.as_str()))
        .collect();

    for expected in ["completed task1", "completed task2", "completed task3"] {
        assert!(
            progress.contains(&expected),
            "missing notification '{}', got {:?}",
            expected,
            progress
        );
    }
}

#[tokio::test]
async fn test_parallel_tasks_merge_into_output() {
    let env = setup().await;

    let definition = r#"
version: '2.0'

workflows:
  wf:
    type: direct
    tasks:
      task1:
        action: std.echo output=1
        publish:
          var1: <% $.task1 %>

      task2:
        action: std.echo output=2
        publish:
          var2: <% $.task2 %>
"#;

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    let wf_ex = env
        .engine
        .start_workflow("wf", json!({}), None, StartParams::default(), &admin())
        .await
        .unwrap();

    let wf_ex = await_workflow_state(&env.engine, wf_ex.id, State::Success).await;

    let tasks = tasks_of(&env.engine, wf_ex.id).await;
    assert_eq!(tasks.len(), 2);

    assert_eq!(published_of(single_task(&tasks, "task1")), json!({"var1": 1}));
    assert_eq!(published_of(single_task(&tasks, "task2")), json!({"var2": 2}));

    assert_eq!(wf_ex.output.get("var1"), Some(&json!(1)));
    assert_eq!(wf_ex.output.get("var2"), Some(&json!(2)));
}

#[tokio::test]
async fn test_with_items_over_empty_list() {
    let env = setup().await;

    let definition = r#"
version: '2.0'

workflows:
  wf:
    type: direct
    tasks:
      task1:
        with-items: i in <% list() %>
        action: std.echo output=<% $.i %>
        publish:
          result: <% $.task1 %>
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

    assert_eq!(task1.state(), State::Success);
    assert_eq!(published_of(task1), json!({"result": []}));
}

#[tokio::test]
async fn test_with_items_fans_out_in_order() {
    let env = setup().await;

    let definition = r#"
version: '2.0'

workflows:
  wf:
    type: direct
    input:
      - items
    tasks:
      task1:
        with-items: i in <% $.items %>
        action: std.echo output=<% $.i %>
        concurrency: 2
        publish:
          result: <% $.task1 %>
"#;

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    let wf_ex = env
        .engine
        .start_workflow(
            "wf",
            json!({"items": ["a", "b", "c", "d"]}),
            None,
            StartParams::default(),
            &admin(),
        )
        .await
        .unwrap();

    let wf_ex = await_workflow_state(&env.engine, wf_ex.id, State::Success).await;

    let tasks = tasks_of(&env.engine, wf_ex.id).await;
    let task1 = single_task(&tasks, "task1");

    // Results are ordered by iteration index regardless of completion order.
    assert_eq!(published_of(task1), json!({"result": ["a", "b", "c", "d"]}));

    let actions = env
        .engine
        .store()
        .list_action_executions(task1.id)
        .await
        .unwrap();
    assert_eq!(actions.len(), 4);
    assert!(actions.iter().all(|a| a.accepted));
}

#[tokio::test]
async fn test_error_transition_keeps_workflow_successful() {
    let env = setup().await;

    let definition = r#"
version: '2.0'

workflows:
  wf:
    type: direct
    tasks:
      task12:
        action: std.noop
        publish:
          var12: 12
        on-complete:
          - task13
          - task14

      task13:
        action: std.fail
        publish:
          var13: 13
        on-error:
          - noop

      task14:
        publish:
          var14: 14
"#;

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    let wf_ex = env
        .engine
        .start_workflow("wf", json!({}), None, StartParams::default(), &admin())
        .await
        .unwrap();

    let wf_ex = await_workflow_state(&env.engine, wf_ex.id, State::Success).await;

    let tasks = tasks_of(&env.engine, wf_ex.id).await;
    assert_eq!(single_task(&tasks, "task13").state(), State::Error);
    assert_eq!(single_task(&tasks, "task14").state(), State::Success);

    // The failed task published nothing; its variable never reaches output.
    assert!(wf_ex.output.get("var13").is_none());
    assert_eq!(wf_ex.output.get("var14"), Some(&json!(14)));
    assert_eq!(wf_ex.output.get("var12"), Some(&json!(12)));
}

#[tokio::test]
async fn test_guarded_transition_skips_failing_branch() {
    let env = setup().await;

    let definition = r#"
version: '2.0'

workflows:
  wf:
    type: direct
    tasks:
      task1:
        action: std.noop
        publish:
          go: false
        on-success:
          - task2: <% $.go %>
          - task3

      task2:
        publish:
          ran2: true

      task3:
        publish:
          ran3: true
"#;

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    let wf_ex = env
        .engine
        .start_workflow("wf", json!({}), None, StartParams::default(), &admin())
        .await
        .unwrap();

    let wf_ex = await_workflow_state(&env.engine, wf_ex.id, State::Success).await;

    let tasks = tasks_of(&env.engine, wf_ex.id).await;
    assert!(tasks.iter().all(|t| t.name != "task2"));
    assert_eq!(single_task(&tasks, "task3").state(), State::Success);
    assert_eq!(wf_ex.output.get("ran3"), Some(&json!(true)));
    assert!(wf_ex.output.get("ran2").is_none());
}

#[tokio::test]
async fn test_join_all_waits_for_both_branches() {
    let env = setup().await;

    let definition = r#"
version: '2.0'

workflows:
  wf:
    type: direct
    tasks:
      branch_a:
        action: std.echo output="a"
        publish:
          va: <% $.branch_a %>
        on-success:
          - merge

      branch_b:
        action: std.echo output="b"
        publish:
          vb: <% $.branch_b %>
        on-success:
          - merge

      merge:
        join: all
        publish:
          merged: "<% $.va %>+<% $.vb %>"
"#;

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    let wf_ex = env
        .engine
        .start_workflow("wf", json!({}), None, StartParams::default(), &admin())
        .await
        .unwrap();

    let wf_ex = await_workflow_state(&env.engine, wf_ex.id, State::Success).await;

    let tasks = tasks_of(&env.engine, wf_ex.id).await;
    let merge = single_task(&tasks, "merge");

    assert_eq!(merge.state(), State::Success);
    assert_eq!(published_of(merge), json!({"merged": "a+b"}));
}

#[tokio::test]
async fn test_reverse_workflow_solves_dependencies() {
    let env = setup().await;

    let definition = r#"
version: '2.0'

workflows:
  wf:
    type: reverse
    tasks:
      base:
        action: std.echo output=1
        publish:
          va: <% $.base %>

      middle:
        requires: [base]
        action: std.echo output=2
        publish:
          vb: <% $.middle %>

      goal:
        requires: [middle]
        publish:
          vc: "<% $.va %>-<% $.vb %>"
"#;

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    let wf_ex = env
        .engine
        .start_workflow(
            "wf",
            json!({}),
            None,
            StartParams {
                task_name: Some("goal".to_string()),
                ..Default::default()
            },
            &admin(),
        )
        .await
        .unwrap();

    let wf_ex = await_workflow_state(&env.engine, wf_ex.id, State::Success).await;

    let tasks = tasks_of(&env.engine, wf_ex.id).await;
    assert_eq!(tasks.len(), 3);
    assert_eq!(wf_ex.output.get("vc"), Some(&json!("1-2")));
}

#[tokio::test]
async fn test_subworkflow_result_flows_to_parent() {
    let env = setup().await;

    let definition = r#"
version: '2.0'

workflows:
  sub:
    type: direct
    input:
      - x
    output:
      doubled: "<% $.x %>-<% $.x %>"
    tasks:
      inner:
        action: std.echo output=<% $.x %>

  main:
    type: direct
    tasks:
      call:
        workflow: sub
        input:
          x: "hi"
        publish:
          sub_out: <% $.call %>
"#;

    env.engine.create_workflows(definition, &admin()).await.unwrap();

    let wf_ex = env
        .engine
        .start_workflow("main", json!({}), None, StartParams::default(), &admin())
        .await
        .unwrap();

    let wf_ex = await_workflow_state(&env.engine, wf_ex.id, State::Success).await;

    let tasks = tasks_of(&env.engine, wf_ex.id).await;
    let call = single_task(&tasks, "call");

    assert_eq!(
        call.published.get("sub_out").and_then(|v| v.get("doubled")),
        Some(&json!("hi-hi"))
    );

    // The sub-workflow execution is linked back to its parent task.
    let subs = env
        .engine
        .store()
        .list_workflow_executions_by_task(call.id)
        .await
        .unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].state(), State::Success);
    assert!(subs[0].accepted);
}
