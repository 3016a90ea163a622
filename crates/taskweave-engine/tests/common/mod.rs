// Shared harness for engine integration tests: an engine over the
// in-memory store with fast sweeper intervals, plus controllable test
// actions.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use taskweave_core::{AuthContext, Context, EngineConfig, State};
use taskweave_engine::{Action, ActionRegistry, DelayedCallScheduler, Engine};
use taskweave_storage::{MemoryStore, StateStore, TaskExecutionRow, WorkflowExecutionRow};
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

pub struct TestEnv {
    pub engine: Arc<Engine>,
    pub store: Arc<MemoryStore>,
    pub registry: Arc<ActionRegistry>,
    // Keeps the sweeper alive for the duration of the test.
    _shutdown_tx: watch::Sender<bool>,
}

pub async fn setup() -> TestEnv {
    setup_with_limit(1024).await
}

pub async fn setup_with_limit(field_size_limit_kb: i64) -> TestEnv {
    let store = Arc::new(MemoryStore::new(field_size_limit_kb));
    let registry = Arc::new(ActionRegistry::with_std());

    let config = EngineConfig {
        execution_field_size_limit_kb: field_size_limit_kb,
        scheduler_interval: Duration::from_millis(50),
        cron_interval: Duration::from_millis(50),
        ..Default::default()
    };

    let engine = Engine::with_registry(
        store.clone() as Arc<dyn StateStore>,
        config,
        registry.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    DelayedCallScheduler::new(engine.clone(), shutdown_rx).spawn();

    TestEnv {
        engine,
        store,
        registry,
        _shutdown_tx: shutdown_tx,
    }
}

pub fn admin() -> AuthContext {
    AuthContext::admin()
}

/// Poll until the workflow reaches the expected state.
pub async fn await_workflow_state(
    engine: &Arc<Engine>,
    wf_ex_id: Uuid,
    expected: State,
) -> WorkflowExecutionRow {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);

    loop {
        let wf_ex = engine
            .store()
            .get_workflow_execution(wf_ex_id)
            .await
            .expect("workflow execution exists");

        if wf_ex.state() == expected {
            return wf_ex;
        }

        if wf_ex.state().is_completed() {
            panic!(
                "workflow reached {} while waiting for {}; state_info: {:?}",
                wf_ex.state, expected, wf_ex.state_info
            );
        }

        if tokio::time::Instant::now() > deadline {
            panic!(
                "timed out waiting for workflow state {} (current: {})",
                expected, wf_ex.state
            );
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn tasks_of(engine: &Arc<Engine>, wf_ex_id: Uuid) -> Vec<TaskExecutionRow> {
    engine
        .store()
        .list_task_executions(wf_ex_id)
        .await
        .expect("task listing")
}

pub fn single_task<'a>(tasks: &'a [TaskExecutionRow], name: &str) -> &'a TaskExecutionRow {
    let matching: Vec<_> = tasks.iter().filter(|t| t.name == name).collect();
    assert_eq!(matching.len(), 1, "expected exactly one task '{}'", name);
    matching[0]
}

pub fn published_of(task: &TaskExecutionRow) -> Value {
    task.published.clone()
}

/// Fails the first `failures` invocations, then succeeds.
pub struct FlakyAction {
    remaining_failures: AtomicU32,
}

impl FlakyAction {
    pub fn failing(times: u32) -> Arc<Self> {
        Arc::new(FlakyAction {
            remaining_failures: AtomicU32::new(times),
        })
    }
}

#[async_trait]
impl Action for FlakyAction {
    async fn run(&self, _input: &Context) -> Result<Value, String> {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);

        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            Err(format!("flaky failure ({} left)", remaining - 1))
        } else {
            Ok(json!("recovered"))
        }
    }
}

/// Blocks until the test releases a permit.
pub struct GateAction {
    gate: Arc<Semaphore>,
}

impl GateAction {
    pub fn new() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (
            Arc::new(GateAction { gate: gate.clone() }),
            gate,
        )
    }
}

#[async_trait]
impl Action for GateAction {
    async fn run(&self, input: &Context) -> Result<Value, String> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| "gate closed".to_string())?;
        permit.forget();

        Ok(input.get("output").cloned().unwrap_or(Value::Null))
    }
}

/// Sleeps long enough to outlive any reasonable task timeout in tests.
pub struct HangAction;

#[async_trait]
impl Action for HangAction {
    async fn run(&self, _input: &Context) -> Result<Value, String> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Value::Null)
    }
}

/// Returns a payload of the requested size in bytes.
pub struct BigResultAction;

#[async_trait]
impl Action for BigResultAction {
    async fn run(&self, input: &Context) -> Result<Value, String> {
        let bytes = input.get("bytes").and_then(Value::as_u64).unwrap_or(4096) as usize;
        Ok(json!({"payload": "x".repeat(bytes)}))
    }
}
