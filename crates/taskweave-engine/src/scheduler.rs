// Delayed-call scheduler: a periodic sweep over the time-ordered pending
// calls. Each due row is claimed with a compare-and-swap, dispatched to a
// registered target under the stored security context, and deleted. On
// handler error the row is also deleted and the failure logged; retry
// semantics belong to task policies. A claimed row whose handler died is
// reclaimed once it exceeds the staleness threshold.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use taskweave_core::{AuthContext, Result};
use taskweave_storage::{CreateDelayedCall, DelayedCallRow, StateStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::engine::Engine;

pub const TARGET_RUN_DEFERRED_TASK: &str = "run_deferred_task";
pub const TARGET_COMPLETE_DEFERRED_TASK: &str = "complete_deferred_task";
pub const TARGET_RESUBMIT_TASK_ACTION: &str = "resubmit_task_action";
pub const TARGET_FAIL_TASK_ON_TIMEOUT: &str = "fail_task_on_timeout";
pub const TARGET_SEND_RESULT_TO_PARENT: &str = "send_result_to_parent_workflow";

const FACTORY_METHOD_PATH: &str = "taskweave.engine.Engine";
const SWEEP_BATCH_SIZE: i64 = 100;

/// Persist a delayed call for a future sweep.
pub(crate) async fn schedule_call(
    store: &dyn StateStore,
    auth: &AuthContext,
    target_method_name: &str,
    method_arguments: Value,
    delay: Duration,
) -> Result<DelayedCallRow> {
    let auth_context = serde_json::to_value(auth).unwrap_or(Value::Null);

    store
        .create_delayed_call(CreateDelayedCall {
            factory_method_path: Some(FACTORY_METHOD_PATH.to_string()),
            target_method_name: target_method_name.to_string(),
            method_arguments,
            serializers: Value::Null,
            auth_context,
            execution_time: Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default(),
        })
        .await
}

/// Periodic sweeper driving time-based task resumption.
pub struct DelayedCallScheduler {
    engine: Arc<Engine>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DelayedCallScheduler {
    pub fn new(engine: Arc<Engine>, shutdown_rx: watch::Receiver<bool>) -> Self {
        DelayedCallScheduler {
            engine,
            shutdown_rx,
        }
    }

    /// Run the sweep loop until shutdown.
    pub fn spawn(self) -> JoinHandle<()> {
        let interval = self.engine.config().scheduler_interval;

        tokio::spawn(async move {
            let mut shutdown_rx = self.shutdown_rx.clone();

            info!("Delayed call scheduler started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Delayed call scheduler shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = sweep(&self.engine).await {
                            error!(error = %e, "Delayed call sweep failed");
                        }
                    }
                }
            }
        })
    }
}

async fn sweep(engine: &Arc<Engine>) -> Result<()> {
    let now = Utc::now();
    let stale_cutoff = now
        - chrono::Duration::from_std(engine.config().stale_call_threshold).unwrap_or_default();

    let released = engine
        .store()
        .reset_stale_delayed_calls(stale_cutoff)
        .await?;
    if released > 0 {
        info!(released, "Reclaimed stale delayed calls");
    }

    let claimed = engine
        .store()
        .claim_due_delayed_calls(now, SWEEP_BATCH_SIZE)
        .await?;

    for call in claimed {
        let call_id = call.id;
        let target = call.target_method_name.clone();

        debug!(call_id = %call_id, target = %target, "Dispatching delayed call");

        if let Err(e) = dispatch_call(engine, call).await {
            error!(
                call_id = %call_id,
                target = %target,
                error = %e,
                "Delayed call handler failed"
            );
        }

        engine.store().delete_delayed_call(call_id).await?;
    }

    Ok(())
}

/// Resolve the target through the dispatch table and invoke it under the
/// restored security context.
async fn dispatch_call(engine: &Arc<Engine>, call: DelayedCallRow) -> Result<()> {
    let _auth: AuthContext = serde_json::from_value(call.auth_context.clone()).unwrap_or_default();
    let args = &call.method_arguments;

    match call.target_method_name.as_str() {
        TARGET_RUN_DEFERRED_TASK => {
            engine.run_deferred_task(arg_uuid(args, "task_ex_id")?).await
        }
        TARGET_COMPLETE_DEFERRED_TASK => {
            engine
                .complete_deferred_task(arg_uuid(args, "task_ex_id")?)
                .await
        }
        TARGET_RESUBMIT_TASK_ACTION => {
            let index = args.get("index").and_then(Value::as_i64);
            let retry_no = args.get("retry_no").and_then(Value::as_u64).unwrap_or(0) as u32;
            engine
                .resubmit_task_action(arg_uuid(args, "task_ex_id")?, index, retry_no)
                .await
        }
        TARGET_FAIL_TASK_ON_TIMEOUT => {
            engine
                .fail_task_on_timeout(arg_uuid(args, "task_ex_id")?)
                .await
        }
        TARGET_SEND_RESULT_TO_PARENT => {
            engine
                .send_result_to_parent_workflow(arg_uuid(args, "wf_ex_id")?)
                .await
        }
        other => Err(taskweave_core::EngineError::invalid_input(format!(
            "Unknown delayed call target: {}",
            other
        ))),
    }
}

fn arg_uuid(args: &Value, key: &str) -> Result<Uuid> {
    args.get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            taskweave_core::EngineError::invalid_input(format!(
                "Delayed call arguments are missing '{}': {}",
                key,
                json!(args)
            ))
        })
}
