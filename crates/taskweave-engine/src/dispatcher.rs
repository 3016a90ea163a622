// Command dispatcher: turns controller commands into side effects, in
// order. Terminal and pause commands stop consumption of the remainder.

use taskweave_core::spec::WorkflowSpec;
use taskweave_core::{Result, State};
use taskweave_storage::WorkflowExecutionRow;
use tracing::debug;

use crate::controller::Command;
use crate::engine::Engine;

/// Execute commands; returns how many produced effective work. Zero means
/// the caller should check the workflow for completion.
pub(crate) async fn dispatch(
    engine: &Engine,
    wf_ex: &WorkflowExecutionRow,
    wf_spec: &WorkflowSpec,
    commands: Vec<Command>,
) -> Result<usize> {
    let mut effective = 0;

    for command in commands {
        match command {
            Command::Noop => {
                debug!(wf_ex_id = %wf_ex.id, "Noop command");
            }
            Command::RunTask(cmd) => {
                if engine.run_new_task(wf_ex, wf_spec, &cmd).await? {
                    effective += 1;
                }
            }
            Command::PauseWorkflow => {
                let mut wf_ex = engine.store.get_workflow_execution(wf_ex.id).await?;
                engine.set_workflow_state(&mut wf_ex, State::Paused, None)?;
                engine.store.save_workflow_execution(&wf_ex).await?;
                effective += 1;
                break;
            }
            Command::SucceedWorkflow { message } => {
                engine.succeed_workflow(wf_ex.id, message).await?;
                effective += 1;
                break;
            }
            Command::FailWorkflow { message } => {
                engine.fail_workflow(wf_ex.id, message).await?;
                effective += 1;
                break;
            }
        }
    }

    Ok(effective)
}
