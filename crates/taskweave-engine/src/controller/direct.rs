// Direct workflow controller: explicit on-success / on-error / on-complete
// transitions with guard expressions and join targets.

use taskweave_core::context::{self, Context};
use taskweave_core::expr::{evaluate_guard, Evaluator};
use taskweave_core::spec::{TaskSpec, TransitionSpec};
use taskweave_core::{Result, State};
use taskweave_storage::TaskExecutionRow;

use crate::dataflow;

use super::{task_spec_from_row, Command, ContinueResult, RunTaskCommand, WorkflowSnapshot};

pub(super) fn continue_workflow(
    snapshot: &WorkflowSnapshot,
    evaluator: &dyn Evaluator,
) -> Result<ContinueResult> {
    let mut result = ContinueResult::default();

    if snapshot.tasks.is_empty() {
        // Initial pass: tasks with no inbound transitions, by name.
        let mut names = snapshot.spec.start_task_names();
        names.sort();

        let ctx = snapshot.workflow_context();

        for name in names {
            result.commands.push(Command::RunTask(RunTaskCommand {
                task_name: name,
                context: ctx.clone(),
                waiting: false,
                triggered_by: None,
            }));
        }

        return Ok(result);
    }

    for task in snapshot.completed_unprocessed() {
        result.consumed.push(task.id);
        commands_after_task(snapshot, task, evaluator, &mut result.commands)?;
    }

    dedup_run_task_commands(&mut result.commands);

    Ok(result)
}

fn commands_after_task(
    snapshot: &WorkflowSnapshot,
    task: &TaskExecutionRow,
    evaluator: &dyn Evaluator,
    commands: &mut Vec<Command>,
) -> Result<()> {
    let task_spec = task_spec_from_row(task)?;
    let out_ctx = dataflow::task_outbound_context(task, &task_spec);

    let transitions: Vec<&TransitionSpec> = match task.state() {
        State::Success => task_spec.transitions_for_success().collect(),
        State::Error => task_spec.transitions_for_error().collect(),
        _ => vec![],
    };

    for transition in transitions {
        if let Some(guard) = &transition.guard {
            if !evaluate_guard(evaluator, guard, &out_ctx)? {
                continue;
            }
        }

        match transition.target.as_str() {
            "noop" => commands.push(Command::Noop),
            "pause" => commands.push(Command::PauseWorkflow),
            "succeed" => commands.push(Command::SucceedWorkflow { message: None }),
            "fail" => commands.push(Command::FailWorkflow {
                message: format!("Workflow failed by 'fail' transition from task: {}", task.name),
            }),
            target => {
                let target_spec = snapshot.spec.effective_task_spec(target)?;

                if target_spec.join.is_some() {
                    if let Some(cmd) = join_command(snapshot, target, &target_spec, evaluator)? {
                        commands.push(Command::RunTask(cmd));
                    }
                } else {
                    commands.push(Command::RunTask(RunTaskCommand {
                        task_name: target.to_string(),
                        context: out_ctx.clone(),
                        waiting: false,
                        triggered_by: Some(task.id),
                    }));
                }
            }
        }
    }

    Ok(())
}

/// Whether to run, park, or skip a join target.
///
/// A join is satisfied when enough of its static inbound tasks have
/// completed with a transition into it whose guard passed. Until then the
/// target is parked as a WAITING placeholder accumulating context.
fn join_command(
    snapshot: &WorkflowSnapshot,
    join_name: &str,
    join_spec: &TaskSpec,
    evaluator: &dyn Evaluator,
) -> Result<Option<RunTaskCommand>> {
    // Already running or finished: nothing to emit.
    if let Some(existing) = snapshot.latest_task(join_name) {
        if existing.state() != State::Waiting {
            return Ok(None);
        }
    }

    let inbound = snapshot.spec.inbound_task_names(join_name);

    // Outbound contexts of inbound tasks whose transition into the join
    // fired, in completion order.
    let mut fired: Vec<(chrono::DateTime<chrono::Utc>, Context)> = Vec::new();

    for name in &inbound {
        let Some(task) = snapshot.latest_task(name) else {
            continue;
        };

        if !task.state().is_completed() {
            continue;
        }

        let task_spec = task_spec_from_row(task)?;
        let transitions: Vec<&TransitionSpec> = match task.state() {
            State::Success => task_spec.transitions_for_success().collect(),
            _ => task_spec.transitions_for_error().collect(),
        };

        let out_ctx = dataflow::task_outbound_context(task, &task_spec);

        let triggered = transitions.iter().any(|t| {
            t.target == join_name
                && t.guard
                    .as_deref()
                    .map(|g| evaluate_guard(evaluator, g, &out_ctx).unwrap_or(false))
                    .unwrap_or(true)
        });

        if triggered {
            fired.push((task.updated_at, out_ctx));
        }
    }

    fired.sort_by_key(|(at, _)| *at);

    let mut ctx = snapshot.workflow_context();
    for (_, fired_ctx) in &fired {
        context::merge_into(&mut ctx, fired_ctx);
    }

    let join = join_spec.join.unwrap_or(taskweave_core::spec::JoinSpec::All);
    let satisfied = fired.len() >= join.required(inbound.len());

    Ok(Some(RunTaskCommand {
        task_name: join_name.to_string(),
        context: ctx,
        waiting: !satisfied,
        triggered_by: None,
    }))
}

/// Keep one RunTask per task name within a single pass; a ready join beats a
/// waiting placeholder for the same target.
fn dedup_run_task_commands(commands: &mut Vec<Command>) {
    let mut kept: Vec<Command> = Vec::with_capacity(commands.len());

    for cmd in commands.drain(..) {
        if let Command::RunTask(run) = &cmd {
            if run.triggered_by.is_none() {
                if let Some(prev) = kept.iter_mut().find(|c| {
                    matches!(c, Command::RunTask(p)
                             if p.task_name == run.task_name && p.triggered_by.is_none())
                }) {
                    if let Command::RunTask(prev_run) = prev {
                        if prev_run.waiting && !run.waiting {
                            *prev = cmd;
                        }
                    }
                    continue;
                }
            }
        }
        kept.push(cmd);
    }

    *commands = kept;
}

pub(super) fn is_error_handled_for(task: &TaskExecutionRow, evaluator: &dyn Evaluator) -> bool {
    let Ok(task_spec) = task_spec_from_row(task) else {
        return false;
    };

    if task_spec.on_error.is_empty() {
        return false;
    }

    let out_ctx = dataflow::task_outbound_context(task, &task_spec);

    task_spec.on_error.iter().any(|t| {
        t.guard
            .as_deref()
            .map(|g| evaluate_guard(evaluator, g, &out_ctx).unwrap_or(false))
            .unwrap_or(true)
    })
}
