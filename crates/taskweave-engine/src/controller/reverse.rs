// Reverse workflow controller: the caller names a target task and the
// controller solves `requires` dependencies backward, running every task in
// the dependency closure whose prerequisites have succeeded.

use std::collections::BTreeSet;

use taskweave_core::context;
use taskweave_core::expr::Evaluator;
use taskweave_core::{Result, State};

use crate::dataflow;

use super::{
    reverse_target, task_spec_from_row, Command, ContinueResult, RunTaskCommand, WorkflowSnapshot,
};

pub(super) fn continue_workflow(
    snapshot: &WorkflowSnapshot,
    _evaluator: &dyn Evaluator,
) -> Result<ContinueResult> {
    let mut result = ContinueResult::default();

    for task in snapshot.completed_unprocessed() {
        result.consumed.push(task.id);
    }

    let Some(target) = reverse_target(snapshot.wf_ex) else {
        result.commands.push(Command::FailWorkflow {
            message: "Reverse workflow requires a 'task_name' start parameter".to_string(),
        });
        return Ok(result);
    };

    let closure = dependency_closure(snapshot, &target)?;

    // A failed dependency can never be satisfied; completion handling will
    // turn it into a workflow error once nothing is left to run.
    for name in &closure {
        if let Some(task) = snapshot.latest_task(name) {
            if task.state() == State::Error {
                return Ok(result);
            }
        }
    }

    for name in &closure {
        if snapshot.latest_task(name).is_some() {
            continue;
        }

        let task_spec = snapshot.spec.effective_task_spec(name)?;

        let deps_met = task_spec.requires.iter().all(|dep| {
            snapshot
                .latest_task(dep)
                .map(|t| t.state() == State::Success)
                .unwrap_or(false)
        });

        if !deps_met {
            continue;
        }

        // Dependency outputs flow into the task alongside the workflow
        // context, in dependency completion order.
        let mut ctx = snapshot.workflow_context();

        let mut deps: Vec<_> = task_spec
            .requires
            .iter()
            .filter_map(|dep| snapshot.latest_task(dep))
            .collect();
        deps.sort_by_key(|t| t.updated_at);

        for dep in deps {
            let dep_spec = task_spec_from_row(dep)?;
            context::merge_into(&mut ctx, &dataflow::task_outbound_context(dep, &dep_spec));
        }

        result.commands.push(Command::RunTask(RunTaskCommand {
            task_name: name.clone(),
            context: ctx,
            waiting: false,
            triggered_by: None,
        }));
    }

    Ok(result)
}

/// The target task plus everything it transitively requires, sorted by name
/// for reproducible ordering.
fn dependency_closure(snapshot: &WorkflowSnapshot, target: &str) -> Result<BTreeSet<String>> {
    let mut closure = BTreeSet::new();
    let mut pending = vec![target.to_string()];

    while let Some(name) = pending.pop() {
        if !closure.insert(name.clone()) {
            continue;
        }

        let task_spec = snapshot.spec.effective_task_spec(&name)?;

        for dep in &task_spec.requires {
            if !closure.contains(dep) {
                pending.push(dep.clone());
            }
        }
    }

    Ok(closure)
}
