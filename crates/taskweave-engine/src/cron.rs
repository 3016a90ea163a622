// Cron trigger processor: a periodic sweep over due triggers with an
// optimistic advance. Only the sweeper whose compare-and-swap on
// next_execution_time wins fires the workflow, which keeps firing
// at-most-once across any number of engine replicas polling the same table.

use std::str::FromStr;
use std::sync::Arc;

use ::cron::Schedule;
use chrono::{DateTime, Utc};
use taskweave_core::{AuthContext, EngineError, Result};
use taskweave_storage::{CreateCronTrigger, CronTriggerRow};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::engine::{Engine, StartParams};

/// Next fire time strictly after `after`. Five-field patterns are accepted
/// and normalized to the six-field form the parser expects.
pub fn next_execution_time(pattern: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let schedule = parse_pattern(pattern)?;

    schedule.after(&after).next().ok_or_else(|| {
        EngineError::invalid_input(format!("Cron pattern never fires again: {}", pattern))
    })
}

pub fn validate_pattern(pattern: &str) -> Result<()> {
    parse_pattern(pattern).map(|_| ())
}

fn parse_pattern(pattern: &str) -> Result<Schedule> {
    let normalized = if pattern.split_whitespace().count() == 5 {
        format!("0 {}", pattern)
    } else {
        pattern.to_string()
    };

    Schedule::from_str(&normalized)
        .map_err(|e| EngineError::invalid_input(format!("Invalid cron pattern '{}': {}", pattern, e)))
}

impl Engine {
    /// Register a cron trigger for a workflow. The workflow must exist and
    /// the pattern must parse; the first fire time defaults to the next
    /// pattern match from now.
    pub async fn create_cron_trigger(
        &self,
        name: &str,
        workflow_name: &str,
        workflow_input: serde_json::Value,
        workflow_params: serde_json::Value,
        pattern: &str,
        first_execution_time: Option<DateTime<Utc>>,
        remaining_executions: Option<i32>,
        auth: &AuthContext,
    ) -> Result<CronTriggerRow> {
        validate_pattern(pattern)?;

        let def = self
            .store
            .load_workflow_definition(workflow_name, auth)
            .await?
            .ok_or_else(|| {
                EngineError::not_found(format!(
                    "Workflow not found [workflow_name={}]",
                    workflow_name
                ))
            })?;

        let next = match first_execution_time {
            Some(t) => t,
            None => next_execution_time(pattern, Utc::now())?,
        };

        self.store
            .create_cron_trigger(CreateCronTrigger {
                name: name.to_string(),
                project_id: auth.project_id.clone(),
                scope: "private".to_string(),
                pattern: pattern.to_string(),
                first_execution_time,
                next_execution_time: next,
                remaining_executions,
                workflow_id: Some(def.id),
                workflow_name: workflow_name.to_string(),
                workflow_input,
                workflow_params,
                trust_id: auth.trust_id.clone(),
            })
            .await
    }
}

/// Periodic sweeper firing due cron triggers.
pub struct CronTriggerProcessor {
    engine: Arc<Engine>,
    shutdown_rx: watch::Receiver<bool>,
}

impl CronTriggerProcessor {
    pub fn new(engine: Arc<Engine>, shutdown_rx: watch::Receiver<bool>) -> Self {
        CronTriggerProcessor {
            engine,
            shutdown_rx,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let interval = self.engine.config().cron_interval;

        tokio::spawn(async move {
            let mut shutdown_rx = self.shutdown_rx.clone();

            info!("Cron trigger processor started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Cron trigger processor shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = process_cron_triggers(&self.engine).await {
                            error!(error = %e, "Cron trigger sweep failed");
                        }
                    }
                }
            }
        })
    }
}

pub async fn process_cron_triggers(engine: &Arc<Engine>) -> Result<()> {
    let due = engine.store().list_due_cron_triggers(Utc::now()).await?;

    for trigger in due {
        debug!(trigger = %trigger.name, "Processing cron trigger");

        // Advance first; fire only if this replica won the CAS.
        match advance_cron_trigger(engine, &trigger).await {
            Ok(true) => {
                info!(
                    trigger = %trigger.name,
                    workflow = %trigger.workflow_name,
                    "Starting workflow triggered by cron"
                );

                let auth = AuthContext {
                    project_id: trigger.project_id.clone(),
                    trust_id: trigger.trust_id.clone(),
                    is_admin: trigger.project_id.is_none(),
                    user_id: None,
                };

                let mut params = StartParams::from_value(&trigger.workflow_params);
                if params.env.is_none() {
                    params.env = trigger.workflow_params.get("env").cloned();
                }

                if let Err(e) = engine
                    .start_workflow(
                        &trigger.workflow_name,
                        trigger.workflow_input.clone(),
                        Some("Workflow execution created by cron trigger.".to_string()),
                        params,
                        &auth,
                    )
                    .await
                {
                    // Log and continue with the next trigger.
                    error!(
                        trigger = %trigger.name,
                        error = %e,
                        "Failed to start workflow from cron trigger"
                    );
                }
            }
            Ok(false) => {
                debug!(trigger = %trigger.name, "Cron trigger already advanced by another engine");
            }
            Err(e) => {
                error!(trigger = %trigger.name, error = %e, "Failed to advance cron trigger");
            }
        }
    }

    Ok(())
}

/// Atomically advance a trigger. The last remaining execution deletes the
/// row instead, with the delete count as the CAS. Returns whether this
/// caller owns the firing.
async fn advance_cron_trigger(engine: &Arc<Engine>, trigger: &CronTriggerRow) -> Result<bool> {
    let remaining = trigger.remaining_executions.map(|r| (r - 1).max(0));

    if remaining == Some(0) {
        return engine
            .store()
            .delete_cron_trigger_if_due(trigger.id, trigger.next_execution_time)
            .await;
    }

    let new_next = next_execution_time(&trigger.pattern, trigger.next_execution_time)?;

    engine
        .store()
        .advance_cron_trigger(trigger.id, trigger.next_execution_time, new_next, remaining)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_five_field_pattern_normalized() {
        let after = DateTime::parse_from_rfc3339("2024-06-01T10:30:30Z")
            .unwrap()
            .with_timezone(&Utc);

        let next = next_execution_time("* * * * *", after).unwrap();
        assert_eq!(next.to_rfc3339(), "2024-06-01T10:31:00+00:00");
    }

    #[test]
    fn test_six_field_pattern() {
        let after = DateTime::parse_from_rfc3339("2024-06-01T10:30:30Z")
            .unwrap()
            .with_timezone(&Utc);

        let next = next_execution_time("0 0 * * * *", after).unwrap();
        assert_eq!(next.to_rfc3339(), "2024-06-01T11:00:00+00:00");
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(validate_pattern("not a pattern").is_err());
        assert!(validate_pattern("* * * * *").is_ok());
    }
}
