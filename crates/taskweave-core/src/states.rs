// Execution states and the validated transition table.
//
// Workflow executions move IDLE -> RUNNING -> {SUCCESS, ERROR, PAUSED};
// task executions additionally use WAITING (blocked on a join) and
// RUNNING_DELAYED (parked by a wait-before/wait-after policy). Terminal
// states can only be left through a rerun.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// State of a workflow, task or action execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "WAITING")]
    Waiting,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "RUNNING_DELAYED")]
    RunningDelayed,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "ERROR")]
    Error,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Idle => "IDLE",
            State::Waiting => "WAITING",
            State::Running => "RUNNING",
            State::RunningDelayed => "RUNNING_DELAYED",
            State::Paused => "PAUSED",
            State::Success => "SUCCESS",
            State::Error => "ERROR",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, State::Success | State::Error)
    }

    pub fn is_paused_or_completed(&self) -> bool {
        matches!(self, State::Paused | State::Success | State::Error)
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, State::Waiting)
    }

    pub fn is_running_or_delayed(&self) -> bool {
        matches!(self, State::Running | State::RunningDelayed)
    }
}

/// Whether `from -> to` is an allowed transition.
///
/// Same-state transitions are valid so that repeated deliveries of the same
/// event stay idempotent. Terminal states can only move back to RUNNING,
/// which is how rerun re-enters a failed graph.
pub fn is_valid_transition(from: State, to: State) -> bool {
    use State::*;

    if from == to {
        return true;
    }

    match from {
        Idle => matches!(to, Running | Error),
        Waiting => matches!(to, Running | Error),
        Running => matches!(to, Success | Error | Paused | RunningDelayed),
        RunningDelayed => matches!(to, Running | Paused | Error),
        Paused => matches!(to, Running | Error | Success),
        Success => matches!(to, Running),
        Error => matches!(to, Running),
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(State::Idle),
            "WAITING" => Ok(State::Waiting),
            "RUNNING" => Ok(State::Running),
            "RUNNING_DELAYED" => Ok(State::RunningDelayed),
            "PAUSED" => Ok(State::Paused),
            "SUCCESS" => Ok(State::Success),
            "ERROR" => Ok(State::Error),
            other => Err(EngineError::invalid_state(format!(
                "Unknown execution state: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        assert!(is_valid_transition(State::Idle, State::Running));
        assert!(is_valid_transition(State::Running, State::Success));
        assert!(is_valid_transition(State::Running, State::Error));
        assert!(is_valid_transition(State::Running, State::Paused));
        assert!(is_valid_transition(State::Paused, State::Running));
        assert!(is_valid_transition(State::Paused, State::Error));
        assert!(is_valid_transition(State::Paused, State::Success));
    }

    #[test]
    fn test_task_only_transitions() {
        assert!(is_valid_transition(State::Waiting, State::Running));
        assert!(is_valid_transition(State::Running, State::RunningDelayed));
        assert!(is_valid_transition(State::RunningDelayed, State::Running));
        assert!(is_valid_transition(State::RunningDelayed, State::Error));
    }

    #[test]
    fn test_rerun_reenters_terminal_states() {
        assert!(is_valid_transition(State::Success, State::Running));
        assert!(is_valid_transition(State::Error, State::Running));
    }

    #[test]
    fn test_forbidden_transitions() {
        assert!(!is_valid_transition(State::Idle, State::Success));
        assert!(!is_valid_transition(State::Idle, State::Paused));
        assert!(!is_valid_transition(State::Success, State::Error));
        assert!(!is_valid_transition(State::Error, State::Success));
        assert!(!is_valid_transition(State::Success, State::Paused));
        assert!(!is_valid_transition(State::Waiting, State::Success));
    }

    #[test]
    fn test_same_state_is_idempotent() {
        for s in [
            State::Idle,
            State::Waiting,
            State::Running,
            State::RunningDelayed,
            State::Paused,
            State::Success,
            State::Error,
        ] {
            assert!(is_valid_transition(s, s));
        }
    }

    #[test]
    fn test_wire_format_round_trip() {
        for s in [
            State::Idle,
            State::Waiting,
            State::Running,
            State::RunningDelayed,
            State::Paused,
            State::Success,
            State::Error,
        ] {
            assert_eq!(s, s.as_str().parse::<State>().unwrap());
        }

        assert!("FOO".parse::<State>().is_err());
    }
}
