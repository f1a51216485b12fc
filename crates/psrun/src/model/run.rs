use crate::model::RunId;
use serde::{Deserialize, Serialize};

/// Lifecycle of one run session.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Prepared,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::TimedOut | RunState::Cancelled
        )
    }
}

/// Result of one `refresh` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Still running. Carries whatever output arrived since the last call,
    /// possibly nothing.
    Progress(String),
    /// The wrapper exited with code 0.
    Completed { exit_code: i32, output: String },
    /// The wrapper exited with a non-zero code.
    Failed { exit_code: i32, output: String },
    /// The execution timeout elapsed first. There is no exit code.
    TimedOut { output: String },
    /// The caller stopped polling.
    Cancelled,
}

impl RefreshOutcome {
    /// Output carried by this outcome.
    pub fn output(&self) -> &str {
        match self {
            RefreshOutcome::Progress(output)
            | RefreshOutcome::Completed { output, .. }
            | RefreshOutcome::Failed { output, .. }
            | RefreshOutcome::TimedOut { output } => output,
            RefreshOutcome::Cancelled => "",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RefreshOutcome::Progress(_))
    }

    /// Exit code for terminal outcomes that have one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RefreshOutcome::Completed { exit_code, .. } | RefreshOutcome::Failed { exit_code, .. } => {
                Some(*exit_code)
            }
            _ => None,
        }
    }
}

/// Serializable report of a run, for `--json` output and logs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub hostname: String,
    pub state: RunState,
    pub exit_code: Option<i32>,
    pub started_at_ms: Option<u64>,
    pub ended_at_ms: Option<u64>,
    pub output_bytes: u64,
    pub remote_dir: Option<String>,
}
