//! Progress callback for reporting run lifecycle events.

use crate::model::{RunId, RunState};

/// Event emitted while a run moves through its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The preflight probe passed.
    PreflightPassed {
        /// Host that was probed.
        hostname: String,
    },
    /// Script and wrapper were staged.
    Staged {
        run_id: RunId,
        /// Remote run directory, unescaped.
        remote_dir: String,
    },
    /// The async command was launched.
    Started { run_id: RunId },
    /// The run reached a terminal state.
    Finished {
        run_id: RunId,
        state: RunState,
        exit_code: Option<i32>,
    },
}

/// Receives progress events during execution.
pub trait ProgressCallback: Send {
    fn on_progress(&self, event: &ProgressEvent);
}

/// Discards all events.
pub struct NoopProgress;

impl ProgressCallback for NoopProgress {
    fn on_progress(&self, _event: &ProgressEvent) {}
}

/// Collects events for inspection.
#[derive(Default, Clone)]
pub struct CollectingProgress {
    events: std::sync::Arc<std::sync::Mutex<Vec<ProgressEvent>>>,
}

impl CollectingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events collected so far. A poisoned lock yields what was recorded.
    pub fn events(&self) -> Vec<ProgressEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ProgressCallback for CollectingProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event.clone());
    }
}
