//! Spinner on stderr while a run is in flight.

use indicatif::{ProgressBar, ProgressStyle};
use psrun::model::RunState;
use psrun::runner::{ProgressCallback, ProgressEvent};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Progress callback that shows a spinner and prints run output around it.
///
/// Clones share the spinner, so one clone can go to the runner while the
/// other is used to print output.
#[derive(Clone, Default)]
pub struct SpinnerProgress {
    spinner: Arc<Mutex<Option<ProgressBar>>>,
}

impl SpinnerProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write run output to stdout without tearing the spinner.
    pub fn print(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let write = || {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        };
        match self.spinner.lock() {
            Ok(spinner) => match spinner.as_ref() {
                Some(pb) => pb.suspend(write),
                None => write(),
            },
            Err(_) => write(),
        }
    }

    fn start(&self, message: String) {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(100));
        if let Ok(mut spinner) = self.spinner.lock() {
            *spinner = Some(pb);
        }
    }

    fn stop(&self) {
        if let Ok(mut spinner) = self.spinner.lock() {
            if let Some(pb) = spinner.take() {
                pb.finish_and_clear();
            }
        }
    }
}

impl ProgressCallback for SpinnerProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::PreflightPassed { hostname } => {
                let _ = writeln!(std::io::stderr(), "preflight passed: {hostname}");
            }
            ProgressEvent::Staged { run_id, remote_dir } => {
                let _ = writeln!(std::io::stderr(), "staged {run_id} in {remote_dir}");
            }
            ProgressEvent::Started { run_id } => self.start(format!("running {run_id}")),
            ProgressEvent::Finished {
                run_id: _,
                state,
                exit_code,
            } => {
                self.stop();
                let status = match state {
                    RunState::Completed => "\x1b[32mcompleted\x1b[0m",
                    RunState::TimedOut => "\x1b[33mtimed out\x1b[0m",
                    RunState::Cancelled => "\x1b[33mcancelled\x1b[0m",
                    _ => "\x1b[31mfailed\x1b[0m",
                };
                let _ = match exit_code {
                    Some(code) => writeln!(std::io::stderr(), "run {status} (exit code {code})"),
                    None => writeln!(std::io::stderr(), "run {status}"),
                };
            }
        }
    }
}
