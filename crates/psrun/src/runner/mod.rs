//! Run session state machine.
//!
//! A [`PowershellRunner`] owns one secure channel, one elevation method, and
//! at most one run session. A run goes through
//! `Idle → Prepared → Running → {Completed, Failed, TimedOut, Cancelled}`:
//!
//! - [`PowershellRunner::prepare_start`] stages the script and its wrapper,
//! - [`PowershellRunner::run_async`] launches a command and returns at once,
//! - [`PowershellRunner::refresh`] is polled until it reports a terminal outcome.
//!
//! # Example
//!
//! ```no_run
//! use psrun::model::RunnerConfigBuilder;
//! use psrun::runner::PowershellRunner;
//!
//! # fn example() -> Result<(), psrun::runner::RunnerError> {
//! let config = RunnerConfigBuilder::new("win-01.example.com")
//!     .script("Write-Output hello")
//!     .execution_timeout_secs(600)
//!     .build();
//! let mut runner = PowershellRunner::connect(config)?;
//! runner.start()?;
//! loop {
//!     let outcome = runner.refresh()?;
//!     if outcome.is_terminal() {
//!         break;
//!     }
//! }
//! runner.close()?;
//! # Ok(())
//! # }
//! ```

mod error;
pub mod progress;

pub use error::{
    interpolate_exit_code, ErrorCode, RunnerError, RunnerResult, EXIT_CODE_PLACEHOLDER,
    PREFLIGHT_ERROR_TEMPLATE,
};
pub use progress::{CollectingProgress, NoopProgress, ProgressCallback, ProgressEvent};

use crate::channel::{
    render_command_line, AsyncProcess, OpenSshChannel, RemoteShell, SecureChannel,
};
use crate::config::{resolve_script, validate_connection};
use crate::elevation::{build_elevation, ElevationMethod};
use crate::model::paths::{SCRIPT_FILE, WRAPPER_FILE};
use crate::model::{
    EscapedPath, RefreshOutcome, RunId, RunPaths, RunState, RunSummary, RunnerConfig,
};
use crate::upload::{self, FileMode};
use crate::wrapper::{build_wrapper, powershell_file_command, wrapper_command};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Body of the preflight probe script.
pub const PREFLIGHT_PROBE: &str = "echo true";

/// Grace period given to the local channel process when it is stopped.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Decodes a byte stream that may split UTF-8 sequences across reads.
#[derive(Debug, Default)]
struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(
                        self.pending.get(..valid).unwrap_or_default(),
                    ));
                    match err.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return text;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// The single run owned by a runner.
struct RunSession {
    run_id: RunId,
    state: RunState,
    paths: Option<RunPaths>,
    local_dir: Option<PathBuf>,
    process: Option<Box<dyn AsyncProcess>>,
    decoder: Utf8Stream,
    started: Option<Instant>,
    started_at_ms: Option<u64>,
    ended_at_ms: Option<u64>,
    exit_code: Option<i32>,
    output_bytes: u64,
    cleanup_pending: bool,
}

impl RunSession {
    fn idle() -> Self {
        Self {
            run_id: RunId::new(),
            state: RunState::Idle,
            paths: None,
            local_dir: None,
            process: None,
            decoder: Utf8Stream::default(),
            started: None,
            started_at_ms: None,
            ended_at_ms: None,
            exit_code: None,
            output_bytes: 0,
            cleanup_pending: false,
        }
    }

    fn prepared(run_id: RunId, paths: RunPaths, local_dir: PathBuf, cleanup: bool) -> Self {
        Self {
            run_id,
            state: RunState::Prepared,
            paths: Some(paths),
            local_dir: Some(local_dir),
            cleanup_pending: cleanup,
            ..Self::idle()
        }
    }

    /// Outcome repeated by `refresh` once the session is terminal.
    fn terminal_outcome(&self) -> Option<RefreshOutcome> {
        let output = String::new();
        match (self.state, self.exit_code) {
            (RunState::Completed, Some(exit_code)) => {
                Some(RefreshOutcome::Completed { exit_code, output })
            }
            (RunState::Failed, Some(exit_code)) => Some(RefreshOutcome::Failed { exit_code, output }),
            (RunState::TimedOut, _) => Some(RefreshOutcome::TimedOut { output }),
            (RunState::Cancelled, _) => Some(RefreshOutcome::Cancelled),
            _ => None,
        }
    }
}

/// Asynchronous executor of one PowerShell script on one remote host.
pub struct PowershellRunner {
    config: RunnerConfig,
    channel: Box<dyn SecureChannel>,
    elevation: Box<dyn ElevationMethod>,
    progress: Box<dyn ProgressCallback>,
    session: RunSession,
}

impl PowershellRunner {
    /// Create a runner over an existing channel and elevation method.
    ///
    /// The script is resolved when a run is staged, so a runner without one
    /// can still preflight, upload and kill.
    pub fn new(
        config: RunnerConfig,
        channel: Box<dyn SecureChannel>,
        elevation: Box<dyn ElevationMethod>,
    ) -> Self {
        Self {
            config,
            channel,
            elevation,
            progress: Box::new(NoopProgress),
            session: RunSession::idle(),
        }
    }

    /// Create a runner connected through the local OpenSSH client.
    ///
    /// # Errors
    /// `Config` for an unusable configuration, `Io` if local directories
    /// cannot be prepared.
    pub fn connect(config: RunnerConfig) -> RunnerResult<Self> {
        validate_connection(&config)?;
        let channel = OpenSshChannel::new(&config)?;
        let elevation = build_elevation(&config.elevation);
        Ok(Self::new(config, Box::new(channel), elevation))
    }

    /// Report lifecycle events to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Box<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.session.state
    }

    pub fn run_id(&self) -> RunId {
        self.session.run_id
    }

    /// Remote layout of the current run, once prepared.
    pub fn paths(&self) -> Option<&RunPaths> {
        self.session.paths.as_ref()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.session.run_id,
            hostname: self.config.hostname.clone(),
            state: self.session.state,
            exit_code: self.session.exit_code,
            started_at_ms: self.session.started_at_ms,
            ended_at_ms: self.session.ended_at_ms,
            output_bytes: self.session.output_bytes,
            remote_dir: self.session.paths.as_ref().map(|paths| paths.dir.to_raw()),
        }
    }

    fn shell(&mut self) -> RemoteShell<'_> {
        RemoteShell::new(self.channel.as_mut(), self.elevation.as_ref())
    }

    // =========================================================================
    // Staging
    // =========================================================================

    /// Create `dir` on the remote host.
    ///
    /// # Errors
    /// `DirectoryCreate` with the remote exit code.
    pub fn ensure_remote_directory(&mut self, dir: &EscapedPath) -> RunnerResult<()> {
        upload::ensure_directory(&mut self.shell(), dir)
    }

    /// Upload `data` to `destination` with `mode`.
    ///
    /// # Errors
    /// `TerminatorCollision`, `DirectoryCreate` or `Upload`.
    pub fn upload(
        &mut self,
        data: &str,
        destination: &EscapedPath,
        mode: FileMode,
    ) -> RunnerResult<EscapedPath> {
        upload::upload(&mut self.shell(), data, destination, mode)
    }

    /// Check that scripts can be staged and executed on the host.
    ///
    /// Stages a probe under its own directory, runs it, and removes the
    /// directory again. The run session is not touched.
    ///
    /// # Errors
    /// `Preflight` with the exit code of the probe, or the staging error.
    pub fn preflight(&mut self) -> RunnerResult<()> {
        let dir = self
            .config
            .remote_working_dir
            .join(&format!("psrun-preflight-{}", RunId::new()));
        let probe = dir.join("probe.ps1");
        let mut shell = self.shell();

        let result = upload::upload(&mut shell, PREFLIGHT_PROBE, &probe, FileMode::default())
            .and_then(|_| shell.run(&powershell_file_command(&probe), None));
        let removed = upload::remove_path(&mut shell, &dir, true);

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                if let Err(cleanup) = removed {
                    warn!(dir = %dir, error = %cleanup, "failed to remove preflight probe");
                }
                return Err(err);
            }
        };
        if !output.success() {
            if let Err(cleanup) = removed {
                warn!(dir = %dir, error = %cleanup, "failed to remove preflight probe");
            }
            return Err(RunnerError::preflight(output.exit_code));
        }
        removed?;

        info!(hostname = %self.config.hostname, "preflight passed");
        self.progress.on_progress(&ProgressEvent::PreflightPassed {
            hostname: self.config.hostname.clone(),
        });
        Ok(())
    }

    /// Stage the script and its wrapper for a new run.
    ///
    /// Allowed when no run is active. Each call starts a fresh run id; the
    /// working directories of the previous run are removed first. If staging
    /// fails part way, the new run directory is removed again and the runner
    /// is left idle.
    ///
    /// # Errors
    /// `AlreadyRunning` while a run is active, `Config` without a script,
    /// otherwise staging errors.
    pub fn prepare_start(&mut self) -> RunnerResult<()> {
        if self.session.state == RunState::Running {
            return Err(RunnerError::already_running());
        }
        let script = resolve_script(&self.config)?;
        self.release_process();
        self.cleanup();
        self.session = RunSession::idle();

        let run_id = RunId::new();
        let paths = RunPaths::for_run(&self.config.remote_working_dir, run_id);
        let wrapper = build_wrapper(&paths, self.elevation.kind());

        upload::ensure_directory(&mut self.shell(), &paths.dir)?;
        let staged = stage_files(&mut self.shell(), &paths, &script, &wrapper);
        let staged = staged.and_then(|()| self.write_local_copy(run_id, &script, &wrapper));
        let local_dir = match staged {
            Ok(local_dir) => local_dir,
            Err(err) => {
                self.abandon_staging(run_id, &paths.dir);
                return Err(err);
            }
        };

        info!(run_id = %run_id, remote_dir = %paths.dir, "run prepared");
        self.progress.on_progress(&ProgressEvent::Staged {
            run_id,
            remote_dir: paths.dir.to_raw(),
        });
        self.session = RunSession::prepared(
            run_id,
            paths,
            local_dir,
            self.config.cleanup_working_dirs,
        );
        Ok(())
    }

    /// Remove what a failed `prepare_start` left behind.
    fn abandon_staging(&mut self, run_id: RunId, dir: &EscapedPath) {
        let local_dir = self.config.local_working_dir.join(run_id.dir_name());
        if local_dir.exists() {
            if let Err(err) = std::fs::remove_dir_all(&local_dir) {
                warn!(dir = %local_dir.display(), error = %err, "failed to remove local run directory");
            }
        }
        if !self.channel.is_open() {
            warn!(dir = %dir, "channel closed, leaving partially staged run directory in place");
            return;
        }
        match upload::remove_path(&mut self.shell(), dir, true) {
            Ok(()) => warn!(run_id = %run_id, dir = %dir, "staging failed, removed run directory"),
            Err(err) => warn!(dir = %dir, error = %err, "failed to remove partially staged run directory"),
        }
    }

    fn write_local_copy(&self, run_id: RunId, script: &str, wrapper: &str) -> RunnerResult<PathBuf> {
        let dir = self.config.local_working_dir.join(run_id.dir_name());
        std::fs::create_dir_all(&dir)
            .map_err(|err| RunnerError::io("failed to create local run directory", err))?;
        std::fs::write(dir.join(SCRIPT_FILE), script)
            .map_err(|err| RunnerError::io("failed to write local script copy", err))?;
        std::fs::write(dir.join(WRAPPER_FILE), wrapper)
            .map_err(|err| RunnerError::io("failed to write local wrapper copy", err))?;
        Ok(dir)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Launch `command` for the prepared run and return immediately.
    ///
    /// # Errors
    /// - `AlreadyRunning` if a run is active; the session is left untouched.
    /// - `InvalidState` if no run is prepared.
    /// - `ChannelClosed` or `Io` if the command cannot be launched.
    pub fn run_async(&mut self, command: &str) -> RunnerResult<bool> {
        match self.session.state {
            RunState::Running => return Err(RunnerError::already_running()),
            RunState::Prepared => {}
            other => {
                return Err(RunnerError::invalid_state(format!(
                    "run_async requires a prepared run, state is {other:?}"
                )))
            }
        }
        if !self.channel.is_open() {
            return Err(RunnerError::channel_closed("secure channel is closed"));
        }

        self.elevation.reset();
        let wrapped = self.elevation.wrap(command);
        let tty = self.config.tty;
        info!(
            run_id = %self.session.run_id,
            command = %render_command_line(&self.channel.command_line(&wrapped, tty)),
            "starting async command"
        );
        let process = self.channel.spawn(&wrapped, tty)?;

        self.session.process = Some(process);
        self.session.state = RunState::Running;
        self.session.started = Some(Instant::now());
        self.session.started_at_ms = Some(now_ms());
        self.progress.on_progress(&ProgressEvent::Started {
            run_id: self.session.run_id,
        });
        Ok(true)
    }

    /// Preflight on first contact, stage, and launch the wrapper.
    ///
    /// # Errors
    /// Any error of [`preflight`](Self::preflight),
    /// [`prepare_start`](Self::prepare_start) or [`run_async`](Self::run_async).
    pub fn start(&mut self) -> RunnerResult<bool> {
        if self.config.first_execution {
            self.preflight()?;
        }
        self.prepare_start()?;
        let command = self
            .session
            .paths
            .as_ref()
            .map(wrapper_command)
            .ok_or_else(|| RunnerError::internal("prepared run has no paths"))?;
        self.run_async(&command)
    }

    /// Poll the running command once.
    ///
    /// Performs one bounded read, answers elevation prompts, then checks for
    /// termination and for the execution timeout, in that order. A terminal
    /// session reports its outcome again with empty output.
    ///
    /// # Errors
    /// - `InvalidState` before a run was started.
    /// - `ChannelClosed` when the channel went away; the run becomes `Failed`.
    pub fn refresh(&mut self) -> RunnerResult<RefreshOutcome> {
        match self.session.state {
            RunState::Running => {}
            state if state.is_terminal() => {
                return self.session.terminal_outcome().ok_or_else(|| {
                    RunnerError::channel_closed("secure channel closed during the run")
                });
            }
            other => {
                return Err(RunnerError::invalid_state(format!(
                    "no run in progress, state is {other:?}"
                )))
            }
        }
        if !self.channel.is_open() {
            self.finish(RunState::Failed, None);
            return Err(RunnerError::channel_closed("secure channel is closed"));
        }

        match self.poll_process() {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.code == ErrorCode::ChannelClosed => {
                self.finish(RunState::Failed, None);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn poll_process(&mut self) -> RunnerResult<RefreshOutcome> {
        let timeout = self.config.refresh_read_timeout();
        let process = self
            .session
            .process
            .as_mut()
            .ok_or_else(|| RunnerError::internal("running session has no process"))?;

        let bytes = process.read_available(timeout)?;
        let mut output = self.session.decoder.decode(&bytes);
        if let Some(answer) = self.elevation.on_output(&output) {
            debug!(run_id = %self.session.run_id, "answering elevation prompt");
            process.write_input(&answer)?;
            if let Some(prompt) = self.elevation.prompt() {
                output = output.replace(prompt, "");
            }
        }

        if let Some(exit_code) = process.try_exit_code()? {
            let rest = process.read_available(Duration::ZERO)?;
            output.push_str(&self.session.decoder.decode(&rest));
            output.push_str(&self.session.decoder.finish());
            self.count_output(&output);
            let state = if exit_code == 0 {
                RunState::Completed
            } else {
                RunState::Failed
            };
            self.finish(state, Some(exit_code));
            return Ok(match state {
                RunState::Completed => RefreshOutcome::Completed { exit_code, output },
                _ => RefreshOutcome::Failed { exit_code, output },
            });
        }

        self.count_output(&output);
        let timed_out = match (self.config.execution_timeout(), self.session.started) {
            (Some(limit), Some(started)) => started.elapsed() >= limit,
            _ => false,
        };
        if timed_out {
            self.finish(RunState::TimedOut, None);
            return Ok(RefreshOutcome::TimedOut { output });
        }
        Ok(RefreshOutcome::Progress(output))
    }

    fn count_output(&mut self, output: &str) {
        self.session.output_bytes += output.len() as u64;
    }

    /// Stop polling the current run. The remote process is left alone.
    ///
    /// # Errors
    /// `InvalidState` when there is no run to cancel.
    pub fn cancel(&mut self) -> RunnerResult<()> {
        match self.session.state {
            RunState::Prepared | RunState::Running => {
                self.finish(RunState::Cancelled, None);
                Ok(())
            }
            state if state.is_terminal() => Ok(()),
            RunState::Idle => Err(RunnerError::invalid_state("no run to cancel")),
            _ => Ok(()),
        }
    }

    /// Stop the remote wrapper process by the pid it recorded.
    ///
    /// Also stops the local end of the channel. The run state is not changed;
    /// a later `refresh` observes the exit. A timed-out or cancelled run keeps
    /// its working directories until it is killed, so they are removed here.
    ///
    /// # Errors
    /// - `InvalidState` if no run was prepared.
    /// - `RemoteCommand` with the exit code of `Stop-Process`.
    pub fn kill(&mut self) -> RunnerResult<()> {
        let pid = self
            .session
            .paths
            .as_ref()
            .map(|paths| paths.pid.clone())
            .ok_or_else(|| RunnerError::invalid_state("no run to kill"))?;
        info!(run_id = %self.session.run_id, "stopping remote process");
        self.stop_remote(&pid)?;
        if let Some(process) = self.session.process.as_mut() {
            process.terminate(TERMINATE_GRACE)?;
        }
        if self.session.state.is_terminal() {
            self.cleanup();
        }
        Ok(())
    }

    /// Stop the wrapper of a run staged under `run_dir`, possibly by
    /// another runner.
    ///
    /// # Errors
    /// `RemoteCommand` with the exit code of `Stop-Process`.
    pub fn kill_run(&mut self, run_dir: &EscapedPath) -> RunnerResult<()> {
        let paths = RunPaths::from_script(run_dir.join(SCRIPT_FILE));
        info!(remote_dir = %paths.dir, "stopping remote process");
        self.stop_remote(&paths.pid)
    }

    fn stop_remote(&mut self, pid: &EscapedPath) -> RunnerResult<()> {
        let command = format!("Stop-Process -Id (Get-Content -LiteralPath {pid}) -Force");
        self.shell().ensure(&command, None, |code| {
            RunnerError::remote_command("Stop-Process", code)
        })?;
        Ok(())
    }

    /// Remove pending working directories and close the channel.
    ///
    /// # Errors
    /// `Io` if the channel fails to close.
    pub fn close(&mut self) -> RunnerResult<()> {
        self.cleanup();
        self.release_process();
        self.channel.close()?;
        info!(hostname = %self.config.hostname, "runner closed");
        Ok(())
    }

    // =========================================================================
    // Terminal transitions
    // =========================================================================

    fn finish(&mut self, state: RunState, exit_code: Option<i32>) {
        self.session.state = state;
        self.session.exit_code = exit_code;
        self.session.ended_at_ms = Some(now_ms());
        info!(
            run_id = %self.session.run_id,
            state = ?state,
            exit_code = ?exit_code,
            "run finished"
        );
        self.progress.on_progress(&ProgressEvent::Finished {
            run_id: self.session.run_id,
            state,
            exit_code,
        });
        // the remote process may outlive these; `kill` still needs the pid
        if !matches!(state, RunState::TimedOut | RunState::Cancelled) {
            self.cleanup();
        }
    }

    fn cleanup(&mut self) {
        if !self.session.cleanup_pending {
            return;
        }
        self.session.cleanup_pending = false;

        if let Some(local_dir) = self.session.local_dir.as_ref() {
            if let Err(err) = std::fs::remove_dir_all(local_dir) {
                warn!(dir = %local_dir.display(), error = %err, "failed to remove local run directory");
            }
        }
        let Some(dir) = self.session.paths.as_ref().map(|paths| paths.dir.clone()) else {
            return;
        };
        if !self.channel.is_open() {
            warn!(dir = %dir, "channel closed, leaving remote run directory in place");
            return;
        }
        match upload::remove_path(&mut self.shell(), &dir, true) {
            Ok(()) => debug!(dir = %dir, "removed remote run directory"),
            Err(err) => warn!(dir = %dir, error = %err, "failed to remove remote run directory"),
        }
    }

    /// Drop the local handle of a previous run.
    fn release_process(&mut self) {
        if let Some(mut process) = self.session.process.take() {
            if let Err(err) = process.terminate(TERMINATE_GRACE) {
                debug!(error = %err, "failed to stop previous channel process");
            }
        }
    }
}

fn stage_files(
    shell: &mut RemoteShell<'_>,
    paths: &RunPaths,
    script: &str,
    wrapper: &str,
) -> RunnerResult<()> {
    upload::remove_stale(shell, &paths.sentinels())?;
    upload::upload(shell, script, &paths.script, FileMode::default())?;
    upload::upload(shell, wrapper, &paths.wrapper, FileMode::READ_EXECUTE)?;
    Ok(())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_stream_keeps_split_sequences() {
        let mut stream = Utf8Stream::default();
        let bytes = "héllo".as_bytes();
        assert_eq!(stream.decode(&bytes[..2]), "h");
        assert_eq!(stream.decode(&bytes[2..]), "éllo");
        assert_eq!(stream.finish(), "");
    }

    #[test]
    fn utf8_stream_replaces_invalid_bytes() {
        let mut stream = Utf8Stream::default();
        assert_eq!(stream.decode(b"a\xffb"), "a\u{fffd}b");
    }

    #[test]
    fn utf8_stream_flushes_truncated_tail() {
        let mut stream = Utf8Stream::default();
        assert_eq!(stream.decode(b"x\xc3"), "x");
        assert_eq!(stream.finish(), "\u{fffd}");
    }

    #[test]
    fn terminal_outcomes_repeat_without_output() {
        let mut session = RunSession::idle();
        assert_eq!(session.terminal_outcome(), None);
        session.state = RunState::Completed;
        session.exit_code = Some(0);
        assert_eq!(
            session.terminal_outcome(),
            Some(RefreshOutcome::Completed {
                exit_code: 0,
                output: String::new()
            })
        );
        session.state = RunState::Failed;
        session.exit_code = None;
        assert_eq!(session.terminal_outcome(), None);
        session.state = RunState::TimedOut;
        assert!(matches!(
            session.terminal_outcome(),
            Some(RefreshOutcome::TimedOut { .. })
        ));
    }
}
