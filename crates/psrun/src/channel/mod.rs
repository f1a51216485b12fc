//! Secure channel to the remote host.
//!
//! The runner only talks to the host through [`SecureChannel`]: a blocking
//! [`SecureChannel::execute`] for staging commands and a non-blocking
//! [`SecureChannel::spawn`] that hands back a pollable [`AsyncProcess`].
//!
//! [`OpenSshChannel`] implements the trait on top of the local `ssh` client,
//! with [`PtyProcess`] as the handle of launched commands.

mod pty;
mod ssh;

pub use pty::PtyProcess;
pub use ssh::OpenSshChannel;

use crate::elevation::ElevationMethod;
use crate::runner::{RunnerError, RunnerResult};
use crate::shell::quote_posix;
use std::time::Duration;
use tracing::debug;

/// Failure of the channel itself, as opposed to a remote command failing.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("channel i/o failed: {0}")]
    Io(String),
}

impl ChannelError {
    pub fn io(context: &str, err: impl std::fmt::Display) -> Self {
        ChannelError::Io(format!("{context}: {err}"))
    }
}

/// Result of a blocking remote command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Handle of a command launched with [`SecureChannel::spawn`].
pub trait AsyncProcess: Send {
    /// Whether the process has been launched.
    fn started(&self) -> bool;

    /// Read whatever output is available, waiting at most `timeout`.
    fn read_available(&mut self, timeout: Duration) -> Result<Vec<u8>, ChannelError>;

    /// Exit code once the process has terminated.
    fn try_exit_code(&mut self) -> Result<Option<i32>, ChannelError>;

    /// Write to the process's standard input.
    fn write_input(&mut self, input: &str) -> Result<(), ChannelError>;

    /// Stop the local end of the process, waiting up to `grace`.
    fn terminate(&mut self, grace: Duration) -> Result<Option<i32>, ChannelError>;
}

/// Connection to one remote host.
pub trait SecureChannel: Send {
    /// Run `command` to completion, feeding `stdin` to it.
    fn execute(&mut self, command: &str, stdin: Option<&str>) -> Result<CommandOutput, ChannelError>;

    /// Launch `command` without waiting for it.
    fn spawn(&mut self, command: &str, tty: bool) -> Result<Box<dyn AsyncProcess>, ChannelError>;

    /// Local argv used to run `command`, for logging.
    fn command_line(&self, command: &str, tty: bool) -> Vec<String>;

    fn is_open(&self) -> bool;

    fn close(&mut self) -> Result<(), ChannelError>;
}

/// Render an argv for log output.
pub fn render_command_line(parts: &[String]) -> String {
    parts
        .iter()
        .map(|part| quote_posix(part))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs blocking commands through a channel with elevation applied.
pub struct RemoteShell<'a> {
    channel: &'a mut dyn SecureChannel,
    elevation: &'a dyn ElevationMethod,
}

impl<'a> RemoteShell<'a> {
    pub fn new(channel: &'a mut dyn SecureChannel, elevation: &'a dyn ElevationMethod) -> Self {
        Self { channel, elevation }
    }

    /// Run `command` elevated and return its output whatever the exit code.
    pub fn run(&mut self, command: &str, stdin: Option<&str>) -> RunnerResult<CommandOutput> {
        if !self.channel.is_open() {
            return Err(RunnerError::channel_closed("secure channel is closed"));
        }
        let wrapped = self.elevation.wrap(command);
        let input = self.elevation.sync_input(stdin);
        debug!(command = %wrapped, "running remote command");
        Ok(self.channel.execute(&wrapped, input.as_deref())?)
    }

    /// Run `command` and turn a non-zero exit code into `on_failure(code)`.
    pub fn ensure(
        &mut self,
        command: &str,
        stdin: Option<&str>,
        on_failure: impl FnOnce(i32) -> RunnerError,
    ) -> RunnerResult<CommandOutput> {
        let output = self.run(command, stdin)?;
        if !output.success() {
            debug!(
                exit_code = output.exit_code,
                stderr = %output.stderr,
                "remote command failed"
            );
            return Err(on_failure(output.exit_code));
        }
        Ok(output)
    }
}
