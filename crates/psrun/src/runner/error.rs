//! Coded runner errors.
//!
//! Every failure surfaced by the runner carries an [`ErrorCode`]. Failures of
//! remote commands also carry the remote exit code; they are detected from
//! the exit status only, never by parsing command output.

use crate::channel::ChannelError;
use miette::Diagnostic;
use serde_json::Value;
use std::fmt;

/// Result alias used throughout the crate.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Placeholder replaced by the remote exit code in caller-facing messages.
pub const EXIT_CODE_PLACEHOLDER: &str = "%{exit_code}";

/// Message shown when the preflight probe cannot be executed.
pub const PREFLIGHT_ERROR_TEMPLATE: &str =
    "Failed to execute script on remote machine, exit code: %{exit_code}.";

/// Closed set of error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Invalid or incomplete configuration.
    Config,
    /// Remote `New-Item -ItemType Directory` exited non-zero.
    DirectoryCreate,
    /// Remote upload command exited non-zero.
    Upload,
    /// Payload contains a line equal to the upload terminator.
    TerminatorCollision,
    /// Preflight probe exited non-zero.
    Preflight,
    /// Some other remote command exited non-zero.
    RemoteCommand,
    /// `run_async` called while a run is active.
    AlreadyRunning,
    /// Operation not valid in the current run state.
    InvalidState,
    /// The secure channel was torn down.
    ChannelClosed,
    /// Local I/O failure.
    Io,
    /// Internal invariant broken.
    Internal,
}

impl ErrorCode {
    /// All codes, in exit-code order.
    pub const ALL: [ErrorCode; 11] = [
        ErrorCode::Config,
        ErrorCode::DirectoryCreate,
        ErrorCode::Upload,
        ErrorCode::TerminatorCollision,
        ErrorCode::Preflight,
        ErrorCode::RemoteCommand,
        ErrorCode::AlreadyRunning,
        ErrorCode::InvalidState,
        ErrorCode::ChannelClosed,
        ErrorCode::Io,
        ErrorCode::Internal,
    ];

    /// Stable string form, e.g. `E_UPLOAD`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Config => "E_CONFIG",
            ErrorCode::DirectoryCreate => "E_DIRECTORY_CREATE",
            ErrorCode::Upload => "E_UPLOAD",
            ErrorCode::TerminatorCollision => "E_TERMINATOR_COLLISION",
            ErrorCode::Preflight => "E_PREFLIGHT",
            ErrorCode::RemoteCommand => "E_REMOTE_COMMAND",
            ErrorCode::AlreadyRunning => "E_ALREADY_RUNNING",
            ErrorCode::InvalidState => "E_INVALID_STATE",
            ErrorCode::ChannelClosed => "E_CHANNEL_CLOSED",
            ErrorCode::Io => "E_IO",
            ErrorCode::Internal => "E_INTERNAL",
        }
    }

    /// Parse the string form back into a code.
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.as_str() == value)
    }

    /// Process exit code used by the CLI for this error.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCode::Config => 2,
            ErrorCode::DirectoryCreate => 3,
            ErrorCode::Upload => 4,
            ErrorCode::TerminatorCollision => 5,
            ErrorCode::Preflight => 6,
            ErrorCode::RemoteCommand => 7,
            ErrorCode::AlreadyRunning => 8,
            ErrorCode::InvalidState => 9,
            ErrorCode::ChannelClosed => 10,
            ErrorCode::Io => 11,
            ErrorCode::Internal => 12,
        }
    }

    /// Ordering faults in the caller. These must not be retried.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorCode::AlreadyRunning | ErrorCode::Internal)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by every fallible runner operation.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RunnerError {
    /// Error classification.
    pub code: ErrorCode,
    /// Human readable message.
    pub message: String,
    /// Exit code of the remote command that failed, if any.
    pub exit_code: Option<i32>,
    /// Structured context for JSON output.
    pub context: Option<Value>,
}

impl RunnerError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            exit_code: None,
            context: None,
        }
    }

    fn remote(code: ErrorCode, template: &str, exit_code: i32) -> Self {
        Self {
            code,
            message: interpolate_exit_code(template, exit_code),
            exit_code: Some(exit_code),
            context: None,
        }
    }

    pub fn config(message: impl Into<String>, context: impl Into<Option<Value>>) -> Self {
        Self {
            context: context.into(),
            ..Self::new(ErrorCode::Config, message)
        }
    }

    pub fn directory_create(path: &str, exit_code: i32) -> Self {
        let template =
            format!("Unable to create directory {path} on remote system, exit code: {EXIT_CODE_PLACEHOLDER}");
        Self::remote(ErrorCode::DirectoryCreate, &template, exit_code)
    }

    pub fn upload(path: &str, exit_code: i32) -> Self {
        let template =
            format!("Unable to upload file to {path} on remote system, exit code: {EXIT_CODE_PLACEHOLDER}");
        Self::remote(ErrorCode::Upload, &template, exit_code)
    }

    pub fn terminator_collision(path: &str, line: usize) -> Self {
        Self {
            context: Some(serde_json::json!({ "path": path, "line": line })),
            ..Self::new(
                ErrorCode::TerminatorCollision,
                format!("payload for {path} contains the upload terminator on line {line}"),
            )
        }
    }

    pub fn preflight(exit_code: i32) -> Self {
        Self::remote(ErrorCode::Preflight, PREFLIGHT_ERROR_TEMPLATE, exit_code)
    }

    pub fn remote_command(what: &str, exit_code: i32) -> Self {
        let template = format!("{what} failed on remote system, exit code: {EXIT_CODE_PLACEHOLDER}");
        Self::remote(ErrorCode::RemoteCommand, &template, exit_code)
    }

    pub fn already_running() -> Self {
        Self::new(ErrorCode::AlreadyRunning, "async command already in progress")
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, message)
    }

    pub fn channel_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ChannelClosed, message)
    }

    pub fn io(message: impl Into<String>, err: impl fmt::Display) -> Self {
        Self {
            context: Some(serde_json::json!({ "source": err.to_string() })),
            ..Self::new(ErrorCode::Io, message)
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        self.code.exit_code()
    }

    /// JSON form used by `--json` output.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "code": self.code.as_str(),
            "message": self.message,
            "exit_code": self.exit_code,
            "context": self.context,
        })
    }
}

impl Diagnostic for RunnerError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(self.code))
    }
}

impl From<ChannelError> for RunnerError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Closed => Self::channel_closed("secure channel is closed"),
            other => Self::io("secure channel failure", other),
        }
    }
}

/// Replace [`EXIT_CODE_PLACEHOLDER`] in `template` with `exit_code`.
pub fn interpolate_exit_code(template: &str, exit_code: i32) -> String {
    template.replace(EXIT_CODE_PLACEHOLDER, &exit_code.to_string())
}
