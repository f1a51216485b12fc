//! Staging files on the remote host through a command channel.
//!
//! There is no file transfer channel, so uploads go through standard input:
//! one PowerShell command reads lines with `Read-Host` until it sees a line
//! equal to [`TERMINATOR`], then writes them to the destination.

use crate::channel::RemoteShell;
use crate::model::EscapedPath;
use crate::runner::{RunnerError, RunnerResult};
use crate::shell::quote_powershell;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Line that ends an upload payload.
pub const TERMINATOR: &str = "END_REMOTE_EXECUTION_SCRIPT";

/// POSIX-style permission bits requested for an uploaded file.
///
/// Windows has no execute bit; a mode without any write bit marks the file
/// read-only, every other mode leaves it writable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileMode(u32);

impl FileMode {
    pub const READ_EXECUTE: FileMode = FileMode(0o555);
    pub const READ_WRITE: FileMode = FileMode(0o644);

    pub fn new(bits: u32) -> Self {
        Self(bits & 0o7777)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_read_only(self) -> bool {
        self.0 & 0o222 == 0
    }
}

impl Default for FileMode {
    fn default() -> Self {
        Self::READ_EXECUTE
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

impl FromStr for FileMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let digits = value.trim_start_matches("0o");
        u32::from_str_radix(digits, 8)
            .ok()
            .filter(|bits| *bits <= 0o7777)
            .map(FileMode)
            .ok_or_else(|| format!("invalid octal file mode '{value}'"))
    }
}

/// Command that creates `dir` and any missing parents.
pub fn ensure_directory_command(dir: &EscapedPath) -> String {
    format!("New-Item -ItemType Directory -Path {dir} -Force | Out-Null")
}

/// Command that reads a framed payload from stdin and writes it to `destination`.
///
/// The file is written as UTF-8 without a byte order mark. A read-only file
/// left by an earlier upload is made writable first.
pub fn upload_command(destination: &EscapedPath, mode: FileMode) -> String {
    let terminator = quote_powershell(TERMINATOR);
    let target = quote_powershell(&destination.to_raw());
    let mut command = format!(
        "$lines = @(); \
         while ((($line = Read-Host) -ne $null) -and ($line -cne {terminator})) {{ $lines += $line }}; \
         if (Test-Path -LiteralPath {destination}) {{ Set-ItemProperty -LiteralPath {destination} -Name IsReadOnly -Value $false }}; \
         [IO.File]::WriteAllText({target}, ($lines -join \"`n\"), (New-Object System.Text.UTF8Encoding $false))"
    );
    if mode.is_read_only() {
        command.push_str(&format!(
            "; (Get-Item -LiteralPath {destination}).IsReadOnly = $true"
        ));
    }
    command
}

/// Command that deletes `path`.
pub fn remove_command(path: &EscapedPath, recursive: bool) -> String {
    let recurse = if recursive { " -Recurse" } else { "" };
    format!("Remove-Item -LiteralPath {path}{recurse} -Force")
}

/// Command that deletes each of `paths` that exists.
pub fn remove_stale_command(paths: &[&EscapedPath]) -> String {
    let list = paths
        .iter()
        .map(|path| path.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!("Remove-Item -LiteralPath {list} -Force -ErrorAction SilentlyContinue; exit 0")
}

/// Normalize `data` and append the terminator line.
///
/// Carriage returns are dropped since `Read-Host` splits on them. A payload
/// line equal to the terminator would end the upload early, so it is refused.
pub fn frame_payload(data: &str, destination: &EscapedPath) -> RunnerResult<String> {
    let normalized = data.replace('\r', "");
    if let Some(index) = normalized.split('\n').position(|line| line == TERMINATOR) {
        return Err(RunnerError::terminator_collision(
            destination.as_str(),
            index + 1,
        ));
    }
    Ok(format!("{normalized}\n{TERMINATOR}\n"))
}

/// Create `dir` on the remote host.
///
/// # Errors
/// `DirectoryCreate` with the remote exit code when the command fails.
pub fn ensure_directory(shell: &mut RemoteShell<'_>, dir: &EscapedPath) -> RunnerResult<()> {
    shell.ensure(&ensure_directory_command(dir), None, |code| {
        RunnerError::directory_create(dir.as_str(), code)
    })?;
    Ok(())
}

/// Write `data` to `destination`, creating its directory first.
///
/// # Errors
/// - `TerminatorCollision` if a payload line equals [`TERMINATOR`].
/// - `DirectoryCreate` or `Upload` with the remote exit code.
pub fn upload(
    shell: &mut RemoteShell<'_>,
    data: &str,
    destination: &EscapedPath,
    mode: FileMode,
) -> RunnerResult<EscapedPath> {
    let payload = frame_payload(data, destination)?;
    if let Some(parent) = destination.parent() {
        ensure_directory(shell, &parent)?;
    }
    debug!(destination = %destination, mode = %mode, payload = %data, "uploading file");
    shell.ensure(&upload_command(destination, mode), Some(&payload), |code| {
        RunnerError::upload(destination.as_str(), code)
    })?;
    Ok(destination.clone())
}

/// Delete `path` on the remote host.
///
/// # Errors
/// `RemoteCommand` with the remote exit code when the command fails.
pub fn remove_path(shell: &mut RemoteShell<'_>, path: &EscapedPath, recursive: bool) -> RunnerResult<()> {
    shell.ensure(&remove_command(path, recursive), None, |code| {
        RunnerError::remote_command(&format!("Remove-Item {path}"), code)
    })?;
    Ok(())
}

/// Delete whichever of `paths` exist. Missing files are not an error.
///
/// # Errors
/// `RemoteCommand` if the remote shell itself fails.
pub fn remove_stale(shell: &mut RemoteShell<'_>, paths: &[&EscapedPath]) -> RunnerResult<()> {
    shell.ensure(&remove_stale_command(paths), None, |code| {
        RunnerError::remote_command("Remove-Item", code)
    })?;
    Ok(())
}
