//! Wrapper script that runs the staged script detached from the caller.
//!
//! The wrapper records its pid, tees the combined output of the script into
//! the output sentinel, and writes a normalized exit code (`0` or `1`) into
//! the exit-code sentinel before exiting with that code.

use crate::elevation::ElevationKind;
use crate::model::{EscapedPath, RunPaths};

const POWERSHELL: &str = "powershell.exe -NoProfile -NonInteractive -ExecutionPolicy Bypass";

/// Command line that runs the PowerShell file at `path`.
pub fn powershell_file_command(path: &EscapedPath) -> String {
    format!("{POWERSHELL} -File {path}")
}

/// Command that launches the staged wrapper.
pub fn wrapper_command(paths: &RunPaths) -> String {
    powershell_file_command(&paths.wrapper)
}

/// Command that runs the staged script directly, without sentinels.
pub fn script_command(paths: &RunPaths) -> String {
    powershell_file_command(&paths.script)
}

fn statements(paths: &RunPaths) -> Vec<String> {
    vec![
        format!("$PID | Set-Content -LiteralPath {} -NoNewline", paths.pid),
        format!(
            "{} 2>&1 | Tee-Object -LiteralPath {}",
            script_command(paths),
            paths.output
        ),
        "$ok = $?".to_string(),
        "$exit_code = if ($ok -and $LASTEXITCODE -eq 0) { 0 } else { 1 }".to_string(),
        format!(
            "Set-Content -LiteralPath {} -Value $exit_code -NoNewline",
            paths.exit_code
        ),
        "exit $exit_code".to_string(),
    ]
}

/// Build the wrapper body for `paths`.
///
/// `su` hands its command over as a single string, so for that variant the
/// statements are joined on one line.
pub fn build_wrapper(paths: &RunPaths, elevation: ElevationKind) -> String {
    let statements = statements(paths);
    match elevation {
        ElevationKind::Su => statements.join("; "),
        _ => statements.join("\n"),
    }
}
