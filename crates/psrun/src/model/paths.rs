//! Remote paths of a run.
//!
//! Every run lives in its own directory under the remote working dir, holding
//! the staged script, its wrapper, and the sentinels the wrapper writes.

use crate::model::RunId;
use crate::shell::{escape_powershell, unescape_powershell};
use serde::{Deserialize, Serialize};
use std::fmt;

/// File name of the staged user script.
pub const SCRIPT_FILE: &str = "script.ps1";
/// File name of the generated wrapper script.
pub const WRAPPER_FILE: &str = "script-wrapper.ps1";
/// Sentinel receiving the combined output of the script.
pub const OUTPUT_FILE: &str = "output";
/// Sentinel receiving the normalized exit code.
pub const EXIT_CODE_FILE: &str = "exit_code";
/// Sentinel receiving the wrapper process id.
pub const PID_FILE: &str = "pid";

const SEPARATORS: &[char] = &['/', '\\'];

/// A remote path that is safe to interpolate into a PowerShell command line.
///
/// Values are escaped when they are constructed; there is no way to build one
/// from an unescaped string without going through [`EscapedPath::escape`].
/// Deserialized values are taken as already escaped.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EscapedPath(String);

impl EscapedPath {
    /// Escape a raw remote path.
    pub fn escape(raw: &str) -> Self {
        Self(escape_powershell(raw))
    }

    /// Wrap a value the caller has already escaped.
    pub fn trusted(pre_escaped: impl Into<String>) -> Self {
        Self(pre_escaped.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append one path segment, escaping it.
    #[must_use]
    pub fn join(&self, segment: &str) -> Self {
        let base = self.0.trim_end_matches(SEPARATORS);
        Self(format!("{base}/{}", escape_powershell(segment)))
    }

    /// Directory containing this path.
    pub fn parent(&self) -> Option<Self> {
        let trimmed = self.0.trim_end_matches(SEPARATORS);
        let idx = trimmed.rfind(SEPARATORS)?;
        let parent = trimmed.get(..idx)?;
        if parent.is_empty() {
            return Some(Self(trimmed.get(..=idx)?.to_string()));
        }
        if parent.ends_with(':') {
            return Some(Self(format!("{parent}/")));
        }
        Some(Self(parent.to_string()))
    }

    /// Last path segment, still escaped.
    pub fn file_name(&self) -> &str {
        let trimmed = self.0.trim_end_matches(SEPARATORS);
        trimmed
            .rfind(SEPARATORS)
            .and_then(|idx| trimmed.get(idx + 1..))
            .unwrap_or(trimmed)
    }

    /// The path with escapes removed, for messages.
    pub fn to_raw(&self) -> String {
        unescape_powershell(&self.0)
    }
}

impl fmt::Display for EscapedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote locations of one run. All siblings of the staged script.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunPaths {
    pub dir: EscapedPath,
    pub script: EscapedPath,
    pub wrapper: EscapedPath,
    pub output: EscapedPath,
    pub exit_code: EscapedPath,
    pub pid: EscapedPath,
}

impl RunPaths {
    /// Layout for `run_id` under the remote working directory.
    pub fn for_run(remote_root: &EscapedPath, run_id: RunId) -> Self {
        Self::from_script(remote_root.join(&run_id.dir_name()).join(SCRIPT_FILE))
    }

    /// Derive every path from the staged script's directory.
    pub fn from_script(script: EscapedPath) -> Self {
        let dir = script
            .parent()
            .unwrap_or_else(|| EscapedPath::trusted("."));
        Self {
            wrapper: dir.join(WRAPPER_FILE),
            output: dir.join(OUTPUT_FILE),
            exit_code: dir.join(EXIT_CODE_FILE),
            pid: dir.join(PID_FILE),
            script,
            dir,
        }
    }

    /// The files written by the remote process.
    pub fn sentinels(&self) -> [&EscapedPath; 3] {
        [&self.output, &self.exit_code, &self.pid]
    }
}
