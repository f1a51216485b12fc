//! Loading and validating a [`RunnerConfig`] from disk.
//!
//! Connection settings are checked before a channel is opened; the script is
//! only required once a run is staged.

use crate::model::RunnerConfig;
use crate::runner::{RunnerError, RunnerResult};
use std::fs;
use std::path::Path;

/// Load a runner configuration. `.yaml`/`.yml` files are YAML, anything else JSON.
pub fn load_config_file(path: &Path) -> RunnerResult<RunnerConfig> {
    let data = fs::read_to_string(path)
        .map_err(|err| RunnerError::io(format!("failed to read config {}", path.display()), err))?;
    let name = path.to_string_lossy();
    if name.ends_with(".yaml") || name.ends_with(".yml") {
        serde_yml::from_str(&data).map_err(|err| {
            RunnerError::config(
                "failed to parse yaml config",
                serde_json::json!({ "path": name, "source": err.to_string() }),
            )
        })
    } else {
        serde_json::from_str(&data).map_err(|err| {
            RunnerError::config(
                "failed to parse json config",
                serde_json::json!({ "path": name, "source": err.to_string() }),
            )
        })
    }
}

/// Reject configurations the runner cannot run a script with.
pub fn validate_config(config: &RunnerConfig) -> RunnerResult<()> {
    validate_connection(config)?;
    if config.script.is_none() && config.script_path.is_none() {
        return Err(RunnerError::config(
            "either script or script_path is required",
            None,
        ));
    }
    if config.execution_timeout_interval == Some(0) {
        return Err(RunnerError::config(
            "execution_timeout_interval must be positive",
            serde_json::json!({ "received": 0 }),
        ));
    }
    Ok(())
}

/// Checks needed before connecting, whatever the runner is used for.
pub fn validate_connection(config: &RunnerConfig) -> RunnerResult<()> {
    if config.hostname.trim().is_empty() {
        return Err(RunnerError::config("hostname must not be empty", None));
    }
    if config.ssh_port == 0 {
        return Err(RunnerError::config("ssh_port must be non-zero", None));
    }
    if config.refresh_read_timeout_ms == 0 {
        return Err(RunnerError::config(
            "refresh_read_timeout_ms must be positive",
            None,
        ));
    }
    Ok(())
}

/// Script body: the inline `script`, else the contents of `script_path`.
pub fn resolve_script(config: &RunnerConfig) -> RunnerResult<String> {
    if let Some(script) = &config.script {
        return Ok(script.clone());
    }
    match &config.script_path {
        Some(path) => fs::read_to_string(path).map_err(|err| {
            RunnerError::io(format!("failed to read script {}", path.display()), err)
        }),
        None => Err(RunnerError::config(
            "either script or script_path is required",
            None,
        )),
    }
}
