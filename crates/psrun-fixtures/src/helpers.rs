//! Common test helper functions.

use psrun::config::validate_config;
use psrun::elevation::build_elevation;
use psrun::model::{RunnerConfig, RunnerConfigBuilder};
use psrun::runner::{PowershellRunner, RunnerResult};
use std::path::Path;
use tempfile::TempDir;

use crate::fake::FakeHost;

/// Create a unique temporary directory for a test, removed on drop.
///
/// # Panics
///
/// Panics if the directory cannot be created.
#[must_use]
#[allow(clippy::expect_used)]
pub fn temp_dir(prefix: &str) -> TempDir {
    tempfile::Builder::new()
        .prefix(&format!("psrun-{prefix}-"))
        .tempdir()
        .expect("failed to create temp directory")
}

/// Configuration with local directories under `dir` and a fast refresh.
#[must_use]
pub fn test_config(dir: &Path) -> RunnerConfigBuilder {
    RunnerConfigBuilder::new("fake-host")
        .local_working_dir(dir.join("local"))
        .socket_working_dir(dir.join("sockets"))
        .refresh_read_timeout_ms(5)
}

/// Runner for `config` connected to `host`, after validating `config`.
pub fn fake_runner(host: &FakeHost, config: RunnerConfig) -> RunnerResult<PowershellRunner> {
    validate_config(&config)?;
    let elevation = build_elevation(&config.elevation);
    Ok(PowershellRunner::new(
        config,
        Box::new(host.channel()),
        elevation,
    ))
}
