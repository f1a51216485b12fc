use crate::elevation::ElevationKind;
use crate::model::EscapedPath;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default SSH login for Windows hosts.
pub const DEFAULT_SSH_USER: &str = "administrator";
/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default remote staging root, before escaping.
pub const DEFAULT_REMOTE_WORKING_DIR: &str = "C:/Windows/Temp";
/// Default bound on a single output read during `refresh`.
pub const DEFAULT_REFRESH_READ_TIMEOUT_MS: u64 = 50;

fn default_ssh_user() -> String {
    DEFAULT_SSH_USER.to_string()
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_local_working_dir() -> PathBuf {
    std::env::temp_dir().join("psrun")
}

fn default_remote_working_dir() -> EscapedPath {
    EscapedPath::escape(DEFAULT_REMOTE_WORKING_DIR)
}

fn default_socket_working_dir() -> PathBuf {
    std::env::temp_dir().join("psrun-sockets")
}

fn default_true() -> bool {
    true
}

fn default_refresh_read_timeout_ms() -> u64 {
    DEFAULT_REFRESH_READ_TIMEOUT_MS
}

/// How commands get elevated on the remote host.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ElevationConfig {
    /// Elevation variant.
    #[serde(default)]
    pub method: ElevationKind,
    /// User the elevated command runs as. Defaults to the variant's choice.
    #[serde(default)]
    pub effective_user: Option<String>,
    /// Password answered to the elevation prompt, if one is expected.
    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for ElevationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElevationConfig")
            .field("method", &self.method)
            .field("effective_user", &self.effective_user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Options recognized by the runner.
///
/// `remote_working_dir` is taken as already escaped for the remote shell;
/// its default is escaped when it is produced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Host to connect to.
    pub hostname: String,
    /// Script body to run.
    #[serde(default)]
    pub script: Option<String>,
    /// Local file holding the script body, used when `script` is absent.
    #[serde(default)]
    pub script_path: Option<PathBuf>,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// Pinned host key (`<type> <base64>`), written to a private known_hosts file.
    #[serde(default)]
    pub host_public_key: Option<String>,
    /// Client private key passed to ssh with `-i`.
    #[serde(default)]
    pub ssh_identity_file: Option<PathBuf>,
    /// Seconds a run may stay in `Running` before it is reported as timed out.
    #[serde(default)]
    pub execution_timeout_interval: Option<u64>,
    #[serde(default = "default_local_working_dir")]
    pub local_working_dir: PathBuf,
    #[serde(default = "default_remote_working_dir")]
    pub remote_working_dir: EscapedPath,
    /// Directory holding the ssh control sockets.
    #[serde(default = "default_socket_working_dir")]
    pub socket_working_dir: PathBuf,
    /// Remove the run's working directories once it reaches a terminal state.
    #[serde(default = "default_true")]
    pub cleanup_working_dirs: bool,
    /// First contact with this host: forget stale host keys and run preflight.
    #[serde(default)]
    pub first_execution: bool,
    /// Ask the channel for a remote terminal when launching the script.
    #[serde(default)]
    pub tty: bool,
    #[serde(default = "default_refresh_read_timeout_ms")]
    pub refresh_read_timeout_ms: u64,
    #[serde(default)]
    pub elevation: ElevationConfig,
}

impl RunnerConfig {
    /// Execution timeout, if configured.
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_interval.map(Duration::from_secs)
    }

    /// Bound on a single output read during `refresh`.
    pub fn refresh_read_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_read_timeout_ms)
    }
}

// =============================================================================
// RunnerConfigBuilder
// =============================================================================

/// Fluent builder for [`RunnerConfig`].
///
/// # Example
///
/// ```
/// use psrun::model::RunnerConfigBuilder;
///
/// let config = RunnerConfigBuilder::new("win-01.example.com")
///     .script("Get-Service")
///     .execution_timeout_secs(600)
///     .build();
/// assert_eq!(config.ssh_user, "administrator");
/// assert_eq!(config.ssh_port, 22);
/// ```
#[derive(Debug, Clone)]
pub struct RunnerConfigBuilder {
    config: RunnerConfig,
}

impl RunnerConfigBuilder {
    /// Start from the defaults for `hostname`.
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            config: RunnerConfig {
                hostname: hostname.into(),
                script: None,
                script_path: None,
                ssh_user: default_ssh_user(),
                ssh_port: default_ssh_port(),
                host_public_key: None,
                ssh_identity_file: None,
                execution_timeout_interval: None,
                local_working_dir: default_local_working_dir(),
                remote_working_dir: default_remote_working_dir(),
                socket_working_dir: default_socket_working_dir(),
                cleanup_working_dirs: true,
                first_execution: false,
                tty: false,
                refresh_read_timeout_ms: DEFAULT_REFRESH_READ_TIMEOUT_MS,
                elevation: ElevationConfig::default(),
            },
        }
    }

    #[must_use]
    pub fn script(mut self, script: impl Into<String>) -> Self {
        self.config.script = Some(script.into());
        self
    }

    #[must_use]
    pub fn script_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.script_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn ssh_user(mut self, user: impl Into<String>) -> Self {
        self.config.ssh_user = user.into();
        self
    }

    #[must_use]
    pub fn ssh_port(mut self, port: u16) -> Self {
        self.config.ssh_port = port;
        self
    }

    #[must_use]
    pub fn host_public_key(mut self, key: impl Into<String>) -> Self {
        self.config.host_public_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn ssh_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ssh_identity_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn execution_timeout_secs(mut self, secs: u64) -> Self {
        self.config.execution_timeout_interval = Some(secs);
        self
    }

    #[must_use]
    pub fn local_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.local_working_dir = dir.into();
        self
    }

    /// Set the remote staging root from a raw path; it is escaped here.
    #[must_use]
    pub fn remote_working_dir(mut self, raw: &str) -> Self {
        self.config.remote_working_dir = EscapedPath::escape(raw);
        self
    }

    #[must_use]
    pub fn socket_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.socket_working_dir = dir.into();
        self
    }

    #[must_use]
    pub fn cleanup_working_dirs(mut self, cleanup: bool) -> Self {
        self.config.cleanup_working_dirs = cleanup;
        self
    }

    #[must_use]
    pub fn first_execution(mut self, first: bool) -> Self {
        self.config.first_execution = first;
        self
    }

    #[must_use]
    pub fn tty(mut self, tty: bool) -> Self {
        self.config.tty = tty;
        self
    }

    #[must_use]
    pub fn refresh_read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.refresh_read_timeout_ms = ms;
        self
    }

    #[must_use]
    pub fn elevation(
        mut self,
        method: ElevationKind,
        effective_user: Option<String>,
        password: Option<String>,
    ) -> Self {
        self.config.elevation = ElevationConfig {
            method,
            effective_user,
            password,
        };
        self
    }

    #[must_use]
    pub fn build(self) -> RunnerConfig {
        self.config
    }
}
