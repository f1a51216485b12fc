//! [`SecureChannel`] backed by the OpenSSH client.
//!
//! All commands share one multiplexed connection (`ControlMaster=auto`) whose
//! socket lives under the configured socket directory. A pinned host key is
//! written to a private known_hosts file and checked strictly.
//!
//! `ssh` exits with 255 when the connection itself fails. Remote commands run
//! by the runner never exit with 255 (the wrapper exits 0 or 1), so that
//! status marks the channel closed, for blocking and launched commands alike.

use super::{render_command_line, AsyncProcess, ChannelError, CommandOutput, PtyProcess, SecureChannel};
use crate::model::RunnerConfig;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_SSH_PROGRAM: &str = "ssh";
const CONTROL_PERSIST_SECS: u32 = 60;
/// Exit status of the ssh client when the connection fails.
const SSH_CONNECTION_FAILURE: i32 = 255;

pub struct OpenSshChannel {
    program: String,
    hostname: String,
    port: u16,
    user: String,
    identity_file: Option<PathBuf>,
    known_hosts: Option<PathBuf>,
    control_path: PathBuf,
    open: Arc<AtomicBool>,
}

impl OpenSshChannel {
    /// Prepare a channel to the host described by `config`.
    ///
    /// Creates the socket and local working directories, writes the pinned
    /// host key if one is configured, and on first contact forgets any stale
    /// host key recorded for the host.
    ///
    /// # Errors
    /// Returns [`ChannelError::Io`] if a local directory or the known_hosts
    /// file cannot be written.
    pub fn new(config: &RunnerConfig) -> Result<Self, ChannelError> {
        std::fs::create_dir_all(&config.socket_working_dir)
            .map_err(|err| ChannelError::io("failed to create socket dir", err))?;
        std::fs::create_dir_all(&config.local_working_dir)
            .map_err(|err| ChannelError::io("failed to create local working dir", err))?;

        let host_entry = host_entry(&config.hostname, config.ssh_port);
        let known_hosts = match &config.host_public_key {
            Some(key) => {
                let path = config
                    .local_working_dir
                    .join(format!("known_hosts-{}", sanitize(&config.hostname)));
                std::fs::write(&path, format!("{host_entry} {}\n", key.trim()))
                    .map_err(|err| ChannelError::io("failed to write known_hosts", err))?;
                Some(path)
            }
            None => None,
        };

        if config.first_execution && known_hosts.is_none() {
            forget_host_key(&host_entry);
        }

        Ok(Self {
            program: DEFAULT_SSH_PROGRAM.to_string(),
            hostname: config.hostname.clone(),
            port: config.ssh_port,
            user: config.ssh_user.clone(),
            identity_file: config.ssh_identity_file.clone(),
            known_hosts,
            control_path: config.socket_working_dir.join("%C"),
            open: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Use a different ssh client binary.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".to_string(),
            format!("ControlPersist={CONTROL_PERSIST_SECS}"),
            "-p".to_string(),
            self.port.to_string(),
            "-l".to_string(),
            self.user.clone(),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        match &self.known_hosts {
            Some(path) => {
                args.push("-o".to_string());
                args.push(format!("UserKnownHostsFile={}", path.display()));
                args.push("-o".to_string());
                args.push("StrictHostKeyChecking=yes".to_string());
            }
            None => {
                args.push("-o".to_string());
                args.push("StrictHostKeyChecking=accept-new".to_string());
            }
        }
        args
    }

    fn remote_args(&self, command: &str, tty: bool) -> Vec<String> {
        let mut args = self.base_args();
        args.push(tty_flag(tty).to_string());
        args.push(self.hostname.clone());
        args.push(command.to_string());
        args
    }

    fn mark_lost(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            warn!(hostname = %self.hostname, "ssh connection lost");
        }
    }
}

/// A launched remote command, with the channel's open flag.
struct SshProcess {
    inner: PtyProcess,
    open: Arc<AtomicBool>,
    hostname: String,
}

impl AsyncProcess for SshProcess {
    fn started(&self) -> bool {
        self.inner.started()
    }

    fn read_available(&mut self, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        self.inner.read_available(timeout)
    }

    fn try_exit_code(&mut self) -> Result<Option<i32>, ChannelError> {
        match self.inner.try_exit_code()? {
            Some(SSH_CONNECTION_FAILURE) => {
                if self.open.swap(false, Ordering::SeqCst) {
                    warn!(hostname = %self.hostname, "ssh connection lost during run");
                }
                Err(ChannelError::Closed)
            }
            other => Ok(other),
        }
    }

    fn write_input(&mut self, input: &str) -> Result<(), ChannelError> {
        self.inner.write_input(input)
    }

    fn terminate(&mut self, grace: Duration) -> Result<Option<i32>, ChannelError> {
        self.inner.terminate(grace)
    }
}

impl SecureChannel for OpenSshChannel {
    fn execute(&mut self, command: &str, stdin: Option<&str>) -> Result<CommandOutput, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        let args = self.remote_args(command, false);
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ChannelError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .map_err(|err| ChannelError::io("failed to write command stdin", err))?;
            // pipe dropped here so the remote side sees EOF
        }

        let output = child
            .wait_with_output()
            .map_err(|err| ChannelError::io("failed to wait for ssh", err))?;
        if output.status.code() == Some(SSH_CONNECTION_FAILURE) {
            debug!(stderr = %String::from_utf8_lossy(&output.stderr), "ssh failed");
            self.mark_lost();
            return Err(ChannelError::Closed);
        }
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(&mut self, command: &str, tty: bool) -> Result<Box<dyn AsyncProcess>, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        let args = self.remote_args(command, tty);
        debug!(command = %render_command_line(&self.command_line(command, tty)), "spawning ssh");
        let inner = PtyProcess::spawn(&self.program, &args, None)?;
        Ok(Box::new(SshProcess {
            inner,
            open: Arc::clone(&self.open),
            hostname: self.hostname.clone(),
        }))
    }

    fn command_line(&self, command: &str, tty: bool) -> Vec<String> {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.remote_args(command, tty));
        parts
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let status = Command::new(&self.program)
            .args([
                "-o".to_string(),
                format!("ControlPath={}", self.control_path.display()),
                "-O".to_string(),
                "exit".to_string(),
                self.hostname.clone(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(_) => info!(hostname = %self.hostname, "closed ssh connection"),
            Err(err) => warn!(hostname = %self.hostname, error = %err, "failed to stop ssh master"),
        }
        Ok(())
    }
}

fn tty_flag(tty: bool) -> &'static str {
    if tty {
        "-tt"
    } else {
        "-T"
    }
}

fn host_entry(hostname: &str, port: u16) -> String {
    if port == 22 {
        hostname.to_string()
    } else {
        format!("[{hostname}]:{port}")
    }
}

fn sanitize(hostname: &str) -> String {
    hostname
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' { ch } else { '_' })
        .collect()
}

fn forget_host_key(host_entry: &str) {
    let result = Command::new("ssh-keygen")
        .args(["-R", host_entry])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match result {
        Ok(status) if status.success() => debug!(host = %host_entry, "forgot stale host key"),
        Ok(status) => debug!(host = %host_entry, status = ?status.code(), "no stale host key"),
        Err(err) => warn!(host = %host_entry, error = %err, "ssh-keygen unavailable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunnerConfigBuilder;
    use std::path::Path;

    fn channel(dir: &Path, key: Option<&str>, port: u16) -> OpenSshChannel {
        let mut builder = RunnerConfigBuilder::new("win-01")
            .ssh_port(port)
            .local_working_dir(dir.join("local"))
            .socket_working_dir(dir.join("sockets"));
        if let Some(key) = key {
            builder = builder.host_public_key(key);
        }
        OpenSshChannel::new(&builder.build()).unwrap()
    }

    #[test]
    fn command_line_carries_connection_options() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(dir.path(), None, 2222);
        let parts = channel.command_line("Get-Date", false);
        assert_eq!(parts[0], "ssh");
        assert!(parts.contains(&"BatchMode=yes".to_string()));
        assert!(parts.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert!(parts.windows(2).any(|w| w[0] == "-l" && w[1] == "administrator"));
        assert!(parts.contains(&"StrictHostKeyChecking=accept-new".to_string()));
        let tail = &parts[parts.len() - 3..];
        assert_eq!(tail, ["-T", "win-01", "Get-Date"]);
    }

    #[test]
    fn tty_requests_forced_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(dir.path(), None, 22);
        let parts = channel.command_line("x", true);
        assert!(parts.contains(&"-tt".to_string()));
        assert!(!parts.contains(&"-T".to_string()));
    }

    #[test]
    fn pinned_key_is_written_and_checked_strictly() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(dir.path(), Some("ssh-ed25519 AAAAC3Nz"), 2222);
        let known_hosts = dir.path().join("local").join("known_hosts-win-01");
        let contents = std::fs::read_to_string(&known_hosts).unwrap();
        assert_eq!(contents, "[win-01]:2222 ssh-ed25519 AAAAC3Nz\n");
        let parts = channel.command_line("x", false);
        assert!(parts.contains(&"StrictHostKeyChecking=yes".to_string()));
        assert!(parts
            .iter()
            .any(|p| p.starts_with("UserKnownHostsFile=") && p.ends_with("known_hosts-win-01")));
    }

    #[test]
    fn closed_channel_refuses_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = channel(dir.path(), None, 22).with_program("/nonexistent/ssh");
        channel.close().unwrap();
        assert!(!channel.is_open());
        assert!(matches!(channel.execute("x", None), Err(ChannelError::Closed)));
        assert!(matches!(channel.spawn("x", false), Err(ChannelError::Closed)));
    }

    #[test]
    fn missing_client_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = channel(dir.path(), None, 22).with_program("/nonexistent/ssh");
        assert!(matches!(
            channel.execute("x", None),
            Err(ChannelError::Spawn { .. })
        ));
    }

    /// Executable stand-in for the ssh client running `body`.
    #[cfg(unix)]
    fn stub_client(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("ssh-stub");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    #[test]
    fn connection_failure_closes_the_channel() {
        let dir = tempfile::tempdir().unwrap();
        let stub = stub_client(dir.path(), "exit 255");
        let mut channel = channel(dir.path(), None, 22).with_program(stub);
        assert!(matches!(channel.execute("Get-Date", None), Err(ChannelError::Closed)));
        assert!(!channel.is_open());
        assert!(matches!(channel.spawn("Get-Date", false), Err(ChannelError::Closed)));
    }

    #[cfg(unix)]
    #[test]
    fn remote_failure_keeps_the_channel_open() {
        let dir = tempfile::tempdir().unwrap();
        let stub = stub_client(dir.path(), "exit 7");
        let mut channel = channel(dir.path(), None, 22).with_program(stub);
        assert_eq!(channel.execute("Get-Date", None).unwrap().exit_code, 7);
        assert!(channel.is_open());
    }

    #[cfg(unix)]
    #[test]
    fn connection_lost_during_a_launched_command() {
        let dir = tempfile::tempdir().unwrap();
        let stub = stub_client(dir.path(), "exit 255");
        let mut channel = channel(dir.path(), None, 22).with_program(stub);
        // launched before the channel has seen any failure
        let mut process = channel.spawn("Get-Date", false).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let result = loop {
            match process.try_exit_code() {
                Ok(None) if std::time::Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                other => break other,
            }
        };
        assert!(matches!(result, Err(ChannelError::Closed)));
        assert!(!channel.is_open());
    }

    #[cfg(unix)]
    #[test]
    fn runner_reports_a_lost_connection_while_running() {
        use crate::elevation::NoElevation;
        use crate::model::RefreshOutcome;
        use crate::runner::{ErrorCode, PowershellRunner};

        let dir = tempfile::tempdir().unwrap();
        let stub = stub_client(
            dir.path(),
            "case \"$*\" in *\"-File \"*script-wrapper.ps1*) exit 255 ;; esac\ncat >/dev/null\nexit 0",
        );
        let config = RunnerConfigBuilder::new("win-01")
            .script("Get-Date")
            .local_working_dir(dir.path().join("local"))
            .socket_working_dir(dir.path().join("sockets"))
            .refresh_read_timeout_ms(10)
            .build();
        let channel = OpenSshChannel::new(&config).unwrap().with_program(stub);
        let mut runner = PowershellRunner::new(config, Box::new(channel), Box::new(NoElevation));
        runner.start().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let err = loop {
            match runner.refresh() {
                Ok(RefreshOutcome::Progress(_)) => {
                    assert!(std::time::Instant::now() < deadline, "run did not end");
                }
                Ok(other) => panic!("expected a lost connection, got {other:?}"),
                Err(err) => break err,
            }
        };
        assert_eq!(err.code, ErrorCode::ChannelClosed);
        assert_eq!(runner.refresh().unwrap_err().code, ErrorCode::ChannelClosed);
    }

    #[cfg(unix)]
    #[test]
    fn staging_over_a_lost_connection_is_channel_closed() {
        use crate::elevation::NoElevation;
        use crate::runner::{ErrorCode, PowershellRunner};

        let dir = tempfile::tempdir().unwrap();
        let stub = stub_client(dir.path(), "exit 255");
        let config = RunnerConfigBuilder::new("win-01")
            .script("Get-Date")
            .local_working_dir(dir.path().join("local"))
            .socket_working_dir(dir.path().join("sockets"))
            .build();
        let channel = OpenSshChannel::new(&config).unwrap().with_program(stub);
        let mut runner = PowershellRunner::new(config, Box::new(channel), Box::new(NoElevation));
        assert_eq!(runner.prepare_start().unwrap_err().code, ErrorCode::ChannelClosed);
    }

    #[test]
    fn host_entry_brackets_non_default_port() {
        assert_eq!(host_entry("h", 22), "h");
        assert_eq!(host_entry("h", 2200), "[h]:2200");
        assert_eq!(sanitize("a:b/c"), "a_b_c");
    }
}
