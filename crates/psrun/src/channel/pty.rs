//! Pseudo-terminal handle for launched commands.
//!
//! The local `ssh` client is spawned on a PTY so that a remote terminal can
//! be requested (`-tt`) and so elevation prompts written to the terminal can
//! be answered through [`AsyncProcess::write_input`].

use super::{AsyncProcess, ChannelError};
#[cfg(unix)]
use nix::fcntl::{fcntl, FcntlArg, OFlag};
#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

/// Wide enough that remote output is not wrapped by the local terminal.
const PTY_COLS: u16 = 240;
const PTY_ROWS: u16 = 48;

/// A local process attached to a pseudo-terminal.
pub struct PtyProcess {
    _master: Box<dyn portable_pty::MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    reader: Box<dyn Read + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    exit_code: Option<i32>,
    eof: bool,
}

impl PtyProcess {
    /// Spawn `program` with `args` on a fresh PTY.
    ///
    /// # Errors
    /// Returns [`ChannelError::Spawn`] if the PTY cannot be opened or the
    /// program cannot be started.
    pub fn spawn(program: &str, args: &[String], cwd: Option<&Path>) -> Result<Self, ChannelError> {
        let spawn_error = |err: &dyn std::fmt::Display| ChannelError::Spawn {
            program: program.to_string(),
            source: std::io::Error::other(err.to_string()),
        };

        let system = native_pty_system();
        let pair = system
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| spawn_error(&err))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        if let Some(cwd) = cwd {
            cmd.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| spawn_error(&err))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| ChannelError::io("failed to clone pty reader", err))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| ChannelError::io("failed to take pty writer", err))?;

        #[cfg(unix)]
        {
            if let Some(fd) = pair.master.as_raw_fd() {
                let flags = OFlag::from_bits_truncate(
                    fcntl(fd, FcntlArg::F_GETFL)
                        .map_err(|err| ChannelError::io("failed to get fd flags", err))?,
                );
                fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
                    .map_err(|err| ChannelError::io("failed to set nonblocking", err))?;
            }
        }

        Ok(Self {
            _master: pair.master,
            writer,
            reader,
            child,
            exit_code: None,
            eof: false,
        })
    }

    /// Poll until the process exits or `timeout` elapses.
    ///
    /// # Errors
    /// Returns [`ChannelError::Io`] if the process status cannot be queried.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> Result<Option<i32>, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = self.try_exit_code()? {
                return Ok(Some(code));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    // Process IDs are always positive and fit in i32
    #[cfg(unix)]
    #[allow(clippy::cast_possible_wrap)]
    fn process_group(&self) -> Option<Pid> {
        self.child.process_id().map(|pid| Pid::from_raw(pid as i32))
    }

    fn cleanup_best_effort(&mut self) {
        if self.exit_code.is_some() {
            return;
        }
        let _ = self.writer.flush();

        #[cfg(unix)]
        if let Some(pgid) = self.process_group() {
            let _ = signal_process_group(pgid, Signal::SIGTERM);
            let deadline = Instant::now() + Duration::from_millis(100);
            while Instant::now() < deadline {
                if self.child.try_wait().ok().flatten().is_some() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            let _ = signal_process_group(pgid, Signal::SIGKILL);
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }
    }
}

impl AsyncProcess for PtyProcess {
    fn started(&self) -> bool {
        true
    }

    fn read_available(&mut self, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        let mut total = Vec::new();
        if self.eof {
            return Ok(total);
        }
        let deadline = Instant::now() + timeout;
        let mut buffer = [0u8; 4096];
        loop {
            match self.reader.read(&mut buffer) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(count) => total.extend_from_slice(buffer.get(..count).unwrap_or_default()),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                // Linux reports a closed slave side as EIO.
                Err(err) if is_eio(&err) => {
                    self.eof = true;
                    break;
                }
                Err(err) => return Err(ChannelError::io("failed to read pty", err)),
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        Ok(total)
    }

    fn try_exit_code(&mut self) -> Result<Option<i32>, ChannelError> {
        if let Some(code) = self.exit_code {
            return Ok(Some(code));
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let code = i32::try_from(status.exit_code()).unwrap_or(i32::MAX);
                self.exit_code = Some(code);
                Ok(Some(code))
            }
            Ok(None) => Ok(None),
            Err(err) => Err(ChannelError::io("failed to wait for child", err)),
        }
    }

    fn write_input(&mut self, input: &str) -> Result<(), ChannelError> {
        self.writer
            .write_all(input.as_bytes())
            .map_err(|err| ChannelError::io("failed to write pty", err))?;
        self.writer
            .flush()
            .map_err(|err| ChannelError::io("failed to flush pty", err))
    }

    fn terminate(&mut self, grace: Duration) -> Result<Option<i32>, ChannelError> {
        if let Some(code) = self.try_exit_code()? {
            return Ok(Some(code));
        }

        #[cfg(unix)]
        if let Some(pgid) = self.process_group() {
            signal_process_group(pgid, Signal::SIGTERM)?;
            if let Some(code) = self.wait_for_exit(grace)? {
                return Ok(Some(code));
            }
            signal_process_group(pgid, Signal::SIGKILL)?;
            return self.wait_for_exit(Duration::from_millis(200));
        }

        self.child
            .kill()
            .map_err(|err| ChannelError::io("failed to kill child", err))?;
        self.wait_for_exit(grace)
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.cleanup_best_effort();
    }
}

#[cfg(unix)]
fn is_eio(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::EIO as i32)
}

#[cfg(not(unix))]
fn is_eio(_err: &std::io::Error) -> bool {
    false
}

#[cfg(unix)]
fn signal_process_group(pgid: Pid, signal: Signal) -> Result<(), ChannelError> {
    match killpg(pgid, signal) {
        // ESRCH means the group is already gone
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(err) => Err(ChannelError::io("failed to signal process group", err)),
    }
}
