//! In-memory remote host behind the channel traits.
//!
//! [`FakeHost`] interprets the PowerShell commands the runner sends (directory
//! creation, stdin uploads, removals, script execution, `Stop-Process`) against
//! an in-memory file system. Launched commands are served by scripted
//! [`FakeProcess`] values queued with [`FakeHost::push_process`]. When the
//! launched command is a staged wrapper, its pid, output and exit-code
//! statements are carried out against the same file system.

use psrun::channel::{AsyncProcess, ChannelError, CommandOutput, SecureChannel};
use psrun::shell::unescape_powershell;
use psrun::upload::TERMINATOR;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

/// Escaped path token: backtick escapes or anything but separators.
const PATH: &str = r"((?:`.|[^\s`,;)'])+)";

#[allow(clippy::expect_used)]
fn pattern(cell: &'static OnceLock<Regex>, source: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(source).expect("fixture regex is valid"))
}

fn new_item() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, &format!(r"New-Item -ItemType Directory -Path {PATH}"))
}

fn write_all_text() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"\[IO\.File\]::WriteAllText\('((?:[^']|'')*)', \(\$lines")
}

fn stop_process() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(
        &CELL,
        &format!(r"Stop-Process -Id \(Get-Content -LiteralPath {PATH}\)"),
    )
}

fn wrapper_pid() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, &format!(r"\$PID \| Set-Content -LiteralPath {PATH}"))
}

fn wrapper_output() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, &format!(r"Tee-Object -LiteralPath {PATH}"))
}

fn wrapper_exit_rule() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(
        &CELL,
        r"\$exit_code = if \(\$ok -and \$LASTEXITCODE -eq 0\) \{ (\d+) \} else \{ (\d+) \}",
    )
}

fn wrapper_exit_file() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(
        &CELL,
        &format!(r"Set-Content -LiteralPath {PATH} -Value \$exit_code"),
    )
}

/// Process id recorded by wrappers launched on the fake host.
pub const FAKE_PID: &str = "4242";

/// Sentinel statements found in a staged wrapper.
#[derive(Clone, Debug, Default)]
struct WrapperPlan {
    pid: Option<String>,
    output: Option<String>,
    exit_code: Option<(String, String, String)>,
}

impl WrapperPlan {
    fn parse(body: &str) -> Self {
        let path = |re: &Regex| re.captures(body).map(|caps| unescape_powershell(&caps[1]));
        let exit_code = match (wrapper_exit_rule().captures(body), path(wrapper_exit_file())) {
            (Some(rule), Some(file)) => Some((file, rule[1].to_string(), rule[2].to_string())),
            _ => None,
        };
        Self {
            pid: path(wrapper_pid()),
            output: path(wrapper_output()),
            exit_code,
        }
    }
}

fn remove_stale() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(
        &CELL,
        r"Remove-Item -LiteralPath (.+?) -Force -ErrorAction SilentlyContinue",
    )
}

fn remove_item() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, &format!(r"Remove-Item -LiteralPath {PATH}( -Recurse)? -Force"))
}

fn run_file() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, &format!(r"-File {PATH}"))
}

#[derive(Default)]
struct HostState {
    open: bool,
    dirs: BTreeSet<String>,
    files: BTreeMap<String, String>,
    commands: Vec<String>,
    stdin: Vec<Option<String>>,
    spawned: Vec<(String, bool)>,
    inputs: Vec<String>,
    failures: Vec<(String, i32)>,
    probe_exit_code: i32,
    processes: VecDeque<FakeProcess>,
}

fn lock(state: &Mutex<HostState>) -> MutexGuard<'_, HostState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn parent(raw: &str) -> Option<&str> {
    let trimmed = raw.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    let parent = trimmed.get(..idx)?;
    if parent.is_empty() || parent.ends_with(':') {
        return trimmed.get(..=idx);
    }
    Some(parent)
}

fn normalize_dir(raw: &str) -> String {
    if raw.len() > 1 && !raw.ends_with(":/") {
        raw.trim_end_matches('/').to_string()
    } else {
        raw.to_string()
    }
}

impl HostState {
    fn mkdir_all(&mut self, raw: &str) {
        let mut current = Some(normalize_dir(raw));
        while let Some(dir) = current {
            current = parent(&dir).map(normalize_dir);
            self.dirs.insert(dir);
        }
    }

    fn has_dir(&self, raw: &str) -> bool {
        self.dirs.contains(&normalize_dir(raw))
    }

    fn remove(&mut self, raw: &str, recursive: bool) -> bool {
        if self.files.remove(raw).is_some() {
            return true;
        }
        let dir = normalize_dir(raw);
        if !self.dirs.contains(&dir) {
            return false;
        }
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let has_children = self.files.keys().any(|path| path.starts_with(&prefix))
            || self.dirs.iter().any(|path| path.starts_with(&prefix));
        if has_children && !recursive {
            return false;
        }
        self.files.retain(|path, _| !path.starts_with(&prefix));
        self.dirs.retain(|path| !path.starts_with(&prefix));
        self.dirs.remove(&dir);
        true
    }

    fn upload(&mut self, raw: &str, stdin: &str, skip_password: bool) -> i32 {
        if !parent(raw).is_some_and(|dir| self.has_dir(dir)) {
            return 1;
        }
        let mut lines = stdin.split('\n');
        if skip_password {
            lines.next();
        }
        let body: Vec<&str> = lines.take_while(|line| *line != TERMINATOR).collect();
        self.files.insert(raw.to_string(), body.join("\n"));
        0
    }

    fn execute(&mut self, command: &str, stdin: Option<&str>) -> CommandOutput {
        if let Some((_, code)) = self
            .failures
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
        {
            return CommandOutput {
                exit_code: *code,
                ..CommandOutput::default()
            };
        }
        let skip_password = command.contains(" -k -S ");

        if let Some(caps) = write_all_text().captures(command) {
            let raw = caps[1].replace("''", "'");
            let exit_code = self.upload(&raw, stdin.unwrap_or_default(), skip_password);
            return CommandOutput {
                exit_code,
                ..CommandOutput::default()
            };
        }
        if let Some(caps) = new_item().captures(command) {
            let raw = unescape_powershell(&caps[1]);
            self.mkdir_all(&raw);
            return CommandOutput::default();
        }
        if let Some(caps) = stop_process().captures(command) {
            let pid = unescape_powershell(&caps[1]);
            return CommandOutput {
                exit_code: i32::from(!self.files.contains_key(&pid)),
                ..CommandOutput::default()
            };
        }
        if let Some(caps) = remove_stale().captures(command) {
            for path in caps[1].split(", ") {
                self.remove(&unescape_powershell(path), false);
            }
            return CommandOutput::default();
        }
        if let Some(caps) = remove_item().captures(command) {
            let raw = unescape_powershell(&caps[1]);
            let removed = self.remove(&raw, caps.get(2).is_some());
            return CommandOutput {
                exit_code: i32::from(!removed),
                ..CommandOutput::default()
            };
        }
        if let Some(caps) = run_file().captures(command) {
            let raw = unescape_powershell(&caps[1]);
            return match self.files.get(&raw) {
                Some(body) if body.trim() == "echo true" => CommandOutput {
                    exit_code: self.probe_exit_code,
                    stdout: "true\n".to_string(),
                    stderr: String::new(),
                },
                Some(_) => CommandOutput::default(),
                None => CommandOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: format!("The argument '{raw}' to the -File parameter does not exist."),
                },
            };
        }
        CommandOutput::default()
    }
}

/// Handle on the simulated host, shared by every channel it hands out.
#[derive(Clone)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState {
                open: true,
                ..HostState::default()
            })),
        }
    }

    /// A channel connected to this host.
    #[must_use]
    pub fn channel(&self) -> FakeChannel {
        FakeChannel {
            state: Arc::clone(&self.state),
        }
    }

    /// Queue the process served to the next `spawn`.
    pub fn push_process(&self, process: FakeProcess) {
        lock(&self.state).processes.push_back(process);
    }

    /// Make every command containing `needle` exit with `exit_code`.
    pub fn fail_when(&self, needle: impl Into<String>, exit_code: i32) {
        lock(&self.state).failures.push((needle.into(), exit_code));
    }

    /// Place a file at the unescaped path `raw`, creating its directories.
    pub fn put_file(&self, raw: &str, contents: &str) {
        let mut state = lock(&self.state);
        if let Some(dir) = parent(raw) {
            state.mkdir_all(dir);
        }
        state.files.insert(raw.to_string(), contents.to_string());
    }

    pub fn set_probe_exit_code(&self, exit_code: i32) {
        lock(&self.state).probe_exit_code = exit_code;
    }

    /// Tear the connection down, as a dropped network link would.
    pub fn disconnect(&self) {
        lock(&self.state).open = false;
    }

    /// Contents of the file at the unescaped path `raw`.
    #[must_use]
    pub fn file(&self, raw: &str) -> Option<String> {
        lock(&self.state).files.get(raw).cloned()
    }

    #[must_use]
    pub fn has_dir(&self, raw: &str) -> bool {
        lock(&self.state).has_dir(raw)
    }

    /// Unescaped paths of every file on the host.
    #[must_use]
    pub fn files(&self) -> Vec<String> {
        lock(&self.state).files.keys().cloned().collect()
    }

    /// Unescaped paths of every directory on the host.
    #[must_use]
    pub fn dirs(&self) -> Vec<String> {
        lock(&self.state).dirs.iter().cloned().collect()
    }

    /// Blocking commands executed so far, as received.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// Standard input given to each blocking command.
    #[must_use]
    pub fn stdin(&self) -> Vec<Option<String>> {
        lock(&self.state).stdin.clone()
    }

    /// Launched commands with their terminal flag.
    #[must_use]
    pub fn spawned(&self) -> Vec<(String, bool)> {
        lock(&self.state).spawned.clone()
    }

    /// Input written to launched processes.
    #[must_use]
    pub fn inputs(&self) -> Vec<String> {
        lock(&self.state).inputs.clone()
    }
}

/// [`SecureChannel`] served by a [`FakeHost`].
pub struct FakeChannel {
    state: Arc<Mutex<HostState>>,
}

impl SecureChannel for FakeChannel {
    fn execute(&mut self, command: &str, stdin: Option<&str>) -> Result<CommandOutput, ChannelError> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(ChannelError::Closed);
        }
        state.commands.push(command.to_string());
        state.stdin.push(stdin.map(str::to_owned));
        Ok(state.execute(command, stdin))
    }

    fn spawn(&mut self, command: &str, tty: bool) -> Result<Box<dyn AsyncProcess>, ChannelError> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(ChannelError::Closed);
        }
        state.spawned.push((command.to_string(), tty));
        let mut process = state.processes.pop_front().unwrap_or_default();
        process.host = Some(Arc::clone(&self.state));
        process.wrapper = run_file()
            .captures(command)
            .and_then(|caps| state.files.get(&unescape_powershell(&caps[1])).cloned())
            .map(|body| WrapperPlan::parse(&body));
        if let Some(pid) = process.wrapper.as_ref().and_then(|plan| plan.pid.clone()) {
            state.files.insert(pid, FAKE_PID.to_string());
        }
        Ok(Box::new(process))
    }

    fn command_line(&self, command: &str, tty: bool) -> Vec<String> {
        let flag = if tty { "-tt" } else { "-T" };
        vec![
            "fake-ssh".to_string(),
            flag.to_string(),
            "fake-host".to_string(),
            command.to_string(),
        ]
    }

    fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        lock(&self.state).open = false;
        Ok(())
    }
}

/// Scripted launched process.
///
/// Each `read_available` call yields the next queued chunk. The process exits
/// with the configured code once `try_exit_code` has been polled the
/// configured number of times; without an exit it runs until terminated.
/// When a staged wrapper was launched, its pid sentinel is written at launch
/// and its output and exit-code sentinels on exit, following the statements
/// of that wrapper. The configured exit code stands for the script's own.
#[derive(Default)]
pub struct FakeProcess {
    chunks: VecDeque<Vec<u8>>,
    exit_after: Option<(u32, i32)>,
    polls: u32,
    exit_code: Option<i32>,
    output: Vec<u8>,
    host: Option<Arc<Mutex<HostState>>>,
    wrapper: Option<WrapperPlan>,
}

impl FakeProcess {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `text` as the next chunk of output.
    #[must_use]
    pub fn output(mut self, text: &str) -> Self {
        self.chunks.push_back(text.as_bytes().to_vec());
        self
    }

    /// Queue raw bytes as the next chunk of output.
    #[must_use]
    pub fn output_bytes(mut self, bytes: &[u8]) -> Self {
        self.chunks.push_back(bytes.to_vec());
        self
    }

    /// Exit with `exit_code` on the `polls`-th exit check.
    #[must_use]
    pub fn exit_after(mut self, polls: u32, exit_code: i32) -> Self {
        self.exit_after = Some((polls, exit_code));
        self
    }

    /// Never exit on its own.
    #[must_use]
    pub fn never_exit(mut self) -> Self {
        self.exit_after = None;
        self
    }

    fn exit(&mut self, exit_code: i32) {
        self.exit_code = Some(exit_code);
        let (Some(host), Some(plan)) = (&self.host, &self.wrapper) else {
            return;
        };
        let mut state = lock(host);
        if let Some(output) = &plan.output {
            state
                .files
                .insert(output.clone(), String::from_utf8_lossy(&self.output).into_owned());
        }
        if let Some((file, success, failure)) = &plan.exit_code {
            let written = if exit_code == 0 { success } else { failure };
            state.files.insert(file.clone(), written.clone());
        }
    }
}

impl AsyncProcess for FakeProcess {
    fn started(&self) -> bool {
        self.host.is_some()
    }

    fn read_available(&mut self, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        if let Some(chunk) = self.chunks.pop_front() {
            self.output.extend_from_slice(&chunk);
            return Ok(chunk);
        }
        if self.exit_code.is_none() && !timeout.is_zero() {
            std::thread::sleep(timeout);
        }
        Ok(Vec::new())
    }

    fn try_exit_code(&mut self) -> Result<Option<i32>, ChannelError> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        self.polls += 1;
        if let Some((polls, exit_code)) = self.exit_after {
            if self.polls >= polls {
                self.exit(exit_code);
            }
        }
        Ok(self.exit_code)
    }

    fn write_input(&mut self, input: &str) -> Result<(), ChannelError> {
        if let Some(host) = &self.host {
            lock(host).inputs.push(input.to_string());
        }
        Ok(())
    }

    fn terminate(&mut self, _grace: Duration) -> Result<Option<i32>, ChannelError> {
        if self.exit_code.is_none() {
            self.exit_code = Some(143);
        }
        Ok(self.exit_code)
    }
}
