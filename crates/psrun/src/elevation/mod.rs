//! Elevation strategies.
//!
//! An [`ElevationMethod`] turns a remote command into one that runs with
//! elevated privileges. Callers select behavior on [`ElevationMethod::kind`],
//! never on the concrete type, so new variants only need a new tag.

use crate::model::ElevationConfig;
use crate::shell::{escape_powershell, quote_powershell};
use serde::{Deserialize, Serialize};
use std::fmt;

/// User elevated commands run as when none is configured.
pub const DEFAULT_EFFECTIVE_USER: &str = "root";

/// Prompt passed to sudo-like tools so it can be recognized in the output.
pub const ELEVATION_PROMPT: &str = "[psrun-elevation] password: ";

/// Prompt printed by `su`.
pub const SU_PROMPT: &str = "Password:";

/// Identity tag of an elevation variant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElevationKind {
    /// Commands run as the login user.
    #[default]
    None,
    Sudo,
    Dzdo,
    /// Switch-user. The whole command is handed over as one string.
    Su,
}

impl ElevationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ElevationKind::None => "none",
            ElevationKind::Sudo => "sudo",
            ElevationKind::Dzdo => "dzdo",
            ElevationKind::Su => "su",
        }
    }
}

impl fmt::Display for ElevationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability that elevates remote commands.
pub trait ElevationMethod: Send {
    /// Variant tag, used to pick command syntax.
    fn kind(&self) -> ElevationKind;

    /// Clear per-run state before a new run starts.
    fn reset(&mut self);

    /// Wrap `command` so it runs elevated.
    fn wrap(&self, command: &str) -> String;

    /// Prompt text this method prints when it wants a password.
    fn prompt(&self) -> Option<&str> {
        None
    }

    /// Inspect output of a running command. Returns input to send back to
    /// the process when a password prompt shows up.
    fn on_output(&mut self, _output: &str) -> Option<String> {
        None
    }

    /// Standard input for a blocking command wrapped by this method.
    fn sync_input(&self, stdin: Option<&str>) -> Option<String> {
        stdin.map(str::to_owned)
    }
}

/// Commands run unchanged.
#[derive(Debug, Default, Clone)]
pub struct NoElevation;

impl ElevationMethod for NoElevation {
    fn kind(&self) -> ElevationKind {
        ElevationKind::None
    }

    fn reset(&mut self) {}

    fn wrap(&self, command: &str) -> String {
        command.to_string()
    }
}

/// `sudo` and the sudo-compatible `dzdo`.
///
/// With a password configured the credential cache is bypassed (`-k`) so the
/// prompt always appears and the password is always consumed from stdin.
pub struct SudoElevation {
    kind: ElevationKind,
    effective_user: String,
    password: Option<String>,
    password_sent: bool,
}

impl SudoElevation {
    pub fn sudo(effective_user: impl Into<String>, password: Option<String>) -> Self {
        Self {
            kind: ElevationKind::Sudo,
            effective_user: effective_user.into(),
            password,
            password_sent: false,
        }
    }

    pub fn dzdo(effective_user: impl Into<String>, password: Option<String>) -> Self {
        Self {
            kind: ElevationKind::Dzdo,
            ..Self::sudo(effective_user, password)
        }
    }

    fn program(&self) -> &'static str {
        match self.kind {
            ElevationKind::Dzdo => "dzdo",
            _ => "sudo",
        }
    }
}

impl ElevationMethod for SudoElevation {
    fn kind(&self) -> ElevationKind {
        self.kind
    }

    fn reset(&mut self) {
        self.password_sent = false;
    }

    fn wrap(&self, command: &str) -> String {
        let cache_flag = if self.password.is_some() { " -k" } else { "" };
        format!(
            "{}{cache_flag} -S -p {} -u {} -- {command}",
            self.program(),
            quote_powershell(ELEVATION_PROMPT),
            escape_powershell(&self.effective_user),
        )
    }

    fn prompt(&self) -> Option<&str> {
        Some(ELEVATION_PROMPT)
    }

    fn on_output(&mut self, output: &str) -> Option<String> {
        answer_prompt(
            output,
            ELEVATION_PROMPT,
            self.password.as_deref(),
            &mut self.password_sent,
        )
    }

    fn sync_input(&self, stdin: Option<&str>) -> Option<String> {
        match (&self.password, stdin) {
            (Some(password), Some(stdin)) => Some(format!("{password}\n{stdin}")),
            (Some(password), None) => Some(format!("{password}\n")),
            (None, stdin) => stdin.map(str::to_owned),
        }
    }
}

impl fmt::Debug for SudoElevation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SudoElevation")
            .field("kind", &self.kind)
            .field("effective_user", &self.effective_user)
            .field("password_sent", &self.password_sent)
            .finish_non_exhaustive()
    }
}

/// `su - <user> -c '<command>'`.
///
/// su reads its password from the terminal, so the password can only be
/// answered on a running command with a terminal allocated.
pub struct SuElevation {
    effective_user: String,
    password: Option<String>,
    password_sent: bool,
}

impl SuElevation {
    pub fn new(effective_user: impl Into<String>, password: Option<String>) -> Self {
        Self {
            effective_user: effective_user.into(),
            password,
            password_sent: false,
        }
    }
}

impl ElevationMethod for SuElevation {
    fn kind(&self) -> ElevationKind {
        ElevationKind::Su
    }

    fn reset(&mut self) {
        self.password_sent = false;
    }

    fn wrap(&self, command: &str) -> String {
        format!(
            "su - {} -c {}",
            escape_powershell(&self.effective_user),
            quote_powershell(command)
        )
    }

    fn prompt(&self) -> Option<&str> {
        Some(SU_PROMPT)
    }

    fn on_output(&mut self, output: &str) -> Option<String> {
        answer_prompt(
            output,
            SU_PROMPT,
            self.password.as_deref(),
            &mut self.password_sent,
        )
    }
}

impl fmt::Debug for SuElevation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuElevation")
            .field("effective_user", &self.effective_user)
            .field("password_sent", &self.password_sent)
            .finish_non_exhaustive()
    }
}

fn answer_prompt(
    output: &str,
    prompt: &str,
    password: Option<&str>,
    sent: &mut bool,
) -> Option<String> {
    let password = password?;
    if *sent || !output.contains(prompt) {
        return None;
    }
    *sent = true;
    Some(format!("{password}\n"))
}

/// Build the elevation method described by `config`.
pub fn build_elevation(config: &ElevationConfig) -> Box<dyn ElevationMethod> {
    let user = config
        .effective_user
        .clone()
        .unwrap_or_else(|| DEFAULT_EFFECTIVE_USER.to_string());
    let password = config.password.clone();
    match config.method {
        ElevationKind::None => Box::new(NoElevation),
        ElevationKind::Sudo => Box::new(SudoElevation::sudo(user, password)),
        ElevationKind::Dzdo => Box::new(SudoElevation::dzdo(user, password)),
        ElevationKind::Su => Box::new(SuElevation::new(user, password)),
    }
}
