//! psrun CLI: run PowerShell scripts on remote Windows hosts.
//!
//! Stages a script over SSH, launches it detached, and polls it to completion.

// CLI-specific lint allowances (CLI binary, not library)
#![allow(missing_docs)]
#![allow(clippy::print_stdout)] // CLI must print to stdout
#![allow(clippy::print_stderr)] // CLI must print to stderr
#![allow(clippy::exit)] // CLI uses exit codes

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use psrun::config::{load_config_file, validate_config, validate_connection};
use psrun::elevation::ElevationKind;
use psrun::model::{EscapedPath, RefreshOutcome, RunnerConfig, RunnerConfigBuilder};
use psrun::runner::{PowershellRunner, RunnerError, RunnerResult};
use psrun::upload::FileMode;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod progress;

use progress::SpinnerProgress;

/// Environment variable read for the elevation password.
const PASSWORD_ENV: &str = "PSRUN_ELEVATION_PASSWORD";
/// Exit status of a run that hit its execution timeout.
const EXIT_TIMED_OUT: i32 = 124;
/// Exit status of a run cancelled with Ctrl-C.
const EXIT_CANCELLED: i32 = 130;

/// Color output mode
#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum ColorMode {
    /// Auto-detect based on terminal and `NO_COLOR` env
    #[default]
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ElevationArg {
    None,
    Sudo,
    Dzdo,
    Su,
}

impl From<ElevationArg> for ElevationKind {
    fn from(arg: ElevationArg) -> Self {
        match arg {
            ElevationArg::None => ElevationKind::None,
            ElevationArg::Sudo => ElevationKind::Sudo,
            ElevationArg::Dzdo => ElevationKind::Dzdo,
            ElevationArg::Su => ElevationKind::Su,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "psrun",
    version,
    about = "Run PowerShell scripts on remote Windows hosts over SSH"
)]
struct Cli {
    /// Control color output
    #[arg(long, value_enum, default_value = "auto", global = true)]
    color: ColorMode,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Log at debug level unless RUST_LOG is set
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where and how to connect. Flags override values from `--config`.
#[derive(Debug, Clone, Default, Args)]
struct ConnectionArgs {
    #[arg(long, help = "Runner configuration file (.json, .yaml or .yml)")]
    config: Option<PathBuf>,
    #[arg(long, help = "Remote host name or address")]
    host: Option<String>,
    #[arg(long, help = "SSH login (default: administrator)")]
    user: Option<String>,
    #[arg(long, help = "SSH port (default: 22)")]
    port: Option<u16>,
    #[arg(long, help = "Client private key")]
    identity: Option<PathBuf>,
    #[arg(long, help = "Pinned host key, '<type> <base64>'")]
    host_key: Option<String>,
    #[arg(long, help = "Remote staging root (default: C:/Windows/Temp)")]
    remote_dir: Option<String>,
    #[arg(long, value_enum, help = "Elevate remote commands")]
    elevation: Option<ElevationArg>,
    #[arg(long, help = "User elevated commands run as (default: root)")]
    effective_user: Option<String>,
    #[arg(long, help = "First contact: forget stale host keys and run preflight")]
    first_execution: bool,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    connection: ConnectionArgs,
    #[arg(long, conflicts_with = "script_file", help = "Inline script body")]
    script: Option<String>,
    #[arg(long, help = "Local file holding the script")]
    script_file: Option<PathBuf>,
    #[arg(long, help = "Seconds before the run is reported as timed out")]
    timeout: Option<u64>,
    #[arg(long, help = "Request a remote terminal")]
    tty: bool,
    #[arg(long, help = "Keep the working directories after the run")]
    keep: bool,
    #[arg(long, help = "On Ctrl-C also stop the remote process")]
    kill_on_cancel: bool,
}

#[derive(Debug, Args)]
struct UploadArgs {
    #[command(flatten)]
    connection: ConnectionArgs,
    #[arg(help = "Local file to upload")]
    local: PathBuf,
    #[arg(help = "Remote destination")]
    remote: String,
    #[arg(
        long,
        default_value = "0555",
        help = "Octal mode; without write bits the file is marked read-only"
    )]
    mode: FileMode,
}

#[derive(Debug, Args)]
struct KillArgs {
    #[command(flatten)]
    connection: ConnectionArgs,
    #[arg(help = "Remote run directory, as reported by `run`")]
    run_dir: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check that scripts can be staged and executed on the host
    Preflight(ConnectionArgs),
    /// Stage a script, run it, and stream its output
    Run(RunArgs),
    /// Upload a local file to the host
    Upload(UploadArgs),
    /// Stop the process of a run by its remote directory
    Kill(KillArgs),
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        #[arg(value_enum, help = "Shell to generate completions for")]
        shell: Shell,
    },
}

/// Configure color output based on CLI flag and environment.
fn configure_colors(mode: ColorMode) -> bool {
    let use_color = match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => {
            if std::env::var("NO_COLOR").is_ok() {
                false
            } else {
                supports_color::on(supports_color::Stream::Stderr).is_some()
            }
        }
    };
    miette::set_hook(Box::new(move |_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .color(use_color)
                .unicode(use_color)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set
    use_color
}

fn init_tracing(verbose: bool, ansi: bool) {
    let default = if verbose { "psrun=debug" } else { "psrun=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(ansi)
        .try_init();
}

fn main() {
    let cli = Cli::parse();
    let use_color = configure_colors(cli.color);
    init_tracing(cli.verbose, use_color);
    let json = cli.json;
    let result = match cli.command {
        Commands::Preflight(connection) => cmd_preflight(json, &connection),
        Commands::Run(args) => cmd_run(json, &args),
        Commands::Upload(args) => cmd_upload(json, &args),
        Commands::Kill(args) => cmd_kill(json, &args),
        Commands::Completions { shell } => {
            cmd_completions(shell);
            Ok(0)
        }
    };
    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(err) => emit_error(json, err),
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration from `--config`, or defaults for `--host`, with flags applied.
fn build_config(args: &ConnectionArgs) -> RunnerResult<RunnerConfig> {
    let mut config = match (&args.config, &args.host) {
        (Some(path), _) => load_config_file(path)?,
        (None, Some(host)) => RunnerConfigBuilder::new(host.clone()).build(),
        (None, None) => {
            return Err(RunnerError::config(
                "either --config or --host is required",
                None,
            ))
        }
    };
    if let Some(host) = &args.host {
        config.hostname = host.clone();
    }
    if let Some(user) = &args.user {
        config.ssh_user = user.clone();
    }
    if let Some(port) = args.port {
        config.ssh_port = port;
    }
    if let Some(identity) = &args.identity {
        config.ssh_identity_file = Some(identity.clone());
    }
    if let Some(key) = &args.host_key {
        config.host_public_key = Some(key.clone());
    }
    if let Some(dir) = &args.remote_dir {
        config.remote_working_dir = EscapedPath::escape(dir);
    }
    if let Some(method) = args.elevation {
        config.elevation.method = method.into();
    }
    if let Some(user) = &args.effective_user {
        config.elevation.effective_user = Some(user.clone());
    }
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        config.elevation.password = Some(password);
    }
    if args.first_execution {
        config.first_execution = true;
    }
    Ok(config)
}

fn apply_run_args(config: &mut RunnerConfig, args: &RunArgs) {
    if let Some(script) = &args.script {
        config.script = Some(script.clone());
        config.script_path = None;
    }
    if let Some(path) = &args.script_file {
        config.script = None;
        config.script_path = Some(path.clone());
    }
    if let Some(secs) = args.timeout {
        config.execution_timeout_interval = Some(secs);
    }
    if args.tty {
        config.tty = true;
    }
    if args.keep {
        config.cleanup_working_dirs = false;
    }
}

fn connect(args: &ConnectionArgs) -> RunnerResult<PowershellRunner> {
    let config = build_config(args)?;
    validate_connection(&config)?;
    PowershellRunner::connect(config)
}

fn close_quietly(runner: &mut PowershellRunner) {
    if let Err(err) = runner.close() {
        warn!(error = %err, "failed to close connection");
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

/// Handle the preflight command.
fn cmd_preflight(json: bool, connection: &ConnectionArgs) -> RunnerResult<i32> {
    let mut runner = connect(connection)?;
    let result = runner.preflight();
    close_quietly(&mut runner);
    result?;
    let hostname = &runner.config().hostname;
    emit_ok(
        json,
        &serde_json::json!({ "status": "ok", "hostname": hostname }),
        &format!("preflight passed: {hostname}"),
    );
    Ok(0)
}

/// Handle the run command.
fn cmd_run(json: bool, args: &RunArgs) -> RunnerResult<i32> {
    let mut config = build_config(&args.connection)?;
    apply_run_args(&mut config, args);
    validate_config(&config)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .map_err(|err| RunnerError::io("failed to install Ctrl-C handler", err))?;

    let progress = SpinnerProgress::new();
    let mut runner = PowershellRunner::connect(config)?;
    if !json {
        runner = runner.with_progress(Box::new(progress.clone()));
    }
    let result = drive_run(
        &mut runner,
        &progress,
        json,
        &interrupted,
        args.kill_on_cancel,
    );
    close_quietly(&mut runner);
    let (outcome, output) = result?;

    if json {
        let payload = serde_json::json!({ "summary": runner.summary(), "output": output });
        println!("{payload}");
    }
    Ok(exit_code_for_outcome(&outcome))
}

/// Start the run and poll it until it is terminal or interrupted.
///
/// In JSON mode output is collected and returned; otherwise it is printed
/// as it arrives.
fn drive_run(
    runner: &mut PowershellRunner,
    progress: &SpinnerProgress,
    json: bool,
    interrupted: &AtomicBool,
    kill_on_cancel: bool,
) -> RunnerResult<(RefreshOutcome, String)> {
    runner.start()?;
    let mut collected = String::new();
    loop {
        if interrupted.load(Ordering::SeqCst) {
            if kill_on_cancel {
                if let Err(err) = runner.kill() {
                    warn!(error = %err, "failed to stop remote process");
                }
            }
            runner.cancel()?;
            return Ok((RefreshOutcome::Cancelled, collected));
        }
        let outcome = runner.refresh()?;
        if json {
            collected.push_str(outcome.output());
        } else {
            progress.print(outcome.output());
        }
        if outcome.is_terminal() {
            return Ok((outcome, collected));
        }
    }
}

/// Handle the upload command.
fn cmd_upload(json: bool, args: &UploadArgs) -> RunnerResult<i32> {
    let data = std::fs::read_to_string(&args.local).map_err(|err| {
        RunnerError::io(format!("failed to read {}", args.local.display()), err)
    })?;
    let destination = EscapedPath::escape(&args.remote);
    let mut runner = connect(&args.connection)?;
    let result = runner.upload(&data, &destination, args.mode);
    close_quietly(&mut runner);
    let written = result?;
    emit_ok(
        json,
        &serde_json::json!({
            "status": "ok",
            "destination": written.to_raw(),
            "mode": args.mode.to_string(),
        }),
        &format!("uploaded {} to {}", args.local.display(), written.to_raw()),
    );
    Ok(0)
}

/// Handle the kill command.
fn cmd_kill(json: bool, args: &KillArgs) -> RunnerResult<i32> {
    let run_dir = EscapedPath::escape(&args.run_dir);
    let mut runner = connect(&args.connection)?;
    let result = runner.kill_run(&run_dir);
    close_quietly(&mut runner);
    result?;
    emit_ok(
        json,
        &serde_json::json!({ "status": "ok", "run_dir": args.run_dir }),
        &format!("stopped run in {}", args.run_dir),
    );
    Ok(0)
}

/// Handle the completions command.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

// =============================================================================
// Output
// =============================================================================

fn emit_ok(json: bool, payload: &serde_json::Value, message: &str) {
    if json {
        println!("{payload}");
    } else {
        eprintln!("{message}");
    }
}

fn emit_error(json: bool, err: RunnerError) -> ! {
    let code = err.exit_code();
    if json {
        println!("{}", serde_json::json!({ "error": err.to_json() }));
    } else {
        eprintln!("{:?}", miette::Report::new(err));
    }
    std::process::exit(code)
}

/// Process exit status for a finished run.
fn exit_code_for_outcome(outcome: &RefreshOutcome) -> i32 {
    match outcome {
        RefreshOutcome::Completed { .. } => 0,
        RefreshOutcome::Failed { exit_code, .. } if *exit_code != 0 => *exit_code,
        RefreshOutcome::TimedOut { .. } => EXIT_TIMED_OUT,
        RefreshOutcome::Cancelled => EXIT_CANCELLED,
        RefreshOutcome::Failed { .. } | RefreshOutcome::Progress(_) => 1,
    }
}
