// Test module - relaxed lint rules
#![allow(clippy::indexing_slicing)]
#![allow(clippy::panic)]
#![allow(clippy::manual_assert)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(missing_docs)]

//! Run session state machine against a simulated host.

use psrun::elevation::{ElevationKind, NoElevation};
use psrun::model::{EscapedPath, RefreshOutcome, RunState};
use psrun::runner::{CollectingProgress, ErrorCode, PowershellRunner, ProgressEvent};
use psrun_fixtures::{fake_runner, temp_dir, test_config, FakeHost, FakeProcess, FAKE_PID};
use std::time::{Duration, Instant};

fn run_to_end(runner: &mut PowershellRunner) -> (RefreshOutcome, String) {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut output = String::new();
    loop {
        let outcome = runner.refresh().unwrap();
        output.push_str(outcome.output());
        if outcome.is_terminal() {
            return (outcome, output);
        }
        assert!(Instant::now() < deadline, "run did not finish");
    }
}

// =============================================================================
// Completion
// =============================================================================

#[test]
fn echo_hello_completes_with_exit_code_zero() {
    let dir = temp_dir("echo");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().output("hello\r\n").exit_after(2, 0));
    let mut runner = fake_runner(&host, test_config(dir.path()).script("echo hello").build()).unwrap();

    assert!(runner.start().unwrap());
    assert_eq!(runner.state(), RunState::Running);

    let (outcome, output) = run_to_end(&mut runner);
    assert_eq!(outcome.exit_code(), Some(0));
    assert!(matches!(outcome, RefreshOutcome::Completed { .. }));
    assert!(output.contains("hello"));
    assert_eq!(runner.state(), RunState::Completed);
}

#[test]
fn exit_code_sentinel_is_normalized() {
    let dir = temp_dir("sentinel");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().exit_after(1, 0));
    host.push_process(FakeProcess::new().output("boom\n").exit_after(1, 3));
    let config = test_config(dir.path())
        .script("exit 3")
        .cleanup_working_dirs(false)
        .build();
    let mut runner = fake_runner(&host, config).unwrap();

    runner.start().unwrap();
    let (outcome, _) = run_to_end(&mut runner);
    assert!(matches!(outcome, RefreshOutcome::Completed { exit_code: 0, .. }));
    let first = runner.paths().unwrap().clone();
    assert_eq!(host.file(&first.exit_code.to_raw()).as_deref(), Some("0"));

    runner.start().unwrap();
    let (outcome, output) = run_to_end(&mut runner);
    assert!(matches!(outcome, RefreshOutcome::Failed { exit_code: 3, .. }));
    assert_eq!(output, "boom\n");
    assert_eq!(runner.state(), RunState::Failed);
    let second = runner.paths().unwrap().clone();
    assert_ne!(first.dir, second.dir);
    assert_eq!(host.file(&second.exit_code.to_raw()).as_deref(), Some("1"));
    assert_eq!(host.file(&second.output.to_raw()).as_deref(), Some("boom\n"));
}

#[test]
fn terminal_outcome_repeats_without_output() {
    let dir = temp_dir("repeat");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().output("done").exit_after(1, 0));
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();
    runner.start().unwrap();
    run_to_end(&mut runner);

    assert_eq!(
        runner.refresh().unwrap(),
        RefreshOutcome::Completed {
            exit_code: 0,
            output: String::new()
        }
    );
}

#[test]
fn output_split_inside_a_character_is_reassembled() {
    let dir = temp_dir("utf8");
    let host = FakeHost::new();
    host.push_process(
        FakeProcess::new()
            .output_bytes(b"h\xc3")
            .output_bytes(b"\xa9llo")
            .exit_after(3, 0),
    );
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();
    runner.start().unwrap();
    let (_, output) = run_to_end(&mut runner);
    assert_eq!(output, "héllo");
}

// =============================================================================
// Polling
// =============================================================================

#[test]
fn refresh_before_output_reports_progress() {
    let dir = temp_dir("progress");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().never_exit());
    let mut runner = fake_runner(&host, test_config(dir.path()).script("Start-Sleep 10").build()).unwrap();
    runner.start().unwrap();

    assert_eq!(runner.refresh().unwrap(), RefreshOutcome::Progress(String::new()));
    assert_eq!(runner.state(), RunState::Running);
}

#[test]
fn execution_timeout_reports_timed_out_without_exit_code() {
    let dir = temp_dir("timeout");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().never_exit());
    let config = test_config(dir.path())
        .script("Start-Sleep -Seconds 10")
        .execution_timeout_secs(1)
        .build();
    let mut runner = fake_runner(&host, config).unwrap();
    let started = Instant::now();
    runner.start().unwrap();

    let (outcome, _) = run_to_end(&mut runner);
    assert!(matches!(outcome, RefreshOutcome::TimedOut { .. }));
    assert_eq!(outcome.exit_code(), None);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(runner.state(), RunState::TimedOut);
    assert!(!host.commands().iter().any(|c| c.contains("Stop-Process")));
}

#[test]
fn refresh_without_a_run_is_invalid() {
    let dir = temp_dir("idle");
    let host = FakeHost::new();
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();
    assert_eq!(runner.refresh().unwrap_err().code, ErrorCode::InvalidState);
    assert_eq!(runner.run_async("x").unwrap_err().code, ErrorCode::InvalidState);
}

// =============================================================================
// Exclusivity
// =============================================================================

#[test]
fn second_run_async_fails_and_leaves_session_unchanged() {
    let dir = temp_dir("exclusive");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().never_exit());
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();
    runner.start().unwrap();
    let run_id = runner.run_id();

    let err = runner.run_async("Get-Date").unwrap_err();
    assert_eq!(err.code, ErrorCode::AlreadyRunning);
    assert!(err.code.is_fatal());
    assert_eq!(runner.state(), RunState::Running);
    assert_eq!(runner.run_id(), run_id);
    assert_eq!(host.spawned().len(), 1);

    assert_eq!(runner.prepare_start().unwrap_err().code, ErrorCode::AlreadyRunning);
}

// =============================================================================
// Staging
// =============================================================================

#[test]
fn prepare_start_stages_script_and_wrapper() {
    let dir = temp_dir("stage");
    let host = FakeHost::new();
    let mut runner = fake_runner(
        &host,
        test_config(dir.path()).script("Write-Output 'hi'").build(),
    )
    .unwrap();
    runner.prepare_start().unwrap();
    assert_eq!(runner.state(), RunState::Prepared);

    let paths = runner.paths().unwrap().clone();
    assert!(paths.dir.to_raw().starts_with("C:/Windows/Temp/psrun-"));
    assert_eq!(host.file(&paths.script.to_raw()).as_deref(), Some("Write-Output 'hi'"));
    let wrapper = host.file(&paths.wrapper.to_raw()).unwrap();
    assert!(wrapper.contains("Tee-Object -LiteralPath"));
    assert!(wrapper.contains(paths.exit_code.as_str()));
    assert!(host
        .commands()
        .iter()
        .any(|c| c.contains(&format!("(Get-Item -LiteralPath {}).IsReadOnly", paths.wrapper))));

    let local = dir.path().join("local").join(runner.run_id().dir_name());
    assert!(local.join("script.ps1").exists());
    assert!(local.join("script-wrapper.ps1").exists());
}

#[test]
fn remote_working_dir_with_spaces_is_escaped() {
    let dir = temp_dir("spaces");
    let host = FakeHost::new();
    let config = test_config(dir.path())
        .script("x")
        .remote_working_dir("C:/Program Files/psrun work")
        .build();
    let mut runner = fake_runner(&host, config).unwrap();
    runner.prepare_start().unwrap();
    let paths = runner.paths().unwrap().clone();
    assert!(paths.dir.as_str().starts_with("C:/Program` Files/psrun` work/"));
    assert_eq!(host.file(&paths.script.to_raw()).as_deref(), Some("x"));
}

#[test]
fn runner_without_script_fails_only_when_staging() {
    let dir = temp_dir("no-script");
    let host = FakeHost::new();
    let config = test_config(dir.path()).build();
    let mut runner = PowershellRunner::new(config, Box::new(host.channel()), Box::new(NoElevation));

    runner.preflight().unwrap();
    assert_eq!(runner.prepare_start().unwrap_err().code, ErrorCode::Config);
    assert_eq!(runner.state(), RunState::Idle);
}

#[test]
fn failed_wrapper_upload_removes_the_partial_run() {
    let dir = temp_dir("partial");
    let host = FakeHost::new();
    host.fail_when("script-wrapper.ps1", 7);
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();

    let err = runner.prepare_start().unwrap_err();
    assert_eq!(err.code, ErrorCode::Upload);
    assert_eq!(err.exit_code, Some(7));
    assert_eq!(runner.state(), RunState::Idle);
    assert!(runner.paths().is_none());
    assert!(host.files().is_empty());
    assert!(host.dirs().iter().all(|d| !d.contains("psrun-")));
    let local = dir.path().join("local");
    assert!(!local.exists() || std::fs::read_dir(&local).unwrap().next().is_none());
}

#[test]
fn preparing_again_removes_the_previous_run() {
    let dir = temp_dir("restage");
    let host = FakeHost::new();
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();
    runner.prepare_start().unwrap();
    let first = runner.paths().unwrap().dir.to_raw();
    let first_local = dir.path().join("local").join(runner.run_id().dir_name());

    runner.prepare_start().unwrap();
    let second = runner.paths().unwrap().dir.to_raw();
    assert_ne!(first, second);
    assert!(!host.has_dir(&first));
    assert!(!first_local.exists());
    assert!(host.has_dir(&second));

    runner.close().unwrap();
    assert!(!host.has_dir(&second));
}

#[test]
fn directory_failure_carries_exit_code() {
    let dir = temp_dir("mkdir");
    let host = FakeHost::new();
    host.fail_when("New-Item", 4);
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();
    let err = runner.prepare_start().unwrap_err();
    assert_eq!(err.code, ErrorCode::DirectoryCreate);
    assert_eq!(err.exit_code, Some(4));
    assert!(err.message.starts_with("Unable to create directory C:/Windows/Temp/psrun-"));
    assert!(err.message.ends_with("on remote system, exit code: 4"));
    assert_eq!(runner.state(), RunState::Idle);
}

// =============================================================================
// Preflight
// =============================================================================

#[test]
fn preflight_leaves_no_probe_artifacts() {
    let dir = temp_dir("preflight");
    let host = FakeHost::new();
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();

    runner.preflight().unwrap();
    runner.preflight().unwrap();

    assert!(host.files().is_empty());
    assert!(host.dirs().iter().all(|d| !d.contains("psrun-preflight")));
    assert_eq!(
        host.commands()
            .iter()
            .filter(|c| c.contains("-File") && c.contains("probe.ps1"))
            .count(),
        2
    );
    assert_eq!(runner.state(), RunState::Idle);
}

#[test]
fn preflight_failure_reports_probe_exit_code() {
    let dir = temp_dir("preflight-fail");
    let host = FakeHost::new();
    host.set_probe_exit_code(5);
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();

    let err = runner.preflight().unwrap_err();
    assert_eq!(err.code, ErrorCode::Preflight);
    assert_eq!(err.exit_code, Some(5));
    assert_eq!(
        err.message,
        "Failed to execute script on remote machine, exit code: 5."
    );
    assert!(host.files().is_empty());
}

#[test]
fn first_execution_runs_preflight_before_staging() {
    let dir = temp_dir("first");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().exit_after(1, 0));
    let config = test_config(dir.path())
        .script("x")
        .first_execution(true)
        .build();
    let mut runner = fake_runner(&host, config).unwrap();
    runner.start().unwrap();

    let commands = host.commands();
    let probe = commands
        .iter()
        .position(|c| c.contains("psrun-preflight-"))
        .unwrap();
    let stage = commands
        .iter()
        .position(|c| c.contains("script.ps1"))
        .unwrap();
    assert!(probe < stage);
}

// =============================================================================
// Cancellation, kill, channel loss
// =============================================================================

#[test]
fn cancel_stops_polling_locally() {
    let dir = temp_dir("cancel");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().never_exit());
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();
    runner.start().unwrap();

    runner.cancel().unwrap();
    assert_eq!(runner.state(), RunState::Cancelled);
    assert_eq!(runner.refresh().unwrap(), RefreshOutcome::Cancelled);
    assert!(!host.commands().iter().any(|c| c.contains("Stop-Process")));
}

#[test]
fn kill_stops_the_recorded_pid() {
    let dir = temp_dir("kill");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().never_exit());
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();
    runner.start().unwrap();
    let pid = runner.paths().unwrap().pid.clone();

    runner.kill().unwrap();
    assert!(host.commands().iter().any(|c| {
        c == &format!("Stop-Process -Id (Get-Content -LiteralPath {pid}) -Force")
    }));
    let (outcome, _) = run_to_end(&mut runner);
    assert!(matches!(outcome, RefreshOutcome::Failed { .. }));
}

#[test]
fn kill_run_targets_a_previous_run_directory() {
    let dir = temp_dir("kill-run");
    let host = FakeHost::new();
    host.put_file("C:/Windows/Temp/psrun-old/pid", "1234");
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();

    runner
        .kill_run(&EscapedPath::escape("C:/Windows/Temp/psrun-old"))
        .unwrap();
    assert_eq!(
        host.commands(),
        vec!["Stop-Process -Id (Get-Content -LiteralPath C:/Windows/Temp/psrun-old/pid) -Force"
            .to_string()]
    );
    assert_eq!(runner.state(), RunState::Idle);
}

#[test]
fn kill_run_without_a_recorded_pid_fails() {
    let dir = temp_dir("kill-run-missing");
    let host = FakeHost::new();
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();

    let err = runner
        .kill_run(&EscapedPath::escape("C:/Windows/Temp/psrun-gone"))
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::RemoteCommand);
    assert_eq!(err.exit_code, Some(1));
}

#[test]
fn timed_out_run_can_still_be_killed() {
    let dir = temp_dir("timeout-kill");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().never_exit());
    let config = test_config(dir.path())
        .script("Start-Sleep -Seconds 600")
        .execution_timeout_secs(1)
        .build();
    let mut runner = fake_runner(&host, config).unwrap();
    runner.start().unwrap();
    let paths = runner.paths().unwrap().clone();

    let (outcome, _) = run_to_end(&mut runner);
    assert!(matches!(outcome, RefreshOutcome::TimedOut { .. }));
    assert!(host.has_dir(&paths.dir.to_raw()));
    assert_eq!(host.file(&paths.pid.to_raw()).as_deref(), Some(FAKE_PID));

    runner.kill().unwrap();
    assert!(host.commands().iter().any(|c| {
        c == &format!("Stop-Process -Id (Get-Content -LiteralPath {}) -Force", paths.pid)
    }));
    assert!(!host.has_dir(&paths.dir.to_raw()));
    assert_eq!(runner.state(), RunState::TimedOut);
}

#[test]
fn cancelled_run_keeps_its_directory_until_close() {
    let dir = temp_dir("cancel-close");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().never_exit());
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();
    runner.start().unwrap();
    let remote_dir = runner.paths().unwrap().dir.to_raw();

    runner.cancel().unwrap();
    assert!(host.has_dir(&remote_dir));

    runner.close().unwrap();
    assert!(!host.has_dir(&remote_dir));
}

#[test]
fn kill_failure_is_a_remote_command_error() {
    let dir = temp_dir("kill-fail");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().never_exit());
    host.fail_when("Stop-Process", 1);
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();
    runner.start().unwrap();

    let err = runner.kill().unwrap_err();
    assert_eq!(err.code, ErrorCode::RemoteCommand);
    assert_eq!(runner.state(), RunState::Running);
}

#[test]
fn channel_loss_fails_the_run() {
    let dir = temp_dir("closed");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().never_exit());
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();
    runner.start().unwrap();

    host.disconnect();
    assert_eq!(runner.refresh().unwrap_err().code, ErrorCode::ChannelClosed);
    assert_eq!(runner.state(), RunState::Failed);
    assert_eq!(runner.refresh().unwrap_err().code, ErrorCode::ChannelClosed);
}

// =============================================================================
// Cleanup
// =============================================================================

#[test]
fn terminal_state_removes_working_dirs() {
    let dir = temp_dir("cleanup");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().exit_after(1, 0));
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();
    runner.start().unwrap();
    let remote_dir = runner.paths().unwrap().dir.to_raw();
    let local_dir = dir.path().join("local").join(runner.run_id().dir_name());
    assert!(host.has_dir(&remote_dir));
    assert!(local_dir.exists());

    run_to_end(&mut runner);
    assert!(!host.has_dir(&remote_dir));
    assert!(!local_dir.exists());
}

#[test]
fn cleanup_failure_does_not_fail_the_run() {
    let dir = temp_dir("cleanup-fail");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().exit_after(1, 0));
    host.fail_when("-Recurse", 2);
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();
    runner.start().unwrap();
    let (outcome, _) = run_to_end(&mut runner);
    assert!(matches!(outcome, RefreshOutcome::Completed { .. }));
}

#[test]
fn close_cleans_a_prepared_run_and_closes_the_channel() {
    let dir = temp_dir("close");
    let host = FakeHost::new();
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();
    runner.prepare_start().unwrap();
    let remote_dir = runner.paths().unwrap().dir.to_raw();

    runner.close().unwrap();
    assert!(!host.has_dir(&remote_dir));
    assert_eq!(runner.prepare_start().unwrap_err().code, ErrorCode::ChannelClosed);
}

// =============================================================================
// Elevation
// =============================================================================

#[test]
fn sudo_prompt_is_answered_and_hidden() {
    let dir = temp_dir("sudo");
    let host = FakeHost::new();
    host.push_process(
        FakeProcess::new()
            .output("[psrun-elevation] password: ")
            .output("hello\n")
            .exit_after(3, 0),
    );
    let config = test_config(dir.path())
        .script("echo hello")
        .elevation(ElevationKind::Sudo, None, Some("pw".to_string()))
        .build();
    let mut runner = fake_runner(&host, config).unwrap();
    runner.start().unwrap();

    let (_, output) = run_to_end(&mut runner);
    assert_eq!(host.inputs(), vec!["pw\n".to_string()]);
    assert!(!output.contains("password"));
    assert!(output.contains("hello"));
    assert!(host.spawned()[0].0.starts_with("sudo -k -S"));
    assert!(host
        .stdin()
        .iter()
        .flatten()
        .all(|stdin| stdin.starts_with("pw\n")));
}

#[test]
fn su_wraps_a_single_line_wrapper() {
    let dir = temp_dir("su");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().exit_after(1, 0));
    let config = test_config(dir.path())
        .script("x")
        .cleanup_working_dirs(false)
        .tty(true)
        .elevation(ElevationKind::Su, None, None)
        .build();
    let mut runner = fake_runner(&host, config).unwrap();
    runner.start().unwrap();

    let wrapper = host.file(&runner.paths().unwrap().wrapper.to_raw()).unwrap();
    assert_eq!(wrapper.lines().count(), 1);
    let (command, tty) = host.spawned()[0].clone();
    assert!(command.starts_with("su - root -c 'powershell.exe"));
    assert!(tty);
}

// =============================================================================
// Reporting
// =============================================================================

#[test]
fn progress_events_follow_the_lifecycle() {
    let dir = temp_dir("events");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().exit_after(1, 0));
    let progress = CollectingProgress::new();
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build())
        .unwrap()
        .with_progress(Box::new(progress.clone()));
    runner.start().unwrap();
    run_to_end(&mut runner);

    let events = progress.events();
    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], ProgressEvent::Staged { .. }));
    assert!(matches!(events[1], ProgressEvent::Started { .. }));
    assert!(matches!(
        events[2],
        ProgressEvent::Finished {
            state: RunState::Completed,
            exit_code: Some(0),
            ..
        }
    ));
}

#[test]
fn summary_reports_the_finished_run() {
    let dir = temp_dir("summary");
    let host = FakeHost::new();
    host.push_process(FakeProcess::new().output("hello\n").exit_after(2, 0));
    let mut runner = fake_runner(&host, test_config(dir.path()).script("x").build()).unwrap();
    runner.start().unwrap();
    run_to_end(&mut runner);

    let summary = runner.summary();
    assert_eq!(summary.hostname, "fake-host");
    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.exit_code, Some(0));
    assert_eq!(summary.output_bytes, 6);
    assert!(summary.started_at_ms.is_some());
    assert!(summary.ended_at_ms >= summary.started_at_ms);
    assert!(summary.remote_dir.unwrap().contains("psrun-"));
}
