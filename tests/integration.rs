//! Integration tests for the divvy CLI.
//!
//! The binary runs the built-in demonstration task, which is enough
//! to drive every end-to-end scenario: clean exhaustion, failure
//! accounting, flapping workers, and signal-driven shutdown.

use std::path::PathBuf;
use std::process::{Child, Command as StdCommand, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::Command;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use predicates::prelude::*;
use tempfile::tempdir;

/// Get a command for the divvy binary.
fn divvy() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("divvy").unwrap()
}

/// Path of the divvy binary, for tests that manage the child process
/// themselves.
fn divvy_bin() -> PathBuf {
    #[allow(deprecated)]
    assert_cmd::cargo::cargo_bin("divvy")
}

fn wait_timeout(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().expect("try_wait") {
            return Some(status);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    let _ = child.kill();
    let _ = child.wait();
    None
}

// ============================================================================
// CLI surface
// ============================================================================

#[test]
fn test_help_displays() {
    divvy()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("--verbose"))
        .stdout(predicate::str::contains("--count"));
}

#[test]
fn test_zero_workers_rejected() {
    divvy().args(["-n", "0", "--count", "1"]).assert().failure();
}

#[test]
fn test_fail_every_zero_rejected() {
    divvy()
        .args(["--count", "1", "--fail-every", "0"])
        .assert()
        .failure();
}

// ============================================================================
// Dispatch runs
// ============================================================================

#[test]
fn test_single_worker_single_item() {
    let dir = tempdir().unwrap();
    let sock = dir.path().join("single.sock");

    divvy()
        .args(["-n", "1", "--count", "1"])
        .arg("--socket")
        .arg(&sock)
        .timeout(Duration::from_secs(30))
        .assert()
        .success()
        .stderr(predicate::str::contains("dispatch complete"))
        .stderr(predicate::str::contains("tasks_distributed=1"));

    assert!(!sock.exists(), "socket file must be unlinked at teardown");
}

#[test]
fn test_failure_accounting() {
    let dir = tempdir().unwrap();
    let sock = dir.path().join("failures.sock");

    divvy()
        .args(["-n", "5", "--count", "10", "--fail-every", "2"])
        .arg("--socket")
        .arg(&sock)
        .timeout(Duration::from_secs(30))
        .assert()
        .success()
        .stderr(predicate::str::contains("tasks_distributed=10"))
        .stderr(predicate::str::contains("failures=5"));

    assert!(!sock.exists());
}

#[test]
fn test_flapping_workers_exit_boot_failure() {
    let dir = tempdir().unwrap();
    let sock = dir.path().join("flap.sock");

    divvy()
        .args(["-n", "1", "--count", "5", "--flap"])
        .arg("--socket")
        .arg(&sock)
        .timeout(Duration::from_secs(30))
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("boot failure"));

    assert!(!sock.exists());
}

// ============================================================================
// Signal-driven shutdown
// ============================================================================

#[test]
fn test_sigint_drains_gracefully() {
    let dir = tempdir().unwrap();
    let sock = dir.path().join("int.sock");

    let mut child = StdCommand::new(divvy_bin())
        .args(["-n", "2", "--count", "0", "--sleep-ms", "10"])
        .arg("--socket")
        .arg(&sock)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn divvy");

    std::thread::sleep(Duration::from_millis(400));
    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).expect("deliver SIGINT");

    let status = wait_timeout(&mut child, Duration::from_secs(10))
        .expect("master must drain and exit after SIGINT");
    assert!(status.success(), "graceful shutdown exits 0: {status:?}");
    assert!(!sock.exists());
}

#[test]
fn test_sigterm_escalates_to_sigkill() {
    let dir = tempdir().unwrap();
    let sock = dir.path().join("term.sock");

    // Each worker sleeps 60 s per item, so only SIGKILL can end them.
    let mut child = StdCommand::new(divvy_bin())
        .args(["-n", "2", "--count", "0", "--sleep-ms", "60000"])
        .arg("--socket")
        .arg(&sock)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn divvy");

    std::thread::sleep(Duration::from_millis(500));
    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).expect("deliver SIGTERM");

    let status = wait_timeout(&mut child, Duration::from_secs(5))
        .expect("forceful shutdown must not wait for sleeping workers");
    assert_eq!(status.code(), Some(3), "forceful shutdown exit code");
    assert!(!sock.exists());
}
