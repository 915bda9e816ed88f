//! Invocation-level behaviour: help, preflight checks and exit codes.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn mprofiler() -> Command {
    Command::new(env!("CARGO_BIN_EXE_mprofiler"))
}

#[test]
fn test_help_exits_zero_with_usage() {
    let dir = TempDir::new().unwrap();
    mprofiler()
        .current_dir(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage"));
    // Help must not touch the filesystem.
    assert!(!dir.path().join("tracedata").exists());
}

#[test]
fn test_no_arguments_fails_preflight() {
    let dir = TempDir::new().unwrap();
    mprofiler()
        .current_dir(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("-p PID"));
    assert!(!dir.path().join("tracedata").exists());
}

#[test]
fn test_missing_target_exits_one() {
    let dir = TempDir::new().unwrap();
    mprofiler()
        .current_dir(dir.path())
        .arg("./definitely-not-a-binary")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not found"));
    assert!(!dir.path().join("tracedata").exists());
}

#[test]
fn test_pid_and_command_are_mutually_exclusive() {
    mprofiler()
        .args(["-p", "1", "/bin/true"])
        .assert()
        .failure();
}

#[test]
fn test_pid_out_of_range_fails_preflight() {
    mprofiler()
        .args(["-p", "-5"])
        .assert()
        .code(255) // exit(-1)
        .stderr(predicate::str::contains("out of range"));
}

#[test]
fn test_bad_extra_pair_fails_preflight() {
    let dir = TempDir::new().unwrap();
    mprofiler()
        .current_dir(dir.path())
        .args(["--extra", "keywithoutvalue", "/bin/true"])
        .assert()
        .code(255)
        .stderr(predicate::str::contains("extra"));
}

#[test]
fn test_unknown_flag_fails() {
    // An unknown option before the command is an argument error, not a
    // target.
    mprofiler().args(["--bogus-option"]).assert().failure();
}
