//! CLI tests for the `gate` binary.
//!
//! Spawns the binary inside a temporary git repository and checks that
//! decisions map to the stable exit codes.

use std::process::{Command, Output};

use gatekeeper::exit_codes;
use gatekeeper::test_support::TestRepo;

fn gate(repo: &TestRepo, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_gate"))
        .current_dir(repo.path())
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("run gate")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn ticket_of(output: &Output) -> String {
    stdout(output)
        .lines()
        .find_map(|line| line.strip_prefix("ticket: "))
        .expect("ticket line")
        .to_string()
}

fn initialized_repo() -> TestRepo {
    let repo = TestRepo::new().expect("repo");
    assert_eq!(gate(&repo, &["init"]).status.code(), Some(exit_codes::OK));
    repo
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let repo = initialized_repo();
    assert_eq!(gate(&repo, &["init"]).status.code(), Some(exit_codes::INVALID));
    assert_eq!(
        gate(&repo, &["init", "--force"]).status.code(),
        Some(exit_codes::OK)
    );
}

#[test]
fn commands_require_init() {
    let repo = TestRepo::new().expect("repo");
    let output = gate(&repo, &["task", "new", "t1", "--level", "1"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("gate init"));
}

#[test]
fn propose_and_record_exit_codes() {
    let repo = initialized_repo();
    assert_eq!(
        gate(&repo, &["task", "new", "t1", "--level", "2"]).status.code(),
        Some(exit_codes::OK)
    );

    let read = gate(&repo, &["propose", "t1", "git", "status"]);
    assert_eq!(read.status.code(), Some(exit_codes::OK));
    assert!(stdout(&read).starts_with("approved\n"));
    let ticket = ticket_of(&read);

    // the approved ticket must be settled first
    let blocked = gate(&repo, &["propose", "t1", "git", "log"]);
    assert_eq!(blocked.status.code(), Some(exit_codes::INVALID));

    let record = gate(&repo, &["record", &ticket, "--exit-code", "0"]);
    assert_eq!(record.status.code(), Some(exit_codes::OK));

    let push = gate(&repo, &["propose", "t1", "git", "push", "--force"]);
    assert_eq!(push.status.code(), Some(exit_codes::UNAUTHORIZED));
    assert_eq!(stdout(&push).trim(), "denied:unauthorized");
}

#[test]
fn skipped_phase_blocks_writes() {
    let repo = initialized_repo();
    gate(&repo, &["task", "new", "t1", "--level", "3"]);
    assert_eq!(
        gate(&repo, &["run", "t1", "plan"]).status.code(),
        Some(exit_codes::OK)
    );
    assert_eq!(
        gate(&repo, &["advance", "t1", "build"]).status.code(),
        Some(exit_codes::PHASE_VIOLATION)
    );
    let write = gate(&repo, &["propose", "t1", "touch", "x.txt"]);
    assert_eq!(write.status.code(), Some(exit_codes::PHASE_VIOLATION));
    assert!(String::from_utf8_lossy(&write.stderr).contains("complete Creative phase before Build"));

    let status = gate(&repo, &["status", "t1"]);
    assert!(stdout(&status).contains("blocked"));
}

#[test]
fn exec_runs_approved_command_and_reports_it() {
    let repo = initialized_repo();
    gate(&repo, &["task", "new", "t1", "--level", "1"]);

    let exec = gate(&repo, &["exec", "t1", "touch", "made.txt"]);
    assert_eq!(exec.status.code(), Some(exit_codes::OK));
    assert!(repo.path().join("made.txt").exists());

    let report = gate(&repo, &["report", "t1"]);
    assert_eq!(report.status.code(), Some(exit_codes::OK));
    let path = stdout(&report).trim().to_string();
    let markdown = std::fs::read_to_string(&path).expect("report file");
    assert!(markdown.contains("touch made.txt"));
    let _ = std::fs::remove_file(&path);
}

#[test]
fn classify_prints_category() {
    let repo = initialized_repo();
    let classify = |args: &[&str]| {
        let mut full = vec!["classify"];
        full.extend_from_slice(args);
        stdout(&gate(&repo, &full)).trim().to_string()
    };
    assert_eq!(classify(&["git", "push"]), "remote-write");
    assert_eq!(classify(&["gh", "pr", "view", "12"]), "local-read");
    assert_eq!(classify(&["cargo", "fmt"]), "local-write");
    assert_eq!(classify(&["some-new-deploy-tool"]), "remote-write");
}
