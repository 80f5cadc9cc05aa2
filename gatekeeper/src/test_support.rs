//! Test-only collaborators: fixed clock, scripted VCS, faulty journals,
//! scripted approvals and throwaway git repositories.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::clock::Clock;
use crate::io::approval::{ApprovalChannel, ApprovalOutcome, ApprovalRequest, Cancellation};
use crate::io::git::{FileChange, Git, HeadRef, Vcs};
use crate::io::journal::Journal;

/// 2026-01-02T03:04:05Z
pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::new(fixed_time())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[derive(Debug, Default)]
struct VcsScript {
    fail_head: bool,
    fail_snapshot: bool,
    fail_anchor: bool,
    fail_changes: bool,
    changes: Vec<FileChange>,
    calls: Vec<String>,
}

/// In-memory [`Vcs`] with switchable failures. Clones share state, so a test
/// can keep a handle after moving one into an engine.
#[derive(Debug, Clone, Default)]
pub struct ScriptedVcs {
    script: Arc<Mutex<VcsScript>>,
}

impl ScriptedVcs {
    pub fn failing_head() -> Self {
        let vcs = Self::default();
        vcs.script.lock().fail_head = true;
        vcs
    }

    pub fn failing_snapshot() -> Self {
        let vcs = Self::default();
        vcs.set_fail_snapshot(true);
        vcs
    }

    pub fn failing_anchor() -> Self {
        let vcs = Self::default();
        vcs.script.lock().fail_anchor = true;
        vcs
    }

    pub fn set_fail_snapshot(&self, fail: bool) {
        self.script.lock().fail_snapshot = fail;
    }

    pub fn set_fail_changes(&self, fail: bool) {
        self.script.lock().fail_changes = fail;
    }

    pub fn set_changes(&self, changes: Vec<FileChange>) {
        self.script.lock().changes = changes;
    }

    /// Calls seen so far (`head`, `snapshot <name>`, `anchor <name> <at>`, ...).
    pub fn calls(&self) -> Vec<String> {
        self.script.lock().calls.clone()
    }

    /// Number of snapshots taken.
    pub fn snapshots(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with("snapshot "))
            .count()
    }
}

impl Vcs for ScriptedVcs {
    fn head(&self) -> Result<HeadRef> {
        let mut script = self.script.lock();
        script.calls.push("head".to_string());
        if script.fail_head {
            return Err(anyhow!("scripted head failure"));
        }
        Ok(HeadRef {
            commit: "1111111111111111111111111111111111111111".to_string(),
            branch: "main".to_string(),
        })
    }

    fn snapshot(&self, name: &str) -> Result<String> {
        let mut script = self.script.lock();
        script.calls.push(format!("snapshot {name}"));
        if script.fail_snapshot {
            return Err(anyhow!("scripted snapshot failure"));
        }
        Ok(format!("snapshot-{}", script.calls.len()))
    }

    fn create_anchor(&self, name: &str, at: &str) -> Result<String> {
        let mut script = self.script.lock();
        script.calls.push(format!("anchor {name} {at}"));
        if script.fail_anchor {
            return Err(anyhow!("scripted anchor failure"));
        }
        Ok(name.to_string())
    }

    fn repo_name(&self) -> Result<String> {
        Ok("demo".to_string())
    }

    fn changes_since(&self, baseline: &str) -> Result<Vec<FileChange>> {
        let mut script = self.script.lock();
        script.calls.push(format!("changes {baseline}"));
        if script.fail_changes {
            return Err(anyhow!("scripted diff failure"));
        }
        Ok(script.changes.clone())
    }

    fn is_ignored(&self, _path: &Path) -> Result<bool> {
        Ok(false)
    }
}

/// Journal whose appends fail while switched on. Clones share the switch.
#[derive(Debug, Clone, Default)]
pub struct FaultyJournal {
    failing: Arc<AtomicBool>,
}

impl FaultyJournal {
    pub fn failing() -> Self {
        let journal = Self::default();
        journal.set_failing(true);
        journal
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl<T> Journal<T> for FaultyJournal {
    fn append(&mut self, _entry: &T) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("disk full"));
        }
        Ok(())
    }
}

/// Approval channel answering from a queue; denies once the queue is empty.
#[derive(Debug, Default)]
pub struct ScriptedApproval {
    answers: Mutex<VecDeque<ApprovalOutcome>>,
    requests: Mutex<Vec<ApprovalRequest>>,
}

impl ScriptedApproval {
    pub fn new(answers: impl IntoIterator<Item = ApprovalOutcome>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ApprovalRequest> {
        self.requests.lock().clone()
    }
}

impl ApprovalChannel for ScriptedApproval {
    fn request(&self, request: &ApprovalRequest, cancel: &Cancellation) -> ApprovalOutcome {
        self.requests.lock().push(request.clone());
        if cancel.is_cancelled() {
            return ApprovalOutcome::Cancelled;
        }
        self.answers
            .lock()
            .pop_front()
            .unwrap_or_else(|| ApprovalOutcome::Denied {
                by: "script".to_string(),
            })
    }
}

/// Throwaway git repository on branch `main` with one commit (`README.md`).
#[derive(Debug)]
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo dir")?;
        let repo = Self { dir };
        repo.capture(&["git", "init", "-q"])?;
        repo.capture(&["git", "symbolic-ref", "HEAD", "refs/heads/main"])?;
        repo.capture(&["git", "config", "user.name", "Gate Test"])?;
        repo.capture(&["git", "config", "user.email", "gate-test@example.com"])?;
        repo.capture(&["git", "config", "commit.gpgsign", "false"])?;
        repo.write_file("README.md", "# demo\n")?;
        repo.capture(&["git", "add", "README.md"])?;
        repo.capture(&["git", "commit", "-q", "-m", "initial"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.path())
    }

    pub fn write_file(&self, rel: &str, contents: &str) -> Result<PathBuf> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Run `args` in the repository and return trimmed stdout.
    pub fn capture(&self, args: &[&str]) -> Result<String> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| anyhow!("capture needs a program"))?;
        let output = Command::new(program)
            .args(rest)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
