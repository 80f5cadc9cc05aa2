//! Version-control collaborator.
//!
//! The gate only needs a handful of VCS capabilities (baseline ref, full
//! working-state snapshot, rollback anchor, net changes) so they sit behind the
//! [`Vcs`] trait. [`Git`] implements it with small, explicit `git` subprocess
//! calls.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandOutput, run_bounded};

const OUTPUT_LIMIT_BYTES: usize = 4_000_000;
const SNAPSHOT_IDENTITY: [&str; 4] = [
    "-c",
    "user.name=gatekeeper",
    "-c",
    "user.email=gatekeeper@localhost",
];

/// Current baseline of the working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadRef {
    pub commit: String,
    /// Branch name, or `detached` for a detached HEAD.
    pub branch: String,
}

/// One net change relative to a baseline.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FileChange {
    /// `A`, `M`, `D`, `R`, ... or `??` for untracked.
    pub status: String,
    pub path: String,
}

/// Capabilities the gate consumes from version control.
pub trait Vcs {
    /// Current HEAD commit and branch name.
    fn head(&self) -> Result<HeadRef>;
    /// Snapshot the full working state (untracked files included) under `name`.
    /// Returns the snapshot ref. Must not modify the working tree.
    fn snapshot(&self, name: &str) -> Result<String>;
    /// Create a named anchor at `at`. Returns the anchor's ref name.
    fn create_anchor(&self, name: &str, at: &str) -> Result<String>;
    fn repo_name(&self) -> Result<String>;
    /// Net changes of the working state relative to `baseline`.
    fn changes_since(&self, baseline: &str) -> Result<Vec<FileChange>>;
    fn is_ignored(&self, path: &Path) -> Result<bool>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
    include_untracked: bool,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: Duration::from_secs(60),
            include_untracked: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_untracked(mut self, include_untracked: bool) -> Self {
        self.include_untracked = include_untracked;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<FileChange>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"], &[])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    fn git_path(&self, name: &str) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--git-path", name], &[])?;
        let path = PathBuf::from(out.trim());
        Ok(if path.is_absolute() {
            path
        } else {
            self.workdir.join(path)
        })
    }

    fn run_capture(&self, args: &[&str], envs: &[(&str, &Path)]) -> Result<String> {
        let output = self.run_checked(args, envs)?;
        Ok(output.stdout_text())
    }

    fn run_checked(&self, args: &[&str], envs: &[(&str, &Path)]) -> Result<CommandOutput> {
        let output = self.run(args, envs)?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {:?}",
                args.join(" "),
                self.timeout
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr_text()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str], envs: &[(&str, &Path)]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        for (key, value) in envs {
            cmd.env(key, value);
        }
        run_bounded(cmd, self.timeout, OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl Vcs for Git {
    #[instrument(skip_all)]
    fn head(&self) -> Result<HeadRef> {
        let commit = self
            .run_capture(&["rev-parse", "--verify", "HEAD"], &[])?
            .trim()
            .to_string();
        let name = self
            .run_capture(&["rev-parse", "--abbrev-ref", "HEAD"], &[])?
            .trim()
            .to_string();
        let branch = if name == "HEAD" {
            warn!("detached HEAD detected");
            "detached".to_string()
        } else {
            name
        };
        debug!(commit = %commit, branch = %branch, "captured head");
        Ok(HeadRef { commit, branch })
    }

    /// Commit the working state through a throwaway index so neither the
    /// worktree nor the real index is touched, then pin it under
    /// `refs/gate/snapshots/<name>`.
    #[instrument(skip_all, fields(name = %name))]
    fn snapshot(&self, name: &str) -> Result<String> {
        let index_path = self.git_path("gate-snapshot-index")?;
        let index = index_path.as_path();
        let result = (|| -> Result<String> {
            self.run_checked(&["read-tree", "HEAD"], &[("GIT_INDEX_FILE", index)])?;
            let add_mode = if self.include_untracked { "-A" } else { "-u" };
            self.run_checked(&["add", add_mode, "--", "."], &[("GIT_INDEX_FILE", index)])?;
            let tree = self
                .run_capture(&["write-tree"], &[("GIT_INDEX_FILE", index)])?
                .trim()
                .to_string();
            let message = format!("gate snapshot {name}");
            let mut args: Vec<&str> = SNAPSHOT_IDENTITY.to_vec();
            args.extend(["commit-tree", tree.as_str(), "-p", "HEAD", "-m", message.as_str()]);
            let commit = self.run_capture(&args, &[])?.trim().to_string();
            let refname = format!("refs/gate/snapshots/{name}");
            self.run_checked(&["update-ref", &refname, &commit], &[])?;
            debug!(refname = %refname, commit = %commit, "snapshot stored");
            Ok(commit)
        })();
        if index_path.exists()
            && let Err(err) = std::fs::remove_file(&index_path)
        {
            warn!(err = %err, path = %index_path.display(), "failed to remove snapshot index");
        }
        result
    }

    #[instrument(skip_all, fields(name = %name))]
    fn create_anchor(&self, name: &str, at: &str) -> Result<String> {
        self.run_checked(&["branch", name, at], &[])?;
        debug!(anchor = name, at, "rollback anchor created");
        Ok(name.to_string())
    }

    fn repo_name(&self) -> Result<String> {
        let top = self.run_capture(&["rev-parse", "--show-toplevel"], &[])?;
        Path::new(top.trim())
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("cannot derive repository name from '{}'", top.trim()))
    }

    fn changes_since(&self, baseline: &str) -> Result<Vec<FileChange>> {
        let diff = self.run_capture(&["diff", "--name-status", "-M", baseline], &[])?;
        let mut changes = Vec::new();
        for line in diff.lines() {
            let mut parts = line.split('\t');
            let (Some(status), Some(first)) = (parts.next(), parts.next()) else {
                continue;
            };
            let path = parts.next().unwrap_or(first);
            changes.push(FileChange {
                status: status.chars().take(1).collect(),
                path: path.to_string(),
            });
        }
        for entry in self.status_porcelain()? {
            if entry.status == "??" {
                changes.push(entry);
            }
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        changes.dedup();
        Ok(changes)
    }

    fn is_ignored(&self, path: &Path) -> Result<bool> {
        let arg = path.to_string_lossy().to_string();
        let output = self.run(&["check-ignore", "-q", &arg], &[])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!("git check-ignore failed: {}", output.stderr_text())),
        }
    }
}

fn parse_status_line(line: &str) -> Result<FileChange> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(FileChange {
            status: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let status = line[..2].trim().to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(FileChange { status, path })
}
