//! Where rendered reports are written.
//!
//! A project-local extras directory is used only when it exists and version
//! control ignores it; otherwise reports go to the shared temp directory.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::core::ids::sanitize_component;
use crate::io::fsutil::write_atomic;
use crate::io::git::Vcs;

/// Pick the report directory for a project rooted at `root`.
pub fn report_dir<V: Vcs + ?Sized>(root: &Path, extras_dir: &str, vcs: &V) -> PathBuf {
    let extras = root.join(extras_dir);
    if extras.is_dir() {
        match vcs.is_ignored(Path::new(extras_dir)) {
            Ok(true) => return extras,
            Ok(false) => {
                debug!(dir = %extras.display(), "extras dir is tracked, using temp dir");
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "cannot check extras dir, using temp dir");
            }
        }
    }
    std::env::temp_dir()
}

/// `gate-report_<repo>_<branch>_<timestamp>.md`
pub fn report_file_name(repo: &str, branch: &str, at: DateTime<Utc>) -> String {
    format!(
        "gate-report_{}_{}_{}.md",
        sanitize_component(repo),
        sanitize_component(branch),
        at.format("%Y%m%dT%H%M%SZ")
    )
}

pub fn write_report(dir: &Path, file_name: &str, contents: &str) -> Result<PathBuf> {
    let path = dir.join(file_name);
    write_atomic(&path, contents)?;
    debug!(path = %path.display(), "report written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;
    use chrono::TimeZone;
    use std::fs;

    #[test]
    fn file_name_embeds_repo_branch_and_timestamp() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(
            report_file_name("my repo", "feature/gate", at),
            "gate-report_my-repo_feature-gate_20260304T050607Z.md"
        );
    }

    #[test]
    fn uses_extras_dir_only_when_ignored() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let extras = repo.path().join(".extras");

        assert_eq!(report_dir(repo.path(), ".extras", &git), std::env::temp_dir());

        fs::create_dir_all(&extras).expect("mkdir");
        assert_eq!(report_dir(repo.path(), ".extras", &git), std::env::temp_dir());

        repo.write_file(".gitignore", ".extras\n").expect("write");
        assert_eq!(report_dir(repo.path(), ".extras", &git), extras);
    }

    #[test]
    fn write_report_creates_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_report(temp.path(), "r.md", "# Report\n").expect("write");
        assert_eq!(fs::read_to_string(path).expect("read"), "# Report\n");
    }
}
