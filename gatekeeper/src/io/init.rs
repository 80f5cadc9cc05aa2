//! Initialization helpers for `.gate/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{GateConfig, write_config};
use super::state_store::{GateState, write_state};

/// All canonical paths within `.gate/` for a project root.
#[derive(Debug, Clone)]
pub struct GatePaths {
    pub root: PathBuf,
    pub gate_dir: PathBuf,
    pub memory_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub state_path: PathBuf,
    pub audit_path: PathBuf,
    pub authorizations_path: PathBuf,
}

impl GatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let gate_dir = root.join(".gate");
        Self {
            root: root.clone(),
            gate_dir: gate_dir.clone(),
            memory_dir: gate_dir.join("memory"),
            gitignore_path: gate_dir.join(".gitignore"),
            config_path: gate_dir.join("config.toml"),
            state_path: gate_dir.join("state.json"),
            audit_path: gate_dir.join("audit.jsonl"),
            authorizations_path: gate_dir.join("authorizations.jsonl"),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.gate_dir.is_dir()
    }
}

/// Options for `init_gate`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, reset config and state. Journals are never touched.
    pub force: bool,
}

/// Create `.gate/` scaffolding in `root`.
///
/// Fails if `.gate/` already exists unless `options.force` is set. The audit
/// and authorization journals survive a forced re-init.
pub fn init_gate(root: &Path, options: &InitOptions) -> Result<GatePaths> {
    let paths = GatePaths::new(root);
    if paths.gate_dir.exists() && !paths.gate_dir.is_dir() {
        return Err(anyhow!("gate init: .gate exists but is not a directory"));
    }
    if paths.gate_dir.exists() && !options.force {
        return Err(anyhow!(
            "gate init: .gate already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.gate_dir)?;
    create_dir(&paths.memory_dir)?;
    fs::write(&paths.gitignore_path, GATE_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &GateConfig::default())?;
    write_state(&paths.state_path, &GateState::default())?;
    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const GATE_GITIGNORE: &str = "*.tmp\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;
    use crate::io::state_store::load_state;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_gate(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.gate_dir.is_dir());
        assert!(paths.memory_dir.is_dir());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            GATE_GITIGNORE
        );
        assert_eq!(
            load_config(&paths.config_path).expect("config"),
            GateConfig::default()
        );
        assert_eq!(
            load_state(&paths.state_path).expect("state"),
            GateState::default()
        );
        assert!(!paths.audit_path.exists());
    }

    #[test]
    fn init_without_force_refuses_existing_gate_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_gate(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_gate(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn forced_init_resets_state_but_keeps_journals() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_gate(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.config_path, "[git]\ntimeout_secs = 5\n").expect("write");
        fs::write(&paths.audit_path, "{\"seq\":1}\n").expect("write");

        init_gate(temp.path(), &InitOptions { force: true }).expect("re-init");

        assert_eq!(
            load_config(&paths.config_path).expect("config"),
            GateConfig::default()
        );
        assert_eq!(
            fs::read_to_string(&paths.audit_path).expect("read"),
            "{\"seq\":1}\n"
        );
    }
}
