//! Gate configuration stored under `.gate/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::classifier::{ClassifierRules, CommandClassifier};

/// Gate configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the built-in
/// values; the classifier lists in particular can be extended per project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct GateConfig {
    pub classifier: ClassifierRules,
    pub checkpoint: CheckpointConfig,
    pub report: ReportConfig,
    pub approval: ApprovalConfig,
    pub git: GitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Branch prefix for rollback anchors (`<prefix>/<task>/<checkpoint>`).
    pub anchor_prefix: String,
    /// Include untracked (non-ignored) files in snapshots.
    pub include_untracked: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            anchor_prefix: "gate/checkpoint".to_string(),
            include_untracked: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportConfig {
    /// Project-local extras directory; used only when it exists and is ignored by git.
    pub extras_dir: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            extras_dir: ".extras".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Give up waiting for a human approval after this many seconds (unset: wait).
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    /// Timeout for each git subprocess.
    pub timeout_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

impl GateConfig {
    pub fn validate(&self) -> Result<()> {
        CommandClassifier::new(&self.classifier).map_err(|err| anyhow!(err))?;
        let prefix = self.checkpoint.anchor_prefix.trim();
        if prefix.is_empty() || prefix.starts_with('/') || prefix.ends_with('/') {
            return Err(anyhow!(
                "checkpoint.anchor_prefix must be a non-empty ref path without leading/trailing '/'"
            ));
        }
        if prefix.contains("..") || prefix.contains(char::is_whitespace) {
            return Err(anyhow!("checkpoint.anchor_prefix is not a valid ref path"));
        }
        if self.report.extras_dir.trim().is_empty() {
            return Err(anyhow!("report.extras_dir must not be empty"));
        }
        if self.approval.timeout_secs == Some(0) {
            return Err(anyhow!("approval.timeout_secs must be > 0 when set"));
        }
        if self.git.timeout_secs == 0 {
            return Err(anyhow!("git.timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn classifier(&self) -> Result<CommandClassifier> {
        CommandClassifier::new(&self.classifier).map_err(|err| anyhow!(err))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `GateConfig::default()`.
pub fn load_config(path: &Path) -> Result<GateConfig> {
    if !path.exists() {
        let cfg = GateConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: GateConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &GateConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::fsutil::write_atomic(path, &buf)
}
