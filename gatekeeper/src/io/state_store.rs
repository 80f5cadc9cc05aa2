//! Gate state storage (`.gate/state.json`) with schema + invariant validation.
//!
//! Tasks, checkpoints, session anchors and unsettled approvals live in flat
//! tables keyed by id. The file is the engine's source of truth.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::phases::validate_task;
use crate::core::types::{Checkpoint, Classification, Task};
use crate::io::fsutil::write_atomic;

pub const STATE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/gate_state/v1.schema.json"
));

const STATE_VERSION: u32 = 1;

/// Approved proposal whose execution result has not been reported yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingExecution {
    pub ticket: String,
    pub task_id: String,
    pub command: String,
    pub classification: Classification,
    pub checkpoint_id: Option<String>,
    pub authorization_id: Option<String>,
    pub proposed_at: DateTime<Utc>,
}

/// Persisted gate state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateState {
    pub version: u32,
    pub tasks: Vec<Task>,
    pub checkpoints: Vec<Checkpoint>,
    /// Task id -> checkpoint covering the task's current work session.
    #[serde(default)]
    pub sessions: BTreeMap<String, String>,
    #[serde(default)]
    pub pending: Vec<PendingExecution>,
}

impl Default for GateState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            tasks: Vec::new(),
            checkpoints: Vec::new(),
            sessions: BTreeMap::new(),
            pending: Vec::new(),
        }
    }
}

impl GateState {
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    pub fn checkpoints_for<'a>(&'a self, task_id: &'a str) -> impl Iterator<Item = &'a Checkpoint> {
        self.checkpoints
            .iter()
            .filter(move |checkpoint| checkpoint.task_id == task_id)
    }

    pub fn pending_for(&self, task_id: &str) -> Option<&PendingExecution> {
        self.pending.iter().find(|pending| pending.task_id == task_id)
    }

    /// Remove and return the pending execution for `ticket`.
    pub fn take_pending(&mut self, ticket: &str) -> Option<PendingExecution> {
        let index = self
            .pending
            .iter()
            .position(|pending| pending.ticket == ticket)?;
        Some(self.pending.remove(index))
    }
}

/// Load/save interface for [`GateState`].
pub trait StateStore: Send {
    fn load(&self) -> Result<GateState>;
    fn save(&mut self, state: &GateState) -> Result<()>;
}

/// JSON file store. A missing file loads as an empty state.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<GateState> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no state file, starting empty");
            return Ok(GateState::default());
        }
        load_state(&self.path)
    }

    fn save(&mut self, state: &GateState) -> Result<()> {
        write_state(&self.path, state)
    }
}

/// Store that keeps the last saved state in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    state: GateState,
}

impl MemoryStateStore {
    pub fn new(state: GateState) -> Self {
        Self { state }
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<GateState> {
        Ok(self.state.clone())
    }

    fn save(&mut self, state: &GateState) -> Result<()> {
        self.state = state.clone();
        Ok(())
    }
}

/// Load and validate state from disk (schema + invariants).
pub fn load_state(path: &Path) -> Result<GateState> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read state {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse state {}", path.display()))?;
    validate_schema(&value)?;
    let state: GateState = serde_json::from_value(value)
        .with_context(|| format!("deserialize state {}", path.display()))?;
    let errors = validate_state(&state);
    if !errors.is_empty() {
        return Err(anyhow!("state invariants failed: {}", errors.join("; ")));
    }
    debug!(
        tasks = state.tasks.len(),
        checkpoints = state.checkpoints.len(),
        pending = state.pending.len(),
        "state loaded"
    );
    Ok(state)
}

/// Atomically write state to disk (temp file + rename).
pub fn write_state(path: &Path, state: &GateState) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn validate_schema(state: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(STATE_SCHEMA).context("parse state schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(state) {
        let messages = compiled
            .iter_errors(state)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "state schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

/// Cross-table invariants the schema cannot express.
pub fn validate_state(state: &GateState) -> Vec<String> {
    let mut errors = Vec::new();
    let mut task_ids = HashSet::new();
    for task in &state.tasks {
        if !task_ids.insert(task.id.as_str()) {
            errors.push(format!("duplicate task id '{}'", task.id));
        }
        errors.extend(validate_task(task));
    }

    let mut checkpoint_keys = HashSet::new();
    for checkpoint in &state.checkpoints {
        if !task_ids.contains(checkpoint.task_id.as_str()) {
            errors.push(format!(
                "checkpoint '{}' references unknown task '{}'",
                checkpoint.id, checkpoint.task_id
            ));
        }
        if !checkpoint_keys.insert((checkpoint.task_id.as_str(), checkpoint.id.as_str())) {
            errors.push(format!(
                "duplicate checkpoint id '{}' in task '{}'",
                checkpoint.id, checkpoint.task_id
            ));
        }
    }

    for (task_id, checkpoint_id) in &state.sessions {
        if !checkpoint_keys.contains(&(task_id.as_str(), checkpoint_id.as_str())) {
            errors.push(format!(
                "session of task '{task_id}' references unknown checkpoint '{checkpoint_id}'"
            ));
        }
    }

    let mut pending_tasks = HashSet::new();
    for pending in &state.pending {
        if !task_ids.contains(pending.task_id.as_str()) {
            errors.push(format!(
                "pending execution '{}' references unknown task '{}'",
                pending.ticket, pending.task_id
            ));
        }
        if !pending_tasks.insert(pending.task_id.as_str()) {
            errors.push(format!(
                "task '{}' has more than one pending execution",
                pending.task_id
            ));
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::phases::new_task;
    use crate::core::types::{ComplexityLevel, Phase};

    fn sample_state() -> GateState {
        let at = DateTime::<Utc>::UNIX_EPOCH;
        let mut task = new_task("t1", ComplexityLevel::new(2).expect("level"), at);
        task.current_phase = Phase::Plan;
        let checkpoint = Checkpoint {
            id: "cp-19700101T000000Z".to_string(),
            task_id: "t1".to_string(),
            baseline_ref: "abc123".to_string(),
            branch: "main".to_string(),
            snapshot_ref: "def456".to_string(),
            rollback_ref: "gate/checkpoint/t1/cp-19700101T000000Z".to_string(),
            created_at: at,
        };
        let mut state = GateState::default();
        state
            .sessions
            .insert("t1".to_string(), checkpoint.id.clone());
        state.tasks.push(task);
        state.checkpoints.push(checkpoint);
        state.pending.push(PendingExecution {
            ticket: "ticket-1".to_string(),
            task_id: "t1".to_string(),
            command: "git commit -am x".to_string(),
            classification: Classification::LocalWrite,
            checkpoint_id: Some("cp-19700101T000000Z".to_string()),
            authorization_id: None,
            proposed_at: at,
        });
        state
    }

    #[test]
    fn state_round_trips_through_schema_validation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        let state = sample_state();
        write_state(&path, &state).expect("write");
        let loaded = load_state(&path).expect("load");
        assert_eq!(loaded, state);
    }

    #[test]
    fn missing_file_loads_empty_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStateStore::new(temp.path().join("state.json"));
        assert_eq!(store.load().expect("load"), GateState::default());
    }

    #[test]
    fn schema_rejects_unknown_phase() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        write_state(&path, &sample_state()).expect("write");
        let contents = fs::read_to_string(&path).expect("read");
        fs::write(&path, contents.replace("\"plan\",\n", "\"ship\",\n")).expect("write");
        let err = load_state(&path).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn invariants_catch_phase_table_drift() {
        let mut state = sample_state();
        state.tasks[0].required_phases.retain(|phase| *phase != Phase::Qa);
        state.checkpoints[0].task_id = "ghost".to_string();
        let errors = validate_state(&state);
        assert!(errors.iter().any(|e| e.contains("required phases do not match")));
        assert!(errors.iter().any(|e| e.contains("unknown task 'ghost'")));
        assert!(errors.iter().any(|e| e.contains("unknown checkpoint")));
    }

    #[test]
    fn take_pending_removes_ticket() {
        let mut state = sample_state();
        assert!(state.pending_for("t1").is_some());
        let pending = state.take_pending("ticket-1").expect("pending");
        assert_eq!(pending.command, "git commit -am x");
        assert!(state.pending_for("t1").is_none());
        assert!(state.take_pending("ticket-1").is_none());
    }
}
