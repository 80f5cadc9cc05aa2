//! Checkpoint creation.
//!
//! A checkpoint is three version-control steps: capture the baseline, snapshot
//! the full working state, anchor the baseline under a named branch. The
//! checkpoint value only exists once all three have succeeded; the caller
//! records it, so a failed step never leaves a recorded partial checkpoint.

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::core::ids::time_derived_id;
use crate::core::types::Checkpoint;
use crate::error::{CheckpointStep, GateError, GateResult};
use crate::io::git::Vcs;

#[derive(Debug, Clone)]
pub struct CheckpointManager<V> {
    vcs: V,
    anchor_prefix: String,
}

impl<V: Vcs> CheckpointManager<V> {
    pub fn new(vcs: V, anchor_prefix: impl Into<String>) -> Self {
        Self {
            vcs,
            anchor_prefix: anchor_prefix.into(),
        }
    }

    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    /// Create a checkpoint for `task_id`.
    ///
    /// `existing` are the checkpoints already recorded (any task); the new id
    /// is time-derived and collision-checked against the task's ids.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn create(
        &self,
        task_id: &str,
        existing: &[Checkpoint],
        at: DateTime<Utc>,
    ) -> GateResult<Checkpoint> {
        let id = time_derived_id("cp", at, |candidate| {
            existing
                .iter()
                .any(|checkpoint| checkpoint.task_id == task_id && checkpoint.id == candidate)
        })
        .map_err(|err| failure(CheckpointStep::AllocateId, anyhow::anyhow!(err)))?;

        let head = self
            .vcs
            .head()
            .map_err(|err| failure(CheckpointStep::CaptureBaseline, err))?;
        let snapshot_ref = self
            .vcs
            .snapshot(&format!("{task_id}/{id}"))
            .map_err(|err| failure(CheckpointStep::Snapshot, err))?;
        let anchor = format!("{}/{task_id}/{id}", self.anchor_prefix);
        let rollback_ref = self
            .vcs
            .create_anchor(&anchor, &head.commit)
            .map_err(|err| failure(CheckpointStep::RollbackAnchor, err))?;

        info!(
            checkpoint_id = %id,
            baseline = %head.commit,
            branch = %head.branch,
            "checkpoint created"
        );
        Ok(Checkpoint {
            id,
            task_id: task_id.to_string(),
            baseline_ref: head.commit,
            branch: head.branch,
            snapshot_ref,
            rollback_ref,
            created_at: at,
        })
    }
}

fn failure(step: CheckpointStep, source: anyhow::Error) -> GateError {
    warn!(step = %step, err = %format!("{source:#}"), "checkpoint step failed");
    GateError::CheckpointFailure { step, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedVcs, TestRepo, fixed_time};

    #[test]
    fn ids_are_unique_within_the_same_second() {
        let manager = CheckpointManager::new(ScriptedVcs::default(), "gate/checkpoint");
        let at = fixed_time();
        let mut recorded = Vec::new();
        for _ in 0..3 {
            let checkpoint = manager.create("t1", &recorded, at).expect("create");
            recorded.push(checkpoint);
        }
        let ids: Vec<&str> = recorded.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "cp-20260102T030405Z",
                "cp-20260102T030405Z-2",
                "cp-20260102T030405Z-3"
            ]
        );
        // another task may reuse the same id
        let other = manager.create("t2", &recorded, at).expect("create");
        assert_eq!(other.id, "cp-20260102T030405Z");
    }

    #[test]
    fn each_failing_step_fails_the_whole_checkpoint() {
        let at = fixed_time();
        for (step, vcs) in [
            (CheckpointStep::CaptureBaseline, ScriptedVcs::failing_head()),
            (CheckpointStep::Snapshot, ScriptedVcs::failing_snapshot()),
            (CheckpointStep::RollbackAnchor, ScriptedVcs::failing_anchor()),
        ] {
            let manager = CheckpointManager::new(vcs, "gate/checkpoint");
            match manager.create("t1", &[], at) {
                Err(GateError::CheckpointFailure { step: failed, .. }) => assert_eq!(failed, step),
                other => panic!("expected checkpoint failure at {step}, got {other:?}"),
            }
        }
    }

    #[test]
    fn creates_snapshot_and_anchor_in_a_real_repository() {
        let repo = TestRepo::new().expect("repo");
        repo.write_file("scratch.txt", "wip\n").expect("write");
        let manager = CheckpointManager::new(repo.git(), "gate/checkpoint");

        let checkpoint = manager.create("t1", &[], fixed_time()).expect("create");

        assert_eq!(checkpoint.branch, "main");
        assert_eq!(
            checkpoint.rollback_ref,
            "gate/checkpoint/t1/cp-20260102T030405Z"
        );
        let anchored = repo
            .capture(&["git", "rev-parse", &checkpoint.rollback_ref])
            .expect("rev-parse");
        assert_eq!(anchored, checkpoint.baseline_ref);
        let files = repo
            .capture(&["git", "ls-tree", "-r", "--name-only", &checkpoint.snapshot_ref])
            .expect("ls-tree");
        assert!(files.lines().any(|line| line == "scratch.txt"));
    }
}
