//! Gate error taxonomy.
//!
//! The first four variants are the denial kinds; the engine converts them into
//! a denied [`Decision`](crate::engine::Decision) plus a recorded audit event.
//! The rest are caller mistakes and surface as plain errors.

use std::fmt;

use thiserror::Error;

use crate::core::phases::PhaseViolation;
use crate::core::types::DenialReason;

/// Step of checkpoint creation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStep {
    CaptureBaseline,
    Snapshot,
    RollbackAnchor,
    AllocateId,
}

impl fmt::Display for CheckpointStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CaptureBaseline => "capturing the baseline ref",
            Self::Snapshot => "snapshotting the working state",
            Self::RollbackAnchor => "creating the rollback anchor",
            Self::AllocateId => "allocating a checkpoint id",
        })
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("phase violation: {0}")]
    PhaseViolation(#[from] PhaseViolation),

    #[error("`{command}` mutates remote state and has no matching authorization")]
    Authorization { command: String },

    #[error("checkpoint failed while {step}: {source:#}")]
    CheckpointFailure {
        step: CheckpointStep,
        #[source]
        source: anyhow::Error,
    },

    #[error("storage failure: {0:#}")]
    Storage(#[source] anyhow::Error),

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("task '{0}' already exists")]
    TaskExists(String),

    #[error("task '{task_id}' still has an unsettled approval for `{command}`")]
    ExecutionPending { task_id: String, command: String },

    #[error("no pending execution for ticket '{0}'")]
    NoPendingExecution(String),

    #[error("report failed: {0:#}")]
    Report(#[source] anyhow::Error),

    #[error("invalid input: {0}")]
    Invalid(String),
}

impl GateError {
    /// Denial kind for errors that deny a proposal.
    pub fn denial_reason(&self) -> Option<DenialReason> {
        match self {
            Self::PhaseViolation(_) => Some(DenialReason::PhaseViolation),
            Self::Authorization { .. } => Some(DenialReason::Unauthorized),
            Self::CheckpointFailure { .. } => Some(DenialReason::CheckpointFailed),
            Self::Storage(_) => Some(DenialReason::StorageFailed),
            _ => None,
        }
    }

    /// What the caller must do to get past this error.
    pub fn resolution(&self) -> String {
        match self {
            Self::PhaseViolation(violation) => violation.resolution(),
            Self::Authorization { command } => {
                format!("obtain explicit authorization for `{command}`")
            }
            Self::CheckpointFailure { .. } => {
                "fix the version-control error, then propose again; writes need a rollback anchor"
                    .to_string()
            }
            Self::Storage(_) => {
                "restore write access to the gate journals; the action counts as not executed"
                    .to_string()
            }
            Self::UnknownTask(_) => "create the task with `gate task new` first".to_string(),
            Self::TaskExists(_) => "pick a different task id".to_string(),
            Self::ExecutionPending { .. } => {
                "record the outcome of the approved command before proposing another".to_string()
            }
            Self::NoPendingExecution(_) => "propose the command again".to_string(),
            Self::Report(_) => "check the report directory and version-control access".to_string(),
            Self::Invalid(_) => "correct the input".to_string(),
        }
    }
}

pub type GateResult<T> = Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Phase;

    #[test]
    fn denial_errors_map_to_reasons_and_resolutions() {
        let err = GateError::from(PhaseViolation::Skipped {
            from: Phase::Plan,
            to: Phase::Build,
            missing: Phase::Creative,
        });
        assert_eq!(err.denial_reason(), Some(DenialReason::PhaseViolation));
        assert_eq!(err.resolution(), "complete Creative phase before Build");

        let err = GateError::Authorization {
            command: "git push".to_string(),
        };
        assert_eq!(err.denial_reason(), Some(DenialReason::Unauthorized));
        assert_eq!(err.resolution(), "obtain explicit authorization for `git push`");

        let err = GateError::CheckpointFailure {
            step: CheckpointStep::Snapshot,
            source: anyhow::anyhow!("stash failed"),
        };
        assert!(err.to_string().contains("snapshotting the working state"));
        assert!(err.to_string().contains("stash failed"));

        assert_eq!(GateError::UnknownTask("x".to_string()).denial_reason(), None);
    }
}
