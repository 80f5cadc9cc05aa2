//! Workflow trigger vocabulary.
//!
//! Each trigger maps to a phase advance; review-type triggers also render the
//! task's audit report.

use std::fmt;
use std::str::FromStr;

use tracing::instrument;

use crate::core::phases::Transition;
use crate::core::types::Phase;
use crate::engine::WorkflowGateEngine;
use crate::error::{GateError, GateResult};
use crate::io::git::Vcs;
use crate::report::AuditReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCommand {
    Init,
    Plan,
    Creative,
    Qa,
    Build,
    Review,
    SelfReview,
    QuickReview,
    CheckProgress,
    Archive,
}

impl TriggerCommand {
    pub const ALL: [TriggerCommand; 10] = [
        Self::Init,
        Self::Plan,
        Self::Creative,
        Self::Qa,
        Self::Build,
        Self::Review,
        Self::SelfReview,
        Self::QuickReview,
        Self::CheckProgress,
        Self::Archive,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Plan => "plan",
            Self::Creative => "creative",
            Self::Qa => "qa",
            Self::Build => "build",
            Self::Review => "review",
            Self::SelfReview => "self-review",
            Self::QuickReview => "quick-review",
            Self::CheckProgress => "check-progress",
            Self::Archive => "archive",
        }
    }

    /// Phase this trigger advances into; `None` re-enters the current phase.
    pub fn target_phase(self) -> Option<Phase> {
        match self {
            Self::Init => Some(Phase::Init),
            Self::Plan => Some(Phase::Plan),
            Self::Creative => Some(Phase::Creative),
            Self::Qa => Some(Phase::Qa),
            Self::Build => Some(Phase::Build),
            Self::Review => Some(Phase::Review),
            Self::Archive => Some(Phase::Archive),
            Self::SelfReview | Self::QuickReview | Self::CheckProgress => None,
        }
    }

    pub fn renders_report(self) -> bool {
        matches!(
            self,
            Self::Review | Self::SelfReview | Self::QuickReview | Self::CheckProgress | Self::Archive
        )
    }
}

impl fmt::Display for TriggerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TriggerCommand {
    type Err = String;

    /// Case-insensitive; `_` and spaces are accepted in place of `-`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        Self::ALL
            .into_iter()
            .find(|trigger| trigger.name() == normalized)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|t| t.name()).collect();
                format!("unknown trigger '{raw}' (expected one of: {})", names.join(", "))
            })
    }
}

#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub trigger: TriggerCommand,
    pub transition: Transition,
    pub report: Option<AuditReport>,
}

/// Run `trigger` against a task.
#[instrument(skip_all, fields(task_id = %task_id, trigger = %trigger))]
pub fn run_trigger<V: Vcs>(
    engine: &WorkflowGateEngine<V>,
    task_id: &str,
    trigger: TriggerCommand,
) -> GateResult<TriggerOutcome> {
    let transition = match trigger {
        TriggerCommand::Archive => engine.archive(task_id)?,
        other => {
            let target = match other.target_phase() {
                Some(phase) => phase,
                None => {
                    engine
                        .task(task_id)
                        .ok_or_else(|| GateError::UnknownTask(task_id.to_string()))?
                        .current_phase
                }
            };
            engine.advance_phase(task_id, target)?
        }
    };
    let report = if trigger.renders_report() {
        Some(engine.render_report(task_id)?)
    } else {
        None
    };
    Ok(TriggerOutcome {
        trigger,
        transition,
        report,
    })
}
