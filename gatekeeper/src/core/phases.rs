//! Task phase table and transition rules.
//!
//! The required phase sequence is a closed lookup keyed by complexity level.
//! Transitions only ever move one step forward (or re-enter the current
//! phase); anything else is a [`PhaseViolation`]. Forward skips are recorded on
//! the task as a hard block that denies write proposals until the skipped phase
//! has been completed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{ComplexityLevel, Phase, Task};

const LEVEL_1: &[Phase] = &[Phase::Init, Phase::Build, Phase::Review];
const LEVEL_2: &[Phase] = &[
    Phase::Init,
    Phase::Plan,
    Phase::Qa,
    Phase::Build,
    Phase::Review,
];
const LEVEL_3_4: &[Phase] = &[
    Phase::Init,
    Phase::Plan,
    Phase::Creative,
    Phase::Qa,
    Phase::Build,
    Phase::Review,
    Phase::Archive,
];

/// Required phase sequence for a complexity level.
pub fn required_phases(level: ComplexityLevel) -> &'static [Phase] {
    match level.get() {
        1 => LEVEL_1,
        2 => LEVEL_2,
        _ => LEVEL_3_4,
    }
}

/// Attempted transition that breaks the phase ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PhaseViolation {
    #[error("cannot enter {to} from {from}: required phase {missing} has not been completed")]
    Skipped {
        from: Phase,
        to: Phase,
        missing: Phase,
    },
    #[error("phase {phase} is not part of the level {level} workflow")]
    NotRequired { level: ComplexityLevel, phase: Phase },
    #[error("cannot move back from {from} to {to}")]
    Backward { from: Phase, to: Phase },
    #[error("write actions are blocked until the Creative phase is complete (current phase {current})")]
    CreativeIncomplete { current: Phase },
    #[error("task is archived")]
    Archived,
}

impl PhaseViolation {
    /// Action that clears this violation.
    pub fn resolution(&self) -> String {
        match self {
            Self::Skipped { to, missing, .. } => {
                format!("complete {missing} phase before {to}")
            }
            Self::NotRequired { level, .. } => {
                let names: Vec<&str> = required_phases(*level).iter().map(|p| p.name()).collect();
                format!("advance through the level {level} sequence: {}", names.join(" -> "))
            }
            Self::Backward { to, .. } => format!("create a new task to re-open {to}"),
            Self::CreativeIncomplete { .. } => "complete Creative phase before Build".to_string(),
            Self::Archived => "create a new task to continue work".to_string(),
        }
    }

    fn is_resolved_by(&self, task: &Task) -> bool {
        match self {
            Self::Skipped { missing, .. } => has_completed(task, *missing),
            _ => false,
        }
    }
}

/// Successful phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Entered { from: Phase, to: Phase },
    /// Idempotent re-run of the current phase.
    Reentered(Phase),
}

impl Transition {
    pub fn phase(self) -> Phase {
        match self {
            Self::Entered { to, .. } => to,
            Self::Reentered(phase) => phase,
        }
    }
}

/// Create a task at `Init` with the phase sequence for `level`.
pub fn new_task(id: &str, level: ComplexityLevel, created_at: DateTime<Utc>) -> Task {
    Task {
        id: id.to_string(),
        complexity_level: level,
        required_phases: required_phases(level).to_vec(),
        current_phase: Phase::Init,
        created_at,
        blocked_by: None,
        archived_at: None,
    }
}

fn position(task: &Task, phase: Phase) -> Option<usize> {
    task.required_phases.iter().position(|p| *p == phase)
}

/// True once the task has moved past `phase`.
pub fn has_completed(task: &Task, phase: Phase) -> bool {
    match (position(task, phase), position(task, task.current_phase)) {
        (Some(target), Some(current)) => target < current,
        _ => false,
    }
}

/// Last phase of the task's sequence (`Archive` or `Review`).
pub fn terminal_phase(task: &Task) -> Phase {
    task.required_phases
        .last()
        .copied()
        .unwrap_or(Phase::Review)
}

/// Move `task` to `target`.
///
/// Only the next phase in sequence (or the current phase) is accepted. A
/// forward skip is stored on the task so the gate keeps denying writes until
/// the skipped phase is completed.
pub fn advance(task: &mut Task, target: Phase) -> Result<Transition, PhaseViolation> {
    if task.archived_at.is_some() {
        return Err(PhaseViolation::Archived);
    }
    let target_pos = position(task, target).ok_or(PhaseViolation::NotRequired {
        level: task.complexity_level,
        phase: target,
    })?;
    let from = task.current_phase;
    let current_pos = position(task, from).ok_or(PhaseViolation::NotRequired {
        level: task.complexity_level,
        phase: from,
    })?;

    if target_pos == current_pos {
        return Ok(Transition::Reentered(target));
    }
    if target_pos < current_pos {
        return Err(PhaseViolation::Backward { from, to: target });
    }
    if target_pos > current_pos + 1 {
        let violation = PhaseViolation::Skipped {
            from,
            to: target,
            missing: task.required_phases[current_pos + 1],
        };
        task.blocked_by = Some(violation.clone());
        return Err(violation);
    }

    task.current_phase = target;
    if task
        .blocked_by
        .as_ref()
        .is_some_and(|violation| violation.is_resolved_by(task))
    {
        task.blocked_by = None;
    }
    Ok(Transition::Entered { from, to: target })
}

/// Archive the task.
///
/// Levels that require `Archive` must advance into it; the others must already
/// sit in their terminal phase.
pub fn archive(task: &mut Task, at: DateTime<Utc>) -> Result<Transition, PhaseViolation> {
    if task.archived_at.is_some() {
        return Err(PhaseViolation::Archived);
    }
    let transition = if task.required_phases.contains(&Phase::Archive) {
        advance(task, Phase::Archive)?
    } else {
        let terminal = terminal_phase(task);
        if task.current_phase != terminal {
            return Err(PhaseViolation::Skipped {
                from: task.current_phase,
                to: Phase::Archive,
                missing: terminal,
            });
        }
        Transition::Reentered(terminal)
    };
    task.archived_at = Some(at);
    Ok(transition)
}

/// Pending condition that denies every write-class proposal, if any.
pub fn hard_block(task: &Task) -> Option<PhaseViolation> {
    if task.archived_at.is_some() {
        return Some(PhaseViolation::Archived);
    }
    if let Some(violation) = &task.blocked_by
        && !violation.is_resolved_by(task)
    {
        return Some(violation.clone());
    }
    if task.required_phases.contains(&Phase::Creative) && !has_completed(task, Phase::Creative) {
        return Some(PhaseViolation::CreativeIncomplete {
            current: task.current_phase,
        });
    }
    None
}

/// Check the persisted task against the phase table.
pub fn validate_task(task: &Task) -> Vec<String> {
    let mut errors = Vec::new();
    if task.required_phases != required_phases(task.complexity_level) {
        errors.push(format!(
            "task '{}': required phases do not match level {}",
            task.id, task.complexity_level
        ));
    }
    if !task.required_phases.contains(&task.current_phase) {
        errors.push(format!(
            "task '{}': current phase {} is not a required phase",
            task.id, task.current_phase
        ));
    }
    errors
}
