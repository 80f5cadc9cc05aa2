//! Shared deterministic types for gate core logic.
//!
//! These types define stable contracts between the gate components and the
//! persisted tables (`state.json`, `audit.jsonl`, `authorizations.jsonl`).
//! Entities reference each other by id only; nothing here owns another entity.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::phases::PhaseViolation;

/// Category assigned to a proposed command.
///
/// Variants are declared from least to most restrictive so `Ord` can be used to
/// pick the strictest classification of a compound command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    LocalRead,
    LocalWrite,
    RemoteWrite,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalRead => "local-read",
            Self::LocalWrite => "local-write",
            Self::RemoteWrite => "remote-write",
        }
    }

    /// True for the write classes that require a checkpoint.
    pub fn is_write(self) -> bool {
        !matches!(self, Self::LocalRead)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Init,
    Plan,
    Creative,
    Qa,
    Build,
    Review,
    Archive,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Init,
        Phase::Plan,
        Phase::Creative,
        Phase::Qa,
        Phase::Build,
        Phase::Review,
        Phase::Archive,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Plan => "Plan",
            Self::Creative => "Creative",
            Self::Qa => "QA",
            Self::Build => "Build",
            Self::Review => "Review",
            Self::Archive => "Archive",
        }
    }

    /// Parse a phase name case-insensitively (`qa`, `QA`, `Build`, ...).
    pub fn parse(raw: &str) -> Option<Phase> {
        let wanted = raw.trim();
        Self::ALL
            .into_iter()
            .find(|phase| phase.name().eq_ignore_ascii_case(wanted))
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Declared complexity of a task (1..=4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ComplexityLevel(u8);

impl ComplexityLevel {
    pub fn new(level: u8) -> Result<Self, String> {
        if (1..=4).contains(&level) {
            Ok(Self(level))
        } else {
            Err(format!("complexity level must be 1..=4 (got {level})"))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for ComplexityLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ComplexityLevel> for u8 {
    fn from(value: ComplexityLevel) -> Self {
        value.0
    }
}

impl fmt::Display for ComplexityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work tracked through its required phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub complexity_level: ComplexityLevel,
    pub required_phases: Vec<Phase>,
    pub current_phase: Phase,
    pub created_at: DateTime<Utc>,
    /// Unresolved out-of-order advance; blocks write proposals until cleared.
    #[serde(default)]
    pub blocked_by: Option<PhaseViolation>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

/// Reversible snapshot taken before the first write of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub task_id: String,
    /// Commit the working tree was based on when the checkpoint was taken.
    pub baseline_ref: String,
    pub branch: String,
    /// Stash-equivalent snapshot of the full working state (untracked included).
    pub snapshot_ref: String,
    /// Named anchor pointing at `baseline_ref`.
    pub rollback_ref: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthorizationScope {
    /// Satisfies exactly one execution.
    SingleUse,
    /// Satisfies any number of executions for the lifetime of the task.
    Session,
}

impl AuthorizationScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleUse => "single-use",
            Self::Session => "session",
        }
    }
}

/// How an authorization's `command_pattern` is compared to proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchKind {
    /// The normalized proposal must equal the normalized pattern.
    #[default]
    Exact,
    /// The pattern names a command category (leading words). Session scope only.
    Category,
}

/// Explicit user grant for a mutating command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRecord {
    pub id: String,
    pub task_id: String,
    pub command_pattern: String,
    #[serde(default)]
    pub match_kind: MatchKind,
    pub authorized_by: String,
    pub authorized_at: DateTime<Utc>,
    pub scope: AuthorizationScope,
    /// Set when a single-use record satisfied a proposal.
    #[serde(default)]
    pub consumed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditDecision {
    Approved,
    Denied,
}

/// Why a proposal was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenialReason {
    PhaseViolation,
    Unauthorized,
    CheckpointFailed,
    StorageFailed,
}

impl DenialReason {
    /// Stable decision code (`denied:<reason>`).
    pub fn code(self) -> &'static str {
        match self {
            Self::PhaseViolation => "denied:phase-violation",
            Self::Unauthorized => "denied:unauthorized",
            Self::CheckpointFailed => "denied:checkpoint-failed",
            Self::StorageFailed => "denied:storage-failed",
        }
    }
}

/// One executed or denied proposal. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Position in the journal (1-indexed, gap-free).
    pub seq: u64,
    pub id: String,
    pub task_id: String,
    /// Arrival time of the proposal.
    pub timestamp: DateTime<Utc>,
    pub proposed_command: String,
    pub classification: Classification,
    pub decision: AuditDecision,
    #[serde(default)]
    pub denial: Option<DenialReason>,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    #[serde(default)]
    pub authorization_id: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub prev_hash: String,
    pub hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_orders_by_restrictiveness() {
        let mut all = vec![
            Classification::RemoteWrite,
            Classification::LocalRead,
            Classification::LocalWrite,
        ];
        all.sort();
        assert_eq!(
            all,
            vec![
                Classification::LocalRead,
                Classification::LocalWrite,
                Classification::RemoteWrite
            ]
        );
        assert!(!Classification::LocalRead.is_write());
        assert!(Classification::LocalWrite.is_write());
    }

    #[test]
    fn phase_parse_is_case_insensitive() {
        assert_eq!(Phase::parse("qa"), Some(Phase::Qa));
        assert_eq!(Phase::parse(" Build "), Some(Phase::Build));
        assert_eq!(Phase::parse("ship"), None);
    }

    #[test]
    fn complexity_level_rejects_out_of_range() {
        assert!(ComplexityLevel::new(0).is_err());
        assert!(ComplexityLevel::new(5).is_err());
        assert_eq!(ComplexityLevel::new(3).expect("level").get(), 3);
        let parsed: Result<ComplexityLevel, _> = serde_json::from_str("9");
        assert!(parsed.is_err());
    }

    #[test]
    fn denial_codes_are_stable() {
        assert_eq!(DenialReason::PhaseViolation.code(), "denied:phase-violation");
        assert_eq!(DenialReason::Unauthorized.code(), "denied:unauthorized");
        assert_eq!(
            DenialReason::CheckpointFailed.code(),
            "denied:checkpoint-failed"
        );
    }
}
