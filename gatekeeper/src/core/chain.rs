//! SHA-256 hash chain over audit events.
//!
//! Every event commits to its own fields and to the previous event's hash, so
//! removing, reordering or editing any journal line breaks verification.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::types::{AuditDecision, AuditEvent};

/// `prev_hash` of the first event in a journal.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("audit journal sequence gap: expected seq {expected}, found {found}")]
    SeqGap { expected: u64, found: u64 },
    #[error("audit event {seq} does not link to the previous event")]
    BrokenLink { seq: u64 },
    #[error("audit event {seq} was modified after it was recorded")]
    Tampered { seq: u64 },
}

/// Hash of `event` with its `hash` field ignored.
pub fn event_hash(event: &AuditEvent) -> String {
    let decision = match event.decision {
        AuditDecision::Approved => "approved",
        AuditDecision::Denied => "denied",
    };
    let exit_code = event.exit_code.map(|c| c.to_string()).unwrap_or_default();
    let fields = [
        event.seq.to_string(),
        event.id.clone(),
        event.task_id.clone(),
        event.timestamp.to_rfc3339(),
        event.proposed_command.clone(),
        event.classification.as_str().to_string(),
        decision.to_string(),
        event.denial.map(|d| d.code()).unwrap_or("").to_string(),
        event.checkpoint_id.clone().unwrap_or_default(),
        event.authorization_id.clone().unwrap_or_default(),
        exit_code,
        event.duration_ms.to_string(),
        event.prev_hash.clone(),
    ];
    let mut hasher = Sha256::new();
    for value in &fields {
        // length prefix keeps adjacent fields from running together
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Link `event` after `prev_hash` and fill in its own hash.
pub fn seal(mut event: AuditEvent, prev_hash: &str) -> AuditEvent {
    event.prev_hash = prev_hash.to_string();
    event.hash = event_hash(&event);
    event
}

/// Verify a full journal (all tasks, in append order).
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), ChainError> {
    let mut prev = GENESIS_HASH;
    for (index, event) in events.iter().enumerate() {
        let expected = index as u64 + 1;
        if event.seq != expected {
            return Err(ChainError::SeqGap {
                expected,
                found: event.seq,
            });
        }
        if event.prev_hash != prev {
            return Err(ChainError::BrokenLink { seq: event.seq });
        }
        if event_hash(event) != event.hash {
            return Err(ChainError::Tampered { seq: event.seq });
        }
        prev = event.hash.as_str();
    }
    Ok(())
}
