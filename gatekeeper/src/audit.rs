//! Append-only audit log.
//!
//! Events are sealed into a hash chain and written to the journal under one
//! lock, so appends never interleave and `seq` is gap-free. There is no API
//! that removes or edits an event; readers get copies.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::chain::{ChainError, GENESIS_HASH, seal, verify_chain};
use crate::core::types::{AuditDecision, AuditEvent, Classification, DenialReason};
use crate::error::{GateError, GateResult};
use crate::io::journal::{Journal, JsonlJournal, NullJournal, read_jsonl};

/// Fields of an event before it is sequenced and sealed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub proposed_command: String,
    pub classification: Classification,
    pub decision: AuditDecision,
    pub denial: Option<DenialReason>,
    pub checkpoint_id: Option<String>,
    pub authorization_id: Option<String>,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

struct AuditInner {
    events: Vec<AuditEvent>,
    journal: Box<dyn Journal<AuditEvent>>,
}

pub struct AuditLog {
    inner: Mutex<AuditInner>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("events", &self.inner.lock().events.len())
            .finish()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(Box::new(NullJournal))
    }
}

impl AuditLog {
    pub fn new(journal: Box<dyn Journal<AuditEvent>>) -> Self {
        Self {
            inner: Mutex::new(AuditInner {
                events: Vec::new(),
                journal,
            }),
        }
    }

    /// Open the journal at `path`.
    ///
    /// A journal whose chain does not verify still opens (the report states
    /// the break); new events keep linking after the last stored hash.
    pub fn open(path: &Path) -> Result<Self> {
        let events: Vec<AuditEvent> =
            read_jsonl(path).with_context(|| format!("open audit log {}", path.display()))?;
        if let Err(err) = verify_chain(&events) {
            warn!(path = %path.display(), err = %err, "audit chain does not verify");
        }
        debug!(path = %path.display(), events = events.len(), "audit log opened");
        Ok(Self {
            inner: Mutex::new(AuditInner {
                events,
                journal: Box::new(JsonlJournal::<AuditEvent>::new(path)),
            }),
        })
    }

    /// Sequence, seal and durably append an event.
    ///
    /// On a journal failure nothing is kept in memory either.
    pub fn record(&self, new: NewEvent) -> GateResult<AuditEvent> {
        let mut inner = self.inner.lock();
        let seq = inner.events.last().map_or(1, |last| last.seq + 1);
        let prev_hash = inner
            .events
            .last()
            .map_or(GENESIS_HASH, |last| last.hash.as_str())
            .to_string();
        let event = seal(
            AuditEvent {
                seq,
                id: format!("evt-{seq:06}"),
                task_id: new.task_id,
                timestamp: new.timestamp,
                proposed_command: new.proposed_command,
                classification: new.classification,
                decision: new.decision,
                denial: new.denial,
                checkpoint_id: new.checkpoint_id,
                authorization_id: new.authorization_id,
                exit_code: new.exit_code,
                duration_ms: new.duration_ms,
                prev_hash: String::new(),
                hash: String::new(),
            },
            &prev_hash,
        );
        inner.journal.append(&event).map_err(GateError::Storage)?;
        inner.events.push(event.clone());
        debug!(
            seq,
            task_id = %event.task_id,
            decision = ?event.decision,
            "audit event recorded"
        );
        Ok(event)
    }

    /// All events, in append order.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.inner.lock().events.clone()
    }

    pub fn events_for(&self, task_id: &str) -> Vec<AuditEvent> {
        self.inner
            .lock()
            .events
            .iter()
            .filter(|event| event.task_id == task_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Verify the full chain.
    pub fn verify(&self) -> Result<(), ChainError> {
        verify_chain(&self.inner.lock().events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::thread;

    fn new_event(task_id: &str, command: &str) -> NewEvent {
        NewEvent {
            task_id: task_id.to_string(),
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            proposed_command: command.to_string(),
            classification: Classification::LocalRead,
            decision: AuditDecision::Approved,
            denial: None,
            checkpoint_id: None,
            authorization_id: None,
            exit_code: Some(0),
            duration_ms: 5,
        }
    }

    #[test]
    fn records_are_sequenced_and_chained() {
        let log = AuditLog::default();
        let first = log.record(new_event("t1", "ls")).expect("record");
        let second = log.record(new_event("t2", "pwd")).expect("record");
        assert_eq!((first.seq, second.seq), (1, 2));
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(log.events_for("t2"), vec![second]);
        log.verify().expect("chain verifies");
    }

    #[test]
    fn returned_copies_cannot_alter_the_log() {
        let log = AuditLog::default();
        log.record(new_event("t1", "ls")).expect("record");
        let mut copies = log.events();
        copies[0].proposed_command = "rm -rf /".to_string();
        copies.clear();
        assert_eq!(log.len(), 1);
        assert_eq!(log.events()[0].proposed_command, "ls");
        log.verify().expect("chain verifies");
    }

    #[test]
    fn concurrent_appends_stay_gap_free() {
        let log = Arc::new(AuditLog::default());
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for n in 0..25 {
                        log.record(new_event(&format!("t{worker}"), &format!("cmd {n}")))
                            .expect("record");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(log.len(), 100);
        log.verify().expect("chain verifies");
    }

    #[test]
    fn reopen_continues_chain_and_detects_tampering() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("audit.jsonl");
        {
            let log = AuditLog::open(&path).expect("open");
            log.record(new_event("t1", "ls")).expect("record");
        }
        let log = AuditLog::open(&path).expect("reopen");
        let second = log.record(new_event("t1", "pwd")).expect("record");
        assert_eq!(second.seq, 2);
        log.verify().expect("chain verifies");

        let contents = fs::read_to_string(&path).expect("read");
        fs::write(&path, contents.replace("\"pwd\"", "\"curl evil\"")).expect("write");
        let tampered = AuditLog::open(&path).expect("open tampered");
        assert_eq!(tampered.verify(), Err(ChainError::Tampered { seq: 2 }));
    }
}
