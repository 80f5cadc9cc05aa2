//! Authorization ledger.
//!
//! Stores explicit user grants and answers whether a proposed command is
//! covered by one. Matching is exact (whitespace-normalized outside quotes)
//! unless a session grant names a command category; a category never covers a
//! compound command, since the extra commands were not part of the grant.
//! Single-use grants are consumed under the
//! ledger lock, and the consumption is journaled before it takes effect, so
//! a grant can never satisfy two executions.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::classifier::is_single_command;
use crate::core::types::{AuthorizationRecord, AuthorizationScope, MatchKind};
use crate::error::{GateError, GateResult};
use crate::io::journal::{Journal, JsonlJournal, NullJournal, read_jsonl};

/// Journal line of `authorizations.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "kebab-case")]
pub enum LedgerEntry {
    Recorded {
        record: AuthorizationRecord,
    },
    #[serde(rename_all = "camelCase")]
    Consumed {
        id: String,
        consumed_at: DateTime<Utc>,
    },
}

/// Grant to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub command_pattern: String,
    pub authorized_by: String,
    pub scope: AuthorizationScope,
    pub match_kind: MatchKind,
}

impl Grant {
    /// Single-use grant for exactly `command`.
    pub fn exact(command: impl Into<String>, authorized_by: impl Into<String>) -> Self {
        Self {
            command_pattern: command.into(),
            authorized_by: authorized_by.into(),
            scope: AuthorizationScope::SingleUse,
            match_kind: MatchKind::Exact,
        }
    }

    pub fn with_scope(mut self, scope: AuthorizationScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_match_kind(mut self, match_kind: MatchKind) -> Self {
        self.match_kind = match_kind;
        self
    }
}

struct LedgerInner {
    records: Vec<AuthorizationRecord>,
    journal: Box<dyn Journal<LedgerEntry>>,
}

pub struct AuthorizationLedger {
    inner: Mutex<LedgerInner>,
}

impl std::fmt::Debug for AuthorizationLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationLedger")
            .field("records", &self.inner.lock().records.len())
            .finish()
    }
}

impl Default for AuthorizationLedger {
    fn default() -> Self {
        Self::new(Box::new(NullJournal))
    }
}

impl AuthorizationLedger {
    pub fn new(journal: Box<dyn Journal<LedgerEntry>>) -> Self {
        Self::from_records(Vec::new(), journal)
    }

    fn from_records(
        records: Vec<AuthorizationRecord>,
        journal: Box<dyn Journal<LedgerEntry>>,
    ) -> Self {
        Self {
            inner: Mutex::new(LedgerInner { records, journal }),
        }
    }

    /// Open the ledger journal at `path`, replaying its entries.
    pub fn open(path: &Path) -> Result<Self> {
        let entries: Vec<LedgerEntry> = read_jsonl(path)?;
        let records = replay(entries).with_context(|| format!("replay {}", path.display()))?;
        debug!(path = %path.display(), records = records.len(), "authorization ledger opened");
        Ok(Self::from_records(
            records,
            Box::new(JsonlJournal::<LedgerEntry>::new(path)),
        ))
    }

    /// Record an explicit grant for `task_id`.
    pub fn record(
        &self,
        task_id: &str,
        grant: Grant,
        at: DateTime<Utc>,
    ) -> GateResult<AuthorizationRecord> {
        let pattern = normalize(&grant.command_pattern);
        if pattern.is_empty() {
            return Err(GateError::Invalid(
                "authorization command must not be empty".to_string(),
            ));
        }
        if grant.authorized_by.trim().is_empty() {
            return Err(GateError::Invalid(
                "authorization needs an approver (authorizedBy)".to_string(),
            ));
        }
        if grant.match_kind == MatchKind::Category && grant.scope != AuthorizationScope::Session {
            return Err(GateError::Invalid(
                "category authorizations must use session scope".to_string(),
            ));
        }

        let mut inner = self.inner.lock();
        let record = AuthorizationRecord {
            id: format!("auth-{:06}", inner.records.len() + 1),
            task_id: task_id.to_string(),
            command_pattern: pattern,
            match_kind: grant.match_kind,
            authorized_by: grant.authorized_by.trim().to_string(),
            authorized_at: at,
            scope: grant.scope,
            consumed_at: None,
        };
        inner
            .journal
            .append(&LedgerEntry::Recorded {
                record: record.clone(),
            })
            .map_err(GateError::Storage)?;
        inner.records.push(record.clone());
        info!(
            id = %record.id,
            task_id,
            pattern = %record.command_pattern,
            scope = record.scope.as_str(),
            "authorization recorded"
        );
        Ok(record)
    }

    /// Matching, usable record for `command`. Never consumes anything.
    pub fn is_authorized(&self, task_id: &str, command: &str) -> Option<AuthorizationRecord> {
        let inner = self.inner.lock();
        find_match(&inner.records, task_id, command).map(|index| inner.records[index].clone())
    }

    /// Atomically find and consume a matching record.
    ///
    /// Session records are returned without being consumed. If the journal
    /// cannot record the consumption the record stays unconsumed and the
    /// error is returned.
    pub fn consume_match(
        &self,
        task_id: &str,
        command: &str,
        at: DateTime<Utc>,
    ) -> GateResult<Option<AuthorizationRecord>> {
        let mut inner = self.inner.lock();
        let Some(index) = find_match(&inner.records, task_id, command) else {
            return Ok(None);
        };
        if inner.records[index].scope == AuthorizationScope::Session {
            return Ok(Some(inner.records[index].clone()));
        }
        let id = inner.records[index].id.clone();
        inner
            .journal
            .append(&LedgerEntry::Consumed {
                id: id.clone(),
                consumed_at: at,
            })
            .map_err(GateError::Storage)?;
        let record = &mut inner.records[index];
        record.consumed_at = Some(at);
        info!(id = %id, task_id, "single-use authorization consumed");
        Ok(Some(record.clone()))
    }

    pub fn records_for(&self, task_id: &str) -> Vec<AuthorizationRecord> {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|record| record.task_id == task_id)
            .cloned()
            .collect()
    }
}

fn replay(entries: Vec<LedgerEntry>) -> Result<Vec<AuthorizationRecord>> {
    let mut records: Vec<AuthorizationRecord> = Vec::new();
    for entry in entries {
        match entry {
            LedgerEntry::Recorded { record } => {
                if records.iter().any(|existing| existing.id == record.id) {
                    return Err(anyhow!("duplicate authorization id '{}'", record.id));
                }
                records.push(record);
            }
            LedgerEntry::Consumed { id, consumed_at } => {
                let record = records
                    .iter_mut()
                    .find(|record| record.id == id)
                    .ok_or_else(|| anyhow!("consumption of unknown authorization '{id}'"))?;
                if record.consumed_at.is_some() {
                    return Err(anyhow!("authorization '{id}' consumed twice"));
                }
                record.consumed_at = Some(consumed_at);
            }
        }
    }
    Ok(records)
}

fn find_match(records: &[AuthorizationRecord], task_id: &str, command: &str) -> Option<usize> {
    let proposed = normalize(command);
    let single = is_single_command(command);
    records.iter().position(|record| {
        record.task_id == task_id
            && record.consumed_at.is_none()
            && pattern_matches(record, &proposed, single)
    })
}

fn pattern_matches(record: &AuthorizationRecord, proposed: &str, single: bool) -> bool {
    match (record.scope, record.match_kind) {
        (AuthorizationScope::Session, MatchKind::Category) => {
            if !single {
                return false;
            }
            let pattern: Vec<&str> = record.command_pattern.split(' ').collect();
            let words: Vec<&str> = proposed.split(' ').collect();
            words.len() >= pattern.len() && words[..pattern.len()] == pattern[..]
        }
        _ => record.command_pattern == proposed,
    }
}

/// Collapse runs of unquoted whitespace so `git  push` and `git push` compare
/// equal. Quoted text is kept verbatim.
pub fn normalize(command: &str) -> String {
    let mut out = String::with_capacity(command.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut gap = false;
    for c in command.trim().chars() {
        if quote.is_none() && !escaped && c.is_whitespace() {
            gap = true;
            continue;
        }
        if gap {
            out.push(' ');
            gap = false;
        }
        out.push(c);
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (Some('\''), '\'') | (Some('"'), '"') => quote = None,
            (Some('\''), _) => {}
            (_, '\\') => escaped = true,
            (None, '\'' | '"') => quote = Some(c),
            _ => {}
        }
    }
    out
}

/// Category offered for a command: its leading words before the first flag,
/// at most two (`git push origin main` -> `git push`).
pub fn default_category(command: &str) -> String {
    command
        .split_whitespace()
        .take_while(|word| !word.starts_with('-'))
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn at() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    #[test]
    fn exact_match_only() {
        let ledger = AuthorizationLedger::default();
        ledger
            .record("t1", Grant::exact("terraform apply -target=module.x", "alice"), at())
            .expect("record");

        assert!(ledger.is_authorized("t1", "terraform apply").is_none());
        assert!(
            ledger
                .is_authorized("t1", "terraform apply -target=module.x -auto-approve")
                .is_none()
        );
        assert!(ledger.is_authorized("t2", "terraform apply -target=module.x").is_none());
        assert!(
            ledger
                .is_authorized("t1", "terraform  apply   -target=module.x")
                .is_some()
        );
    }

    #[test]
    fn single_use_is_consumed_once() {
        let ledger = AuthorizationLedger::default();
        let record = ledger
            .record("t1", Grant::exact("git push", "alice"), at())
            .expect("record");

        let first = ledger.consume_match("t1", "git push", at()).expect("consume");
        assert_eq!(first.map(|r| r.id), Some(record.id));
        assert!(ledger.consume_match("t1", "git push", at()).expect("consume").is_none());
        assert!(ledger.is_authorized("t1", "git push").is_none());
    }

    #[test]
    fn concurrent_consumers_cannot_double_spend() {
        let ledger = Arc::new(AuthorizationLedger::default());
        ledger
            .record("t1", Grant::exact("git push", "alice"), at())
            .expect("record");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    ledger
                        .consume_match("t1", "git push", at())
                        .expect("consume")
                        .is_some()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn session_category_matches_prefix_and_is_not_consumed() {
        let ledger = AuthorizationLedger::default();
        let grant = Grant::exact("git push", "alice")
            .with_scope(AuthorizationScope::Session)
            .with_match_kind(MatchKind::Category);
        ledger.record("t1", grant, at()).expect("record");

        for _ in 0..3 {
            let record = ledger
                .consume_match("t1", "git push origin main", at())
                .expect("consume")
                .expect("match");
            assert_eq!(record.consumed_at, None);
        }
        assert!(ledger.is_authorized("t1", "git pushy").is_none());
        assert!(ledger.is_authorized("t1", "gh pr create").is_none());
    }

    #[test]
    fn category_does_not_cover_compound_commands() {
        let ledger = AuthorizationLedger::default();
        let grant = Grant::exact("git push", "alice")
            .with_scope(AuthorizationScope::Session)
            .with_match_kind(MatchKind::Category);
        ledger.record("t1", grant, at()).expect("record");

        assert!(ledger.is_authorized("t1", "git push origin main").is_some());
        for command in [
            "git push && terraform destroy -auto-approve",
            "git push; gh pr merge 7",
            "git push origin main | sh",
            "git push $(terraform destroy)",
        ] {
            assert!(ledger.is_authorized("t1", command).is_none(), "{command}");
        }
    }

    #[test]
    fn exact_compound_grant_still_matches_itself() {
        let ledger = AuthorizationLedger::default();
        ledger
            .record("t1", Grant::exact("cargo test && git push", "alice"), at())
            .expect("record");
        assert!(ledger.is_authorized("t1", "cargo test  &&  git push").is_some());
    }

    #[test]
    fn normalization_keeps_quoted_whitespace() {
        assert_eq!(normalize("  git   commit -m \"a  b\" "), "git commit -m \"a  b\"");
        assert_eq!(normalize("echo 'x   y'   z"), "echo 'x   y' z");
        assert_eq!(normalize(r#"echo "a \"  b""#), r#"echo "a \"  b""#);

        let ledger = AuthorizationLedger::default();
        ledger
            .record("t1", Grant::exact(r#"git commit -m "a  b""#, "alice"), at())
            .expect("record");
        assert!(ledger.is_authorized("t1", r#"git commit -m "a b""#).is_none());
        assert!(
            ledger
                .is_authorized("t1", r#"git  commit   -m "a  b""#)
                .is_some()
        );
    }

    #[test]
    fn session_exact_does_not_match_prefix() {
        let ledger = AuthorizationLedger::default();
        let grant = Grant::exact("git push", "alice").with_scope(AuthorizationScope::Session);
        ledger.record("t1", grant, at()).expect("record");
        assert!(ledger.is_authorized("t1", "git push --force").is_none());
        assert!(ledger.is_authorized("t1", "git push").is_some());
    }

    #[test]
    fn rejects_category_without_session_scope() {
        let ledger = AuthorizationLedger::default();
        let grant = Grant::exact("git push", "alice").with_match_kind(MatchKind::Category);
        let err = ledger.record("t1", grant, at()).unwrap_err();
        assert!(matches!(err, GateError::Invalid(_)));
    }

    #[test]
    fn journal_replay_restores_consumption() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("authorizations.jsonl");
        {
            let ledger = AuthorizationLedger::open(&path).expect("open");
            ledger
                .record("t1", Grant::exact("git push", "alice"), at())
                .expect("record");
            ledger
                .record("t1", Grant::exact("gh pr create", "alice"), at())
                .expect("record");
            ledger.consume_match("t1", "git push", at()).expect("consume");
        }
        let reopened = AuthorizationLedger::open(&path).expect("reopen");
        assert!(reopened.is_authorized("t1", "git push").is_none());
        assert!(reopened.is_authorized("t1", "gh pr create").is_some());
        let records = reopened.records_for("t1");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].id, "auth-000002");
    }

    #[test]
    fn default_category_stops_at_flags() {
        assert_eq!(default_category("git push origin main"), "git push");
        assert_eq!(default_category("terraform -chdir=x apply"), "terraform");
    }
}
