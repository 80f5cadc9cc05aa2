//! Audit report rendering.
//!
//! The report is a read-only projection of one task's events, checkpoints and
//! consumed authorizations. Everything in it is derived from recorded state
//! except `rendered_at`, so two renders of the same state differ only there.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::chain::ChainError;
use crate::core::phases::hard_block;
use crate::core::types::{
    AuditDecision, AuditEvent, AuthorizationRecord, Checkpoint, MatchKind, Task,
};
use crate::io::git::FileChange;
use crate::io::report_out::report_file_name;

const REPORT_TEMPLATE: &str = include_str!("templates/report.md");

/// Everything a report is rendered from.
#[derive(Debug)]
pub struct ReportInput<'a> {
    pub task: &'a Task,
    /// The task's events in append order.
    pub events: &'a [AuditEvent],
    pub checkpoints: &'a [Checkpoint],
    /// All authorization records of the task; only used ones are listed.
    pub authorizations: &'a [AuthorizationRecord],
    pub changes: Result<Vec<FileChange>, String>,
    pub chain: Result<(), ChainError>,
    pub repo: String,
    pub branch: String,
    pub rendered_at: DateTime<Utc>,
}

/// Rendered report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub task_id: String,
    pub file_name: String,
    pub markdown: String,
}

#[derive(Debug, Serialize)]
struct Timestamp {
    utc: String,
    local: String,
}

impl Timestamp {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            utc: utc(at),
            local: at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S %:z")
                .to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct TaskRow {
    id: String,
    level: u8,
    phases: String,
    phase: String,
    status: String,
}

#[derive(Debug, Serialize)]
struct EventRow {
    seq: u64,
    time: String,
    command: String,
    classification: &'static str,
    decision: &'static str,
    exit_code: String,
    duration_ms: u64,
    checkpoint: String,
    authorization: String,
}

#[derive(Debug, Serialize)]
struct CheckpointRow {
    id: String,
    utc: String,
    local: String,
    branch: String,
    baseline: String,
    snapshot: String,
    rollback: String,
}

#[derive(Debug, Serialize)]
struct AuthorizationRow {
    id: String,
    pattern: String,
    match_kind: &'static str,
    scope: &'static str,
    by: String,
    authorized_at: String,
    consumed_at: String,
}

#[derive(Debug, Serialize)]
struct ChangeRow {
    status: String,
    path: String,
}

#[derive(Debug, Serialize)]
struct Summary {
    total: usize,
    approved: usize,
    denied: usize,
}

/// Template engine wrapper around minijinja.
pub struct ReportBuilder {
    env: Environment<'static>,
}

impl Default for ReportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportBuilder {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("report.md", REPORT_TEMPLATE)
            .expect("report template should be valid");
        Self { env }
    }

    pub fn render(&self, input: &ReportInput<'_>) -> Result<AuditReport> {
        let task = input.task;
        let end = task
            .archived_at
            .or_else(|| input.events.last().map(|event| event.timestamp))
            .unwrap_or(task.created_at);

        let events: Vec<EventRow> = input.events.iter().map(event_row).collect();
        let approved = input
            .events
            .iter()
            .filter(|event| event.decision == AuditDecision::Approved)
            .count();
        let checkpoints: Vec<CheckpointRow> = input
            .checkpoints
            .iter()
            .map(|checkpoint| CheckpointRow {
                id: checkpoint.id.clone(),
                utc: utc(checkpoint.created_at),
                local: Timestamp::new(checkpoint.created_at).local,
                branch: checkpoint.branch.clone(),
                baseline: short(&checkpoint.baseline_ref),
                snapshot: short(&checkpoint.snapshot_ref),
                rollback: checkpoint.rollback_ref.clone(),
            })
            .collect();
        let authorizations = used_authorizations(input.authorizations, input.events);
        let (changes, changes_error) = match &input.changes {
            Ok(changes) => (
                changes
                    .iter()
                    .map(|change| ChangeRow {
                        status: change.status.clone(),
                        path: change.path.clone(),
                    })
                    .collect::<Vec<_>>(),
                None,
            ),
            Err(err) => (Vec::new(), Some(err.clone())),
        };

        let template = self.env.get_template("report.md")?;
        let markdown = template
            .render(context! {
                rendered_at => utc(input.rendered_at),
                task => TaskRow {
                    id: task.id.clone(),
                    level: task.complexity_level.get(),
                    phases: task
                        .required_phases
                        .iter()
                        .map(|phase| phase.name())
                        .collect::<Vec<_>>()
                        .join(" -> "),
                    phase: task.current_phase.name().to_string(),
                    status: status(task),
                },
                repo => md_cell(&input.repo),
                branch => md_cell(&input.branch),
                start => Timestamp::new(task.created_at),
                end => Timestamp::new(end),
                summary => Summary {
                    total: input.events.len(),
                    approved,
                    denied: input.events.len() - approved,
                },
                chain_error => input.chain.as_ref().err().map(ToString::to_string),
                events => events,
                checkpoints => checkpoints,
                authorizations => authorizations,
                changes => changes,
                changes_error => changes_error,
            })
            .with_context(|| format!("render report for task '{}'", task.id))?;

        Ok(AuditReport {
            task_id: task.id.clone(),
            file_name: report_file_name(&input.repo, &input.branch, input.rendered_at),
            markdown,
        })
    }
}

fn event_row(event: &AuditEvent) -> EventRow {
    let decision = match (event.decision, event.denial) {
        (AuditDecision::Approved, _) => "approved",
        (AuditDecision::Denied, Some(reason)) => reason.code(),
        (AuditDecision::Denied, None) => "denied",
    };
    EventRow {
        seq: event.seq,
        time: utc(event.timestamp),
        command: md_cell(&event.proposed_command).replace('`', "'"),
        classification: event.classification.as_str(),
        decision,
        exit_code: event
            .exit_code
            .map_or_else(|| "-".to_string(), |code| code.to_string()),
        duration_ms: event.duration_ms,
        checkpoint: event.checkpoint_id.clone().unwrap_or_else(|| "-".to_string()),
        authorization: event
            .authorization_id
            .clone()
            .unwrap_or_else(|| "-".to_string()),
    }
}

/// Single-use records that were consumed, plus session records an approved
/// event relied on.
fn used_authorizations(
    records: &[AuthorizationRecord],
    events: &[AuditEvent],
) -> Vec<AuthorizationRow> {
    let referenced: HashSet<&str> = events
        .iter()
        .filter(|event| event.decision == AuditDecision::Approved)
        .filter_map(|event| event.authorization_id.as_deref())
        .collect();
    records
        .iter()
        .filter(|record| record.consumed_at.is_some() || referenced.contains(record.id.as_str()))
        .map(|record| AuthorizationRow {
            id: record.id.clone(),
            pattern: md_cell(&record.command_pattern).replace('`', "'"),
            match_kind: match record.match_kind {
                MatchKind::Exact => "exact",
                MatchKind::Category => "category",
            },
            scope: record.scope.as_str(),
            by: md_cell(&record.authorized_by),
            authorized_at: utc(record.authorized_at),
            consumed_at: record.consumed_at.map_or_else(|| "-".to_string(), utc),
        })
        .collect()
}

fn status(task: &Task) -> String {
    if task.archived_at.is_some() {
        return "archived".to_string();
    }
    match hard_block(task) {
        Some(violation) => format!("writes blocked: {}", violation.resolution()),
        None => "active".to_string(),
    }
}

fn utc(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn short(reference: &str) -> String {
    reference.chars().take(12).collect()
}

/// Keep table rows intact.
fn md_cell(raw: &str) -> String {
    raw.replace('|', "\\|").replace('\n', " ")
}
