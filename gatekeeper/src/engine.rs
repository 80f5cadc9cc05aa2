//! Workflow gate engine.
//!
//! Every proposed command goes through [`WorkflowGateEngine::propose`]:
//!
//! 1. classify the command;
//! 2. deny write-class commands while the task has a hard phase block;
//! 3. deny remote writes without a matching authorization (asking the
//!    approval channel first);
//! 4. make sure a checkpoint covers the current session before any write;
//! 5. consume the authorization and hand out an approval ticket.
//!
//! The caller runs the command itself and settles the ticket with
//! [`WorkflowGateEngine::record_execution`], which appends the approved audit
//! event. Denials are recorded immediately. A task has at most one unsettled
//! ticket, so its audit events stay in proposal-arrival order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditLog, NewEvent};
use crate::checkpoint::CheckpointManager;
use crate::clock::{Clock, SystemClock};
use crate::core::classifier::CommandClassifier;
use crate::core::ids::{time_derived_id, validate_id};
use crate::core::phases::{self, PhaseViolation, Transition, hard_block, new_task};
use crate::core::types::{
    AuditDecision, AuditEvent, AuthorizationRecord, Checkpoint, Classification, ComplexityLevel,
    DenialReason, Phase, Task,
};
use crate::error::{GateError, GateResult};
use crate::io::approval::{
    ApprovalChannel, ApprovalOutcome, ApprovalRequest, Cancellation, DenyAll,
};
use crate::io::config::GateConfig;
use crate::io::git::Vcs;
use crate::io::init::GatePaths;
use crate::io::mirror::{MarkdownMirror, NoMirror, TaskMirror};
use crate::io::report_out::{report_dir, write_report};
use crate::io::state_store::{
    FileStateStore, GateState, MemoryStateStore, PendingExecution, StateStore,
};
use crate::ledger::{AuthorizationLedger, Grant};
use crate::report::{AuditReport, ReportBuilder, ReportInput};

/// Approved proposal; settle it with [`WorkflowGateEngine::record_execution`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalTicket {
    pub ticket: String,
    pub task_id: String,
    pub command: String,
    pub classification: Classification,
    pub checkpoint_id: Option<String>,
    pub authorization_id: Option<String>,
}

/// Denied proposal with the violated invariant and how to resolve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub reason: DenialReason,
    pub classification: Classification,
    pub message: String,
    pub resolution: String,
    /// Audit event recording the denial (absent if the journal failed).
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approved(ApprovalTicket),
    Denied(Denial),
}

impl Decision {
    /// `approved` or `denied:<reason>`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Approved(_) => "approved",
            Self::Denied(denial) => denial.reason.code(),
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved(_))
    }

    pub fn ticket(&self) -> Option<&ApprovalTicket> {
        match self {
            Self::Approved(ticket) => Some(ticket),
            Self::Denied(_) => None,
        }
    }

    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Self::Approved(_) => None,
            Self::Denied(denial) => Some(denial),
        }
    }
}

/// State plus the stores that persist it; always locked together.
struct StateCell {
    state: GateState,
    store: Box<dyn StateStore>,
    mirror: Box<dyn TaskMirror>,
}

impl StateCell {
    fn persist(&mut self, active: &str) -> Result<()> {
        self.store.save(&self.state)?;
        if let Err(err) = self.mirror.save(&self.state, active) {
            warn!(err = %format!("{err:#}"), "failed to refresh context mirror");
        }
        Ok(())
    }

    fn task(&self, task_id: &str) -> GateResult<&Task> {
        self.state
            .task(task_id)
            .ok_or_else(|| GateError::UnknownTask(task_id.to_string()))
    }

    /// Apply `change` to the state and persist it. The previous state is
    /// restored if `change` fails or the state cannot be saved.
    fn commit<T>(
        &mut self,
        active: &str,
        change: impl FnOnce(&mut GateState) -> GateResult<T>,
    ) -> GateResult<T> {
        let before = self.state.clone();
        let value = match change(&mut self.state) {
            Ok(value) => value,
            Err(err) => {
                self.state = before;
                return Err(err);
            }
        };
        if let Err(err) = self.persist(active) {
            self.state = before;
            return Err(GateError::Storage(err));
        }
        Ok(value)
    }
}

/// Builder for [`WorkflowGateEngine`].
pub struct EngineBuilder<V> {
    vcs: V,
    config: GateConfig,
    clock: Arc<dyn Clock>,
    store: Box<dyn StateStore>,
    mirror: Box<dyn TaskMirror>,
    audit: AuditLog,
    ledger: AuthorizationLedger,
    approval: Arc<dyn ApprovalChannel>,
    report_root: Option<PathBuf>,
}

impl<V: Vcs> EngineBuilder<V> {
    pub fn config(mut self, config: GateConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(mut self, store: Box<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn mirror(mut self, mirror: Box<dyn TaskMirror>) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn ledger(mut self, ledger: AuthorizationLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn approval(mut self, approval: Arc<dyn ApprovalChannel>) -> Self {
        self.approval = approval;
        self
    }

    /// Project root used to resolve the report extras directory.
    pub fn report_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.report_root = Some(root.into());
        self
    }

    pub fn build(self) -> Result<WorkflowGateEngine<V>> {
        self.config.validate()?;
        let classifier = self.config.classifier()?;
        let state = self.store.load().context("load gate state")?;
        Ok(WorkflowGateEngine {
            classifier,
            ledger: self.ledger,
            audit: self.audit,
            checkpoints: CheckpointManager::new(self.vcs, self.config.checkpoint.anchor_prefix.clone()),
            reports: ReportBuilder::new(),
            clock: self.clock,
            approval: self.approval,
            approval_timeout: self.config.approval.timeout_secs.map(Duration::from_secs),
            extras_dir: self.config.report.extras_dir.clone(),
            report_root: self.report_root,
            cell: Mutex::new(StateCell {
                state,
                store: self.store,
                mirror: self.mirror,
            }),
        })
    }
}

pub struct WorkflowGateEngine<V> {
    classifier: CommandClassifier,
    ledger: AuthorizationLedger,
    audit: AuditLog,
    checkpoints: CheckpointManager<V>,
    reports: ReportBuilder,
    clock: Arc<dyn Clock>,
    approval: Arc<dyn ApprovalChannel>,
    approval_timeout: Option<Duration>,
    extras_dir: String,
    report_root: Option<PathBuf>,
    cell: Mutex<StateCell>,
}

impl<V: Vcs> WorkflowGateEngine<V> {
    /// In-memory engine with default config, no mirror and a deny-all approver.
    pub fn builder(vcs: V) -> EngineBuilder<V> {
        EngineBuilder {
            vcs,
            config: GateConfig::default(),
            clock: Arc::new(SystemClock),
            store: Box::new(MemoryStateStore::default()),
            mirror: Box::new(NoMirror),
            audit: AuditLog::default(),
            ledger: AuthorizationLedger::default(),
            approval: Arc::new(DenyAll),
            report_root: None,
        }
    }

    /// File-backed engine over an initialized `.gate/` directory.
    pub fn open(paths: &GatePaths, config: GateConfig, vcs: V) -> Result<EngineBuilder<V>> {
        let audit = AuditLog::open(&paths.audit_path)?;
        let ledger = AuthorizationLedger::open(&paths.authorizations_path)?;
        Ok(Self::builder(vcs)
            .config(config)
            .store(Box::new(FileStateStore::new(&paths.state_path)))
            .mirror(Box::new(MarkdownMirror::new(&paths.memory_dir)))
            .audit(audit)
            .ledger(ledger)
            .report_root(&paths.root))
    }

    pub fn classify(&self, command: &str) -> Classification {
        self.classifier.classify(command)
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn ledger(&self) -> &AuthorizationLedger {
        &self.ledger
    }

    pub fn vcs(&self) -> &V {
        self.checkpoints.vcs()
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.lock().state.task(task_id).cloned()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.lock().state.tasks.clone()
    }

    pub fn checkpoints_for(&self, task_id: &str) -> Vec<Checkpoint> {
        self.lock().state.checkpoints_for(task_id).cloned().collect()
    }

    /// Checkpoint covering the task's current session, if any.
    pub fn session_checkpoint(&self, task_id: &str) -> Option<String> {
        self.lock().state.sessions.get(task_id).cloned()
    }

    pub fn pending_for(&self, task_id: &str) -> Option<PendingExecution> {
        self.lock().state.pending_for(task_id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, StateCell> {
        self.cell.lock()
    }

    /// Start a task at `Init` with the phase sequence of `level`.
    ///
    /// Ids are never reused: an id with authorizations or audit events on
    /// record (for example from before a forced re-init) is refused.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn create_task(&self, task_id: &str, level: u8) -> GateResult<Task> {
        validate_id(task_id).map_err(GateError::Invalid)?;
        let level = ComplexityLevel::new(level).map_err(GateError::Invalid)?;
        let now = self.clock.now();
        let mut cell = self.lock();
        if !self.ledger.records_for(task_id).is_empty()
            || !self.audit.events_for(task_id).is_empty()
        {
            warn!("task id already has journal history");
            return Err(GateError::TaskExists(task_id.to_string()));
        }
        let task = cell.commit(task_id, |state| {
            if state.task(task_id).is_some() {
                return Err(GateError::TaskExists(task_id.to_string()));
            }
            let task = new_task(task_id, level, now);
            state.tasks.push(task.clone());
            Ok(task)
        })?;
        info!(level = %level, "task created");
        Ok(task)
    }

    /// Move the task to `target` (see [`phases::advance`]).
    ///
    /// An out-of-order advance is rejected and also leaves a hard block on
    /// the task until the skipped phase has been completed.
    #[instrument(skip_all, fields(task_id = %task_id, target = %target))]
    pub fn advance_phase(&self, task_id: &str, target: Phase) -> GateResult<Transition> {
        let mut cell = self.lock();
        cell.task(task_id)?;
        let mut violation = None;
        let transition = cell.commit(task_id, |state| {
            let task = state
                .task_mut(task_id)
                .ok_or_else(|| GateError::UnknownTask(task_id.to_string()))?;
            match phases::advance(task, target) {
                Ok(transition) => Ok(Some(transition)),
                Err(err) => {
                    // keep the block recorded on the task
                    violation = Some(err);
                    Ok(None)
                }
            }
        })?;
        match (transition, violation) {
            (Some(transition), _) => {
                info!(phase = %transition.phase(), "phase entered");
                Ok(transition)
            }
            (None, Some(violation)) => {
                warn!(err = %violation, "phase advance rejected");
                Err(GateError::PhaseViolation(violation))
            }
            (None, None) => Err(GateError::Invalid("phase advance produced no result".to_string())),
        }
    }

    /// Archive the task. Archived tasks deny every write proposal.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn archive(&self, task_id: &str) -> GateResult<Transition> {
        let now = self.clock.now();
        let mut cell = self.lock();
        cell.task(task_id)?;
        if let Some(pending) = cell.state.pending_for(task_id) {
            return Err(GateError::ExecutionPending {
                task_id: task_id.to_string(),
                command: pending.command.clone(),
            });
        }
        let transition = cell.commit(task_id, |state| {
            let task = state
                .task_mut(task_id)
                .ok_or_else(|| GateError::UnknownTask(task_id.to_string()))?;
            let transition = phases::archive(task, now)?;
            state.sessions.remove(task_id);
            Ok(transition)
        })?;
        info!("task archived");
        Ok(transition)
    }

    /// Record an explicit authorization for a task.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn authorize(&self, task_id: &str, grant: Grant) -> GateResult<AuthorizationRecord> {
        {
            let cell = self.lock();
            if cell.task(task_id)?.archived_at.is_some() {
                return Err(GateError::PhaseViolation(PhaseViolation::Archived));
            }
        }
        self.ledger.record(task_id, grant, self.clock.now())
    }

    /// Drop the session anchor so the next write takes a fresh checkpoint.
    /// Returns the checkpoint that covered the finished session.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn begin_session(&self, task_id: &str) -> GateResult<Option<String>> {
        let mut cell = self.lock();
        cell.task(task_id)?;
        let previous = cell.commit(task_id, |state| Ok(state.sessions.remove(task_id)))?;
        debug!(previous = ?previous, "new work session");
        Ok(previous)
    }

    /// Create a checkpoint now and make it the session anchor.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn fresh_checkpoint(&self, task_id: &str) -> GateResult<Checkpoint> {
        let now = self.clock.now();
        let mut cell = self.lock();
        if cell.task(task_id)?.archived_at.is_some() {
            return Err(GateError::PhaseViolation(PhaseViolation::Archived));
        }
        self.checkpoint_locked(&mut cell, task_id, now)
    }

    fn checkpoint_locked(
        &self,
        cell: &mut StateCell,
        task_id: &str,
        at: DateTime<Utc>,
    ) -> GateResult<Checkpoint> {
        let checkpoint = self
            .checkpoints
            .create(task_id, &cell.state.checkpoints, at)?;
        cell.commit(task_id, |state| {
            state.checkpoints.push(checkpoint.clone());
            state
                .sessions
                .insert(task_id.to_string(), checkpoint.id.clone());
            Ok(())
        })?;
        Ok(checkpoint)
    }

    /// Gate a proposed command, using the configured approval channel and
    /// approval timeout.
    pub fn propose(&self, task_id: &str, command: &str) -> GateResult<Decision> {
        let cancel = match self.approval_timeout {
            Some(timeout) => Cancellation::with_timeout(timeout),
            None => Cancellation::new(),
        };
        self.propose_with(task_id, command, &cancel)
    }

    /// Gate a proposed command. `cancel` bounds the wait for a human approval;
    /// cancellation yields `denied:unauthorized`.
    ///
    /// Errors are reserved for caller mistakes (unknown task, unsettled
    /// ticket, empty command); every gate failure becomes a denied decision.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn propose_with(
        &self,
        task_id: &str,
        command: &str,
        cancel: &Cancellation,
    ) -> GateResult<Decision> {
        let command = command.trim();
        if command.is_empty() {
            return Err(GateError::Invalid("command must not be empty".to_string()));
        }
        let arrival = self.clock.now();
        let classification = self.classifier.classify(command);
        debug!(command, classification = %classification, "proposal classified");
        let proposal = Proposal {
            task_id,
            command,
            classification,
            arrival,
        };

        let mut cell = self.lock();
        let task = self.admit(&cell, task_id)?;

        if classification.is_write()
            && let Some(violation) = hard_block(&task)
        {
            return Ok(self.deny(&proposal, GateError::PhaseViolation(violation), None));
        }

        if classification == Classification::RemoteWrite
            && self.ledger.is_authorized(task_id, command).is_none()
        {
            drop(cell);
            if let Err(err) = self.request_approval(&proposal, cancel) {
                return Ok(self.deny(&proposal, err, None));
            }
            // the task may have moved on while the lock was released
            cell = self.lock();
            let task = match self.admit(&cell, task_id) {
                Ok(task) => task,
                Err(err) => {
                    return Ok(self.deny_as(&proposal, DenialReason::Unauthorized, err, None));
                }
            };
            if let Some(violation) = hard_block(&task) {
                return Ok(self.deny(&proposal, GateError::PhaseViolation(violation), None));
            }
        }

        let mut checkpoint_id = None;
        if classification.is_write() {
            let session = cell.state.sessions.get(task_id).cloned();
            checkpoint_id = match session {
                Some(id) => Some(id),
                None => match self.checkpoint_locked(&mut cell, task_id, arrival) {
                    Ok(checkpoint) => Some(checkpoint.id),
                    Err(err) => return Ok(self.deny(&proposal, err, None)),
                },
            };
        }

        let mut authorization_id = None;
        if classification == Classification::RemoteWrite {
            match self.ledger.consume_match(task_id, command, arrival) {
                Ok(Some(record)) => authorization_id = Some(record.id),
                Ok(None) => {
                    let err = GateError::Authorization {
                        command: command.to_string(),
                    };
                    return Ok(self.deny(&proposal, err, checkpoint_id));
                }
                Err(err) => return Ok(self.deny(&proposal, err, checkpoint_id)),
            }
        }

        let ticket = time_derived_id(&format!("{task_id}-run"), arrival, |candidate| {
            cell.state
                .pending
                .iter()
                .any(|pending| pending.ticket == candidate)
        })
        .map_err(GateError::Invalid)?;
        let pending = PendingExecution {
            ticket: ticket.clone(),
            task_id: task_id.to_string(),
            command: command.to_string(),
            classification,
            checkpoint_id: checkpoint_id.clone(),
            authorization_id: authorization_id.clone(),
            proposed_at: arrival,
        };
        if let Err(err) = cell.commit(task_id, |state| {
            state.pending.push(pending);
            Ok(())
        }) {
            return Ok(self.deny(&proposal, err, checkpoint_id));
        }

        info!(ticket = %ticket, classification = %classification, "proposal approved");
        Ok(Decision::Approved(ApprovalTicket {
            ticket,
            task_id: task_id.to_string(),
            command: command.to_string(),
            classification,
            checkpoint_id,
            authorization_id,
        }))
    }

    /// Task snapshot for a new proposal; refuses while a ticket is unsettled.
    fn admit(&self, cell: &StateCell, task_id: &str) -> GateResult<Task> {
        let task = cell.task(task_id)?.clone();
        if let Some(pending) = cell.state.pending_for(task_id) {
            return Err(GateError::ExecutionPending {
                task_id: task_id.to_string(),
                command: pending.command.clone(),
            });
        }
        Ok(task)
    }

    /// Block on the approval channel; a grant becomes an authorization record.
    fn request_approval(&self, proposal: &Proposal<'_>, cancel: &Cancellation) -> GateResult<()> {
        let request = ApprovalRequest {
            task_id: proposal.task_id.to_string(),
            command: proposal.command.to_string(),
            classification: proposal.classification,
        };
        let unauthorized = || GateError::Authorization {
            command: proposal.command.to_string(),
        };
        match self.approval.request(&request, cancel) {
            ApprovalOutcome::Granted(grant) => {
                let pattern = grant
                    .command_pattern
                    .unwrap_or_else(|| proposal.command.to_string());
                let grant = Grant::exact(pattern, grant.authorized_by)
                    .with_scope(grant.scope)
                    .with_match_kind(grant.match_kind);
                match self.ledger.record(proposal.task_id, grant, self.clock.now()) {
                    Ok(record) => {
                        info!(authorization_id = %record.id, "approval granted");
                        Ok(())
                    }
                    Err(GateError::Invalid(reason)) => {
                        warn!(reason = %reason, "approval grant rejected");
                        Err(unauthorized())
                    }
                    Err(err) => Err(err),
                }
            }
            ApprovalOutcome::Denied { by } => {
                info!(by = %by, "approval denied");
                Err(unauthorized())
            }
            ApprovalOutcome::Cancelled => {
                info!("approval wait cancelled");
                Err(unauthorized())
            }
        }
    }

    /// Turn a gate error into a denied decision plus a denied audit event.
    fn deny(&self, proposal: &Proposal<'_>, err: GateError, checkpoint_id: Option<String>) -> Decision {
        let reason = err.denial_reason().unwrap_or(DenialReason::StorageFailed);
        self.deny_as(proposal, reason, err, checkpoint_id)
    }

    fn deny_as(
        &self,
        proposal: &Proposal<'_>,
        reason: DenialReason,
        err: GateError,
        checkpoint_id: Option<String>,
    ) -> Decision {
        warn!(
            command = proposal.command,
            decision = reason.code(),
            err = %err,
            "proposal denied"
        );
        let recorded = self.audit.record(NewEvent {
            task_id: proposal.task_id.to_string(),
            timestamp: proposal.arrival,
            proposed_command: proposal.command.to_string(),
            classification: proposal.classification,
            decision: AuditDecision::Denied,
            denial: Some(reason),
            checkpoint_id,
            authorization_id: None,
            exit_code: None,
            duration_ms: 0,
        });
        let event_id = match recorded {
            Ok(event) => Some(event.id),
            Err(store_err) => {
                warn!(err = %store_err, "denial could not be recorded");
                None
            }
        };
        Decision::Denied(Denial {
            reason,
            classification: proposal.classification,
            message: err.to_string(),
            resolution: err.resolution(),
            event_id,
        })
    }

    /// Settle an approved ticket with the command's outcome.
    ///
    /// If the audit event cannot be stored the execution counts as not having
    /// happened: the ticket is dropped and `GateError::Storage` is returned.
    #[instrument(skip_all, fields(ticket = %ticket))]
    pub fn record_execution(
        &self,
        ticket: &str,
        exit_code: i32,
        duration_ms: u64,
    ) -> GateResult<AuditEvent> {
        let mut cell = self.lock();
        let pending = cell
            .state
            .take_pending(ticket)
            .ok_or_else(|| GateError::NoPendingExecution(ticket.to_string()))?;
        let recorded = self.audit.record(NewEvent {
            task_id: pending.task_id.clone(),
            timestamp: pending.proposed_at,
            proposed_command: pending.command.clone(),
            classification: pending.classification,
            decision: AuditDecision::Approved,
            denial: None,
            checkpoint_id: pending.checkpoint_id.clone(),
            authorization_id: pending.authorization_id.clone(),
            exit_code: Some(exit_code),
            duration_ms,
        });
        if let Err(err) = cell.persist(&pending.task_id) {
            warn!(err = %format!("{err:#}"), "failed to persist settled ticket");
        }
        match recorded {
            Ok(event) => {
                debug!(seq = event.seq, exit_code, "execution recorded");
                Ok(event)
            }
            Err(err) => {
                warn!(err = %err, "execution could not be recorded; treated as not executed");
                Err(err)
            }
        }
    }

    /// Render the task's audit report. Read-only.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn render_report(&self, task_id: &str) -> GateResult<AuditReport> {
        let (task, checkpoints) = {
            let cell = self.lock();
            let task = cell.task(task_id)?.clone();
            let checkpoints: Vec<Checkpoint> =
                cell.state.checkpoints_for(task_id).cloned().collect();
            (task, checkpoints)
        };
        let events = self.audit.events_for(task_id);
        let authorizations = self.ledger.records_for(task_id);
        let vcs = self.checkpoints.vcs();

        let baseline = match checkpoints.first() {
            Some(checkpoint) => Ok(checkpoint.baseline_ref.clone()),
            None => vcs.head().map(|head| head.commit),
        };
        let changes = baseline
            .and_then(|baseline| vcs.changes_since(&baseline))
            .map(|changes| {
                changes
                    .into_iter()
                    .filter(|change| !change.path.starts_with(".gate/"))
                    .collect::<Vec<_>>()
            })
            .map_err(|err| format!("{err:#}"));
        let repo = vcs.repo_name().unwrap_or_else(|err| {
            warn!(err = %format!("{err:#}"), "cannot resolve repository name");
            "unknown".to_string()
        });
        let branch = vcs
            .head()
            .map(|head| head.branch)
            .unwrap_or_else(|_| "unknown".to_string());

        let input = ReportInput {
            task: &task,
            events: &events,
            checkpoints: &checkpoints,
            authorizations: &authorizations,
            changes,
            chain: self.audit.verify(),
            repo,
            branch,
            rendered_at: self.clock.now(),
        };
        self.reports.render(&input).map_err(GateError::Report)
    }

    /// Render the report and write it to the report directory.
    pub fn write_report(&self, task_id: &str) -> GateResult<(AuditReport, PathBuf)> {
        let report = self.render_report(task_id)?;
        let dir = match &self.report_root {
            Some(root) => report_dir(root, &self.extras_dir, self.checkpoints.vcs()),
            None => std::env::temp_dir(),
        };
        let path = write_report(&dir, &report.file_name, &report.markdown)
            .map_err(GateError::Report)?;
        info!(path = %path.display(), "report written");
        Ok((report, path))
    }

    pub fn report_root(&self) -> Option<&Path> {
        self.report_root.as_deref()
    }
}

struct Proposal<'a> {
    task_id: &'a str,
    command: &'a str,
    classification: Classification,
    arrival: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::AuthorizationScope;
    use crate::io::approval::ApprovalGrant;
    use crate::test_support::{FaultyJournal, FixedClock, ScriptedApproval, ScriptedVcs};
    use std::sync::Weak;

    /// Grants every request, but first runs `during` against the engine,
    /// standing in for work that lands while a human is deciding.
    struct InterleavedApproval {
        engine: Mutex<Weak<WorkflowGateEngine<ScriptedVcs>>>,
        during: fn(&WorkflowGateEngine<ScriptedVcs>),
    }

    impl InterleavedApproval {
        fn new(during: fn(&WorkflowGateEngine<ScriptedVcs>)) -> Self {
            Self {
                engine: Mutex::new(Weak::new()),
                during,
            }
        }

        fn attach(&self, engine: &Arc<WorkflowGateEngine<ScriptedVcs>>) {
            *self.engine.lock() = Arc::downgrade(engine);
        }
    }

    impl ApprovalChannel for InterleavedApproval {
        fn request(&self, _request: &ApprovalRequest, _cancel: &Cancellation) -> ApprovalOutcome {
            let engine = self.engine.lock().upgrade();
            if let Some(engine) = engine {
                (self.during)(&engine);
            }
            ApprovalOutcome::Granted(ApprovalGrant::once("alice"))
        }
    }

    struct Harness {
        engine: WorkflowGateEngine<ScriptedVcs>,
        vcs: ScriptedVcs,
        clock: Arc<FixedClock>,
    }

    fn harness_with(approval: Arc<dyn ApprovalChannel>) -> Harness {
        let vcs = ScriptedVcs::default();
        let clock = Arc::new(FixedClock::default());
        let engine = WorkflowGateEngine::builder(vcs.clone())
            .clock(clock.clone())
            .approval(approval)
            .build()
            .expect("engine");
        Harness { engine, vcs, clock }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(DenyAll))
    }

    fn settle(engine: &WorkflowGateEngine<ScriptedVcs>, decision: &Decision) -> AuditEvent {
        let ticket = decision.ticket().expect("approved");
        engine
            .record_execution(&ticket.ticket, 0, 10)
            .expect("record execution")
    }

    #[test]
    fn read_is_approved_without_checkpoint() {
        let h = harness();
        h.engine.create_task("t1", 2).expect("task");
        let decision = h.engine.propose("t1", "git status").expect("propose");
        assert_eq!(decision.code(), "approved");
        assert_eq!(decision.ticket().and_then(|t| t.checkpoint_id.clone()), None);
        assert_eq!(h.vcs.snapshots(), 0);
        let event = settle(&h.engine, &decision);
        assert_eq!(event.exit_code, Some(0));
        assert_eq!(event.classification, Classification::LocalRead);
    }

    #[test]
    fn one_checkpoint_covers_the_session_until_a_new_one_begins() {
        let h = harness();
        h.engine.create_task("t1", 1).expect("task");
        let first = h.engine.propose("t1", "git commit -am one").expect("propose");
        settle(&h.engine, &first);
        let second = h.engine.propose("t1", "git commit -am two").expect("propose");
        settle(&h.engine, &second);
        assert_eq!(h.vcs.snapshots(), 1);
        assert_eq!(
            first.ticket().and_then(|t| t.checkpoint_id.clone()),
            second.ticket().and_then(|t| t.checkpoint_id.clone())
        );

        let previous = h.engine.begin_session("t1").expect("session");
        assert_eq!(previous, first.ticket().and_then(|t| t.checkpoint_id.clone()));
        let third = h.engine.propose("t1", "git commit -am three").expect("propose");
        assert_eq!(h.vcs.snapshots(), 2);
        assert_eq!(
            third.ticket().and_then(|t| t.checkpoint_id.clone()).as_deref(),
            Some("cp-20260102T030405Z-2")
        );
    }

    #[test]
    fn checkpoint_failure_denies_and_records_nothing_partial() {
        let h = harness();
        h.vcs.set_fail_snapshot(true);
        h.engine.create_task("t1", 1).expect("task");
        let decision = h.engine.propose("t1", "touch notes.txt").expect("propose");
        assert_eq!(decision.code(), "denied:checkpoint-failed");
        assert!(h.engine.checkpoints_for("t1").is_empty());
        assert_eq!(h.engine.session_checkpoint("t1"), None);

        h.vcs.set_fail_snapshot(false);
        let decision = h.engine.propose("t1", "touch notes.txt").expect("propose");
        assert!(decision.is_approved());
        assert_eq!(h.engine.checkpoints_for("t1").len(), 1);
    }

    #[test]
    fn unsettled_ticket_blocks_next_proposal() {
        let h = harness();
        h.engine.create_task("t1", 1).expect("task");
        let first = h.engine.propose("t1", "ls").expect("propose");
        let err = h.engine.propose("t1", "pwd").unwrap_err();
        assert!(matches!(err, GateError::ExecutionPending { .. }));
        settle(&h.engine, &first);
        assert!(h.engine.propose("t1", "pwd").expect("propose").is_approved());
    }

    #[test]
    fn granted_approval_records_and_consumes_authorization() {
        let approval = Arc::new(ScriptedApproval::new([ApprovalOutcome::Granted(
            ApprovalGrant::once("alice"),
        )]));
        let h = harness_with(approval.clone());
        h.engine.create_task("t1", 2).expect("task");

        let decision = h.engine.propose("t1", "git push").expect("propose");
        assert!(decision.is_approved());
        assert_eq!(approval.requests().len(), 1);
        let records = h.engine.ledger().records_for("t1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].authorized_by, "alice");
        assert!(records[0].consumed_at.is_some());
        settle(&h.engine, &decision);

        // queue is empty now: the scripted approver denies
        let again = h.engine.propose("t1", "git push").expect("propose");
        assert_eq!(again.code(), "denied:unauthorized");
    }

    #[test]
    fn session_grant_covers_repeated_commands() {
        let h = harness();
        h.engine.create_task("t1", 2).expect("task");
        let grant = Grant::exact("git push", "alice")
            .with_scope(AuthorizationScope::Session)
            .with_match_kind(crate::core::types::MatchKind::Category);
        h.engine.authorize("t1", grant).expect("authorize");
        for _ in 0..2 {
            let decision = h.engine.propose("t1", "git push origin main").expect("propose");
            assert!(decision.is_approved());
            settle(&h.engine, &decision);
        }
        assert_eq!(
            h.engine.propose("t1", "gh pr create").expect("propose").code(),
            "denied:unauthorized"
        );
        // the category does not stretch to a second remote write
        assert_eq!(
            h.engine
                .propose("t1", "git push && terraform destroy -auto-approve")
                .expect("propose")
                .code(),
            "denied:unauthorized"
        );
    }

    #[test]
    fn cancelled_approval_is_a_denial() {
        let (channel, _inbox) = crate::io::approval::ChannelApproval::pair();
        let h = harness_with(Arc::new(channel));
        h.engine.create_task("t1", 1).expect("task");
        let cancel = Cancellation::new();
        cancel.cancel();
        let decision = h
            .engine
            .propose_with("t1", "git push", &cancel)
            .expect("propose");
        assert_eq!(decision.code(), "denied:unauthorized");
        assert_eq!(h.engine.audit().len(), 1);
    }

    #[test]
    fn audit_storage_failure_on_execution_is_fail_closed() {
        let journal = FaultyJournal::default();
        let vcs = ScriptedVcs::default();
        let engine = WorkflowGateEngine::builder(vcs)
            .clock(Arc::new(FixedClock::default()))
            .audit(AuditLog::new(Box::new(journal.clone())))
            .build()
            .expect("engine");
        engine.create_task("t1", 1).expect("task");
        let decision = engine.propose("t1", "ls").expect("propose");
        let ticket = decision.ticket().expect("approved").ticket.clone();

        journal.set_failing(true);
        let err = engine.record_execution(&ticket, 0, 5).unwrap_err();
        assert_eq!(err.denial_reason(), Some(DenialReason::StorageFailed));
        assert!(engine.audit().is_empty());
        assert!(engine.pending_for("t1").is_none());
    }

    #[test]
    fn ledger_storage_failure_denies_remote_write() {
        let journal = FaultyJournal::default();
        let h = harness();
        let engine = WorkflowGateEngine::builder(h.vcs.clone())
            .clock(h.clock.clone())
            .ledger(AuthorizationLedger::new(Box::new(journal.clone())))
            .build()
            .expect("engine");
        engine.create_task("t1", 1).expect("task");
        engine
            .authorize("t1", Grant::exact("git push", "alice"))
            .expect("authorize");
        journal.set_failing(true);
        let decision = engine.propose("t1", "git push").expect("propose");
        assert_eq!(decision.code(), "denied:storage-failed");
        assert!(engine.ledger().is_authorized("t1", "git push").is_some());
    }

    #[test]
    fn proposal_settled_elsewhere_during_approval_is_a_recorded_denial() {
        let approval = Arc::new(InterleavedApproval::new(|engine| {
            engine.propose("t1", "ls").expect("interleaved proposal");
        }));
        let h = harness_with(approval.clone());
        let engine = Arc::new(h.engine);
        approval.attach(&engine);
        engine.create_task("t1", 1).expect("task");

        let decision = engine.propose("t1", "git push").expect("propose");
        assert_eq!(decision.code(), "denied:unauthorized");
        let denial = decision.denial().expect("denial");
        assert!(denial.event_id.is_some());
        assert_eq!(
            denial.resolution,
            "record the outcome of the approved command before proposing another"
        );
        let events = engine.audit().events_for("t1");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].proposed_command, "git push");
        assert_eq!(engine.pending_for("t1").map(|p| p.command), Some("ls".to_string()));
    }

    #[test]
    fn task_archived_during_approval_denies_the_write() {
        let approval = Arc::new(InterleavedApproval::new(|engine| {
            engine.archive("t1").expect("archive");
        }));
        let h = harness_with(approval.clone());
        let engine = Arc::new(h.engine);
        approval.attach(&engine);
        engine.create_task("t1", 1).expect("task");
        engine.advance_phase("t1", Phase::Build).expect("build");
        engine.advance_phase("t1", Phase::Review).expect("review");

        let decision = engine.propose("t1", "git push").expect("propose");
        assert_eq!(decision.code(), "denied:phase-violation");
        assert!(engine.checkpoints_for("t1").is_empty());
        assert!(engine.pending_for("t1").is_none());
        assert_eq!(engine.audit().len(), 1);
    }

    #[test]
    fn archived_task_denies_writes_but_allows_reads() {
        let h = harness();
        h.engine.create_task("t1", 1).expect("task");
        h.engine.advance_phase("t1", Phase::Build).expect("build");
        h.engine.advance_phase("t1", Phase::Review).expect("review");
        h.engine.archive("t1").expect("archive");

        let decision = h.engine.propose("t1", "git commit -am late").expect("propose");
        assert_eq!(decision.code(), "denied:phase-violation");
        let denial = decision.denial().expect("denial");
        assert_eq!(denial.resolution, "create a new task to continue work");
        assert!(h.engine.propose("t1", "git log").expect("propose").is_approved());
    }

    #[test]
    fn unknown_task_and_duplicate_task_are_errors() {
        let h = harness();
        assert!(matches!(
            h.engine.propose("nope", "ls"),
            Err(GateError::UnknownTask(_))
        ));
        h.engine.create_task("t1", 1).expect("task");
        assert!(matches!(
            h.engine.create_task("t1", 2),
            Err(GateError::TaskExists(_))
        ));
        assert!(matches!(
            h.engine.create_task("t2", 5),
            Err(GateError::Invalid(_))
        ));
    }

    #[test]
    fn task_id_with_journal_history_is_not_reused() {
        let h = harness();
        h.engine
            .ledger()
            .record("t1", Grant::exact("git push", "alice"), crate::test_support::fixed_time())
            .expect("record");
        assert!(matches!(
            h.engine.create_task("t1", 1),
            Err(GateError::TaskExists(_))
        ));
        h.engine.create_task("t2", 1).expect("fresh id");
    }

    #[test]
    fn clock_drives_event_timestamps() {
        let h = harness();
        h.engine.create_task("t1", 1).expect("task");
        h.clock.advance(chrono::Duration::seconds(30));
        let decision = h.engine.propose("t1", "ls").expect("propose");
        let event = settle(&h.engine, &decision);
        assert_eq!(
            event.timestamp,
            crate::test_support::fixed_time() + chrono::Duration::seconds(30)
        );
    }
}
