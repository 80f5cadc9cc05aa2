//! Human approval of remote-write proposals.
//!
//! A proposal that needs authorization blocks in [`ApprovalChannel::request`]
//! until a human answers or the caller's [`Cancellation`] fires. There is no
//! timeout unless the caller sets one.

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::types::{AuthorizationScope, Classification, MatchKind};
use crate::ledger::default_category;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What the human is asked to approve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub task_id: String,
    pub command: String,
    pub classification: Classification,
}

/// A positive answer; becomes an authorization record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalGrant {
    pub authorized_by: String,
    pub scope: AuthorizationScope,
    pub match_kind: MatchKind,
    /// Pattern to record. `None` records the proposed command itself.
    pub command_pattern: Option<String>,
}

impl ApprovalGrant {
    /// Grant exactly the proposed command, once.
    pub fn once(authorized_by: impl Into<String>) -> Self {
        Self {
            authorized_by: authorized_by.into(),
            scope: AuthorizationScope::SingleUse,
            match_kind: MatchKind::Exact,
            command_pattern: None,
        }
    }

    /// Grant the proposed command for the rest of the task.
    pub fn session(authorized_by: impl Into<String>) -> Self {
        Self {
            scope: AuthorizationScope::Session,
            ..Self::once(authorized_by)
        }
    }

    /// Grant a whole command category (`git push`) for the rest of the task.
    pub fn category(authorized_by: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            scope: AuthorizationScope::Session,
            match_kind: MatchKind::Category,
            command_pattern: Some(category.into()),
            ..Self::once(authorized_by)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Granted(ApprovalGrant),
    Denied { by: String },
    Cancelled,
}

/// Cancellation handle for a blocking approval wait: a shared flag plus an
/// optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    /// Never fires unless [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn next_wait(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(POLL_INTERVAL),
            None => POLL_INTERVAL,
        }
    }
}

/// Source of human approval decisions.
pub trait ApprovalChannel: Send + Sync {
    fn request(&self, request: &ApprovalRequest, cancel: &Cancellation) -> ApprovalOutcome;
}

/// Denies every request without asking; the default for non-interactive use.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl ApprovalChannel for DenyAll {
    fn request(&self, request: &ApprovalRequest, _cancel: &Cancellation) -> ApprovalOutcome {
        debug!(task_id = %request.task_id, command = %request.command, "no approver configured");
        ApprovalOutcome::Denied {
            by: "no-approver".to_string(),
        }
    }
}

/// Request waiting in an [`ApprovalInbox`].
#[derive(Debug)]
pub struct PendingApproval {
    request: ApprovalRequest,
    reply: Sender<ApprovalOutcome>,
}

impl PendingApproval {
    pub fn request(&self) -> &ApprovalRequest {
        &self.request
    }

    pub fn grant(self, grant: ApprovalGrant) {
        self.answer(ApprovalOutcome::Granted(grant));
    }

    pub fn deny(self, by: impl Into<String>) {
        self.answer(ApprovalOutcome::Denied { by: by.into() });
    }

    fn answer(self, outcome: ApprovalOutcome) {
        if self.reply.send(outcome).is_err() {
            debug!(command = %self.request.command, "approval answered after requester gave up");
        }
    }
}

/// In-process channel: requests are delivered to an [`ApprovalInbox`] that
/// another thread answers.
#[derive(Debug)]
pub struct ChannelApproval {
    requests: Sender<PendingApproval>,
}

/// Receiving side of a [`ChannelApproval`].
#[derive(Debug)]
pub struct ApprovalInbox {
    requests: Receiver<PendingApproval>,
}

impl ChannelApproval {
    pub fn pair() -> (ChannelApproval, ApprovalInbox) {
        let (tx, rx) = mpsc::channel();
        (
            ChannelApproval { requests: tx },
            ApprovalInbox { requests: rx },
        )
    }
}

impl ApprovalInbox {
    /// Block until the next request arrives; `None` once every sender is gone.
    pub fn recv(&self) -> Option<PendingApproval> {
        self.requests.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<PendingApproval> {
        self.requests.recv_timeout(timeout).ok()
    }
}

impl ApprovalChannel for ChannelApproval {
    fn request(&self, request: &ApprovalRequest, cancel: &Cancellation) -> ApprovalOutcome {
        let (reply_tx, reply_rx) = mpsc::channel();
        let pending = PendingApproval {
            request: request.clone(),
            reply: reply_tx,
        };
        if self.requests.send(pending).is_err() {
            warn!(command = %request.command, "approval inbox closed");
            return ApprovalOutcome::Cancelled;
        }
        wait_for_answer(&reply_rx, cancel)
    }
}

fn wait_for_answer(reply: &Receiver<ApprovalOutcome>, cancel: &Cancellation) -> ApprovalOutcome {
    loop {
        if cancel.is_cancelled() {
            return ApprovalOutcome::Cancelled;
        }
        match reply.recv_timeout(cancel.next_wait()) {
            Ok(outcome) => return outcome,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return ApprovalOutcome::Cancelled,
        }
    }
}

/// Interactive line prompt (`y` once, `s` session, `c` category, anything else denies).
///
/// The answer is read on a helper thread so the wait still honours the
/// cancellation handle.
pub struct PromptApproval<R, W> {
    input: Arc<Mutex<R>>,
    output: Mutex<W>,
    approver: String,
}

impl<R, W> PromptApproval<R, W>
where
    R: BufRead + Send + 'static,
    W: Write + Send,
{
    pub fn new(input: R, output: W, approver: impl Into<String>) -> Self {
        Self {
            input: Arc::new(Mutex::new(input)),
            output: Mutex::new(output),
            approver: approver.into(),
        }
    }
}

impl PromptApproval<std::io::BufReader<std::io::Stdin>, std::io::Stderr> {
    /// Prompt on stderr, read answers from stdin.
    pub fn stdio(approver: impl Into<String>) -> Self {
        Self::new(
            std::io::BufReader::new(std::io::stdin()),
            std::io::stderr(),
            approver,
        )
    }
}

impl<R, W> ApprovalChannel for PromptApproval<R, W>
where
    R: BufRead + Send + 'static,
    W: Write + Send,
{
    fn request(&self, request: &ApprovalRequest, cancel: &Cancellation) -> ApprovalOutcome {
        let category = default_category(&request.command);
        {
            let mut out = self.output.lock();
            let written = write!(
                out,
                "task {} wants to run {} command:\n  {}\nauthorize? [y]es once / [s]ession / [c]ategory `{}` / [N]o: ",
                request.task_id, request.classification, request.command, category
            )
            .and_then(|()| out.flush());
            if let Err(err) = written {
                warn!(err = %err, "failed to write approval prompt");
                return ApprovalOutcome::Cancelled;
            }
        }

        let (tx, rx) = mpsc::channel();
        let input = Arc::clone(&self.input);
        let approver = self.approver.clone();
        thread::spawn(move || {
            let mut line = String::new();
            let outcome = match input.lock().read_line(&mut line) {
                Ok(0) | Err(_) => ApprovalOutcome::Cancelled,
                Ok(_) => parse_answer(line.trim(), &approver, &category),
            };
            let _ = tx.send(outcome);
        });
        wait_for_answer(&rx, cancel)
    }
}

fn parse_answer(answer: &str, approver: &str, category: &str) -> ApprovalOutcome {
    match answer.to_ascii_lowercase().as_str() {
        "y" | "yes" => ApprovalOutcome::Granted(ApprovalGrant::once(approver)),
        "s" | "session" => ApprovalOutcome::Granted(ApprovalGrant::session(approver)),
        "c" | "category" => ApprovalOutcome::Granted(ApprovalGrant::category(approver, category)),
        _ => ApprovalOutcome::Denied {
            by: approver.to_string(),
        },
    }
}
