//! Human-readable mirror of task/phase state (`.gate/memory/`).
//!
//! The mirror is write-mostly: the engine regenerates it after every state
//! change and never reads it back to make decisions.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::core::phases::{has_completed, hard_block};
use crate::core::types::Task;
use crate::io::fsutil::write_atomic;
use crate::io::state_store::GateState;

/// Contents of the three mirror documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorDocs {
    pub tasks: String,
    pub active_context: String,
    pub progress: String,
}

/// Load/save interface for the context mirror.
pub trait TaskMirror: Send {
    /// Regenerate the mirror; `active` is the task that just changed.
    fn save(&mut self, state: &GateState, active: &str) -> Result<()>;
    fn load(&self) -> Result<Option<MirrorDocs>>;
}

/// Mirror disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMirror;

impl TaskMirror for NoMirror {
    fn save(&mut self, _state: &GateState, _active: &str) -> Result<()> {
        Ok(())
    }

    fn load(&self) -> Result<Option<MirrorDocs>> {
        Ok(None)
    }
}

/// Markdown files `tasks.md`, `active-context.md`, `progress.md` in one directory.
#[derive(Debug, Clone)]
pub struct MarkdownMirror {
    dir: PathBuf,
}

impl MarkdownMirror {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl TaskMirror for MarkdownMirror {
    fn save(&mut self, state: &GateState, active: &str) -> Result<()> {
        let docs = render_docs(state, active);
        write_atomic(&self.dir.join("tasks.md"), &docs.tasks)?;
        write_atomic(&self.dir.join("active-context.md"), &docs.active_context)?;
        write_atomic(&self.dir.join("progress.md"), &docs.progress)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<MirrorDocs>> {
        let tasks_path = self.dir.join("tasks.md");
        if !tasks_path.exists() {
            return Ok(None);
        }
        let read = |name: &str| {
            let path = self.dir.join(name);
            fs::read_to_string(&path).with_context(|| format!("read mirror {}", path.display()))
        };
        Ok(Some(MirrorDocs {
            tasks: read("tasks.md")?,
            active_context: read("active-context.md")?,
            progress: read("progress.md")?,
        }))
    }
}

fn task_status(task: &Task) -> &'static str {
    if task.archived_at.is_some() {
        "archived"
    } else if hard_block(task).is_some() {
        "blocked"
    } else {
        "active"
    }
}

/// Render the mirror documents. Deterministic for a given state.
pub fn render_docs(state: &GateState, active: &str) -> MirrorDocs {
    let mut tasks = String::from("# Tasks\n\n| Task | Level | Phase | Status |\n|---|---|---|---|\n");
    for task in &state.tasks {
        let _ = writeln!(
            tasks,
            "| {} | {} | {} | {} |",
            task.id,
            task.complexity_level,
            task.current_phase,
            task_status(task)
        );
    }

    let mut active_context = String::from("# Active Context\n\n");
    match state.task(active) {
        Some(task) => {
            let _ = writeln!(active_context, "- Task: {}", task.id);
            let _ = writeln!(active_context, "- Level: {}", task.complexity_level);
            let _ = writeln!(active_context, "- Phase: {}", task.current_phase);
            let next = task
                .required_phases
                .iter()
                .find(|phase| **phase != task.current_phase && !has_completed(task, **phase));
            let _ = writeln!(
                active_context,
                "- Next phase: {}",
                next.map(|phase| phase.name()).unwrap_or("none")
            );
            let session = state.sessions.get(&task.id).map(String::as_str);
            let _ = writeln!(
                active_context,
                "- Session checkpoint: {}",
                session.unwrap_or("none")
            );
            if let Some(violation) = hard_block(task) {
                let _ = writeln!(active_context, "- Write block: {violation}");
                let _ = writeln!(active_context, "- Resolve by: {}", violation.resolution());
            }
        }
        None => active_context.push_str("No active task.\n"),
    }

    let mut progress = String::from("# Progress\n");
    for task in &state.tasks {
        let _ = write!(progress, "\n## {}\n\n", task.id);
        for phase in &task.required_phases {
            let mark = if has_completed(task, *phase)
                || (task.archived_at.is_some() && *phase == task.current_phase)
            {
                "x"
            } else if *phase == task.current_phase {
                "~"
            } else {
                " "
            };
            let _ = writeln!(progress, "- [{mark}] {phase}");
        }
        let checkpoints = state.checkpoints_for(&task.id).count();
        let _ = writeln!(progress, "\nCheckpoints: {checkpoints}");
    }

    MirrorDocs {
        tasks,
        active_context,
        progress,
    }
}
