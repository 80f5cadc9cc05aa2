//! Workflow gate CLI.
//!
//! Keeps gate state in `.gate/` under the project root: config, task state,
//! the audit journal and the authorization ledger. Agents propose commands
//! with `gate propose` (or run them through `gate exec`); the exit code carries
//! the decision.

use std::path::PathBuf;
use std::process::Command as ProcessCommand;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use gatekeeper::commands::{TriggerCommand, run_trigger};
use gatekeeper::core::phases::hard_block;
use gatekeeper::core::types::{AuditEvent, AuthorizationScope, MatchKind, Phase};
use gatekeeper::engine::{Decision, WorkflowGateEngine};
use gatekeeper::error::GateError;
use gatekeeper::exit_codes;
use gatekeeper::io::approval::PromptApproval;
use gatekeeper::io::config::load_config;
use gatekeeper::io::git::Git;
use gatekeeper::io::init::{GatePaths, InitOptions, init_gate};
use gatekeeper::io::process::run_bounded;
use gatekeeper::ledger::Grant;
use gatekeeper::logging;

const EXEC_OUTPUT_LIMIT_BYTES: usize = 4_000_000;

#[derive(Parser)]
#[command(name = "gate", version, about = "Workflow gate for agent-proposed commands")]
struct Cli {
    /// Project root containing `.gate/`.
    #[arg(short = 'C', long = "dir", global = true, default_value = ".")]
    dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.gate/` with default config and empty state.
    Init {
        /// Reset config and state (journals are kept).
        #[arg(short, long)]
        force: bool,
    },
    /// Manage tasks.
    #[command(subcommand)]
    Task(TaskCommand),
    /// Run a workflow trigger (plan, creative, qa, build, review, self-review,
    /// quick-review, check-progress, archive).
    Run { task: String, trigger: TriggerCommand },
    /// Advance a task into a phase.
    Advance {
        task: String,
        #[arg(value_parser = parse_phase)]
        phase: Phase,
    },
    /// Print the classification of a command.
    Classify {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Record an explicit authorization.
    Authorize(AuthorizeArgs),
    /// Gate a command; prints the decision and, if approved, the ticket.
    Propose(ProposeArgs),
    /// Settle an approved ticket with the command's outcome.
    Record {
        ticket: String,
        #[arg(long)]
        exit_code: i32,
        #[arg(long, default_value_t = 0)]
        duration_ms: u64,
    },
    /// Propose a command, run it through `sh -c` if approved, record the outcome.
    Exec {
        #[command(flatten)]
        propose: ProposeArgs,
        /// Kill the command after this many seconds.
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    /// Create a checkpoint now, or end the current work session.
    Checkpoint {
        task: String,
        /// Drop the session anchor instead; the next write checkpoints again.
        #[arg(long)]
        end_session: bool,
    },
    /// Render the task's audit report and write it to the report directory.
    Report { task: String },
    /// Show tasks, blocks, session checkpoints and unsettled tickets.
    Status { task: Option<String> },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Start a task at Init.
    New {
        id: String,
        /// Complexity level (1-4).
        #[arg(short, long)]
        level: u8,
    },
}

#[derive(Args)]
struct AuthorizeArgs {
    task: String,
    /// Who authorized the command.
    #[arg(long = "by")]
    authorized_by: String,
    /// Keep the authorization for the rest of the task.
    #[arg(long)]
    session: bool,
    /// Match every command starting with the given words (implies --session).
    #[arg(long)]
    category: bool,
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Args)]
struct ProposeArgs {
    task: String,
    /// Ask on the terminal for remote writes without an authorization.
    #[arg(long)]
    approver: Option<String>,
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => match err.downcast_ref::<GateError>() {
            // gate errors already render their source
            Some(gate_err) => {
                eprintln!("{gate_err}");
                eprintln!("resolve: {}", gate_err.resolution());
                exit_codes::for_error(gate_err)
            }
            None => {
                eprintln!("{:#}", err);
                exit_codes::INVALID
            }
        },
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = GatePaths::new(&cli.dir);
    match cli.command {
        Command::Init { force } => {
            let paths = init_gate(&cli.dir, &InitOptions { force })?;
            println!("initialized {}", paths.gate_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Task(TaskCommand::New { id, level }) => {
            let engine = open_engine(&paths, None)?;
            let task = engine.create_task(&id, level)?;
            let phases: Vec<&str> = task.required_phases.iter().map(|p| p.name()).collect();
            println!("{} {}", task.id, phases.join(" -> "));
            Ok(exit_codes::OK)
        }
        Command::Run { task, trigger } => {
            let engine = open_engine(&paths, None)?;
            let outcome = run_trigger(&engine, &task, trigger)?;
            println!("{task} {}", outcome.transition.phase());
            if outcome.report.is_some() {
                let (_, path) = engine.write_report(&task)?;
                println!("report: {}", path.display());
            }
            Ok(exit_codes::OK)
        }
        Command::Advance { task, phase } => {
            let engine = open_engine(&paths, None)?;
            let transition = engine.advance_phase(&task, phase)?;
            println!("{task} {}", transition.phase());
            Ok(exit_codes::OK)
        }
        Command::Classify { command } => {
            let config = load_config(&paths.config_path)?;
            println!("{}", config.classifier()?.classify(&command.join(" ")));
            Ok(exit_codes::OK)
        }
        Command::Authorize(args) => cmd_authorize(&paths, args),
        Command::Propose(args) => {
            let engine = open_engine(&paths, args.approver.as_deref())?;
            let decision = engine.propose(&args.task, &args.command.join(" "))?;
            Ok(print_decision(&decision))
        }
        Command::Record {
            ticket,
            exit_code,
            duration_ms,
        } => {
            let engine = open_engine(&paths, None)?;
            let event = settle(&engine, &ticket, exit_code, duration_ms)?;
            println!("recorded {}", event.id);
            Ok(exit_codes::OK)
        }
        Command::Exec {
            propose,
            timeout_secs,
        } => cmd_exec(&paths, propose, Duration::from_secs(timeout_secs)),
        Command::Checkpoint { task, end_session } => {
            let engine = open_engine(&paths, None)?;
            if end_session {
                match engine.begin_session(&task)? {
                    Some(previous) => println!("session ended (was {previous})"),
                    None => println!("no active session"),
                }
            } else {
                let checkpoint = engine.fresh_checkpoint(&task)?;
                println!("{} {}", checkpoint.id, checkpoint.rollback_ref);
            }
            Ok(exit_codes::OK)
        }
        Command::Report { task } => {
            let engine = open_engine(&paths, None)?;
            let (_, path) = engine.write_report(&task)?;
            println!("{}", path.display());
            Ok(exit_codes::OK)
        }
        Command::Status { task } => cmd_status(&paths, task.as_deref()),
    }
}

fn parse_phase(raw: &str) -> Result<Phase, String> {
    Phase::parse(raw).ok_or_else(|| format!("unknown phase '{raw}'"))
}

fn open_engine(paths: &GatePaths, approver: Option<&str>) -> Result<WorkflowGateEngine<Git>> {
    if !paths.is_initialized() {
        bail!(
            "no gate state in {}; run `gate init` first",
            paths.root.display()
        );
    }
    let config = load_config(&paths.config_path)?;
    let git = Git::new(&paths.root)
        .with_timeout(Duration::from_secs(config.git.timeout_secs))
        .with_untracked(config.checkpoint.include_untracked);
    let mut builder = WorkflowGateEngine::open(paths, config, git)?;
    if let Some(approver) = approver {
        builder = builder.approval(Arc::new(PromptApproval::stdio(approver)));
    }
    builder.build().context("open gate engine")
}

fn cmd_authorize(paths: &GatePaths, args: AuthorizeArgs) -> Result<i32> {
    let engine = open_engine(paths, None)?;
    let mut grant = Grant::exact(args.command.join(" "), args.authorized_by);
    if args.session || args.category {
        grant = grant.with_scope(AuthorizationScope::Session);
    }
    if args.category {
        grant = grant.with_match_kind(MatchKind::Category);
    }
    let record = engine.authorize(&args.task, grant)?;
    println!("{} {}", record.id, record.command_pattern);
    Ok(exit_codes::OK)
}

/// Print the decision; returns the matching exit code.
fn print_decision(decision: &Decision) -> i32 {
    println!("{}", decision.code());
    match decision {
        Decision::Approved(ticket) => {
            println!("ticket: {}", ticket.ticket);
            if let Some(checkpoint) = &ticket.checkpoint_id {
                println!("checkpoint: {checkpoint}");
            }
            if let Some(authorization) = &ticket.authorization_id {
                println!("authorization: {authorization}");
            }
            exit_codes::OK
        }
        Decision::Denied(denial) => {
            eprintln!("{}", denial.message);
            eprintln!("resolve: {}", denial.resolution);
            exit_codes::for_denial(denial.reason)
        }
    }
}

/// Record the outcome of a ticket. A storage failure turns the execution into
/// a `denied:storage-failed` decision.
fn settle(
    engine: &WorkflowGateEngine<Git>,
    ticket: &str,
    exit_code: i32,
    duration_ms: u64,
) -> Result<AuditEvent> {
    match engine.record_execution(ticket, exit_code, duration_ms) {
        Ok(event) => Ok(event),
        Err(err) => {
            if let Some(reason) = err.denial_reason() {
                println!("{}", reason.code());
            }
            Err(err.into())
        }
    }
}

fn cmd_exec(paths: &GatePaths, args: ProposeArgs, timeout: Duration) -> Result<i32> {
    let engine = open_engine(paths, args.approver.as_deref())?;
    let command = args.command.join(" ");
    let decision = engine.propose(&args.task, &command)?;
    let ticket = match &decision {
        Decision::Approved(ticket) => ticket.ticket.clone(),
        Decision::Denied(_) => return Ok(print_decision(&decision)),
    };

    let mut child = ProcessCommand::new("sh");
    child.arg("-c").arg(&command).current_dir(&paths.root);
    let started = Instant::now();
    let (exit_code, output) = match run_bounded(child, timeout, EXEC_OUTPUT_LIMIT_BYTES) {
        Ok(output) => (output.status.code().unwrap_or(-1), Some(output)),
        Err(err) => {
            eprintln!("{:#}", err);
            (-1, None)
        }
    };
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    settle(&engine, &ticket, exit_code, duration_ms)?;

    if let Some(output) = output {
        print!("{}", String::from_utf8_lossy(&output.stdout));
        eprint!("{}", String::from_utf8_lossy(&output.stderr));
        if output.timed_out {
            eprintln!("command timed out after {}s", timeout.as_secs());
        }
    }
    Ok(exit_code)
}

fn cmd_status(paths: &GatePaths, only: Option<&str>) -> Result<i32> {
    let engine = open_engine(paths, None)?;
    let tasks: Vec<_> = engine
        .tasks()
        .into_iter()
        .filter(|task| only.is_none_or(|id| task.id == id))
        .collect();
    if let Some(id) = only
        && tasks.is_empty()
    {
        return Err(GateError::UnknownTask(id.to_string()).into());
    }
    for task in tasks {
        let state = if task.archived_at.is_some() {
            "archived".to_string()
        } else {
            match hard_block(&task) {
                Some(block) => format!("blocked: {}", block.resolution()),
                None => "open".to_string(),
            }
        };
        println!(
            "{} level {} {} [{}]",
            task.id, task.complexity_level, task.current_phase, state
        );
        if let Some(checkpoint) = engine.session_checkpoint(&task.id) {
            println!("  session checkpoint: {checkpoint}");
        }
        if let Some(pending) = engine.pending_for(&task.id) {
            println!("  unsettled: {} `{}`", pending.ticket, pending.command);
        }
    }
    Ok(exit_codes::OK)
}
