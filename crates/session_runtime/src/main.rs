use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_session::agent_protocol::ConsentDecision;
use agent_session::{
    logging, ActivityStatus, MemoryTranscript, Notice, SessionConfig, TranscriptSink, TurnOutcome,
    UserMessage,
};
use anyhow::{bail, Context};
use clap::Parser;
use session_runtime::backends;
use session_runtime::executor::LocalActionExecutor;
use session_runtime::journal::JsonlJournal;
use session_runtime::runtime::RuntimeController;

const DEFAULT_PROMPT: &str = "Write NOTES.md and check that it is marked ready.";
const POLL_SLICE: Duration = Duration::from_millis(200);
const TURN_DEADLINE: Duration = Duration::from_secs(600);

/// Runs one agent turn headlessly against the configured backend.
#[derive(Debug, Parser)]
#[command(name = "session_runtime", version)]
struct CliArgs {
    /// Workspace root for file and command actions (defaults to the current directory)
    #[arg(long, value_name = "DIR")]
    workspace: Option<PathBuf>,

    /// Approve every command that asks for consent instead of skipping it
    #[arg(long)]
    allow_commands: bool,

    /// Append the finalized turn to a JSONL journal under the workspace
    #[arg(long)]
    journal: bool,

    /// Message sent to the agent
    #[arg(value_name = "PROMPT", trailing_var_arg = true)]
    prompt: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    logging::init_from_env();

    let args = CliArgs::parse();
    let config = SessionConfig::from_env().context("loading session config")?;
    let workspace = match args.workspace {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolving current directory")?,
    };

    let backend = backends::backend_from_env()?;
    let executor = LocalActionExecutor::new(&workspace)
        .map_err(anyhow::Error::msg)?
        .with_command_timeout(Duration::from_secs(config.command_timeout_sec));
    let sink: Arc<dyn TranscriptSink> = if args.journal {
        let session_id = uuid::Uuid::new_v4().to_string();
        let journal = JsonlJournal::create_new(executor.workspace_root(), &session_id)
            .context("creating session journal")?;
        println!("journal: {}", journal.path().display());
        Arc::new(journal)
    } else {
        Arc::new(MemoryTranscript::new())
    };

    let runtime = RuntimeController::new(config, backend, Arc::new(executor), sink);
    let prompt = if args.prompt.is_empty() {
        DEFAULT_PROMPT.to_string()
    } else {
        args.prompt.join(" ")
    };
    runtime.submit(UserMessage::new(prompt))?;

    let started = Instant::now();
    while !runtime.run_until_idle(POLL_SLICE) {
        for notice in runtime.take_notices() {
            print_notice(&notice);
        }
        for consent in runtime.pending_consents() {
            let decision = if args.allow_commands {
                ConsentDecision::Allow
            } else {
                ConsentDecision::Skip
            };
            println!("consent {} for `{}`: {decision:?}", consent.consent_id, consent.command);
            runtime.resolve_consent(&consent.consent_id, decision)?;
        }
        if started.elapsed() >= TURN_DEADLINE {
            runtime.shutdown();
            bail!("turn did not finish within {}s", TURN_DEADLINE.as_secs());
        }
    }
    for notice in runtime.take_notices() {
        print_notice(&notice);
    }

    let Some(entry) = runtime.transcript().pop() else {
        bail!("turn ended without a transcript entry");
    };
    println!();
    for activity in &entry.activities {
        let marker = match activity.status {
            ActivityStatus::Running => "…",
            ActivityStatus::Done => "✓",
            ActivityStatus::Error => "✗",
        };
        println!("{marker} {:<24} {}", activity.label, activity.detail);
    }
    if !entry.assistant_text.is_empty() {
        println!("\n{}", entry.assistant_text);
    }
    if let Some(summary) = &entry.summary {
        println!(
            "\nactions: {} total, {} succeeded, {} failed, {} skipped (+{} -{})",
            summary.total,
            summary.succeeded,
            summary.failed,
            summary.skipped,
            summary.lines_added,
            summary.lines_removed
        );
    }
    for note in &entry.notes {
        println!("note: {note}");
    }

    match entry.outcome {
        TurnOutcome::Completed => Ok(()),
        TurnOutcome::Cancelled => bail!("turn cancelled"),
        TurnOutcome::Failed { reason } => bail!("turn failed: {reason}"),
        TurnOutcome::RecoveryExhausted { signature } => {
            bail!("automatic recovery exhausted for {signature}")
        }
    }
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::StillWorking { elapsed_ms, .. } => {
            println!("still working ({}s)", elapsed_ms / 1000);
        }
        Notice::SignInRequired { message } => println!("sign-in required: {message}"),
        Notice::Connectivity { message } => println!("connection problem: {message}"),
        Notice::AgentError { message, .. } => println!("agent error: {message}"),
        Notice::ConsentRequired { command, .. } => println!("approval required: {command}"),
        Notice::RecoveryExhausted { note, .. } => println!("{note}"),
    }
}
