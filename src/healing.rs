//! Bounded automatic recovery from failed actions and commands.
//!
//! Each failure is keyed by a signature (`<type>:<target>`). Consecutive
//! failures with the same signature count as attempts of one episode; a new
//! signature starts a new episode at attempt 1. Once an episode runs past
//! the attempt limit its signature is exhausted for the rest of the turn.

use std::collections::BTreeSet;
use std::fmt;
use std::fmt::Write as _;
use std::sync::OnceLock;

use agent_protocol::ProposedAction;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::activity::{ActivityEvent, ActivityKind, ActivityStatus};
use crate::command_tracker::{tail_chars, CommandFailure};

const MAX_KEY_ERROR_LINES: usize = 8;

fn error_line_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(
            r"(?i)\b(error|errors|failed|failure|exception|panicked|fatal|traceback|cannot|denied|not found|undefined)\b|^\s*(FAIL|✗|✖|×)",
        )
        .expect("error line regex must compile")
    })
}

fn ansi_escape_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("ansi regex must compile"))
}

/// Removes terminal color and cursor sequences from captured output.
#[must_use]
pub fn strip_ansi(text: &str) -> String {
    ansi_escape_regex().replace_all(text, "").into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureSignature(String);

impl FailureSignature {
    #[must_use]
    pub fn for_command(command: &str) -> Self {
        Self(format!("command:{}", command.trim()))
    }

    #[must_use]
    pub fn for_action(action: &ProposedAction) -> Self {
        if action.is_command() {
            Self::for_command(action.target())
        } else {
            Self(format!("{}:{}", action.type_name(), action.target()))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FailureSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything quoted back to the agent about one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureContext {
    pub signature: FailureSignature,
    /// "command", "edit" or "file creation"; used in prose only.
    pub what: &'static str,
    pub target: String,
    pub exit_code: Option<i32>,
    pub cwd: Option<String>,
    pub message: Option<String>,
    pub output: String,
}

impl FailureContext {
    #[must_use]
    pub fn from_command(failure: &CommandFailure) -> Self {
        Self {
            signature: FailureSignature::for_command(&failure.command),
            what: "command",
            target: failure.command.clone(),
            exit_code: failure.exit_code,
            cwd: failure.cwd.clone(),
            message: failure.message.as_deref().map(strip_ansi),
            output: strip_ansi(&failure.output_tail),
        }
    }

    /// Context for a failed action, enriched with the command it ran when known.
    #[must_use]
    pub fn from_action(
        action: &ProposedAction,
        reason: &str,
        command: Option<&CommandFailure>,
    ) -> Self {
        let what = match action.type_name() {
            "editFile" => "edit",
            "createFile" => "file creation",
            _ => "command",
        };
        let (cwd, exit_code, output) = match command {
            Some(failure) => (
                failure.cwd.clone(),
                failure.exit_code,
                strip_ansi(&failure.output_tail),
            ),
            None => (None, None, String::new()),
        };
        Self {
            signature: FailureSignature::for_action(action),
            what,
            target: action.target().to_string(),
            exit_code,
            cwd,
            message: Some(strip_ansi(reason)).filter(|reason| !reason.is_empty()),
            output,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryState {
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_failure_signature: Option<FailureSignature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealingPhase {
    Idle,
    Retrying(u32),
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealingDecision {
    /// Send `prompt` as a corrective chat request.
    Retry {
        attempt: u32,
        max_attempts: u32,
        signature: FailureSignature,
        prompt: String,
        activity: ActivityEvent,
    },
    /// The attempt limit was just exceeded. `progress` closes the episode's
    /// attempt activity as failed.
    Exhausted {
        signature: FailureSignature,
        note: String,
        activity: ActivityEvent,
        progress: ActivityEvent,
    },
    /// The signature was already exhausted; nothing more is done.
    Suppressed { signature: FailureSignature },
}

#[derive(Debug, Clone)]
pub struct SelfHealingController {
    state: RetryState,
    phase: HealingPhase,
    episode: u32,
    target: String,
    exhausted: BTreeSet<FailureSignature>,
    error_preview_chars: usize,
}

impl SelfHealingController {
    #[must_use]
    pub fn new(max_attempts: u32, error_preview_chars: usize) -> Self {
        Self {
            state: RetryState {
                attempt_count: 0,
                max_attempts,
                last_failure_signature: None,
            },
            phase: HealingPhase::Idle,
            episode: 0,
            target: String::new(),
            exhausted: BTreeSet::new(),
            error_preview_chars,
        }
    }

    pub fn on_failure(&mut self, failure: &FailureContext, now_ms: i64) -> HealingDecision {
        let signature = failure.signature.clone();
        if self.exhausted.contains(&signature) {
            tracing::debug!(%signature, "suppressing failure for exhausted signature");
            return HealingDecision::Suppressed { signature };
        }

        if self.state.last_failure_signature.as_ref() == Some(&signature) {
            self.state.attempt_count += 1;
        } else {
            self.state.attempt_count = 1;
            self.state.last_failure_signature = Some(signature.clone());
            self.episode += 1;
            self.target = failure.target.clone();
        }

        let attempt = self.state.attempt_count;
        let max_attempts = self.state.max_attempts;
        if attempt > max_attempts {
            tracing::warn!(%signature, max_attempts, "self-healing exhausted");
            self.exhausted.insert(signature.clone());
            self.phase = HealingPhase::Exhausted;
            let note = format!(
                "Automatic recovery stopped after {max_attempts} attempts: the {} `{}` kept failing. Review the error and decide how to proceed.",
                failure.what, failure.target
            );
            let activity = ActivityEvent::new(
                format!("{}:exhausted", self.activity_id()),
                ActivityKind::Error,
                "Self-healing exhausted",
                failure.target.clone(),
                ActivityStatus::Error,
                now_ms,
            )
            .with_error(note.clone());
            let progress = self
                .progress_activity(ActivityStatus::Error, now_ms)
                .with_error(note.clone());
            return HealingDecision::Exhausted {
                signature,
                note,
                activity,
                progress,
            };
        }

        tracing::info!(%signature, attempt, max_attempts, "requesting corrective attempt");
        self.phase = HealingPhase::Retrying(attempt);
        HealingDecision::Retry {
            attempt,
            max_attempts,
            signature,
            prompt: self.corrective_prompt(failure, attempt),
            activity: self.progress_activity(ActivityStatus::Running, now_ms),
        }
    }

    /// Records a success. Returns the healing activity to close when the
    /// success belongs to the episode in progress.
    pub fn on_success(
        &mut self,
        signature: &FailureSignature,
        now_ms: i64,
    ) -> Option<ActivityEvent> {
        if self.state.last_failure_signature.as_ref() != Some(signature)
            || !matches!(self.phase, HealingPhase::Retrying(_))
        {
            return None;
        }
        tracing::info!(%signature, attempts = self.state.attempt_count, "self-healing recovered");
        let closed = self.progress_activity(ActivityStatus::Done, now_ms);
        self.phase = HealingPhase::Idle;
        self.state.attempt_count = 0;
        self.state.last_failure_signature = None;
        Some(closed)
    }

    pub fn reset(&mut self) {
        self.state.attempt_count = 0;
        self.state.last_failure_signature = None;
        self.phase = HealingPhase::Idle;
        self.exhausted.clear();
    }

    #[must_use]
    pub fn state(&self) -> &RetryState {
        &self.state
    }

    #[must_use]
    pub fn phase(&self) -> HealingPhase {
        self.phase
    }

    #[must_use]
    pub fn is_exhausted(&self, signature: &FailureSignature) -> bool {
        self.exhausted.contains(signature)
    }

    fn activity_id(&self) -> String {
        format!("self-healing:{}", self.episode)
    }

    fn progress_activity(&self, status: ActivityStatus, now_ms: i64) -> ActivityEvent {
        let label = match status {
            ActivityStatus::Running => format!(
                "Self-healing (attempt {}/{})",
                self.state.attempt_count, self.state.max_attempts
            ),
            ActivityStatus::Done => "Self-healing succeeded".to_string(),
            ActivityStatus::Error => format!(
                "Self-healing stopped ({}/{} attempts)",
                self.state.max_attempts, self.state.max_attempts
            ),
        };
        ActivityEvent::new(
            self.activity_id(),
            ActivityKind::Info,
            label,
            self.target.clone(),
            status,
            now_ms,
        )
    }

    fn corrective_prompt(&self, failure: &FailureContext, attempt: u32) -> String {
        let mut prompt = String::new();
        let _ = writeln!(prompt, "The previous {} failed.", failure.what);
        let _ = writeln!(prompt);
        let _ = writeln!(prompt, "Target: {}", failure.target);
        if let Some(code) = failure.exit_code {
            let _ = writeln!(prompt, "Exit code: {code}");
        }
        if let Some(cwd) = &failure.cwd {
            let _ = writeln!(prompt, "Working directory: {cwd}");
        }
        if let Some(message) = &failure.message {
            let _ = writeln!(prompt, "Error: {message}");
        }

        let key_lines = key_error_lines(&failure.output);
        if !key_lines.is_empty() {
            let _ = writeln!(prompt);
            let _ = writeln!(prompt, "Key error lines:");
            for line in key_lines {
                let _ = writeln!(prompt, "- {line}");
            }
        }

        let preview = tail_chars(failure.output.trim_end(), self.error_preview_chars);
        if !preview.is_empty() {
            let _ = writeln!(prompt);
            let _ = writeln!(
                prompt,
                "Output (last {} characters):",
                self.error_preview_chars
            );
            let _ = writeln!(prompt, "```");
            let _ = writeln!(prompt, "{preview}");
            let _ = writeln!(prompt, "```");
        }

        let _ = writeln!(prompt);
        let _ = write!(
            prompt,
            "This is self-healing attempt {attempt} of {}. Diagnose the root cause and try a different approach from the one that failed; do not repeat the same change.",
            self.state.max_attempts
        );
        prompt
    }
}

/// Lines of `output` that look like errors, deduplicated, in order.
#[must_use]
pub fn key_error_lines(output: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = Vec::new();
    for line in output.lines().map(str::trim_end) {
        if line.trim().is_empty() || !error_line_regex().is_match(line) {
            continue;
        }
        if !lines.contains(&line) {
            lines.push(line);
        }
        if lines.len() == MAX_KEY_ERROR_LINES {
            break;
        }
    }
    lines
}
