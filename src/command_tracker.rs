//! Lifecycle of shell commands reported by the backend or the local executor.
//!
//! The tracker owns per-command output buffers and turns every lifecycle
//! event into the activity the caller should upsert. It never touches the
//! timeline itself.

use agent_protocol::OutputStream;

use crate::activity::{ActivityEvent, ActivityKind, ActivityStatus};
use crate::normalize::default_label;

/// Append-only text buffer that keeps the most recent `cap` characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputBuffer {
    text: String,
    chars: usize,
    cap: usize,
    truncated: bool,
}

impl OutputBuffer {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            cap: cap.max(1),
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        self.chars += chunk.chars().count();
        if self.chars > self.cap {
            let excess = self.chars - self.cap;
            let cut = self
                .text
                .char_indices()
                .nth(excess)
                .map_or(self.text.len(), |(offset, _)| offset);
            self.text.drain(..cut);
            self.chars = self.cap;
            self.truncated = true;
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    #[must_use]
    pub fn char_len(&self) -> usize {
        self.chars
    }

    /// Returns at most the last `max_chars` characters.
    #[must_use]
    pub fn tail(&self, max_chars: usize) -> &str {
        tail_chars(&self.text, max_chars)
    }
}

/// Returns at most the last `max_chars` characters of `text`.
#[must_use]
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let skip = total - max_chars;
    let start = text
        .char_indices()
        .nth(skip)
        .map_or(text.len(), |(offset, _)| offset);
    &text[start..]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExecution {
    pub command_id: String,
    pub command: String,
    pub cwd: Option<String>,
    pub action_index: Option<usize>,
    pub output: OutputBuffer,
    pub status: ActivityStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
    pub started_at_ms: i64,
    /// Created by output that arrived before its start event.
    pub placeholder: bool,
}

impl CommandExecution {
    fn activity(&self, now_ms: i64) -> ActivityEvent {
        let mut activity = ActivityEvent::new(
            command_activity_id(&self.command_id),
            ActivityKind::Command,
            default_label(ActivityKind::Command, self.status),
            self.command.clone(),
            self.status,
            now_ms,
        )
        .with_action_index(self.action_index);
        if self.output.char_len() > 0 {
            activity.output = Some(self.output.as_str().to_string());
        }
        activity.exit_code = self.exit_code;
        activity
    }
}

/// Everything the recovery loop needs to know about one failed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    pub command_id: String,
    pub command: String,
    pub cwd: Option<String>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    /// Captured output, already bounded by the output cap.
    pub output_tail: String,
    pub truncated: bool,
    pub action_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Succeeded {
        command_id: String,
        command: String,
        action_index: Option<usize>,
    },
    Failed(CommandFailure),
}

/// Result of feeding one lifecycle event to the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandUpdate {
    pub activity: Option<ActivityEvent>,
    /// Set only on the first finalization of a command.
    pub outcome: Option<CommandOutcome>,
}

#[must_use]
pub fn command_activity_id(command_id: &str) -> String {
    format!("command:{command_id}")
}

#[derive(Debug, Clone)]
pub struct CommandTracker {
    commands: Vec<CommandExecution>,
    output_cap: usize,
}

impl CommandTracker {
    #[must_use]
    pub fn new(output_cap: usize) -> Self {
        Self {
            commands: Vec::new(),
            output_cap,
        }
    }

    pub fn on_start(
        &mut self,
        command_id: &str,
        command: &str,
        cwd: Option<&str>,
        action_index: Option<usize>,
        now_ms: i64,
    ) -> ActivityEvent {
        let index = self.entry_index(command_id, now_ms);
        let execution = &mut self.commands[index];
        execution.command = command.to_string();
        execution.cwd = cwd.map(str::to_string);
        if action_index.is_some() {
            execution.action_index = action_index;
        }
        if execution.placeholder {
            execution.placeholder = false;
        } else {
            execution.started_at_ms = now_ms;
        }
        execution.activity(now_ms)
    }

    pub fn on_output(
        &mut self,
        command_id: &str,
        chunk: &str,
        stream: OutputStream,
        now_ms: i64,
    ) -> ActivityEvent {
        let index = self.entry_index(command_id, now_ms);
        let execution = &mut self.commands[index];
        if execution.status.is_terminal() {
            tracing::debug!(command_id, ?stream, "output after command finished");
        }
        execution.output.push(chunk);
        execution.activity(now_ms)
    }

    pub fn on_done(
        &mut self,
        command_id: &str,
        exit_code: Option<i32>,
        duration_ms: Option<u64>,
        stdout: Option<&str>,
        stderr: Option<&str>,
        now_ms: i64,
    ) -> CommandUpdate {
        let index = self.entry_index(command_id, now_ms);
        let execution = &mut self.commands[index];
        if execution.status.is_terminal() {
            tracing::debug!(command_id, "ignoring duplicate command.done");
            return CommandUpdate::default();
        }

        for trailing in [stdout, stderr].into_iter().flatten() {
            execution.output.push(trailing);
        }
        execution.exit_code = exit_code;
        execution.duration_ms = Some(
            duration_ms.unwrap_or_else(|| elapsed_ms(execution.started_at_ms, now_ms)),
        );

        if exit_code.unwrap_or(0) == 0 {
            execution.status = ActivityStatus::Done;
            CommandUpdate {
                activity: Some(execution.activity(now_ms)),
                outcome: Some(CommandOutcome::Succeeded {
                    command_id: execution.command_id.clone(),
                    command: execution.command.clone(),
                    action_index: execution.action_index,
                }),
            }
        } else {
            Self::fail(execution, None, now_ms)
        }
    }

    pub fn on_error(&mut self, command_id: &str, message: &str, now_ms: i64) -> CommandUpdate {
        let index = self.entry_index(command_id, now_ms);
        let execution = &mut self.commands[index];
        if execution.status.is_terminal() {
            tracing::debug!(command_id, "ignoring command.error for finished command");
            return CommandUpdate::default();
        }
        execution.duration_ms = Some(elapsed_ms(execution.started_at_ms, now_ms));
        Self::fail(execution, Some(message), now_ms)
    }

    #[must_use]
    pub fn get(&self, command_id: &str) -> Option<&CommandExecution> {
        self.commands
            .iter()
            .find(|execution| execution.command_id == command_id)
    }

    #[must_use]
    pub fn running(&self) -> Vec<&CommandExecution> {
        self.commands
            .iter()
            .filter(|execution| !execution.status.is_terminal())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    fn fail(execution: &mut CommandExecution, message: Option<&str>, now_ms: i64) -> CommandUpdate {
        execution.status = ActivityStatus::Error;
        let mut activity = execution.activity(now_ms);
        let reason = match (message, execution.exit_code) {
            (Some(message), _) => message.to_string(),
            (None, Some(code)) => format!("exited with code {code}"),
            (None, None) => "command failed".to_string(),
        };
        activity.error = Some(reason);

        let failure = CommandFailure {
            command_id: execution.command_id.clone(),
            command: execution.command.clone(),
            cwd: execution.cwd.clone(),
            exit_code: execution.exit_code,
            message: message.map(str::to_string),
            output_tail: execution.output.as_str().to_string(),
            truncated: execution.output.is_truncated(),
            action_index: execution.action_index,
        };
        CommandUpdate {
            activity: Some(activity),
            outcome: Some(CommandOutcome::Failed(failure)),
        }
    }

    fn entry_index(&mut self, command_id: &str, now_ms: i64) -> usize {
        if let Some(index) = self
            .commands
            .iter()
            .position(|execution| execution.command_id == command_id)
        {
            return index;
        }
        self.commands.push(CommandExecution {
            command_id: command_id.to_string(),
            command: String::new(),
            cwd: None,
            action_index: None,
            output: OutputBuffer::new(self.output_cap),
            status: ActivityStatus::Running,
            exit_code: None,
            duration_ms: None,
            started_at_ms: now_ms,
            placeholder: true,
        });
        self.commands.len() - 1
    }
}

fn elapsed_ms(started_at_ms: i64, now_ms: i64) -> u64 {
    u64::try_from(now_ms.saturating_sub(started_at_ms)).unwrap_or(0)
}
