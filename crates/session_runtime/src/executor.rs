use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use agent_protocol::{ActionKind, BackendError, CancelSignal, ProposedAction};
use serde_json::{json, Value};
use similar::{ChangeTag, TextDiff};
use wait_timeout::ChildExt;

pub const DEFAULT_COMMAND_TIMEOUT_SEC: u64 = 120;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 100 * 1024;
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Runs proposed actions and reports them as wire payloads.
///
/// Implementations emit `action.start`, any activity or `command.*` events,
/// then exactly one `action.complete`. Failures of the action itself are
/// reported through `action.complete`; `Err` is reserved for the executor
/// being unable to run at all.
pub trait ActionExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        index: usize,
        action: ProposedAction,
        cancel: CancelSignal,
        emit: &mut dyn FnMut(Value),
    ) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub additions: u32,
    pub deletions: u32,
}

/// Line-level change counts between two file contents.
#[must_use]
pub fn diff_stats(before: &str, after: &str) -> DiffStats {
    let diff = TextDiff::from_lines(before, after);
    let mut stats = DiffStats::default();
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => stats.additions += 1,
            ChangeTag::Delete => stats.deletions += 1,
            ChangeTag::Equal => {}
        }
    }
    stats
}

#[derive(Debug, Clone, PartialEq)]
struct ActionReport {
    success: bool,
    message: String,
    data: Option<Value>,
}

impl ActionReport {
    fn ok(message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

enum CommandExit {
    Finished(ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(String),
}

/// Executes file edits, file creation and shell commands inside one workspace.
#[derive(Debug)]
pub struct LocalActionExecutor {
    workspace_root: PathBuf,
    command_timeout: Duration,
    max_output_bytes: usize,
    next_command: AtomicU64,
}

impl LocalActionExecutor {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Result<Self, String> {
        let workspace_root = workspace_root.into();
        let canonical_root = workspace_root
            .canonicalize()
            .map_err(|err| format!("Failed to resolve workspace root: {err}"))?;

        if !canonical_root.is_dir() {
            return Err("Workspace root must be a directory".to_string());
        }

        Ok(Self {
            workspace_root: canonical_root,
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SEC),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            next_command: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    fn create_file(
        &self,
        index: usize,
        path: &str,
        content: &str,
        emit: &mut dyn FnMut(Value),
    ) -> ActionReport {
        let report = self.write_new_content(path, content);
        emit_file_activity("create", index, path, &report, emit);
        report
    }

    fn write_new_content(&self, path: &str, content: &str) -> ActionReport {
        let resolved = match self.resolve_write_path(path) {
            Ok(path) => path,
            Err(error) => return ActionReport::fail(error),
        };

        if let Some(parent) = resolved.parent() {
            if let Err(error) = fs::create_dir_all(parent) {
                return ActionReport::fail(format!(
                    "Failed to create parent directories {}: {error}",
                    parent.display()
                ));
            }

            let canonical_parent = match parent.canonicalize() {
                Ok(path) => path,
                Err(error) => {
                    return ActionReport::fail(format!(
                        "Failed to resolve write parent {}: {error}",
                        parent.display()
                    ));
                }
            };

            if let Err(error) = self.ensure_inside_workspace(&canonical_parent) {
                return ActionReport::fail(error);
            }
        }

        let before = fs::read_to_string(&resolved).unwrap_or_default();
        if let Err(error) = fs::write(&resolved, content) {
            return ActionReport::fail(format!(
                "Failed to write file {}: {error}",
                resolved.display()
            ));
        }

        let stats = diff_stats(&before, content);
        ActionReport::ok(
            format!("Wrote {}", self.workspace_relative_display(&resolved)),
            Some(file_data(path, stats)),
        )
    }

    fn edit_file(
        &self,
        index: usize,
        path: &str,
        old_text: &str,
        new_text: &str,
        emit: &mut dyn FnMut(Value),
    ) -> ActionReport {
        let report = self.replace_once(path, old_text, new_text);
        emit_file_activity("edit", index, path, &report, emit);
        report
    }

    fn replace_once(&self, path: &str, old_text: &str, new_text: &str) -> ActionReport {
        if old_text.is_empty() {
            return ActionReport::fail("oldText must not be empty");
        }

        let resolved = match self.resolve_existing_path(path) {
            Ok(path) => path,
            Err(error) => return ActionReport::fail(error),
        };

        let current_content = match fs::read_to_string(&resolved) {
            Ok(content) => content,
            Err(error) => {
                return ActionReport::fail(format!(
                    "Failed to read file {}: {error}",
                    resolved.display()
                ));
            }
        };

        let occurrence_count = current_content.match_indices(old_text).count();
        if occurrence_count != 1 {
            return ActionReport::fail(format!(
                "editFile requires exactly one match of oldText in {path}; found {occurrence_count}"
            ));
        }

        let updated_content = current_content.replacen(old_text, new_text, 1);
        if let Err(error) = fs::write(&resolved, &updated_content) {
            return ActionReport::fail(format!(
                "Failed to write file {}: {error}",
                resolved.display()
            ));
        }

        let stats = diff_stats(&current_content, &updated_content);
        ActionReport::ok(
            format!("Updated {}", self.workspace_relative_display(&resolved)),
            Some(file_data(path, stats)),
        )
    }

    fn run_command(
        &self,
        index: usize,
        command: &str,
        cwd: Option<&str>,
        cancel: &CancelSignal,
        emit: &mut dyn FnMut(Value),
    ) -> ActionReport {
        let cwd_path = match cwd {
            Some(cwd) => match self.resolve_existing_path(cwd) {
                Ok(path) if path.is_dir() => path,
                Ok(_) => return ActionReport::fail("Invalid command cwd: expected a directory"),
                Err(error) => return ActionReport::fail(format!("Invalid command cwd: {error}")),
            },
            None => self.workspace_root.clone(),
        };

        let command_id = format!(
            "local-{}",
            self.next_command.fetch_add(1, Ordering::SeqCst)
        );
        emit(json!({
            "type": "command.start",
            "commandId": command_id,
            "command": command,
            "cwd": cwd_path.display().to_string(),
            "meta": { "actionIndex": index },
        }));

        let started = Instant::now();
        let mut child = match Command::new("bash")
            .arg("-lc")
            .arg(command)
            .current_dir(&cwd_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(error) => {
                let message = format!("Failed to launch command: {error}");
                emit(json!({ "type": "command.error", "commandId": command_id, "error": message }));
                return ActionReport::fail(message);
            }
        };

        let stdout_reader = spawn_pipe_reader(child.stdout.take());
        let stderr_reader = spawn_pipe_reader(child.stderr.take());
        let exit = self.wait_for_exit(&mut child, started, cancel);
        let stdout = join_pipe_reader(stdout_reader);
        let stderr = join_pipe_reader(stderr_reader);

        for (bytes, stream) in [(stdout, "stdout"), (stderr, "stderr")] {
            if bytes.is_empty() {
                continue;
            }
            let text = truncate_to_byte_limit(
                String::from_utf8_lossy(&bytes).into_owned(),
                self.max_output_bytes,
            );
            emit(json!({
                "type": "command.output",
                "commandId": command_id,
                "text": text,
                "stream": stream,
            }));
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let error = match exit {
            CommandExit::Finished(status) => match status.code() {
                Some(code) => {
                    emit(json!({
                        "type": "command.done",
                        "commandId": command_id,
                        "exitCode": code,
                        "durationMs": duration_ms,
                    }));
                    if code == 0 {
                        return ActionReport::ok(format!("`{command}` exited with code 0"), None);
                    }
                    return ActionReport::fail(format!("`{command}` exited with code {code}"));
                }
                None => format!("`{command}` was terminated by a signal"),
            },
            CommandExit::TimedOut => format!(
                "`{command}` timed out after {}s",
                self.command_timeout.as_secs()
            ),
            CommandExit::Cancelled => format!("`{command}` was cancelled"),
            CommandExit::WaitFailed(error) => {
                format!("Failed waiting for `{command}`: {error}")
            }
        };

        emit(json!({ "type": "command.error", "commandId": command_id, "error": error }));
        ActionReport::fail(error)
    }

    fn wait_for_exit(&self, child: &mut Child, started: Instant, cancel: &CancelSignal) -> CommandExit {
        loop {
            match child.wait_timeout(CANCEL_POLL) {
                Ok(Some(status)) => return CommandExit::Finished(status),
                Ok(None) => {
                    let exit = if cancel.load(Ordering::SeqCst) {
                        CommandExit::Cancelled
                    } else if started.elapsed() >= self.command_timeout {
                        CommandExit::TimedOut
                    } else {
                        continue;
                    };
                    let _ = child.kill();
                    let _ = child.wait();
                    return exit;
                }
                Err(error) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return CommandExit::WaitFailed(error.to_string());
                }
            }
        }
    }

    fn resolve_existing_path(&self, path: &str) -> Result<PathBuf, String> {
        if path.trim().is_empty() {
            return Err("Path must not be empty".to_string());
        }

        let candidate = self.absolute_candidate(path);
        let canonical = candidate
            .canonicalize()
            .map_err(|error| format!("Failed to resolve path {}: {error}", candidate.display()))?;

        self.ensure_inside_workspace(&canonical)?;
        Ok(canonical)
    }

    fn resolve_write_path(&self, path: &str) -> Result<PathBuf, String> {
        if path.trim().is_empty() {
            return Err("Path must not be empty".to_string());
        }

        let candidate = self.absolute_candidate(path);
        let parent = candidate.parent().ok_or_else(|| {
            format!(
                "Path {} has no parent directory and cannot be written safely",
                candidate.display()
            )
        })?;

        let anchor = canonicalize_existing_ancestor(parent)?;
        self.ensure_inside_workspace(&anchor)?;

        Ok(candidate)
    }

    fn absolute_candidate(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    fn ensure_inside_workspace(&self, canonical_path: &Path) -> Result<(), String> {
        if canonical_path.starts_with(&self.workspace_root) {
            Ok(())
        } else {
            Err(format!(
                "Path escapes workspace root: {}",
                canonical_path.display()
            ))
        }
    }

    fn workspace_relative_display(&self, path: &Path) -> String {
        path.strip_prefix(&self.workspace_root)
            .map(|relative| relative.display().to_string())
            .unwrap_or_else(|_| path.display().to_string())
    }
}

impl ActionExecutor for LocalActionExecutor {
    fn execute(
        &self,
        index: usize,
        action: ProposedAction,
        cancel: CancelSignal,
        emit: &mut dyn FnMut(Value),
    ) -> Result<(), BackendError> {
        if cancel.load(Ordering::SeqCst) {
            return Ok(());
        }

        emit(json!({ "type": "action.start", "actionIndex": index }));
        let report = match &action.kind {
            ActionKind::CreateFile { file_path, content } => {
                self.create_file(index, file_path, content, emit)
            }
            ActionKind::EditFile {
                file_path,
                old_text,
                new_text,
            } => self.edit_file(index, file_path, old_text, new_text, emit),
            ActionKind::RunCommand { command, cwd } => {
                self.run_command(index, command, cwd.as_deref(), &cancel, emit)
            }
        };
        tracing::debug!(
            index,
            action = action.type_name(),
            success = report.success,
            "local action finished"
        );

        let mut complete = json!({
            "type": "action.complete",
            "actionIndex": index,
            "success": report.success,
            "message": report.message,
        });
        if let Some(data) = report.data {
            complete["data"] = data;
        }
        emit(complete);
        Ok(())
    }
}

fn emit_file_activity(
    event_type: &str,
    index: usize,
    path: &str,
    report: &ActionReport,
    emit: &mut dyn FnMut(Value),
) {
    let mut event = json!({
        "type": event_type,
        "path": path,
        "status": if report.success { "done" } else { "error" },
        "actionIndex": index,
    });
    if let Some(data) = &report.data {
        event["additions"] = data["additions"].clone();
        event["deletions"] = data["deletions"].clone();
    }
    emit(event);
}

fn file_data(path: &str, stats: DiffStats) -> Value {
    json!({
        "filePath": path,
        "additions": stats.additions,
        "deletions": stats.deletions,
    })
}

fn spawn_pipe_reader(pipe: Option<impl Read + Send + 'static>) -> Option<JoinHandle<Vec<u8>>> {
    let mut pipe = pipe?;
    thread::Builder::new()
        .name("agent-session-pipe".to_string())
        .spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            bytes
        })
        .ok()
}

fn join_pipe_reader(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn truncate_to_byte_limit(content: String, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content;
    }

    let mut cutoff = content.len() - max_bytes;
    while cutoff < content.len() && !content.is_char_boundary(cutoff) {
        cutoff += 1;
    }

    let mut truncated = "[truncated]\n".to_string();
    truncated.push_str(&content[cutoff..]);
    truncated
}

fn canonicalize_existing_ancestor(path: &Path) -> Result<PathBuf, String> {
    for ancestor in path.ancestors() {
        if ancestor.exists() {
            return ancestor.canonicalize().map_err(|error| {
                format!("Failed to resolve path {}: {error}", ancestor.display())
            });
        }
    }

    Err(format!(
        "No existing ancestor found for path {}",
        path.display()
    ))
}
