use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status as reported on the wire. Backends disagree on spelling, so the
/// common synonyms are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireStatus {
    #[serde(alias = "started", alias = "in_progress", alias = "pending")]
    Running,
    #[serde(alias = "completed", alias = "success", alias = "ok")]
    Done,
    #[serde(alias = "failed", alias = "failure")]
    Error,
}

/// Source-reported time: epoch milliseconds or an RFC 3339 string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Millis(i64),
    Text(String),
}

/// Payload shared by the tool-style activity events (`file_read`, `edit`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, alias = "filePath", skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WireStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<WireTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_index: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhasePayload {
    #[serde(alias = "id")]
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WireStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<WireTimestamp>,
}

/// Free-form `activity` event whose kind is carried as a string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericActivity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WireStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<WireTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_index: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStart {
    pub command_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub meta: CommandMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<WireTimestamp>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    #[default]
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub command_id: String,
    pub text: String,
    #[serde(default)]
    pub stream: OutputStream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDone {
    pub command_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFailed {
    pub command_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRequired {
    pub consent_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default)]
    pub danger_level: DangerLevel,
    #[serde(default)]
    pub warning: String,
    #[serde(default)]
    pub consequences: Vec<String>,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default)]
    pub rollback_possible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ProposedAction>,
    pub action_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionComplete {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ProposedAction>,
    pub action_index: usize,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// What an agent-proposed action does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ActionKind {
    #[serde(rename_all = "camelCase")]
    EditFile {
        file_path: String,
        old_text: String,
        new_text: String,
    },
    #[serde(rename_all = "camelCase")]
    CreateFile { file_path: String, content: String },
    #[serde(rename_all = "camelCase")]
    RunCommand {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
}

/// One unit of agent-requested work within a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedAction {
    #[serde(flatten)]
    pub kind: ActionKind,
    #[serde(default)]
    pub requires_previous_success: bool,
}

impl ProposedAction {
    #[must_use]
    pub fn edit_file(
        file_path: impl Into<String>,
        old_text: impl Into<String>,
        new_text: impl Into<String>,
    ) -> Self {
        Self {
            kind: ActionKind::EditFile {
                file_path: file_path.into(),
                old_text: old_text.into(),
                new_text: new_text.into(),
            },
            requires_previous_success: false,
        }
    }

    #[must_use]
    pub fn create_file(file_path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::CreateFile {
                file_path: file_path.into(),
                content: content.into(),
            },
            requires_previous_success: false,
        }
    }

    #[must_use]
    pub fn run_command(command: impl Into<String>, cwd: Option<String>) -> Self {
        Self {
            kind: ActionKind::RunCommand {
                command: command.into(),
                cwd,
            },
            requires_previous_success: false,
        }
    }

    /// Marks this action as depending on the success of the one before it.
    #[must_use]
    pub fn after_previous_success(mut self) -> Self {
        self.requires_previous_success = true;
        self
    }

    /// Wire name of the action type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            ActionKind::EditFile { .. } => "editFile",
            ActionKind::CreateFile { .. } => "createFile",
            ActionKind::RunCommand { .. } => "runCommand",
        }
    }

    /// The command line or file path the action operates on.
    #[must_use]
    pub fn target(&self) -> &str {
        match &self.kind {
            ActionKind::EditFile { file_path, .. } | ActionKind::CreateFile { file_path, .. } => {
                file_path
            }
            ActionKind::RunCommand { command, .. } => command,
        }
    }

    #[must_use]
    pub fn is_command(&self) -> bool {
        matches!(self.kind, ActionKind::RunCommand { .. })
    }
}

/// Inbound event union keyed by the wire `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireEvent {
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default, alias = "text")]
        delta: String,
    },
    #[serde(rename = "phase_start")]
    PhaseStart(PhasePayload),
    #[serde(rename = "phase_end")]
    PhaseEnd(PhasePayload),
    #[serde(rename = "file_read")]
    FileRead(ToolPayload),
    #[serde(rename = "edit")]
    Edit(ToolPayload),
    #[serde(rename = "create")]
    Create(ToolPayload),
    #[serde(rename = "delete")]
    Delete(ToolPayload),
    #[serde(rename = "command")]
    Command(ToolPayload),
    #[serde(rename = "analysis")]
    Analysis(ToolPayload),
    #[serde(rename = "detection")]
    Detection(ToolPayload),
    #[serde(rename = "intent")]
    Intent(ToolPayload),
    #[serde(rename = "context")]
    Context(ToolPayload),
    #[serde(rename = "activity")]
    Activity(GenericActivity),
    #[serde(rename = "narrative")]
    Narrative {
        text: String,
        #[serde(default, rename = "actionIndex", skip_serializing_if = "Option::is_none")]
        action_index: Option<usize>,
    },
    #[serde(rename = "command.start")]
    CommandStart(CommandStart),
    #[serde(rename = "command.output")]
    CommandOutput(CommandOutput),
    #[serde(rename = "command.done")]
    CommandDone(CommandDone),
    #[serde(rename = "command.error")]
    CommandError(CommandFailed),
    #[serde(rename = "command.consent_required")]
    ConsentRequired(ConsentRequired),
    #[serde(rename = "action.start")]
    ActionStart(ActionStart),
    #[serde(rename = "action.complete")]
    ActionComplete(ActionComplete),
    #[serde(rename = "botMessage.start")]
    BotMessageStart {
        #[serde(default, rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    #[serde(rename = "botMessage.chunk")]
    BotMessageChunk { text: String },
    #[serde(rename = "botMessage.end")]
    BotMessageEnd {
        #[serde(default)]
        actions: Vec<ProposedAction>,
    },
    #[serde(rename = "done")]
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl WireEvent {
    /// Returns the wire `type` tag, for logging.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Thinking { .. } => "thinking",
            Self::PhaseStart(_) => "phase_start",
            Self::PhaseEnd(_) => "phase_end",
            Self::FileRead(_) => "file_read",
            Self::Edit(_) => "edit",
            Self::Create(_) => "create",
            Self::Delete(_) => "delete",
            Self::Command(_) => "command",
            Self::Analysis(_) => "analysis",
            Self::Detection(_) => "detection",
            Self::Intent(_) => "intent",
            Self::Context(_) => "context",
            Self::Activity(_) => "activity",
            Self::Narrative { .. } => "narrative",
            Self::CommandStart(_) => "command.start",
            Self::CommandOutput(_) => "command.output",
            Self::CommandDone(_) => "command.done",
            Self::CommandError(_) => "command.error",
            Self::ConsentRequired(_) => "command.consent_required",
            Self::ActionStart(_) => "action.start",
            Self::ActionComplete(_) => "action.complete",
            Self::BotMessageStart { .. } => "botMessage.start",
            Self::BotMessageChunk { .. } => "botMessage.chunk",
            Self::BotMessageEnd { .. } => "botMessage.end",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Returns true when this event terminates the dispatch that produced it.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Encodes the event into its wire JSON form.
    pub fn encode(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Decodes one raw inbound payload. Unknown `type` tags and malformed fields fail.
pub fn decode_wire_event(payload: Value) -> Result<WireEvent, serde_json::Error> {
    serde_json::from_value(payload)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn command_done_decodes_camel_case_fields() {
        let event = decode_wire_event(json!({
            "type": "command.done",
            "commandId": "cmd-1",
            "exitCode": 1,
            "durationMs": 420,
            "stderr": "boom\n",
        }))
        .expect("command.done decodes");

        assert_eq!(
            event,
            WireEvent::CommandDone(CommandDone {
                command_id: "cmd-1".to_string(),
                exit_code: Some(1),
                duration_ms: Some(420),
                stdout: None,
                stderr: Some("boom\n".to_string()),
            })
        );
    }

    #[test]
    fn status_synonyms_map_to_canonical_states() {
        let event = decode_wire_event(json!({
            "type": "file_read",
            "path": "src/main.rs",
            "status": "completed",
        }))
        .expect("file_read decodes");

        let WireEvent::FileRead(payload) = event else {
            panic!("expected file_read");
        };
        assert_eq!(payload.status, Some(WireStatus::Done));
        assert_eq!(payload.path.as_deref(), Some("src/main.rs"));
    }

    #[test]
    fn bot_message_end_carries_proposed_actions() {
        let event = decode_wire_event(json!({
            "type": "botMessage.end",
            "actions": [
                { "type": "createFile", "filePath": "a.ts", "content": "export {}" },
                { "type": "runCommand", "command": "npm test", "requiresPreviousSuccess": true },
            ],
        }))
        .expect("botMessage.end decodes");

        assert_eq!(
            event,
            WireEvent::BotMessageEnd {
                actions: vec![
                    ProposedAction::create_file("a.ts", "export {}"),
                    ProposedAction::run_command("npm test", None).after_previous_success(),
                ],
            }
        );
    }

    #[test]
    fn consent_required_defaults_optional_lists() {
        let event = decode_wire_event(json!({
            "type": "command.consent_required",
            "consentId": "consent-1",
            "command": "rm -rf build",
            "dangerLevel": "high",
        }))
        .expect("consent decodes");

        let WireEvent::ConsentRequired(consent) = event else {
            panic!("expected consent");
        };
        assert_eq!(consent.danger_level, DangerLevel::High);
        assert!(consent.consequences.is_empty());
        assert!(!consent.rollback_possible);
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(decode_wire_event(json!({ "type": "telemetry.ping" })).is_err());
        assert!(decode_wire_event(json!({ "text": "no tag" })).is_err());
    }

    #[test]
    fn encode_uses_wire_tags() {
        let value = WireEvent::ActionStart(ActionStart {
            action: Some(ProposedAction::run_command("ls", Some("src".to_string()))),
            action_index: 2,
        })
        .encode()
        .expect("encode action.start");

        assert_eq!(value["type"], "action.start");
        assert_eq!(value["actionIndex"], 2);
        assert_eq!(value["action"]["type"], "runCommand");
        assert_eq!(value["action"]["cwd"], "src");
    }

    #[test]
    fn timestamps_accept_millis_and_text() {
        let millis: WireTimestamp = serde_json::from_value(json!(1_700_000_000_000i64))
            .expect("millis timestamp");
        let text: WireTimestamp =
            serde_json::from_value(json!("2026-02-14T00:00:00Z")).expect("text timestamp");

        assert_eq!(millis, WireTimestamp::Millis(1_700_000_000_000));
        assert_eq!(text, WireTimestamp::Text("2026-02-14T00:00:00Z".to_string()));
    }

    #[test]
    fn terminal_detection_matches_dispatch_lifecycle() {
        assert!(WireEvent::Done { summary: None }.is_terminal());
        assert!(WireEvent::Error {
            message: "boom".to_string(),
            code: None,
        }
        .is_terminal());
        assert!(!WireEvent::BotMessageChunk {
            text: "hi".to_string(),
        }
        .is_terminal());
    }
}
