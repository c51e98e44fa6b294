//! Canonical timeline entry shared by every component of a turn.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityKind {
    Read,
    Edit,
    Create,
    Delete,
    Command,
    Thinking,
    NarrativeMarker,
    Detection,
    Intent,
    Context,
    Error,
    Info,
}

impl ActivityKind {
    /// Parses the kind strings used by generic `activity` payloads.
    ///
    /// Unknown kinds are still user-visible, so they fall back to `Info`.
    #[must_use]
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "read" | "file_read" => Self::Read,
            "edit" => Self::Edit,
            "create" => Self::Create,
            "delete" => Self::Delete,
            "command" => Self::Command,
            "thinking" => Self::Thinking,
            "narrative" | "narrative-marker" | "narrative_marker" => Self::NarrativeMarker,
            "detection" => Self::Detection,
            "intent" => Self::Intent,
            "context" | "analysis" => Self::Context,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Edit => "edit",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Command => "command",
            Self::Thinking => "thinking",
            Self::NarrativeMarker => "narrative",
            Self::Detection => "detection",
            Self::Intent => "intent",
            Self::Context => "context",
            Self::Error => "error",
            Self::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityStatus {
    Running,
    Done,
    Error,
}

impl ActivityStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Applies the monotonic lifecycle rule: running may move to a terminal
    /// state; terminal states never change.
    #[must_use]
    pub fn advance(self, next: Self) -> Self {
        if self.is_terminal() {
            self
        } else {
            next
        }
    }
}

impl From<agent_protocol::WireStatus> for ActivityStatus {
    fn from(status: agent_protocol::WireStatus) -> Self {
        match status {
            agent_protocol::WireStatus::Running => Self::Running,
            agent_protocol::WireStatus::Done => Self::Done,
            agent_protocol::WireStatus::Error => Self::Error,
        }
    }
}

/// One observed unit of agent work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub id: String,
    pub kind: ActivityKind,
    pub label: String,
    pub detail: String,
    pub status: ActivityStatus,
    pub timestamp_ms: i64,
    /// Assigned by the store on first insertion; zero until then.
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_index: Option<usize>,
}

impl ActivityEvent {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        kind: ActivityKind,
        label: impl Into<String>,
        detail: impl Into<String>,
        status: ActivityStatus,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            detail: detail.into(),
            status,
            timestamp_ms,
            sequence: 0,
            file_path: None,
            additions: None,
            deletions: None,
            output: None,
            exit_code: None,
            error: None,
            action_index: None,
        }
    }

    #[must_use]
    pub fn with_file_path(mut self, file_path: impl Into<String>) -> Self {
        self.file_path = Some(file_path.into());
        self
    }

    #[must_use]
    pub fn with_action_index(mut self, action_index: Option<usize>) -> Self {
        self.action_index = action_index;
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Key used to collapse repeated reports of the same logical activity.
    ///
    /// The detail (file path, command text) identifies the work; activities
    /// without one fall back to their label.
    #[must_use]
    pub fn dedup_key(&self) -> (ActivityKind, &str) {
        if self.detail.is_empty() {
            (self.kind, self.label.as_str())
        } else {
            (self.kind, self.detail.as_str())
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == ActivityStatus::Running
    }
}

/// Deterministic id for payloads that arrive without one, so that
/// retransmissions of the same payload resolve to the same activity.
#[must_use]
pub fn derived_activity_id(kind: ActivityKind, subject: &str) -> String {
    format!("{}:{subject}", kind.as_str())
}
