use serde::{Deserialize, Serialize};

use crate::TurnId;

/// File or snippet attached to a chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub content: String,
}

/// Why a chat request was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RequestOrigin {
    User,
    #[serde(rename_all = "camelCase")]
    SelfHealing {
        attempt: u32,
        max_attempts: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub turn_id: TurnId,
    pub message: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub origin: RequestOrigin,
}

impl ChatRequest {
    #[must_use]
    pub fn is_self_healing(&self) -> bool {
        matches!(self.origin, RequestOrigin::SelfHealing { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentDecision {
    Allow,
    Skip,
}

/// A command the backend should (re-)execute, optionally carrying a granted consent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_index: Option<usize>,
}

/// Every request this runtime sends toward the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundRequest {
    Chat(ChatRequest),
    #[serde(rename_all = "camelCase")]
    ResolveConsent {
        consent_id: String,
        decision: ConsentDecision,
    },
    ExecuteCommand(CommandRequest),
}

impl OutboundRequest {
    /// Chat requests own a response stream that must end with `done`/`error`.
    #[must_use]
    pub fn expects_terminal_event(&self) -> bool {
        matches!(self, Self::Chat(_))
    }

    #[must_use]
    pub fn as_chat(&self) -> Option<&ChatRequest> {
        match self {
            Self::Chat(chat) => Some(chat),
            _ => None,
        }
    }
}
