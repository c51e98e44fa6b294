use std::path::PathBuf;

use agent_protocol::TurnId;
use thiserror::Error;

/// Misuse of the turn controller API by its owner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("turn {turn_id} is still active; cancel it or wait for it to finish")]
    TurnActive { turn_id: TurnId },

    #[error("no turn is active")]
    NoActiveTurn,

    #[error("message is empty")]
    EmptyMessage,

    #[error("unknown consent id '{consent_id}'")]
    UnknownConsent { consent_id: String },

    #[error("action index {index} is outside the current batch of {len}")]
    UnknownActionIndex { index: usize, len: usize },
}

impl SessionError {
    #[must_use]
    pub fn unknown_consent(consent_id: impl Into<String>) -> Self {
        Self::UnknownConsent {
            consent_id: consent_id.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error while reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config JSON at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl ConfigError {
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// A finalized turn that could not be handed to its transcript sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("transcript sink is unavailable: {message}")]
    Unavailable { message: String },

    #[error("failed to write transcript entry: {source}")]
    Write {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl SinkError {
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn write(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Write {
            source: source.into(),
        }
    }
}

/// An inbound payload that could not be decoded into a wire event.
#[derive(Debug, Error)]
#[error("dropped malformed `{type_name}` payload: {source}")]
pub struct ProtocolError {
    pub type_name: String,
    #[source]
    pub source: serde_json::Error,
}

impl ProtocolError {
    #[must_use]
    pub fn new(payload: &serde_json::Value, source: serde_json::Error) -> Self {
        let type_name = payload
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("<untyped>")
            .to_string();
        Self { type_name, source }
    }
}
