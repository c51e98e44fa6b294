//! Transport-neutral wire contract between the session runtime and a remote
//! coding-agent backend.
//!
//! This crate defines the inbound event union, the outbound request shapes and
//! the backend dispatch trait. It excludes transport details (HTTP, host message
//! bus) and every piece of turn bookkeeping; those live in `agent_session`.

use std::fmt;
use std::sync::{atomic::AtomicBool, Arc};

use serde_json::Value;
use thiserror::Error;

mod outbound;
mod wire;

pub use outbound::{
    Attachment, ChatRequest, CommandRequest, ConsentDecision, OutboundRequest, RequestOrigin,
};
pub use wire::{
    decode_wire_event, ActionComplete, ActionKind, ActionStart, CommandDone, CommandFailed,
    CommandMeta, CommandOutput, CommandStart, ConsentRequired, DangerLevel, GenericActivity,
    OutputStream, PhasePayload, ProposedAction, ToolPayload, WireEvent, WireStatus,
    WireTimestamp,
};

/// Identifier for one user-initiated turn.
pub type TurnId = u64;

/// Identifier for one outbound dispatch within a turn.
pub type DispatchId = u64;

/// Shared cancellation flag for a dispatch.
pub type CancelSignal = Arc<AtomicBool>;

/// Error returned while constructing a backend before any dispatch starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInitError {
    message: String,
}

impl BackendInitError {
    /// Creates a new backend initialization error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the underlying error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for BackendInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for BackendInitError {}

impl From<String> for BackendInitError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for BackendInitError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Failure reported by a backend while dispatching one request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The channel to the backend could not be used (unreachable, reset, timed out).
    #[error("backend unreachable: {message}")]
    Transport { message: String },

    /// The backend rejected the caller's credentials.
    #[error("sign-in required: {message}")]
    Unauthorized { message: String },

    /// The backend violated the wire contract.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl BackendError {
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }
}

/// Immutable metadata describing a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendProfile {
    pub backend_id: String,
    pub model_id: String,
}

/// Backend interface for dispatching one outbound request.
pub trait SessionBackend: Send + Sync + 'static {
    /// Returns backend/model identity metadata.
    fn profile(&self) -> BackendProfile;

    /// Sends a request and emits every inbound payload it produces, in arrival order.
    ///
    /// Payloads are raw JSON so malformed events can be rejected by the consumer
    /// instead of aborting the dispatch. Chat requests are expected to end with a
    /// `done` or `error` payload; consent resolutions and command re-issues may
    /// emit any number of events (including none).
    fn dispatch(
        &self,
        request: OutboundRequest,
        cancel: CancelSignal,
        emit: &mut dyn FnMut(Value),
    ) -> Result<(), BackendError>;
}
