//! Deterministic client-side handler for coding-agent sessions.
//!
//! A [`TurnController`] consumes the unordered event stream of one turn and
//! produces an ordered, deduplicated activity timeline. It also tracks
//! command lifecycles, runs proposed actions through approval and dependency
//! checks, and recovers from failures with a bounded self-healing loop. All
//! components are synchronous reducers; hosts execute the returned
//! [`TurnEffect`]s.

pub mod actions;
pub mod activity;
pub mod command_tracker;
pub mod config;
pub mod consent;
pub mod error;
pub mod healing;
pub mod logging;
pub mod normalize;
pub mod store;
pub mod transcript;
pub mod turn;

pub use actions::{
    ActionOrchestrator, ActionProgress, ActionResult, ActionStartOutcome, ActionState,
    ActionSummary, TrackedAction,
};
pub use activity::{ActivityEvent, ActivityKind, ActivityStatus};
pub use command_tracker::{
    CommandExecution, CommandFailure, CommandOutcome, CommandTracker, CommandUpdate, OutputBuffer,
};
pub use config::SessionConfig;
pub use consent::{ConsentGate, ConsentResolution};
pub use error::{ConfigError, ProtocolError, SessionError, SinkError};
pub use healing::{
    FailureContext, FailureSignature, HealingDecision, HealingPhase, RetryState,
    SelfHealingController,
};
pub use normalize::normalize;
pub use store::{ActivityStore, UpsertOutcome};
pub use transcript::{MemoryTranscript, TranscriptEntry, TranscriptSink, TurnOutcome};
pub use turn::{Notice, TurnContext, TurnController, TurnEffect, TurnPhase, UserMessage};

pub use agent_protocol;
