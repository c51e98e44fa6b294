//! Host runtime for `agent_session`.
//!
//! ## Backend bootstrap
//!
//! The backend is chosen explicitly through `AGENT_SESSION_BACKEND`:
//!
//! - `AGENT_SESSION_BACKEND=mock` (default) replays the scripted demo backend.
//!
//! Session limits come from [`agent_session::SessionConfig::from_env`]; set
//! `AGENT_SESSION_CONFIG_PATH` to a JSON file such as:
//!
//! ```json
//! {
//!   "maxHealAttempts": 3,
//!   "outputCapChars": 20000,
//!   "commandTimeoutSec": 60
//! }
//! ```
//!
//! Unknown JSON fields are rejected. Logging is controlled by
//! `AGENT_SESSION_LOG` (an `EnvFilter` directive, default `info`).
//!
//! ## Execution contract
//!
//! Backend dispatches and local actions run on named worker threads that only
//! enqueue events. [`runtime::RuntimeController`] applies them in arrival order
//! on the owner's thread, persists every finalized turn to its
//! [`agent_session::TranscriptSink`] and never lets a sink failure fail a turn.

pub mod backends;
pub mod executor;
pub mod journal;
pub mod runtime;
