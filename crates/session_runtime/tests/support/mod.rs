#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_protocol_mock::ScriptedBackend;
use agent_session::agent_protocol::{
    BackendError, BackendProfile, CancelSignal, OutboundRequest, ProposedAction, SessionBackend,
};
use agent_session::{MemoryTranscript, SessionConfig, SinkError, TranscriptEntry, TranscriptSink};
use serde_json::Value;
use session_runtime::executor::{ActionExecutor, LocalActionExecutor};
use session_runtime::runtime::RuntimeController;

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(20);

pub fn local_runtime(
    config: SessionConfig,
    backend: Arc<ScriptedBackend>,
    workspace: &Path,
) -> (Arc<RuntimeController>, MemoryTranscript) {
    let transcript = MemoryTranscript::new();
    let executor = LocalActionExecutor::new(workspace).expect("workspace root resolves");
    let runtime = RuntimeController::new(
        config,
        backend,
        Arc::new(executor),
        Arc::new(transcript.clone()),
    );
    (runtime, transcript)
}

pub fn remote_config() -> SessionConfig {
    SessionConfig {
        execute_actions_locally: false,
        ..SessionConfig::default()
    }
}

/// Flushes until `predicate` holds or `timeout` elapses.
pub fn run_until(
    runtime: &Arc<RuntimeController>,
    timeout: Duration,
    mut predicate: impl FnMut(&RuntimeController) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        runtime.flush_pending_events();
        if predicate(&**runtime) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    predicate(&**runtime)
}

pub fn only_entry(transcript: &MemoryTranscript) -> TranscriptEntry {
    let mut entries = transcript.entries();
    assert_eq!(entries.len(), 1, "expected exactly one finalized turn");
    entries.remove(0)
}

/// Executor that records what it was asked to run and reports success.
#[derive(Debug, Default)]
pub struct CountingExecutor {
    pub calls: AtomicUsize,
}

impl ActionExecutor for CountingExecutor {
    fn execute(
        &self,
        index: usize,
        _action: ProposedAction,
        _cancel: CancelSignal,
        emit: &mut dyn FnMut(Value),
    ) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        emit(serde_json::json!({ "type": "action.start", "actionIndex": index }));
        emit(serde_json::json!({ "type": "action.complete", "actionIndex": index, "success": true }));
        Ok(())
    }
}

pub struct PanickingBackend;

impl SessionBackend for PanickingBackend {
    fn profile(&self) -> BackendProfile {
        BackendProfile {
            backend_id: "panicking".to_string(),
            model_id: "none".to_string(),
        }
    }

    fn dispatch(
        &self,
        _request: OutboundRequest,
        _cancel: CancelSignal,
        emit: &mut dyn FnMut(Value),
    ) -> Result<(), BackendError> {
        emit(serde_json::json!({ "type": "thinking", "delta": "about to fail" }));
        panic!("scripted backend panic");
    }
}

pub struct FailingSink;

impl TranscriptSink for FailingSink {
    fn persist(&self, _entry: &TranscriptEntry) -> Result<(), SinkError> {
        Err(SinkError::write(std::io::Error::other("disk full")))
    }
}
