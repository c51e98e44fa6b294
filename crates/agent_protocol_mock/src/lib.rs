//! Deterministic scripted implementation of the `agent_protocol` backend contract.
//!
//! This crate contains no transport logic. It replays canned event streams and is
//! intended for local development and contract-level integration testing.

use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use agent_protocol::{
    BackendError, BackendProfile, CancelSignal, CommandRequest, OutboundRequest, SessionBackend,
};
use serde_json::{json, Value};

/// Stable backend identifier used for explicit startup selection.
pub const MOCK_BACKEND_ID: &str = "mock";

/// One canned response: events emitted in order, optionally followed by a dispatch error.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScriptedReply {
    pub events: Vec<Value>,
    pub error: Option<BackendError>,
}

impl ScriptedReply {
    #[must_use]
    pub fn events(events: Vec<Value>) -> Self {
        Self {
            events,
            error: None,
        }
    }

    /// Ends the reply with `error` after every scripted event was emitted.
    #[must_use]
    pub fn then_fail(mut self, error: BackendError) -> Self {
        self.error = Some(error);
        self
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    chat_cursor: usize,
    command_counter: usize,
    received: Vec<OutboundRequest>,
}

/// Scripted backend used by runtime tests and the headless demo.
///
/// Chat dispatches consume `chat_replies` in order; once exhausted the last
/// reply repeats. Consent resolutions replay `consent_reply`. Command re-issues
/// synthesize a `command.start`/`command.done` pair with the configured exit code.
#[derive(Debug)]
pub struct ScriptedBackend {
    chat_replies: Vec<ScriptedReply>,
    consent_reply: ScriptedReply,
    command_exit_code: i32,
    event_delay: Duration,
    state: Mutex<ScriptState>,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new(chat_replies: Vec<ScriptedReply>) -> Self {
        Self {
            chat_replies,
            consent_reply: ScriptedReply::default(),
            command_exit_code: 0,
            event_delay: Duration::ZERO,
            state: Mutex::new(ScriptState::default()),
        }
    }

    #[must_use]
    pub fn with_consent_reply(mut self, reply: ScriptedReply) -> Self {
        self.consent_reply = reply;
        self
    }

    #[must_use]
    pub fn with_command_exit_code(mut self, exit_code: i32) -> Self {
        self.command_exit_code = exit_code;
        self
    }

    /// Sleeps between emitted events so cancellation and progress can be observed.
    #[must_use]
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    /// Returns every request received so far, in dispatch order.
    #[must_use]
    pub fn requests(&self) -> Vec<OutboundRequest> {
        lock_unpoisoned(&self.state).received.clone()
    }

    #[must_use]
    pub fn chat_count(&self) -> usize {
        lock_unpoisoned(&self.state).chat_cursor
    }

    fn next_chat_reply(&self) -> ScriptedReply {
        let mut state = lock_unpoisoned(&self.state);
        let index = state.chat_cursor.min(self.chat_replies.len().saturating_sub(1));
        state.chat_cursor += 1;
        self.chat_replies
            .get(index)
            .cloned()
            .unwrap_or_else(|| ScriptedReply::events(vec![json!({ "type": "done" })]))
    }

    fn command_reply(&self, request: &CommandRequest) -> ScriptedReply {
        let command_id = {
            let mut state = lock_unpoisoned(&self.state);
            state.command_counter += 1;
            format!("mock-command-{}", state.command_counter)
        };
        let mut start = json!({
            "type": "command.start",
            "commandId": command_id,
            "command": request.command,
        });
        if let Some(cwd) = &request.cwd {
            start["cwd"] = json!(cwd);
        }
        if let Some(index) = request.action_index {
            start["meta"] = json!({ "actionIndex": index });
        }

        ScriptedReply::events(vec![
            start,
            json!({
                "type": "command.done",
                "commandId": command_id,
                "exitCode": self.command_exit_code,
                "durationMs": 1,
            }),
        ])
    }

    fn replay(
        &self,
        reply: ScriptedReply,
        cancel: &CancelSignal,
        emit: &mut dyn FnMut(Value),
    ) -> Result<(), BackendError> {
        for event in reply.events {
            if cancel.load(Ordering::SeqCst) {
                return Ok(());
            }
            emit(event);
            if !self.event_delay.is_zero() {
                thread::sleep(self.event_delay);
            }
        }

        match reply.error {
            Some(error) if !cancel.load(Ordering::SeqCst) => Err(error),
            _ => Ok(()),
        }
    }
}

impl Default for ScriptedBackend {
    /// A two-round demo: the first attempt writes a draft and fails its check,
    /// the corrective round fixes the file and the check passes.
    fn default() -> Self {
        Self::new(vec![
            ScriptedReply::events(vec![
                json!({ "type": "thinking", "delta": "Drafting release notes and checking them." }),
                json!({ "type": "phase_start", "phase": "planning", "label": "Planning" }),
                json!({ "type": "phase_end", "phase": "planning", "label": "Planning" }),
                json!({ "type": "botMessage.chunk", "text": "I'll write NOTES.md " }),
                json!({ "type": "botMessage.chunk", "text": "and verify it is marked ready." }),
                json!({ "type": "botMessage.end", "actions": [
                    { "type": "createFile", "filePath": "NOTES.md", "content": "status: draft\n" },
                    { "type": "runCommand", "command": "grep -q 'status: ready' NOTES.md",
                      "requiresPreviousSuccess": true },
                ]}),
                json!({ "type": "done" }),
            ]),
            ScriptedReply::events(vec![
                json!({ "type": "thinking", "delta": "The check expects a ready status." }),
                json!({ "type": "botMessage.chunk", "text": "Marking the notes as ready." }),
                json!({ "type": "botMessage.end", "actions": [
                    { "type": "editFile", "filePath": "NOTES.md",
                      "oldText": "status: draft", "newText": "status: ready" },
                    { "type": "runCommand", "command": "grep -q 'status: ready' NOTES.md",
                      "requiresPreviousSuccess": true },
                ]}),
                json!({ "type": "done" }),
            ]),
        ])
        .with_event_delay(Duration::from_millis(Self::DEMO_EVENT_DELAY_MS))
    }
}

impl ScriptedBackend {
    const DEMO_EVENT_DELAY_MS: u64 = 40;
}

impl SessionBackend for ScriptedBackend {
    fn profile(&self) -> BackendProfile {
        BackendProfile {
            backend_id: MOCK_BACKEND_ID.to_string(),
            model_id: "scripted".to_string(),
        }
    }

    fn dispatch(
        &self,
        request: OutboundRequest,
        cancel: CancelSignal,
        emit: &mut dyn FnMut(Value),
    ) -> Result<(), BackendError> {
        lock_unpoisoned(&self.state).received.push(request.clone());

        let reply = match &request {
            OutboundRequest::Chat(_) => self.next_chat_reply(),
            OutboundRequest::ResolveConsent { .. } => self.consent_reply.clone(),
            OutboundRequest::ExecuteCommand(command) => self.command_reply(command),
        };
        self.replay(reply, &cancel, emit)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use agent_protocol::{ChatRequest, ConsentDecision, RequestOrigin};
    use pretty_assertions::assert_eq;

    use super::*;

    fn chat(message: &str) -> OutboundRequest {
        OutboundRequest::Chat(ChatRequest {
            turn_id: 1,
            message: message.to_string(),
            attachments: Vec::new(),
            conversation_id: None,
            origin: RequestOrigin::User,
        })
    }

    fn collect(
        backend: &ScriptedBackend,
        request: OutboundRequest,
        cancel: CancelSignal,
    ) -> (Vec<Value>, Result<(), BackendError>) {
        let mut events = Vec::new();
        let result = backend.dispatch(request, cancel, &mut |event| events.push(event));
        (events, result)
    }

    #[test]
    fn profile_exposes_explicit_mock_backend_identity() {
        let profile = ScriptedBackend::new(Vec::new()).profile();

        assert_eq!(profile.backend_id, MOCK_BACKEND_ID);
        assert_eq!(profile.model_id, "scripted");
    }

    #[test]
    fn chat_replies_advance_and_repeat_the_last_script() {
        let backend = ScriptedBackend::new(vec![
            ScriptedReply::events(vec![json!({ "type": "botMessage.chunk", "text": "one" })]),
            ScriptedReply::events(vec![json!({ "type": "botMessage.chunk", "text": "two" })]),
        ]);

        let texts: Vec<Value> = (0..3)
            .map(|_| collect(&backend, chat("hi"), CancelSignal::default()).0[0]["text"].clone())
            .collect();

        assert_eq!(texts, vec![json!("one"), json!("two"), json!("two")]);
        assert_eq!(backend.chat_count(), 3);
        assert_eq!(backend.requests().len(), 3);
    }

    #[test]
    fn empty_script_answers_with_done() {
        let backend = ScriptedBackend::new(Vec::new());
        let (events, result) = collect(&backend, chat("hi"), CancelSignal::default());

        assert!(result.is_ok());
        assert_eq!(events, vec![json!({ "type": "done" })]);
    }

    #[test]
    fn cancelled_dispatch_emits_nothing_and_suppresses_error() {
        let backend = ScriptedBackend::new(vec![ScriptedReply::events(vec![
            json!({ "type": "done" }),
        ])
        .then_fail(BackendError::transport("reset"))]);
        let cancel = Arc::new(AtomicBool::new(true));

        let (events, result) = collect(&backend, chat("hi"), cancel);

        assert!(events.is_empty());
        assert!(result.is_ok());
    }

    #[test]
    fn scripted_error_follows_events() {
        let backend = ScriptedBackend::new(vec![ScriptedReply::events(vec![
            json!({ "type": "thinking", "delta": "..." }),
        ])
        .then_fail(BackendError::unauthorized("token expired"))]);

        let (events, result) = collect(&backend, chat("hi"), CancelSignal::default());

        assert_eq!(events.len(), 1);
        assert_eq!(result, Err(BackendError::unauthorized("token expired")));
    }

    #[test]
    fn command_reissue_synthesizes_lifecycle_with_action_index() {
        let backend = ScriptedBackend::new(Vec::new()).with_command_exit_code(3);
        let (events, result) = collect(
            &backend,
            OutboundRequest::ExecuteCommand(CommandRequest {
                command: "rm -rf build".to_string(),
                cwd: Some("/repo".to_string()),
                consent_id: Some("k1".to_string()),
                action_index: Some(2),
            }),
            CancelSignal::default(),
        );

        assert!(result.is_ok());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "command.start");
        assert_eq!(events[0]["meta"]["actionIndex"], 2);
        assert_eq!(events[0]["cwd"], "/repo");
        assert_eq!(events[1]["commandId"], events[0]["commandId"]);
        assert_eq!(events[1]["exitCode"], 3);
    }

    #[test]
    fn consent_resolution_replays_configured_reply() {
        let backend = ScriptedBackend::new(Vec::new()).with_consent_reply(ScriptedReply::events(
            vec![json!({ "type": "activity", "kind": "info", "label": "Consent noted" })],
        ));
        let (events, _) = collect(
            &backend,
            OutboundRequest::ResolveConsent {
                consent_id: "k1".to_string(),
                decision: ConsentDecision::Skip,
            },
            CancelSignal::default(),
        );

        assert_eq!(events[0]["label"], "Consent noted");
        assert_eq!(backend.chat_count(), 0);
    }

    #[test]
    fn default_demo_script_proposes_actions_and_terminates() {
        let backend = ScriptedBackend::default().with_event_delay(Duration::ZERO);
        let (events, _) = collect(&backend, chat("demo"), CancelSignal::default());

        assert!(events
            .iter()
            .any(|event| event["type"] == "botMessage.end" && event["actions"].is_array()));
        assert_eq!(events.last().map(|event| event["type"].clone()), Some(json!("done")));
    }
}
