use std::sync::Arc;

use agent_protocol_mock::{ScriptedBackend, ScriptedReply};
use agent_session::agent_protocol::BackendError;
use agent_session::{MemoryTranscript, Notice, SessionConfig, TurnOutcome, UserMessage};
use pretty_assertions::assert_eq;
use serde_json::json;
use session_runtime::executor::LocalActionExecutor;
use session_runtime::runtime::RuntimeController;
use tempfile::tempdir;

mod support;

#[test]
fn backend_panic_fails_the_turn() {
    let workspace = tempdir().expect("temp workspace");
    let transcript = MemoryTranscript::new();
    let executor = LocalActionExecutor::new(workspace.path()).expect("workspace root resolves");
    let runtime = RuntimeController::new(
        SessionConfig::default(),
        Arc::new(support::PanickingBackend),
        Arc::new(executor),
        Arc::new(transcript.clone()),
    );

    runtime.submit(UserMessage::new("explode")).expect("turn starts");
    assert!(runtime.run_until_idle(support::IDLE_TIMEOUT));

    assert_eq!(
        support::only_entry(&transcript).outcome,
        TurnOutcome::Failed {
            reason: "backend panicked".to_string()
        }
    );
    assert!(runtime.notices().iter().any(|notice| matches!(
        notice,
        Notice::AgentError { message, .. } if message == "backend panicked"
    )));
}

#[test]
fn stream_without_terminal_event_is_a_connectivity_failure() {
    let workspace = tempdir().expect("temp workspace");
    let backend = Arc::new(ScriptedBackend::new(vec![ScriptedReply::events(vec![
        json!({ "type": "botMessage.chunk", "text": "partial" }),
    ])]));
    let (runtime, transcript) =
        support::local_runtime(SessionConfig::default(), backend, workspace.path());

    runtime.submit(UserMessage::new("hello")).expect("turn starts");
    assert!(runtime.run_until_idle(support::IDLE_TIMEOUT));

    let entry = support::only_entry(&transcript);
    assert_eq!(entry.assistant_text, "partial");
    assert!(matches!(
        entry.outcome,
        TurnOutcome::Failed { ref reason } if reason.contains("terminal event")
    ));
    assert!(runtime
        .notices()
        .iter()
        .any(|notice| matches!(notice, Notice::Connectivity { .. })));
}

#[test]
fn unauthorized_backend_asks_for_sign_in() {
    let workspace = tempdir().expect("temp workspace");
    let backend = Arc::new(ScriptedBackend::new(vec![ScriptedReply::events(Vec::new())
        .then_fail(BackendError::unauthorized("token expired"))]));
    let (runtime, transcript) =
        support::local_runtime(SessionConfig::default(), backend, workspace.path());

    runtime.submit(UserMessage::new("hello")).expect("turn starts");
    assert!(runtime.run_until_idle(support::IDLE_TIMEOUT));

    assert_eq!(
        runtime.take_notices(),
        vec![Notice::SignInRequired {
            message: "token expired".to_string()
        }]
    );
    assert!(runtime.notices().is_empty());
    assert!(matches!(
        support::only_entry(&transcript).outcome,
        TurnOutcome::Failed { .. }
    ));
}

#[test]
fn backend_error_event_is_surfaced() {
    let workspace = tempdir().expect("temp workspace");
    let backend = Arc::new(ScriptedBackend::new(vec![ScriptedReply::events(vec![
        json!({ "type": "error", "message": "model overloaded", "code": "overloaded" }),
    ])]));
    let (runtime, transcript) =
        support::local_runtime(SessionConfig::default(), backend, workspace.path());

    runtime.submit(UserMessage::new("hello")).expect("turn starts");
    assert!(runtime.run_until_idle(support::IDLE_TIMEOUT));

    assert!(runtime.notices().iter().any(|notice| matches!(
        notice,
        Notice::AgentError { message, code } if message == "model overloaded"
            && code.as_deref() == Some("overloaded")
    )));
    assert!(matches!(
        support::only_entry(&transcript).outcome,
        TurnOutcome::Failed { .. }
    ));
}

#[test]
fn sink_failures_do_not_lose_the_turn() {
    let workspace = tempdir().expect("temp workspace");
    let backend = Arc::new(ScriptedBackend::new(vec![ScriptedReply::events(vec![
        json!({ "type": "botMessage.chunk", "text": "done anyway" }),
        json!({ "type": "done" }),
    ])]));
    let executor = LocalActionExecutor::new(workspace.path()).expect("workspace root resolves");
    let runtime = RuntimeController::new(
        SessionConfig::default(),
        backend,
        Arc::new(executor),
        Arc::new(support::FailingSink),
    );

    runtime.submit(UserMessage::new("hello")).expect("turn starts");
    assert!(runtime.run_until_idle(support::IDLE_TIMEOUT));

    let transcript = runtime.transcript();
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].outcome, TurnOutcome::Completed);
    assert_eq!(transcript[0].assistant_text, "done anyway");
}

#[test]
fn second_submit_during_a_turn_is_rejected() {
    let workspace = tempdir().expect("temp workspace");
    let backend = Arc::new(
        ScriptedBackend::new(vec![ScriptedReply::events(vec![json!({ "type": "done" })])])
            .with_event_delay(std::time::Duration::from_millis(200)),
    );
    let (runtime, _) = support::local_runtime(SessionConfig::default(), backend, workspace.path());

    runtime.submit(UserMessage::new("first")).expect("turn starts");
    assert!(runtime.submit(UserMessage::new("second")).is_err());
    assert!(runtime.submit(UserMessage::new("   ")).is_err());
    assert!(runtime.run_until_idle(support::IDLE_TIMEOUT));
}
