use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use agent_session::agent_protocol::{CancelSignal, ProposedAction};
use pretty_assertions::assert_eq;
use serde_json::Value;
use session_runtime::executor::{ActionExecutor, LocalActionExecutor};
use tempfile::tempdir;

fn run(executor: &LocalActionExecutor, index: usize, action: ProposedAction) -> Vec<Value> {
    run_with_cancel(executor, index, action, Arc::new(AtomicBool::new(false)))
}

fn run_with_cancel(
    executor: &LocalActionExecutor,
    index: usize,
    action: ProposedAction,
    cancel: CancelSignal,
) -> Vec<Value> {
    let mut events = Vec::new();
    executor
        .execute(index, action, cancel, &mut |event| events.push(event))
        .expect("executor runs");
    events
}

fn event_types(events: &[Value]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|event| event["type"].as_str())
        .collect()
}

fn completion(events: &[Value]) -> &Value {
    events
        .iter()
        .rev()
        .find(|event| event["type"] == "action.complete")
        .expect("action.complete is emitted")
}

#[test]
fn create_then_edit_reports_line_counts() {
    let workspace = tempdir().expect("temp workspace");
    let executor = LocalActionExecutor::new(workspace.path()).expect("workspace root resolves");

    let created = run(
        &executor,
        0,
        ProposedAction::create_file("docs/notes.md", "one\ntwo\n"),
    );
    assert_eq!(
        event_types(&created),
        vec!["action.start", "create", "action.complete"]
    );
    assert_eq!(completion(&created)["success"], true);
    assert_eq!(completion(&created)["data"]["additions"], 2);

    let edited = run(
        &executor,
        1,
        ProposedAction::edit_file("docs/notes.md", "two", "three"),
    );
    let complete = completion(&edited);
    assert_eq!(complete["success"], true);
    assert_eq!(complete["actionIndex"], 1);
    assert_eq!(complete["data"]["additions"], 1);
    assert_eq!(complete["data"]["deletions"], 1);
    assert_eq!(edited[1]["path"], "docs/notes.md");
    assert_eq!(
        fs::read_to_string(workspace.path().join("docs/notes.md")).expect("file exists"),
        "one\nthree\n"
    );
}

#[test]
fn edit_requires_exactly_one_match() {
    let workspace = tempdir().expect("temp workspace");
    fs::write(workspace.path().join("a.txt"), "x x\n").expect("fixture");
    let executor = LocalActionExecutor::new(workspace.path()).expect("workspace root resolves");

    let ambiguous = run(&executor, 0, ProposedAction::edit_file("a.txt", "x", "y"));
    assert_eq!(completion(&ambiguous)["success"], false);
    assert_eq!(
        completion(&ambiguous)["message"],
        "editFile requires exactly one match of oldText in a.txt; found 2"
    );
    assert_eq!(ambiguous[1]["status"], "error");

    let missing = run(&executor, 0, ProposedAction::edit_file("a.txt", "z", "y"));
    assert!(completion(&missing)["message"]
        .as_str()
        .is_some_and(|message| message.ends_with("found 0")));
    assert_eq!(
        fs::read_to_string(workspace.path().join("a.txt")).expect("file exists"),
        "x x\n"
    );
}

#[test]
fn writes_outside_the_workspace_are_rejected() {
    let workspace = tempdir().expect("temp workspace");
    let executor = LocalActionExecutor::new(workspace.path()).expect("workspace root resolves");

    let events = run(
        &executor,
        0,
        ProposedAction::create_file("../escaped.txt", "nope"),
    );
    let complete = completion(&events);
    assert_eq!(complete["success"], false);
    assert!(complete["message"]
        .as_str()
        .is_some_and(|message| message.contains("escapes workspace root")));
    assert!(!workspace
        .path()
        .parent()
        .map(|parent| parent.join("escaped.txt").exists())
        .unwrap_or(false));
}

#[test]
fn failing_command_reports_exit_code_and_output() {
    let workspace = tempdir().expect("temp workspace");
    let executor = LocalActionExecutor::new(workspace.path()).expect("workspace root resolves");

    let events = run(
        &executor,
        2,
        ProposedAction::run_command("echo boom >&2; exit 3", None),
    );
    let types = event_types(&events);
    assert_eq!(&types[..2], &["action.start", "command.start"]);
    assert_eq!(&types[types.len() - 2..], &["command.done", "action.complete"]);
    assert_eq!(events[1]["meta"]["actionIndex"], 2);

    let stderr = events
        .iter()
        .find(|event| event["type"] == "command.output" && event["stream"] == "stderr")
        .expect("stderr is reported");
    assert!(stderr["text"]
        .as_str()
        .is_some_and(|text| text.contains("boom")));
    let done = &events[events.len() - 2];
    assert_eq!(done["exitCode"], 3);
    assert_eq!(
        completion(&events)["message"],
        "`echo boom >&2; exit 3` exited with code 3"
    );
}

#[test]
fn commands_run_in_the_workspace() {
    let workspace = tempdir().expect("temp workspace");
    let executor = LocalActionExecutor::new(workspace.path()).expect("workspace root resolves");

    let events = run(&executor, 0, ProposedAction::run_command("touch here", None));
    assert_eq!(completion(&events)["success"], true);
    assert!(workspace.path().join("here").exists());
}

#[test]
fn commands_past_the_timeout_are_killed() {
    let workspace = tempdir().expect("temp workspace");
    let executor = LocalActionExecutor::new(workspace.path())
        .expect("workspace root resolves")
        .with_command_timeout(Duration::from_millis(200));

    let started = Instant::now();
    let events = run(&executor, 0, ProposedAction::run_command("sleep 30", None));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(event_types(&events).contains(&"command.error"));
    assert_eq!(completion(&events)["success"], false);
    assert!(completion(&events)["message"]
        .as_str()
        .is_some_and(|message| message.contains("timed out")));
}

#[test]
fn cancellation_stops_a_running_command() {
    let workspace = tempdir().expect("temp workspace");
    let executor = LocalActionExecutor::new(workspace.path()).expect("workspace root resolves");
    let cancel: CancelSignal = Arc::new(AtomicBool::new(false));

    let trigger = Arc::clone(&cancel);
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        trigger.store(true, Ordering::SeqCst);
    });

    let started = Instant::now();
    let events = run_with_cancel(
        &executor,
        0,
        ProposedAction::run_command("sleep 30", None),
        cancel,
    );
    canceller.join().expect("canceller joins");

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(completion(&events)["success"], false);
    assert_eq!(completion(&events)["message"], "`sleep 30` was cancelled");
}

#[test]
fn already_cancelled_actions_emit_nothing() {
    let workspace = tempdir().expect("temp workspace");
    let executor = LocalActionExecutor::new(workspace.path()).expect("workspace root resolves");

    let events = run_with_cancel(
        &executor,
        0,
        ProposedAction::create_file("never.txt", "x"),
        Arc::new(AtomicBool::new(true)),
    );
    assert!(events.is_empty());
    assert!(!workspace.path().join("never.txt").exists());
}
