//! Maps heterogeneous wire events onto [`ActivityEvent`]s.
//!
//! Normalization reads the current timeline (to continue rolling thinking
//! text and to close phases) but never mutates it; the caller upserts.

use agent_protocol::{GenericActivity, PhasePayload, ToolPayload, WireEvent, WireTimestamp};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::activity::{derived_activity_id, ActivityEvent, ActivityKind, ActivityStatus};
use crate::store::ActivityStore;

pub const THINKING_ACTIVITY_ID: &str = "thinking";

#[must_use]
pub fn normalize(event: &WireEvent, store: &ActivityStore, now_ms: i64) -> Option<ActivityEvent> {
    match event {
        WireEvent::FileRead(payload) => tool_activity(ActivityKind::Read, payload, now_ms),
        WireEvent::Edit(payload) => tool_activity(ActivityKind::Edit, payload, now_ms),
        WireEvent::Create(payload) => tool_activity(ActivityKind::Create, payload, now_ms),
        WireEvent::Delete(payload) => tool_activity(ActivityKind::Delete, payload, now_ms),
        WireEvent::Command(payload) => tool_activity(ActivityKind::Command, payload, now_ms),
        WireEvent::Analysis(payload) | WireEvent::Context(payload) => {
            tool_activity(ActivityKind::Context, payload, now_ms)
        }
        WireEvent::Detection(payload) => tool_activity(ActivityKind::Detection, payload, now_ms),
        WireEvent::Intent(payload) => tool_activity(ActivityKind::Intent, payload, now_ms),
        WireEvent::PhaseStart(payload) => Some(phase_start(payload, now_ms)),
        WireEvent::PhaseEnd(payload) => phase_end(payload, store, now_ms),
        WireEvent::Thinking { delta } => rolling_thinking(THINKING_ACTIVITY_ID, delta, store, now_ms),
        WireEvent::Activity(activity) => generic_activity(activity, now_ms),
        WireEvent::Narrative { text, action_index } => narrative(text, *action_index, now_ms),
        _ => None,
    }
}

/// Resolves a source timestamp to epoch milliseconds, falling back to `now_ms`
/// when it is absent or unparseable.
#[must_use]
pub fn resolve_timestamp(timestamp: Option<&WireTimestamp>, now_ms: i64) -> i64 {
    match timestamp {
        Some(WireTimestamp::Millis(millis)) => *millis,
        Some(WireTimestamp::Text(text)) => OffsetDateTime::parse(text.trim(), &Rfc3339)
            .ok()
            .and_then(|parsed| i64::try_from(parsed.unix_timestamp_nanos() / 1_000_000).ok())
            .unwrap_or(now_ms),
        None => now_ms,
    }
}

/// The placeholder shown between sending a message and the first event.
#[must_use]
pub fn thinking_placeholder(id: &str, now_ms: i64) -> ActivityEvent {
    ActivityEvent::new(
        id,
        ActivityKind::Thinking,
        "Thinking",
        "",
        ActivityStatus::Running,
        now_ms,
    )
}

/// Present/past/failure label for a kind, chosen by status.
#[must_use]
pub fn default_label(kind: ActivityKind, status: ActivityStatus) -> &'static str {
    let (running, done, failed) = match kind {
        ActivityKind::Read => ("Reading", "Read", "Could not read"),
        ActivityKind::Edit => ("Editing", "Edited", "Could not edit"),
        ActivityKind::Create => ("Creating", "Created", "Could not create"),
        ActivityKind::Delete => ("Deleting", "Deleted", "Could not delete"),
        ActivityKind::Command => ("Running", "Ran", "Command failed"),
        ActivityKind::Context => ("Analyzing", "Analyzed", "Analysis failed"),
        ActivityKind::Detection => ("Detecting", "Detected", "Detection failed"),
        ActivityKind::Intent => ("Planning", "Planned", "Planning failed"),
        ActivityKind::Thinking => ("Thinking", "Thought", "Thinking failed"),
        ActivityKind::NarrativeMarker => ("Narrating", "Narrated", "Narration failed"),
        ActivityKind::Error => ("Error", "Error", "Error"),
        ActivityKind::Info => ("Working", "Done", "Failed"),
    };
    match status {
        ActivityStatus::Running => running,
        ActivityStatus::Done => done,
        ActivityStatus::Error => failed,
    }
}

fn tool_activity(kind: ActivityKind, payload: &ToolPayload, now_ms: i64) -> Option<ActivityEvent> {
    let subject = [&payload.path, &payload.command, &payload.detail, &payload.label]
        .into_iter()
        .flatten()
        .map(|value| value.trim())
        .find(|value| !value.is_empty())?
        .to_string();

    let status = match payload.status {
        Some(status) => status.into(),
        None if payload.exit_code.is_some_and(|code| code != 0) => ActivityStatus::Error,
        None => ActivityStatus::Done,
    };
    let detail = [&payload.detail, &payload.path, &payload.command]
        .into_iter()
        .flatten()
        .find(|value| !value.trim().is_empty())
        .cloned()
        .unwrap_or_default();
    let label = payload
        .label
        .clone()
        .filter(|label| !label.trim().is_empty())
        .unwrap_or_else(|| default_label(kind, status).to_string());
    let id = payload
        .id
        .clone()
        .unwrap_or_else(|| derived_activity_id(kind, &subject));

    let mut activity = ActivityEvent::new(
        id,
        kind,
        label,
        detail,
        status,
        resolve_timestamp(payload.timestamp.as_ref(), now_ms),
    )
    .with_action_index(payload.action_index);
    activity.file_path = payload.path.clone();
    activity.additions = payload.additions;
    activity.deletions = payload.deletions;
    activity.output = payload.output.clone();
    activity.exit_code = payload.exit_code;
    Some(activity)
}

fn phase_id(phase: &str) -> String {
    format!("phase:{phase}")
}

fn humanize_phase(phase: &str) -> String {
    let mut chars = phase.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.map(|ch| if ch == '_' || ch == '-' { ' ' } else { ch }))
            .collect(),
        None => String::new(),
    }
}

fn phase_start(payload: &PhasePayload, now_ms: i64) -> ActivityEvent {
    let label = payload
        .label
        .clone()
        .unwrap_or_else(|| humanize_phase(&payload.phase));
    let status = payload
        .status
        .map(ActivityStatus::from)
        .unwrap_or(ActivityStatus::Running);
    ActivityEvent::new(
        phase_id(&payload.phase),
        ActivityKind::Info,
        label,
        "",
        status,
        resolve_timestamp(payload.timestamp.as_ref(), now_ms),
    )
}

fn phase_end(payload: &PhasePayload, store: &ActivityStore, now_ms: i64) -> Option<ActivityEvent> {
    let id = phase_id(&payload.phase);
    let label = match (&payload.label, store.get(&id)) {
        (Some(label), _) => label.clone(),
        (None, Some(open)) => open.label.clone(),
        (None, None) => return None,
    };
    let status = payload
        .status
        .map(ActivityStatus::from)
        .unwrap_or(ActivityStatus::Done);
    Some(ActivityEvent::new(
        id,
        ActivityKind::Info,
        label,
        "",
        status,
        resolve_timestamp(payload.timestamp.as_ref(), now_ms),
    ))
}

/// Appends `delta` to the thinking entry stored under `id`.
#[must_use]
pub fn rolling_thinking(
    id: &str,
    delta: &str,
    store: &ActivityStore,
    now_ms: i64,
) -> Option<ActivityEvent> {
    if delta.is_empty() {
        return None;
    }
    let mut text = store
        .get(id)
        .map(|existing| existing.detail.clone())
        .unwrap_or_default();
    text.push_str(delta);
    Some(ActivityEvent::new(
        id,
        ActivityKind::Thinking,
        "Thinking",
        text,
        ActivityStatus::Running,
        now_ms,
    ))
}

fn generic_activity(activity: &GenericActivity, now_ms: i64) -> Option<ActivityEvent> {
    let label = activity
        .label
        .clone()
        .filter(|label| !label.trim().is_empty());
    let detail = activity
        .detail
        .clone()
        .filter(|detail| !detail.trim().is_empty());
    if label.is_none() && detail.is_none() {
        return None;
    }

    let kind = ActivityKind::parse_lenient(&activity.kind);
    let status = activity
        .status
        .map(ActivityStatus::from)
        .unwrap_or(ActivityStatus::Done);
    let subject = detail.as_deref().or(label.as_deref()).unwrap_or_default();
    let id = activity
        .id
        .clone()
        .unwrap_or_else(|| derived_activity_id(kind, subject));
    let label = label.unwrap_or_else(|| default_label(kind, status).to_string());

    let mut event = ActivityEvent::new(
        id,
        kind,
        label,
        detail.unwrap_or_default(),
        status,
        resolve_timestamp(activity.timestamp.as_ref(), now_ms),
    )
    .with_action_index(activity.action_index);
    event.file_path = activity.file_path.clone();
    Some(event)
}

fn narrative(text: &str, action_index: Option<usize>, now_ms: i64) -> Option<ActivityEvent> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let subject = match action_index {
        Some(index) => format!("{index}:{text}"),
        None => text.to_string(),
    };
    Some(
        ActivityEvent::new(
            derived_activity_id(ActivityKind::NarrativeMarker, &subject),
            ActivityKind::NarrativeMarker,
            text,
            "",
            ActivityStatus::Done,
            now_ms,
        )
        .with_action_index(action_index),
    )
}
