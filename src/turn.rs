//! Top-level reducer for one user turn.
//!
//! The controller owns every per-turn component and never performs I/O. Each
//! call returns the [`TurnEffect`]s the host must carry out: dispatching
//! requests, executing actions, cancelling dispatches, surfacing notices and
//! persisting the finalized transcript.

use std::collections::BTreeMap;

use agent_protocol::{
    ActionComplete, Attachment, BackendError, ChatRequest, ConsentDecision, DispatchId,
    OutboundRequest, ProposedAction, RequestOrigin, TurnId, WireEvent,
};
use serde_json::Value;

use crate::actions::{ActionOrchestrator, ActionProgress, ActionResult, ActionStartOutcome, ActionSummary};
use crate::activity::{ActivityEvent, ActivityKind, ActivityStatus};
use crate::command_tracker::{CommandFailure, CommandOutcome, CommandTracker, CommandUpdate};
use crate::config::SessionConfig;
use crate::consent::{consent_activity, ConsentGate, USER_SKIP_REASON};
use crate::error::{ProtocolError, SessionError};
use crate::healing::{FailureContext, FailureSignature, HealingDecision, SelfHealingController};
use crate::normalize::{normalize, rolling_thinking, thinking_placeholder, THINKING_ACTIVITY_ID};
use crate::store::ActivityStore;
use crate::transcript::{TranscriptEntry, TurnOutcome};

const CANCELLED_REASON: &str = "Cancelled";
const NO_TERMINAL_EVENT: &str = "backend exited without terminal event";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Sending,
    Streaming,
    Finalizing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserMessage {
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub conversation_id: Option<String>,
}

impl UserMessage {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// User-facing signals that are not timeline entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    StillWorking { turn_id: TurnId, elapsed_ms: u64 },
    SignInRequired { message: String },
    Connectivity { message: String },
    AgentError { message: String, code: Option<String> },
    ConsentRequired { consent_id: String, command: String },
    RecoveryExhausted { signature: String, note: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEffect {
    Dispatch {
        dispatch_id: DispatchId,
        request: OutboundRequest,
    },
    /// Execute one action locally, reporting its events under `dispatch_id`.
    ExecuteAction {
        dispatch_id: DispatchId,
        index: usize,
        action: ProposedAction,
    },
    CancelDispatch {
        dispatch_id: DispatchId,
    },
    Notice(Notice),
    BatchCompleted(ActionSummary),
    TurnFinalized(TranscriptEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchKind {
    Chat,
    Consent,
    Command { action_index: Option<usize> },
    LocalAction { index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedRetry {
    prompts: Vec<String>,
    attempt: u32,
    max_attempts: u32,
}

/// Everything that lives for exactly one turn.
#[derive(Debug)]
pub struct TurnContext {
    turn_id: TurnId,
    user_message: UserMessage,
    store: ActivityStore,
    tracker: CommandTracker,
    orchestrator: ActionOrchestrator,
    gate: ConsentGate,
    healing: SelfHealingController,
    assistant_text: String,
    thinking: String,
    thinking_id: String,
    narratives: BTreeMap<usize, Vec<String>>,
    notes: Vec<String>,
    command_outcomes: BTreeMap<usize, CommandOutcome>,
    live: BTreeMap<DispatchId, DispatchKind>,
    chat_dispatch: DispatchId,
    done_received: bool,
    local_inflight: Option<(DispatchId, usize)>,
    queued_retry: Option<QueuedRetry>,
    dispatch_started_ms: i64,
    still_working_sent: bool,
    failure: Option<String>,
    exhausted_signature: Option<String>,
    last_summary: Option<ActionSummary>,
}

impl TurnContext {
    fn new(turn_id: TurnId, user_message: UserMessage, config: &SessionConfig) -> Self {
        Self {
            turn_id,
            user_message,
            store: ActivityStore::new(config.max_activities),
            tracker: CommandTracker::new(config.output_cap_chars),
            orchestrator: ActionOrchestrator::new(),
            gate: ConsentGate::new(),
            healing: SelfHealingController::new(
                config.max_heal_attempts,
                config.error_preview_chars,
            ),
            assistant_text: String::new(),
            thinking: String::new(),
            thinking_id: THINKING_ACTIVITY_ID.to_string(),
            narratives: BTreeMap::new(),
            notes: Vec::new(),
            command_outcomes: BTreeMap::new(),
            live: BTreeMap::new(),
            chat_dispatch: 0,
            done_received: false,
            local_inflight: None,
            queued_retry: None,
            dispatch_started_ms: 0,
            still_working_sent: false,
            failure: None,
            exhausted_signature: None,
            last_summary: None,
        }
    }

    #[must_use]
    pub fn turn_id(&self) -> TurnId {
        self.turn_id
    }

    #[must_use]
    pub fn user_message(&self) -> &UserMessage {
        &self.user_message
    }

    #[must_use]
    pub fn store(&self) -> &ActivityStore {
        &self.store
    }

    #[must_use]
    pub fn tracker(&self) -> &CommandTracker {
        &self.tracker
    }

    #[must_use]
    pub fn orchestrator(&self) -> &ActionOrchestrator {
        &self.orchestrator
    }

    #[must_use]
    pub fn gate(&self) -> &ConsentGate {
        &self.gate
    }

    #[must_use]
    pub fn healing(&self) -> &SelfHealingController {
        &self.healing
    }

    #[must_use]
    pub fn assistant_text(&self) -> &str {
        &self.assistant_text
    }

    #[must_use]
    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    fn record(&mut self, activity: ActivityEvent) -> String {
        let action_index = activity.action_index;
        let outcome = self.store.upsert(activity);
        if let Some(index) = action_index {
            self.orchestrator.record_activity(index, &outcome.id);
        }
        outcome.id
    }

    /// Shows a fresh Running thinking entry for the chat dispatch `id`.
    fn open_thinking(&mut self, id: &str, now_ms: i64) {
        self.thinking_id = self.record(thinking_placeholder(id, now_ms));
    }

    fn queue_retry(&mut self, prompt: String, attempt: u32, max_attempts: u32) {
        match self.queued_retry.as_mut() {
            Some(queued) => {
                queued.prompts.push(prompt);
                queued.attempt = attempt;
                queued.max_attempts = max_attempts;
            }
            None => {
                self.queued_retry = Some(QueuedRetry {
                    prompts: vec![prompt],
                    attempt,
                    max_attempts,
                });
            }
        }
    }

    fn has_side_dispatches(&self) -> bool {
        self.live.values().any(|kind| *kind != DispatchKind::Chat)
    }
}

#[derive(Debug)]
pub struct TurnController {
    config: SessionConfig,
    phase: TurnPhase,
    next_turn_id: TurnId,
    next_dispatch_id: DispatchId,
    context: Option<TurnContext>,
}

impl TurnController {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            phase: TurnPhase::Idle,
            next_turn_id: 1,
            next_dispatch_id: 1,
            context: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    /// The current turn, or the most recently finalized one.
    #[must_use]
    pub fn context(&self) -> Option<&TurnContext> {
        self.context.as_ref()
    }

    #[must_use]
    pub fn timeline(&self) -> &[ActivityEvent] {
        self.context
            .as_ref()
            .map_or(&[], |context| context.store.entries())
    }

    /// Summary of the most recently completed action batch of this turn.
    #[must_use]
    pub fn summary(&self) -> Option<&ActionSummary> {
        self.context
            .as_ref()
            .and_then(|context| context.last_summary.as_ref())
    }

    pub fn begin_turn(
        &mut self,
        message: UserMessage,
        now_ms: i64,
    ) -> Result<Vec<TurnEffect>, SessionError> {
        if self.phase != TurnPhase::Idle {
            let turn_id = self.context.as_ref().map_or(0, TurnContext::turn_id);
            return Err(SessionError::TurnActive { turn_id });
        }
        if message.text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let turn_id = self.next_turn_id;
        self.next_turn_id += 1;
        let mut context = TurnContext::new(turn_id, message, &self.config);
        context.open_thinking(THINKING_ACTIVITY_ID, now_ms);

        let request = OutboundRequest::Chat(ChatRequest {
            turn_id,
            message: context.user_message.text.clone(),
            attachments: context.user_message.attachments.clone(),
            conversation_id: context.user_message.conversation_id.clone(),
            origin: RequestOrigin::User,
        });
        self.context = Some(context);
        tracing::debug!(turn_id, "turn started");

        let mut effects = Vec::new();
        self.dispatch_chat(request, now_ms, &mut effects);
        Ok(effects)
    }

    /// Decodes and applies one raw inbound payload. Malformed payloads are
    /// logged and dropped.
    pub fn apply_raw(&mut self, dispatch_id: DispatchId, payload: Value, now_ms: i64) -> Vec<TurnEffect> {
        match agent_protocol::decode_wire_event(payload.clone()) {
            Ok(event) => self.apply_event(dispatch_id, event, now_ms),
            Err(source) => {
                let error = ProtocolError::new(&payload, source);
                tracing::warn!(dispatch_id, %error, "dropping inbound payload");
                Vec::new()
            }
        }
    }

    pub fn apply_event(
        &mut self,
        dispatch_id: DispatchId,
        event: WireEvent,
        now_ms: i64,
    ) -> Vec<TurnEffect> {
        let mut effects = Vec::new();
        let Some(kind) = self.live_dispatch(dispatch_id) else {
            tracing::debug!(dispatch_id, event = event.type_name(), "dropping stale event");
            return effects;
        };
        if kind == DispatchKind::Chat && self.phase == TurnPhase::Sending {
            self.phase = TurnPhase::Streaming;
        }

        let Some(context) = self.context.as_mut() else {
            return effects;
        };

        match event {
            WireEvent::BotMessageStart { .. } => {}
            WireEvent::BotMessageChunk { text } => context.assistant_text.push_str(&text),
            WireEvent::BotMessageEnd { actions } => {
                if !actions.is_empty() {
                    context.orchestrator.start(actions);
                    context.command_outcomes.clear();
                }
            }
            WireEvent::Thinking { ref delta } => {
                context.thinking.push_str(delta);
                if let Some(activity) =
                    rolling_thinking(&context.thinking_id, delta, &context.store, now_ms)
                {
                    context.thinking_id = context.record(activity);
                }
            }
            WireEvent::Narrative {
                ref text,
                action_index,
            } => {
                if let Some(index) = action_index {
                    context.orchestrator.record_narrative(index, text);
                    context
                        .narratives
                        .entry(index)
                        .or_default()
                        .push(text.clone());
                }
                if let Some(activity) = normalize(&event, &context.store, now_ms) {
                    context.record(activity);
                }
            }
            WireEvent::CommandStart(start) => {
                let activity = context.tracker.on_start(
                    &start.command_id,
                    &start.command,
                    start.cwd.as_deref(),
                    start.meta.action_index,
                    now_ms,
                );
                context.record(activity);
            }
            WireEvent::CommandOutput(output) => {
                let activity = context.tracker.on_output(
                    &output.command_id,
                    &output.text,
                    output.stream,
                    now_ms,
                );
                context.record(activity);
            }
            WireEvent::CommandDone(done) => {
                let update = context.tracker.on_done(
                    &done.command_id,
                    done.exit_code,
                    done.duration_ms,
                    done.stdout.as_deref(),
                    done.stderr.as_deref(),
                    now_ms,
                );
                Self::absorb_command_update(context, update, now_ms, &mut effects);
            }
            WireEvent::CommandError(failed) => {
                let update = context
                    .tracker
                    .on_error(&failed.command_id, &failed.error, now_ms);
                Self::absorb_command_update(context, update, now_ms, &mut effects);
            }
            WireEvent::ConsentRequired(consent) => {
                let activity = consent_activity(&consent, None, now_ms);
                let notice = Notice::ConsentRequired {
                    consent_id: consent.consent_id.clone(),
                    command: consent.command.clone(),
                };
                if context.gate.request(consent) {
                    context.record(activity);
                    effects.push(TurnEffect::Notice(notice));
                }
            }
            WireEvent::ActionStart(start) => {
                match context.orchestrator.on_action_start(start.action_index) {
                    Ok(ActionStartOutcome::Skipped(progress)) => {
                        Self::absorb_progress(context, progress, now_ms, &mut effects);
                    }
                    Ok(_) => {}
                    Err(error) => tracing::warn!(%error, "ignoring action.start"),
                }
            }
            WireEvent::ActionComplete(complete) => {
                Self::complete_action(context, complete, now_ms, &mut effects);
            }
            WireEvent::Done { summary } => {
                if kind == DispatchKind::Chat {
                    context.done_received = true;
                    if context.assistant_text.is_empty() {
                        if let Some(summary) = summary {
                            context.assistant_text = summary;
                        }
                    }
                }
            }
            WireEvent::Error { message, code } => {
                if kind == DispatchKind::Chat {
                    context.record(
                        ActivityEvent::new(
                            format!("error:{dispatch_id}"),
                            ActivityKind::Error,
                            "Agent error",
                            message.clone(),
                            ActivityStatus::Error,
                            now_ms,
                        )
                        .with_error(message.clone()),
                    );
                    effects.push(TurnEffect::Notice(Notice::AgentError {
                        message: message.clone(),
                        code,
                    }));
                    context.failure = Some(message);
                    self.finalize(now_ms, &mut effects);
                    return effects;
                }
                Self::side_dispatch_failed(context, kind, &message, now_ms, &mut effects);
            }
            other => {
                if let Some(activity) = normalize(&other, &context.store, now_ms) {
                    context.record(activity);
                }
            }
        }

        self.advance(now_ms, &mut effects);
        effects
    }

    /// Reports that a dispatch returned. Chat dispatches that end without a
    /// terminal event, or with a transport error, fail the turn.
    pub fn dispatch_ended(
        &mut self,
        dispatch_id: DispatchId,
        result: Result<(), BackendError>,
        now_ms: i64,
    ) -> Vec<TurnEffect> {
        let mut effects = Vec::new();
        let Some(kind) = self.live_dispatch(dispatch_id) else {
            return effects;
        };
        let Some(context) = self.context.as_mut() else {
            return effects;
        };
        context.live.remove(&dispatch_id);

        match (kind, result) {
            (DispatchKind::Chat, Ok(())) if context.done_received => {}
            (DispatchKind::Chat, result) => {
                let (notice, reason) = match result {
                    Err(BackendError::Unauthorized { message }) => (
                        Notice::SignInRequired {
                            message: message.clone(),
                        },
                        message,
                    ),
                    Err(BackendError::Transport { message }) => (
                        Notice::Connectivity {
                            message: message.clone(),
                        },
                        message,
                    ),
                    Err(BackendError::Protocol(message)) => (
                        Notice::AgentError {
                            message: message.clone(),
                            code: None,
                        },
                        message,
                    ),
                    Ok(()) => (
                        Notice::Connectivity {
                            message: NO_TERMINAL_EVENT.to_string(),
                        },
                        NO_TERMINAL_EVENT.to_string(),
                    ),
                };
                tracing::warn!(dispatch_id, %reason, "chat dispatch failed");
                effects.push(TurnEffect::Notice(notice));
                context.failure = Some(reason);
                self.finalize(now_ms, &mut effects);
                return effects;
            }
            (kind, Err(error)) => {
                Self::side_dispatch_failed(context, kind, &error.to_string(), now_ms, &mut effects);
            }
            (DispatchKind::LocalAction { index }, Ok(())) => {
                Self::side_dispatch_failed(
                    context,
                    DispatchKind::LocalAction { index },
                    "executor exited without completing the action",
                    now_ms,
                    &mut effects,
                );
            }
            (DispatchKind::Command { action_index: Some(index) }, Ok(())) => {
                Self::settle_from_command(context, index, now_ms, &mut effects);
            }
            (_, Ok(())) => {}
        }

        if context
            .local_inflight
            .is_some_and(|(inflight, _)| inflight == dispatch_id)
        {
            context.local_inflight = None;
        }
        self.advance(now_ms, &mut effects);
        effects
    }

    pub fn resolve_consent(
        &mut self,
        consent_id: &str,
        decision: ConsentDecision,
        now_ms: i64,
    ) -> Result<Vec<TurnEffect>, SessionError> {
        if self.phase == TurnPhase::Idle {
            return Err(SessionError::NoActiveTurn);
        }
        let context = self.context.as_mut().ok_or(SessionError::NoActiveTurn)?;
        let resolution = context.gate.resolve(consent_id, decision)?;
        context.record(consent_activity(&resolution.consent, Some(decision), now_ms));

        let mut effects = Vec::new();
        if decision == ConsentDecision::Skip {
            if let Some(index) = resolution.action_index() {
                match context.orchestrator.fail(index, USER_SKIP_REASON) {
                    Ok(progress) => Self::absorb_progress(context, progress, now_ms, &mut effects),
                    Err(error) => tracing::debug!(%error, "consent for action outside batch"),
                }
            }
        }

        for request in resolution.outbound {
            let kind = match &request {
                OutboundRequest::ExecuteCommand(command) => DispatchKind::Command {
                    action_index: command.action_index,
                },
                _ => DispatchKind::Consent,
            };
            let dispatch_id = self.allocate_dispatch_id();
            if let Some(context) = self.context.as_mut() {
                context.live.insert(dispatch_id, kind);
            }
            effects.push(TurnEffect::Dispatch {
                dispatch_id,
                request,
            });
        }

        self.advance(now_ms, &mut effects);
        Ok(effects)
    }

    /// Aborts the active turn. A no-op when idle.
    pub fn cancel(&mut self, now_ms: i64) -> Vec<TurnEffect> {
        let mut effects = Vec::new();
        if self.phase == TurnPhase::Idle {
            return effects;
        }
        let Some(context) = self.context.as_mut() else {
            self.phase = TurnPhase::Idle;
            return effects;
        };

        tracing::info!(turn_id = context.turn_id, now_ms, "cancelling turn");
        for dispatch_id in std::mem::take(&mut context.live).into_keys() {
            effects.push(TurnEffect::CancelDispatch { dispatch_id });
        }
        context.store.fail_running(CANCELLED_REASON);
        context.orchestrator.abandon();
        context.gate.discard_all();
        context.tracker.clear();
        context.local_inflight = None;
        context.queued_retry = None;

        let entry = Self::transcript_entry(context, TurnOutcome::Cancelled);
        effects.push(TurnEffect::TurnFinalized(entry));
        self.phase = TurnPhase::Idle;
        effects
    }

    /// Emits the still-working notice once per dispatch after the configured delay.
    pub fn tick(&mut self, now_ms: i64) -> Vec<TurnEffect> {
        let mut effects = Vec::new();
        if !matches!(self.phase, TurnPhase::Sending | TurnPhase::Streaming) {
            return effects;
        }
        let Some(context) = self.context.as_mut() else {
            return effects;
        };
        let elapsed_ms = u64::try_from(now_ms.saturating_sub(context.dispatch_started_ms)).unwrap_or(0);
        if !context.still_working_sent && elapsed_ms >= self.config.still_working_after_ms {
            context.still_working_sent = true;
            effects.push(TurnEffect::Notice(Notice::StillWorking {
                turn_id: context.turn_id,
                elapsed_ms,
            }));
        }
        effects
    }

    fn allocate_dispatch_id(&mut self) -> DispatchId {
        let id = self.next_dispatch_id;
        self.next_dispatch_id += 1;
        id
    }

    fn live_dispatch(&self, dispatch_id: DispatchId) -> Option<DispatchKind> {
        if self.phase == TurnPhase::Idle {
            return None;
        }
        self.context
            .as_ref()
            .and_then(|context| context.live.get(&dispatch_id).copied())
    }

    fn dispatch_chat(&mut self, request: OutboundRequest, now_ms: i64, effects: &mut Vec<TurnEffect>) {
        let dispatch_id = self.allocate_dispatch_id();
        let Some(context) = self.context.as_mut() else {
            return;
        };
        context.live.retain(|_, kind| *kind != DispatchKind::Chat);
        context.live.insert(dispatch_id, DispatchKind::Chat);
        context.chat_dispatch = dispatch_id;
        context.done_received = false;
        context.dispatch_started_ms = now_ms;
        context.still_working_sent = false;
        self.phase = TurnPhase::Sending;
        effects.push(TurnEffect::Dispatch {
            dispatch_id,
            request,
        });
    }

    /// Starts the next local action, then either sends a queued corrective
    /// prompt or finalizes once the current dispatch has settled.
    fn advance(&mut self, now_ms: i64, effects: &mut Vec<TurnEffect>) {
        if matches!(self.phase, TurnPhase::Idle | TurnPhase::Finalizing) {
            return;
        }
        self.schedule_local_action(effects);

        let Some(context) = self.context.as_mut() else {
            return;
        };
        let pending_local = self.config.execute_actions_locally
            && context.orchestrator.next_runnable().is_some();
        let settled = context.done_received
            && context.gate.is_empty()
            && context.local_inflight.is_none()
            && !context.has_side_dispatches()
            && !pending_local;
        if !settled {
            return;
        }

        if let Some(retry) = context.queued_retry.take() {
            let request = OutboundRequest::Chat(ChatRequest {
                turn_id: context.turn_id,
                message: retry.prompts.join("\n\n---\n\n"),
                attachments: Vec::new(),
                conversation_id: context.user_message.conversation_id.clone(),
                origin: RequestOrigin::SelfHealing {
                    attempt: retry.attempt,
                    max_attempts: retry.max_attempts,
                },
            });
            tracing::info!(
                turn_id = context.turn_id,
                attempt = retry.attempt,
                "dispatching corrective prompt"
            );
            let thinking_id = format!("{THINKING_ACTIVITY_ID}:{}", self.next_dispatch_id);
            context.open_thinking(&thinking_id, now_ms);
            self.dispatch_chat(request, now_ms, effects);
            return;
        }

        self.finalize(now_ms, effects);
    }

    fn schedule_local_action(&mut self, effects: &mut Vec<TurnEffect>) {
        if !self.config.execute_actions_locally {
            return;
        }
        let next = match self.context.as_ref() {
            Some(context) if context.local_inflight.is_none() => context
                .orchestrator
                .next_runnable()
                .map(|(index, action)| (index, action.clone())),
            _ => None,
        };
        let Some((index, action)) = next else {
            return;
        };

        let dispatch_id = self.allocate_dispatch_id();
        if let Some(context) = self.context.as_mut() {
            context
                .live
                .insert(dispatch_id, DispatchKind::LocalAction { index });
            context.local_inflight = Some((dispatch_id, index));
        }
        effects.push(TurnEffect::ExecuteAction {
            dispatch_id,
            index,
            action,
        });
    }

    fn finalize(&mut self, now_ms: i64, effects: &mut Vec<TurnEffect>) {
        let Some(context) = self.context.as_mut() else {
            self.phase = TurnPhase::Idle;
            return;
        };
        self.phase = TurnPhase::Finalizing;

        let chat_dispatch = context.chat_dispatch;
        for (dispatch_id, _) in std::mem::take(&mut context.live) {
            if dispatch_id != chat_dispatch {
                effects.push(TurnEffect::CancelDispatch { dispatch_id });
            }
        }
        context.store.finish_running();
        context.orchestrator.abandon();
        for consent in context.gate.discard_all() {
            tracing::debug!(consent_id = %consent.consent_id, "discarding unresolved consent");
        }
        context.tracker.clear();
        context.local_inflight = None;
        context.queued_retry = None;

        let outcome = match (&context.failure, &context.exhausted_signature) {
            (Some(reason), _) => TurnOutcome::Failed {
                reason: reason.clone(),
            },
            (None, Some(signature)) => TurnOutcome::RecoveryExhausted {
                signature: signature.clone(),
            },
            (None, None) => TurnOutcome::Completed,
        };
        tracing::debug!(turn_id = context.turn_id, ?outcome, now_ms, "turn finalized");
        let entry = Self::transcript_entry(context, outcome);
        effects.push(TurnEffect::TurnFinalized(entry));
        self.phase = TurnPhase::Idle;
    }

    fn transcript_entry(context: &TurnContext, outcome: TurnOutcome) -> TranscriptEntry {
        TranscriptEntry {
            turn_id: context.turn_id,
            user_message: context.user_message.text.clone(),
            assistant_text: context.assistant_text.clone(),
            thinking: context.thinking.clone(),
            activities: context.store.snapshot(),
            narratives: context.narratives.clone(),
            summary: context.last_summary.clone(),
            notes: context.notes.clone(),
            outcome,
        }
    }

    fn complete_action(
        context: &mut TurnContext,
        complete: ActionComplete,
        now_ms: i64,
        effects: &mut Vec<TurnEffect>,
    ) {
        let index = complete.action_index;
        let result = ActionResult::from_wire(complete.message, complete.data.as_ref());
        let reason = result
            .message
            .clone()
            .unwrap_or_else(|| "action failed".to_string());
        let was_settled = context
            .orchestrator
            .get(index)
            .is_some_and(|tracked| tracked.state.is_settled());

        let progress = match context
            .orchestrator
            .on_action_complete(index, complete.success, result)
        {
            Ok(progress) => progress,
            Err(error) => {
                tracing::warn!(%error, "ignoring action.complete");
                return;
            }
        };
        if context
            .local_inflight
            .is_some_and(|(_, inflight)| inflight == index)
        {
            context.local_inflight = None;
        }

        if !was_settled {
            if let Some(action) = context.orchestrator.get(index).map(|t| t.action.clone()) {
                let signature = FailureSignature::for_action(&action);
                if complete.success {
                    if let Some(activity) = context.healing.on_success(&signature, now_ms) {
                        context.record(activity);
                    }
                } else {
                    let command = match context.command_outcomes.get(&index) {
                        Some(CommandOutcome::Failed(failure)) => Some(failure.clone()),
                        _ => None,
                    };
                    let failure = FailureContext::from_action(&action, &reason, command.as_ref());
                    Self::heal(context, &failure, now_ms, effects);
                }
            }
        }
        Self::absorb_progress(context, progress, now_ms, effects);
    }

    fn absorb_command_update(
        context: &mut TurnContext,
        update: CommandUpdate,
        now_ms: i64,
        effects: &mut Vec<TurnEffect>,
    ) {
        if let Some(activity) = update.activity {
            context.record(activity);
        }
        let Some(outcome) = update.outcome else {
            return;
        };

        let owning_action = match &outcome {
            CommandOutcome::Succeeded { action_index, .. } => *action_index,
            CommandOutcome::Failed(failure) => failure.action_index,
        }
        .filter(|index| context.orchestrator.get(*index).is_some());

        match owning_action {
            // The action's own completion drives recovery; keep the details for its prompt.
            Some(index) => {
                context.command_outcomes.insert(index, outcome);
            }
            None => match outcome {
                CommandOutcome::Succeeded { command, .. } => {
                    let signature = FailureSignature::for_command(&command);
                    if let Some(activity) = context.healing.on_success(&signature, now_ms) {
                        context.record(activity);
                    }
                }
                CommandOutcome::Failed(failure) => {
                    Self::heal(context, &FailureContext::from_command(&failure), now_ms, effects);
                }
            },
        }
    }

    /// Completes an action whose command was re-issued after consent, using
    /// the command's own outcome when the backend reported no completion.
    fn settle_from_command(
        context: &mut TurnContext,
        index: usize,
        now_ms: i64,
        effects: &mut Vec<TurnEffect>,
    ) {
        let unsettled = context
            .orchestrator
            .get(index)
            .is_some_and(|tracked| !tracked.state.is_settled());
        if !unsettled {
            return;
        }
        let complete = match context.command_outcomes.get(&index) {
            Some(CommandOutcome::Succeeded { .. }) => ActionComplete {
                action: None,
                action_index: index,
                success: true,
                message: None,
                data: None,
            },
            Some(CommandOutcome::Failed(failure)) => ActionComplete {
                action: None,
                action_index: index,
                success: false,
                message: Some(command_failure_reason(failure)),
                data: None,
            },
            None => return,
        };
        Self::complete_action(context, complete, now_ms, effects);
    }

    fn side_dispatch_failed(
        context: &mut TurnContext,
        kind: DispatchKind,
        message: &str,
        now_ms: i64,
        effects: &mut Vec<TurnEffect>,
    ) {
        let index = match kind {
            DispatchKind::LocalAction { index } => Some(index),
            DispatchKind::Command { action_index } => action_index,
            DispatchKind::Chat | DispatchKind::Consent => None,
        };
        tracing::warn!(?kind, %message, "side dispatch failed");
        let Some(index) = index else {
            return;
        };
        if context
            .orchestrator
            .get(index)
            .is_some_and(|tracked| tracked.state.is_settled())
        {
            return;
        }
        Self::complete_action(
            context,
            ActionComplete {
                action: None,
                action_index: index,
                success: false,
                message: Some(message.to_string()),
                data: None,
            },
            now_ms,
            effects,
        );
    }

    fn heal(
        context: &mut TurnContext,
        failure: &FailureContext,
        now_ms: i64,
        effects: &mut Vec<TurnEffect>,
    ) {
        match context.healing.on_failure(failure, now_ms) {
            HealingDecision::Retry {
                attempt,
                max_attempts,
                prompt,
                activity,
                ..
            } => {
                context.record(activity);
                context.queue_retry(prompt, attempt, max_attempts);
            }
            HealingDecision::Exhausted {
                signature,
                note,
                activity,
                progress,
            } => {
                context.store.upsert_failed(progress);
                context.record(activity);
                context.notes.push(note.clone());
                context.exhausted_signature = Some(signature.to_string());
                effects.push(TurnEffect::Notice(Notice::RecoveryExhausted {
                    signature: signature.to_string(),
                    note,
                }));
            }
            HealingDecision::Suppressed { .. } => {}
        }
    }

    fn absorb_progress(
        context: &mut TurnContext,
        progress: ActionProgress,
        now_ms: i64,
        effects: &mut Vec<TurnEffect>,
    ) {
        for index in progress.skipped {
            let Some(tracked) = context.orchestrator.get(index) else {
                continue;
            };
            let activity = ActivityEvent::new(
                format!("action:{index}"),
                ActivityKind::Info,
                format!("Skipped {}", tracked.action.type_name()),
                tracked.action.target().to_string(),
                ActivityStatus::Done,
                now_ms,
            )
            .with_action_index(Some(index));
            context.record(activity);
        }
        if let Some(summary) = progress.summary {
            context.last_summary = Some(summary.clone());
            effects.push(TurnEffect::BatchCompleted(summary));
        }
    }
}

fn command_failure_reason(failure: &CommandFailure) -> String {
    match (&failure.message, failure.exit_code) {
        (Some(message), _) => message.clone(),
        (None, Some(code)) => format!("`{}` exited with code {code}", failure.command),
        (None, None) => format!("`{}` failed", failure.command),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn remote_config() -> SessionConfig {
        SessionConfig {
            execute_actions_locally: false,
            ..SessionConfig::default()
        }
    }

    fn begin(controller: &mut TurnController, text: &str) -> DispatchId {
        let effects = controller
            .begin_turn(UserMessage::new(text), 0)
            .expect("turn starts");
        match effects.as_slice() {
            [TurnEffect::Dispatch { dispatch_id, .. }] => *dispatch_id,
            other => panic!("unexpected effects: {other:?}"),
        }
    }

    fn feed(
        controller: &mut TurnController,
        dispatch_id: DispatchId,
        payloads: Vec<Value>,
    ) -> Vec<TurnEffect> {
        payloads
            .into_iter()
            .enumerate()
            .flat_map(|(offset, payload)| {
                controller.apply_raw(dispatch_id, payload, 10 + offset as i64)
            })
            .collect()
    }

    #[test]
    fn begin_turn_creates_thinking_placeholder_and_chat_dispatch() {
        let mut controller = TurnController::new(remote_config());
        let effects = controller
            .begin_turn(UserMessage::new("add a test"), 5)
            .expect("turn starts");

        assert_eq!(controller.phase(), TurnPhase::Sending);
        assert_matches!(
            effects.as_slice(),
            [TurnEffect::Dispatch { request: OutboundRequest::Chat(chat), .. }]
                if chat.message == "add a test" && chat.origin == RequestOrigin::User
        );
        let timeline = controller.timeline();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].kind, ActivityKind::Thinking);
        assert!(timeline[0].is_running());
    }

    #[test]
    fn second_turn_while_active_is_rejected() {
        let mut controller = TurnController::new(remote_config());
        begin(&mut controller, "first");
        assert_eq!(
            controller.begin_turn(UserMessage::new("second"), 1),
            Err(SessionError::TurnActive { turn_id: 1 })
        );
        assert_eq!(
            TurnController::new(remote_config()).begin_turn(UserMessage::new("  "), 0),
            Err(SessionError::EmptyMessage)
        );
    }

    #[test]
    fn done_finalizes_with_completed_outcome() {
        let mut controller = TurnController::new(remote_config());
        let dispatch = begin(&mut controller, "hello");

        let effects = feed(
            &mut controller,
            dispatch,
            vec![
                json!({ "type": "botMessage.start" }),
                json!({ "type": "botMessage.chunk", "text": "Hi " }),
                json!({ "type": "botMessage.chunk", "text": "there" }),
                json!({ "type": "file_read", "path": "README.md", "status": "running" }),
                json!({ "type": "done" }),
            ],
        );

        assert_eq!(controller.phase(), TurnPhase::Idle);
        let entry = effects
            .iter()
            .find_map(|effect| match effect {
                TurnEffect::TurnFinalized(entry) => Some(entry.clone()),
                _ => None,
            })
            .expect("turn finalized");
        assert_eq!(entry.assistant_text, "Hi there");
        assert_eq!(entry.outcome, TurnOutcome::Completed);
        assert!(entry.activities.iter().all(|activity| !activity.is_running()));
    }

    #[test]
    fn stale_dispatch_events_are_dropped() {
        let mut controller = TurnController::new(remote_config());
        let dispatch = begin(&mut controller, "hello");

        let effects = controller.apply_raw(
            dispatch + 100,
            json!({ "type": "file_read", "path": "x.rs" }),
            1,
        );
        assert!(effects.is_empty());
        assert_eq!(controller.timeline().len(), 1);
        assert_eq!(controller.phase(), TurnPhase::Sending);
    }

    #[test]
    fn malformed_payload_is_dropped_without_state_change() {
        let mut controller = TurnController::new(remote_config());
        let dispatch = begin(&mut controller, "hello");

        assert!(controller
            .apply_raw(dispatch, json!({ "type": "telemetry" }), 1)
            .is_empty());
        assert_eq!(controller.phase(), TurnPhase::Sending);
    }

    #[test]
    fn cancel_marks_running_activities_and_cancels_dispatch() {
        let mut controller = TurnController::new(remote_config());
        let dispatch = begin(&mut controller, "hello");
        feed(
            &mut controller,
            dispatch,
            vec![json!({ "type": "command.start", "commandId": "c1", "command": "sleep 10" })],
        );

        let effects = controller.cancel(50);
        assert_eq!(controller.phase(), TurnPhase::Idle);
        assert!(effects.contains(&TurnEffect::CancelDispatch {
            dispatch_id: dispatch
        }));
        let command = controller
            .timeline()
            .iter()
            .find(|activity| activity.id == "command:c1")
            .expect("command activity");
        assert_eq!(command.status, ActivityStatus::Error);
        assert_eq!(command.error.as_deref(), Some("Cancelled"));
        assert!(controller.cancel(60).is_empty());
    }

    #[test]
    fn transport_failure_fails_turn_with_notice() {
        let mut controller = TurnController::new(remote_config());
        let dispatch = begin(&mut controller, "hello");

        let effects = controller.dispatch_ended(
            dispatch,
            Err(BackendError::unauthorized("token expired")),
            5,
        );
        assert!(effects.contains(&TurnEffect::Notice(Notice::SignInRequired {
            message: "token expired".to_string()
        })));
        assert_matches!(
            effects.last(),
            Some(TurnEffect::TurnFinalized(TranscriptEntry {
                outcome: TurnOutcome::Failed { .. },
                ..
            }))
        );
    }

    #[test]
    fn chat_dispatch_without_terminal_event_fails() {
        let mut controller = TurnController::new(remote_config());
        let dispatch = begin(&mut controller, "hello");
        let effects = controller.dispatch_ended(dispatch, Ok(()), 5);

        assert!(effects.contains(&TurnEffect::Notice(Notice::Connectivity {
            message: NO_TERMINAL_EVENT.to_string()
        })));
        assert_eq!(controller.phase(), TurnPhase::Idle);
    }

    #[test]
    fn still_working_notice_fires_once_per_dispatch() {
        let mut controller = TurnController::new(SessionConfig {
            still_working_after_ms: 100,
            ..remote_config()
        });
        begin(&mut controller, "hello");

        assert!(controller.tick(50).is_empty());
        assert_eq!(
            controller.tick(150),
            vec![TurnEffect::Notice(Notice::StillWorking {
                turn_id: 1,
                elapsed_ms: 150
            })]
        );
        assert!(controller.tick(400).is_empty());
        assert_eq!(controller.phase(), TurnPhase::Sending);
    }

    #[test]
    fn consent_skip_fails_action_without_self_healing() {
        let mut controller = TurnController::new(remote_config());
        let dispatch = begin(&mut controller, "clean up");
        feed(
            &mut controller,
            dispatch,
            vec![
                json!({ "type": "botMessage.end", "actions": [
                    { "type": "runCommand", "command": "rm -rf build" }
                ]}),
                json!({ "type": "action.start", "actionIndex": 0 }),
                json!({
                    "type": "command.consent_required",
                    "consentId": "k1",
                    "command": "rm -rf build",
                    "dangerLevel": "high",
                    "actionIndex": 0
                }),
                json!({ "type": "done" }),
            ],
        );
        assert_eq!(controller.phase(), TurnPhase::Streaming);

        let effects = controller
            .resolve_consent("k1", ConsentDecision::Skip, 30)
            .expect("known consent");
        assert!(effects.iter().any(|effect| matches!(
            effect,
            TurnEffect::Dispatch {
                request: OutboundRequest::ResolveConsent { .. },
                ..
            }
        )));
        assert!(effects.iter().any(|effect| matches!(effect, TurnEffect::BatchCompleted(_))));
        assert!(!effects.iter().any(|effect| matches!(
            effect,
            TurnEffect::Dispatch {
                request: OutboundRequest::Chat(_),
                ..
            }
        )));
        assert_eq!(
            controller.resolve_consent("k1", ConsentDecision::Skip, 31),
            Err(SessionError::unknown_consent("k1"))
        );
    }
}
