use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use agent_protocol::{
    BackendError, CancelSignal, ConsentDecision, ConsentRequired, DispatchId, OutboundRequest,
    ProposedAction, SessionBackend, TurnId,
};
use agent_session::{
    ActionSummary, ActivityEvent, Notice, SessionConfig, SessionError, TranscriptEntry,
    TranscriptSink, TurnContext, TurnController, TurnEffect, TurnPhase, UserMessage,
};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::executor::ActionExecutor;

const IDLE_POLL: Duration = Duration::from_millis(5);
const PANIC_MESSAGE: &str = "backend panicked";

/// Called from worker threads when the pending queue goes from empty to non-empty.
pub type EventWaker = Arc<dyn Fn() + Send + Sync>;

/// Source of wall-clock milliseconds handed to the turn controller.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

#[derive(Debug)]
enum DispatchEvent {
    Payload {
        dispatch_id: DispatchId,
        payload: Value,
    },
    Ended {
        dispatch_id: DispatchId,
        result: Result<(), BackendError>,
    },
}

struct ActiveDispatch {
    cancel: CancelSignal,
    join_handle: Option<JoinHandle<()>>,
}

struct SessionState {
    controller: TurnController,
    notices: Vec<Notice>,
    transcript: Vec<TranscriptEntry>,
}

/// Owns a [`TurnController`] and carries out its effects on worker threads.
///
/// Workers only enqueue events. The owner applies them in order by calling
/// [`RuntimeController::flush_pending_events`] (directly, from an
/// [`EventWaker`], or through [`RuntimeController::run_until_idle`]).
pub struct RuntimeController {
    session: Mutex<SessionState>,
    pending_events: Mutex<VecDeque<DispatchEvent>>,
    drain: Mutex<()>,
    active: Mutex<HashMap<DispatchId, ActiveDispatch>>,
    backend: Arc<dyn SessionBackend>,
    executor: Arc<dyn ActionExecutor>,
    sink: Arc<dyn TranscriptSink>,
    waker: Mutex<Option<EventWaker>>,
    clock: Clock,
    conversation_id: String,
}

impl RuntimeController {
    pub fn new(
        config: SessionConfig,
        backend: Arc<dyn SessionBackend>,
        executor: Arc<dyn ActionExecutor>,
        sink: Arc<dyn TranscriptSink>,
    ) -> Arc<Self> {
        Self::new_with_clock(config, backend, executor, sink, Arc::new(system_now_ms))
    }

    pub fn new_with_clock(
        config: SessionConfig,
        backend: Arc<dyn SessionBackend>,
        executor: Arc<dyn ActionExecutor>,
        sink: Arc<dyn TranscriptSink>,
        clock: Clock,
    ) -> Arc<Self> {
        let profile = backend.profile();
        tracing::info!(
            backend = %profile.backend_id,
            model = %profile.model_id,
            "session runtime ready"
        );
        Arc::new(Self {
            session: Mutex::new(SessionState {
                controller: TurnController::new(config),
                notices: Vec::new(),
                transcript: Vec::new(),
            }),
            pending_events: Mutex::new(VecDeque::new()),
            drain: Mutex::new(()),
            active: Mutex::new(HashMap::new()),
            backend,
            executor,
            sink,
            waker: Mutex::new(None),
            clock,
            conversation_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn set_waker(&self, waker: EventWaker) {
        *lock_unpoisoned(&self.waker) = Some(waker);
    }

    /// Conversation id attached to messages that do not carry their own.
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn submit(self: &Arc<Self>, mut message: UserMessage) -> Result<TurnId, SessionError> {
        if message.conversation_id.is_none() {
            message.conversation_id = Some(self.conversation_id.clone());
        }

        let mut session = self.lock_session();
        let effects = session.controller.begin_turn(message, self.now_ms())?;
        let turn_id = session
            .controller
            .context()
            .map_or(0, TurnContext::turn_id);
        self.apply_effects(&mut session, effects);
        Ok(turn_id)
    }

    /// Cancels the active turn. A no-op when idle.
    pub fn cancel(self: &Arc<Self>) {
        let mut session = self.lock_session();
        let effects = session.controller.cancel(self.now_ms());
        self.apply_effects(&mut session, effects);
    }

    pub fn resolve_consent(
        self: &Arc<Self>,
        consent_id: &str,
        decision: ConsentDecision,
    ) -> Result<(), SessionError> {
        let mut session = self.lock_session();
        let effects = session
            .controller
            .resolve_consent(consent_id, decision, self.now_ms())?;
        self.apply_effects(&mut session, effects);
        Ok(())
    }

    /// Applies every queued worker event, then lets the controller check its
    /// still-working deadline. Returns how many events were applied.
    pub fn flush_pending_events(self: &Arc<Self>) -> usize {
        // One drainer at a time keeps events in arrival order.
        let _drain = lock_unpoisoned(&self.drain);
        let mut drained = 0usize;

        loop {
            let event = {
                let mut pending_events = lock_unpoisoned(&self.pending_events);
                pending_events.pop_front()
            };
            let Some(event) = event else {
                break;
            };

            let mut session = self.lock_session();
            let now_ms = self.now_ms();
            let effects = match event {
                DispatchEvent::Payload {
                    dispatch_id,
                    payload,
                } => session.controller.apply_raw(dispatch_id, payload, now_ms),
                DispatchEvent::Ended {
                    dispatch_id,
                    result,
                } => {
                    self.reap(dispatch_id);
                    session.controller.dispatch_ended(dispatch_id, result, now_ms)
                }
            };
            self.apply_effects(&mut session, effects);
            drained += 1;
        }

        let mut session = self.lock_session();
        let effects = session.controller.tick(self.now_ms());
        self.apply_effects(&mut session, effects);
        drained
    }

    /// Flushes until the turn is idle and every worker has reported back, or
    /// `timeout` elapses. Returns whether idle was reached.
    pub fn run_until_idle(self: &Arc<Self>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.flush_pending_events();
            if self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(IDLE_POLL);
        }
    }

    /// Idle turn, empty queue and no live workers, including cancelled ones
    /// that have not returned yet.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.phase() == TurnPhase::Idle
            && lock_unpoisoned(&self.pending_events).is_empty()
            && lock_unpoisoned(&self.active).is_empty()
    }

    /// Cancels the active turn and joins every worker thread.
    pub fn shutdown(self: &Arc<Self>) {
        self.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut active = lock_unpoisoned(&self.active);
            active
                .values_mut()
                .filter_map(|dispatch| {
                    dispatch.cancel.store(true, Ordering::SeqCst);
                    dispatch.join_handle.take()
                })
                .collect()
        };
        for handle in handles {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.flush_pending_events();
    }

    #[must_use]
    pub fn phase(&self) -> TurnPhase {
        self.lock_session().controller.phase()
    }

    #[must_use]
    pub fn timeline(&self) -> Vec<ActivityEvent> {
        self.lock_session().controller.timeline().to_vec()
    }

    #[must_use]
    pub fn summary(&self) -> Option<ActionSummary> {
        self.lock_session().controller.summary().cloned()
    }

    #[must_use]
    pub fn assistant_text(&self) -> String {
        self.lock_session()
            .controller
            .context()
            .map(|context| context.assistant_text().to_string())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn pending_consents(&self) -> Vec<ConsentRequired> {
        let session = self.lock_session();
        if session.controller.phase() == TurnPhase::Idle {
            return Vec::new();
        }
        session
            .controller
            .context()
            .map(|context| context.gate().pending().to_vec())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn notices(&self) -> Vec<Notice> {
        self.lock_session().notices.clone()
    }

    pub fn take_notices(&self) -> Vec<Notice> {
        std::mem::take(&mut self.lock_session().notices)
    }

    /// Every turn finalized by this runtime, oldest first.
    #[must_use]
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.lock_session().transcript.clone()
    }

    fn apply_effects(self: &Arc<Self>, session: &mut SessionState, effects: Vec<TurnEffect>) {
        for effect in effects {
            match effect {
                TurnEffect::Dispatch {
                    dispatch_id,
                    request,
                } => self.spawn_dispatch(dispatch_id, request),
                TurnEffect::ExecuteAction {
                    dispatch_id,
                    index,
                    action,
                } => self.spawn_action(dispatch_id, index, action),
                TurnEffect::CancelDispatch { dispatch_id } => {
                    if let Some(dispatch) = lock_unpoisoned(&self.active).get(&dispatch_id) {
                        dispatch.cancel.store(true, Ordering::SeqCst);
                    }
                }
                TurnEffect::Notice(notice) => {
                    tracing::info!(?notice, "session notice");
                    session.notices.push(notice);
                }
                TurnEffect::BatchCompleted(summary) => {
                    tracing::info!(
                        total = summary.total,
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        skipped = summary.skipped,
                        "action batch completed"
                    );
                }
                TurnEffect::TurnFinalized(entry) => {
                    if let Err(error) = self.sink.persist(&entry) {
                        tracing::error!(turn_id = entry.turn_id, %error, "failed to persist turn");
                    }
                    session.transcript.push(entry);
                }
            }
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, dispatch_id: DispatchId, request: OutboundRequest) {
        let backend = Arc::clone(&self.backend);
        self.spawn_worker(dispatch_id, "dispatch", move |cancel, emit| {
            backend.dispatch(request, cancel, emit)
        });
    }

    fn spawn_action(self: &Arc<Self>, dispatch_id: DispatchId, index: usize, action: ProposedAction) {
        let executor = Arc::clone(&self.executor);
        self.spawn_worker(dispatch_id, "action", move |cancel, emit| {
            executor.execute(index, action, cancel, emit)
        });
    }

    fn spawn_worker<F>(self: &Arc<Self>, dispatch_id: DispatchId, role: &str, job: F)
    where
        F: FnOnce(CancelSignal, &mut dyn FnMut(Value)) -> Result<(), BackendError> + Send + 'static,
    {
        let cancel = CancelSignal::default();
        lock_unpoisoned(&self.active).insert(
            dispatch_id,
            ActiveDispatch {
                cancel: Arc::clone(&cancel),
                join_handle: None,
            },
        );

        let controller = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("agent-session-{role}-{dispatch_id}"))
            .spawn(move || controller.run_worker(dispatch_id, cancel, job));

        match spawned {
            Ok(handle) => {
                if let Some(dispatch) = lock_unpoisoned(&self.active).get_mut(&dispatch_id) {
                    dispatch.join_handle = Some(handle);
                }
            }
            // Still under the session lock here, so the waker must not run.
            Err(error) => {
                self.push_event(DispatchEvent::Ended {
                    dispatch_id,
                    result: Err(BackendError::transport(format!(
                        "failed to spawn worker: {error}"
                    ))),
                });
            }
        }
    }

    fn run_worker<F>(self: Arc<Self>, dispatch_id: DispatchId, cancel: CancelSignal, job: F)
    where
        F: FnOnce(CancelSignal, &mut dyn FnMut(Value)) -> Result<(), BackendError>,
    {
        let controller = Arc::clone(&self);
        let mut emit = move |payload: Value| {
            controller.enqueue(DispatchEvent::Payload {
                dispatch_id,
                payload,
            });
        };

        let result = match catch_unwind(AssertUnwindSafe(|| job(cancel, &mut emit))) {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(dispatch_id, "worker panicked");
                Err(BackendError::Protocol(PANIC_MESSAGE.to_string()))
            }
        };

        self.enqueue(DispatchEvent::Ended {
            dispatch_id,
            result,
        });
    }

    fn enqueue(&self, event: DispatchEvent) {
        if self.push_event(event) {
            let waker = lock_unpoisoned(&self.waker).clone();
            if let Some(waker) = waker {
                waker();
            }
        }
    }

    /// Queues `event`, returning whether the queue was empty before.
    fn push_event(&self, event: DispatchEvent) -> bool {
        let mut queue = lock_unpoisoned(&self.pending_events);
        let was_empty = queue.is_empty();
        queue.push_back(event);
        was_empty
    }

    fn reap(&self, dispatch_id: DispatchId) {
        let Some(mut completed) = lock_unpoisoned(&self.active).remove(&dispatch_id) else {
            return;
        };

        if let Some(join_handle) = completed.join_handle.take() {
            let is_current_thread = join_handle.thread().id() == thread::current().id();
            if !is_current_thread && join_handle.is_finished() {
                let _ = join_handle.join();
            }
        }
    }

    fn now_ms(&self) -> i64 {
        (self.clock)()
    }

    fn lock_session(&self) -> MutexGuard<'_, SessionState> {
        lock_unpoisoned(&self.session)
    }
}

fn system_now_ms() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000)
        .unwrap_or(i64::MAX)
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
