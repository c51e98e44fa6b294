//! Tracks one batch of agent-proposed actions from proposal to completion.

use std::collections::BTreeSet;
use std::fmt;

use agent_protocol::{ActionKind, ProposedAction};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SessionError;

pub const DEPENDENCY_SKIP_REASON: &str = "previous action did not succeed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ActionState {
    Pending,
    Running,
    Succeeded,
    Failed { reason: String },
    Skipped { reason: String },
    /// The turn ended before this action reached a terminal state.
    Abandoned,
}

impl ActionState {
    /// Terminal for batch completion purposes. Abandoned is not.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed { .. } | Self::Skipped { .. }
        )
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.is_complete() || matches!(self, Self::Abandoned)
    }
}

/// Outcome details reported with `action.complete`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletions: Option<u32>,
}

impl ActionResult {
    /// Builds a result from the free-form `data` object of `action.complete`.
    #[must_use]
    pub fn from_wire(message: Option<String>, data: Option<&Value>) -> Self {
        let field = |key: &str| data.and_then(|data| data.get(key));
        Self {
            message,
            file_path: field("filePath")
                .and_then(Value::as_str)
                .map(str::to_string),
            additions: field("additions")
                .and_then(Value::as_u64)
                .and_then(|value| u32::try_from(value).ok()),
            deletions: field("deletions")
                .and_then(Value::as_u64)
                .and_then(|value| u32::try_from(value).ok()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedAction {
    pub action: ProposedAction,
    pub state: ActionState,
    pub result: Option<ActionResult>,
    pub activity_ids: Vec<String>,
    pub narratives: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub files_touched: Vec<String>,
    pub lines_added: u32,
    pub lines_removed: u32,
    pub commands_run: usize,
}

/// What changed as a consequence of one orchestrator call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionProgress {
    /// Actions skipped without execution because a dependency failed.
    pub skipped: Vec<usize>,
    /// Present exactly once per batch, on the call that completed it.
    pub summary: Option<ActionSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionStartOutcome {
    Started,
    Skipped(ActionProgress),
    /// The action already reached a terminal state; the start is ignored.
    AlreadySettled,
}

pub type CompletionCallback = Box<dyn FnMut(&ActionSummary) + Send>;

#[derive(Default)]
pub struct ActionOrchestrator {
    actions: Vec<TrackedAction>,
    remaining: usize,
    summary: Option<ActionSummary>,
    on_complete: Option<CompletionCallback>,
}

impl fmt::Debug for ActionOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionOrchestrator")
            .field("actions", &self.actions)
            .field("remaining", &self.remaining)
            .field("summary", &self.summary)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

impl ActionOrchestrator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current batch. A registered completion callback is kept.
    pub fn start(&mut self, actions: Vec<ProposedAction>) {
        self.remaining = actions.len();
        self.summary = None;
        self.actions = actions
            .into_iter()
            .map(|action| TrackedAction {
                action,
                state: ActionState::Pending,
                result: None,
                activity_ids: Vec::new(),
                narratives: Vec::new(),
            })
            .collect();
    }

    pub fn on_all_complete(&mut self, callback: CompletionCallback) {
        self.on_complete = Some(callback);
    }

    pub fn on_action_start(&mut self, index: usize) -> Result<ActionStartOutcome, SessionError> {
        self.check_index(index)?;
        if self.actions[index].state.is_settled() {
            return Ok(ActionStartOutcome::AlreadySettled);
        }

        let blocked = self.actions[index].action.requires_previous_success
            && index > 0
            && matches!(
                self.actions[index - 1].state,
                ActionState::Failed { .. } | ActionState::Skipped { .. }
            );
        if blocked {
            let mut progress = ActionProgress::default();
            self.settle(
                index,
                ActionState::Skipped {
                    reason: DEPENDENCY_SKIP_REASON.to_string(),
                },
                &mut progress,
            );
            progress.skipped.insert(0, index);
            return Ok(ActionStartOutcome::Skipped(progress));
        }

        self.actions[index].state = ActionState::Running;
        Ok(ActionStartOutcome::Started)
    }

    pub fn on_action_complete(
        &mut self,
        index: usize,
        success: bool,
        result: ActionResult,
    ) -> Result<ActionProgress, SessionError> {
        self.check_index(index)?;
        let mut progress = ActionProgress::default();
        if self.actions[index].state.is_settled() {
            tracing::debug!(index, "ignoring completion for settled action");
            return Ok(progress);
        }

        let state = if success {
            ActionState::Succeeded
        } else {
            ActionState::Failed {
                reason: result
                    .message
                    .clone()
                    .unwrap_or_else(|| "action failed".to_string()),
            }
        };
        self.actions[index].result = Some(result);
        self.settle(index, state, &mut progress);
        Ok(progress)
    }

    /// Fails an action for a reason decided on this side (e.g. a declined consent).
    pub fn fail(&mut self, index: usize, reason: &str) -> Result<ActionProgress, SessionError> {
        self.on_action_complete(
            index,
            false,
            ActionResult {
                message: Some(reason.to_string()),
                ..ActionResult::default()
            },
        )
    }

    pub fn record_activity(&mut self, index: usize, activity_id: &str) {
        if let Some(tracked) = self.actions.get_mut(index) {
            if !tracked.activity_ids.iter().any(|id| id == activity_id) {
                tracked.activity_ids.push(activity_id.to_string());
            }
        }
    }

    pub fn record_narrative(&mut self, index: usize, text: &str) {
        if let Some(tracked) = self.actions.get_mut(index) {
            tracked.narratives.push(text.to_string());
        }
    }

    /// The next action to execute locally: the first pending one, and only
    /// while nothing else is running.
    #[must_use]
    pub fn next_runnable(&self) -> Option<(usize, &ProposedAction)> {
        if self.current().is_some() {
            return None;
        }
        self.actions
            .iter()
            .enumerate()
            .find(|(_, tracked)| tracked.state == ActionState::Pending)
            .map(|(index, tracked)| (index, &tracked.action))
    }

    #[must_use]
    pub fn current(&self) -> Option<usize> {
        self.actions
            .iter()
            .position(|tracked| tracked.state == ActionState::Running)
    }

    /// Marks every unsettled action Abandoned. No summary is produced.
    pub fn abandon(&mut self) -> Vec<usize> {
        let mut abandoned = Vec::new();
        for (index, tracked) in self.actions.iter_mut().enumerate() {
            if !tracked.state.is_settled() {
                tracked.state = ActionState::Abandoned;
                abandoned.push(index);
            }
        }
        abandoned
    }

    #[must_use]
    pub fn is_batch_complete(&self) -> bool {
        self.actions.iter().all(|tracked| tracked.state.is_complete())
    }

    #[must_use]
    pub fn has_batch(&self) -> bool {
        !self.actions.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&TrackedAction> {
        self.actions.get(index)
    }

    #[must_use]
    pub fn actions(&self) -> &[TrackedAction] {
        &self.actions
    }

    #[must_use]
    pub fn summary(&self) -> Option<&ActionSummary> {
        self.summary.as_ref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    fn check_index(&self, index: usize) -> Result<(), SessionError> {
        if index < self.actions.len() {
            Ok(())
        } else {
            Err(SessionError::UnknownActionIndex {
                index,
                len: self.actions.len(),
            })
        }
    }

    fn settle(&mut self, index: usize, state: ActionState, progress: &mut ActionProgress) {
        let failed = !matches!(state, ActionState::Succeeded);
        self.actions[index].state = state;
        self.remaining = self.remaining.saturating_sub(1);

        if failed {
            let mut next = index + 1;
            while let Some(tracked) = self.actions.get_mut(next) {
                if !tracked.action.requires_previous_success
                    || tracked.state != ActionState::Pending
                {
                    break;
                }
                tracked.state = ActionState::Skipped {
                    reason: DEPENDENCY_SKIP_REASON.to_string(),
                };
                self.remaining = self.remaining.saturating_sub(1);
                progress.skipped.push(next);
                next += 1;
            }
        }

        if self.remaining == 0 && self.summary.is_none() && self.is_batch_complete() {
            let summary = self.build_summary();
            if let Some(callback) = self.on_complete.as_mut() {
                callback(&summary);
            }
            self.summary = Some(summary.clone());
            progress.summary = Some(summary);
        }
    }

    fn build_summary(&self) -> ActionSummary {
        let mut summary = ActionSummary {
            total: self.actions.len(),
            ..ActionSummary::default()
        };
        let mut files = BTreeSet::new();

        for tracked in &self.actions {
            match tracked.state {
                ActionState::Succeeded => summary.succeeded += 1,
                ActionState::Failed { .. } => summary.failed += 1,
                ActionState::Skipped { .. } => summary.skipped += 1,
                _ => {}
            }
            let executed = matches!(
                tracked.state,
                ActionState::Succeeded | ActionState::Failed { .. }
            );
            if let Some(result) = &tracked.result {
                summary.lines_added += result.additions.unwrap_or(0);
                summary.lines_removed += result.deletions.unwrap_or(0);
            }
            match &tracked.action.kind {
                ActionKind::RunCommand { .. } if executed => summary.commands_run += 1,
                ActionKind::EditFile { file_path, .. } | ActionKind::CreateFile { file_path, .. }
                    if tracked.state == ActionState::Succeeded =>
                {
                    let path = tracked
                        .result
                        .as_ref()
                        .and_then(|result| result.file_path.clone())
                        .unwrap_or_else(|| file_path.clone());
                    files.insert(path);
                }
                _ => {}
            }
        }

        summary.files_touched = files.into_iter().collect();
        summary
    }
}
