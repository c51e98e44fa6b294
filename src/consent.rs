//! Holds commands that wait for explicit user approval.

use agent_protocol::{CommandRequest, ConsentDecision, ConsentRequired, DangerLevel, OutboundRequest};

use crate::activity::{ActivityEvent, ActivityKind, ActivityStatus};
use crate::error::SessionError;

pub const USER_SKIP_REASON: &str = "skipped by user";

/// What the caller must do after a consent was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentResolution {
    pub consent: ConsentRequired,
    pub decision: ConsentDecision,
    /// Requests to send, in order.
    pub outbound: Vec<OutboundRequest>,
}

impl ConsentResolution {
    #[must_use]
    pub fn action_index(&self) -> Option<usize> {
        self.consent.action_index
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsentGate {
    pending: Vec<ConsentRequired>,
}

impl ConsentGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a consent request. Returns false for a redelivered id.
    pub fn request(&mut self, consent: ConsentRequired) -> bool {
        if self
            .pending
            .iter()
            .any(|pending| pending.consent_id == consent.consent_id)
        {
            return false;
        }
        if consent.danger_level >= DangerLevel::High {
            tracing::info!(
                consent_id = %consent.consent_id,
                danger = ?consent.danger_level,
                "high-risk command awaiting approval"
            );
        }
        self.pending.push(consent);
        true
    }

    pub fn resolve(
        &mut self,
        consent_id: &str,
        decision: ConsentDecision,
    ) -> Result<ConsentResolution, SessionError> {
        let position = self
            .pending
            .iter()
            .position(|pending| pending.consent_id == consent_id)
            .ok_or_else(|| SessionError::unknown_consent(consent_id))?;
        let consent = self.pending.remove(position);

        let mut outbound = vec![OutboundRequest::ResolveConsent {
            consent_id: consent.consent_id.clone(),
            decision,
        }];
        if decision == ConsentDecision::Allow {
            outbound.push(OutboundRequest::ExecuteCommand(CommandRequest {
                command: consent.command.clone(),
                cwd: consent.cwd.clone(),
                consent_id: Some(consent.consent_id.clone()),
                action_index: consent.action_index,
            }));
        }

        Ok(ConsentResolution {
            consent,
            decision,
            outbound,
        })
    }

    /// Drops every unresolved request, returning them for bookkeeping.
    pub fn discard_all(&mut self) -> Vec<ConsentRequired> {
        std::mem::take(&mut self.pending)
    }

    #[must_use]
    pub fn pending(&self) -> &[ConsentRequired] {
        &self.pending
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[must_use]
pub fn consent_activity_id(consent_id: &str) -> String {
    format!("consent:{consent_id}")
}

/// Timeline entry for a consent request in the given state.
#[must_use]
pub fn consent_activity(
    consent: &ConsentRequired,
    decision: Option<ConsentDecision>,
    now_ms: i64,
) -> ActivityEvent {
    let (label, status) = match decision {
        None => (
            format!("Approval required ({})", danger_label(consent.danger_level)),
            ActivityStatus::Running,
        ),
        Some(ConsentDecision::Allow) => ("Approved".to_string(), ActivityStatus::Done),
        Some(ConsentDecision::Skip) => ("Skipped".to_string(), ActivityStatus::Error),
    };
    let mut activity = ActivityEvent::new(
        consent_activity_id(&consent.consent_id),
        ActivityKind::Info,
        label,
        consent.command.clone(),
        status,
        now_ms,
    )
    .with_action_index(consent.action_index);
    if decision == Some(ConsentDecision::Skip) {
        activity.error = Some(USER_SKIP_REASON.to_string());
    }
    activity
}

fn danger_label(level: DangerLevel) -> &'static str {
    match level {
        DangerLevel::Low => "low risk",
        DangerLevel::Medium => "medium risk",
        DangerLevel::High => "high risk",
        DangerLevel::Critical => "critical risk",
    }
}
