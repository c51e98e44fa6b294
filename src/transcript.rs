//! Finalized record of one turn, handed to whatever persists chat history.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use agent_protocol::TurnId;
use serde::{Deserialize, Serialize};

use crate::actions::ActionSummary;
use crate::activity::ActivityEvent;
use crate::error::SinkError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TurnOutcome {
    Completed,
    Failed { reason: String },
    Cancelled,
    RecoveryExhausted { signature: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub turn_id: TurnId,
    pub user_message: String,
    pub assistant_text: String,
    pub thinking: String,
    pub activities: Vec<ActivityEvent>,
    pub narratives: BTreeMap<usize, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ActionSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    pub outcome: TurnOutcome,
}

/// Destination for finalized turns.
pub trait TranscriptSink: Send + Sync {
    fn persist(&self, entry: &TranscriptEntry) -> Result<(), SinkError>;
}

/// In-memory sink used by tests and the headless CLI.
#[derive(Debug, Clone, Default)]
pub struct MemoryTranscript {
    entries: Arc<Mutex<Vec<TranscriptEntry>>>,
}

impl MemoryTranscript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<TranscriptEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TranscriptSink for MemoryTranscript {
    fn persist(&self, entry: &TranscriptEntry) -> Result<(), SinkError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| SinkError::unavailable("transcript lock poisoned"))?;
        entries.push(entry.clone());
        Ok(())
    }
}
