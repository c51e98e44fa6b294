//! Ordered, deduplicated timeline of one turn.

use crate::activity::{ActivityEvent, ActivityStatus};

/// What an [`ActivityStore::upsert`] did with the incoming event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Id of the stored entry. Differs from the incoming id when the event
    /// was merged into an existing entry by dedup key.
    pub id: String,
    pub inserted: bool,
}

#[derive(Debug, Clone)]
pub struct ActivityStore {
    entries: Vec<ActivityEvent>,
    next_sequence: u64,
    max_activities: usize,
}

impl ActivityStore {
    #[must_use]
    pub fn new(max_activities: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_sequence: 1,
            max_activities: max_activities.max(1),
        }
    }

    /// Inserts or merges one activity.
    ///
    /// Redelivering the same event leaves the store unchanged apart from the
    /// timestamp. An event whose dedup key matches a finished entry under a
    /// different id is a new occurrence: it reopens that entry in place with
    /// the incoming status. At most one entry is Running after every call.
    pub fn upsert(&mut self, event: ActivityEvent) -> UpsertOutcome {
        let target = self.resolve_target(&event);

        let reopens = target.is_some_and(|index| {
            let entry = &self.entries[index];
            entry.status.is_terminal() && entry.id != event.id
        });
        let resulting_status = match target {
            Some(_) if reopens => event.status,
            Some(index) => self.entries[index].status.advance(event.status),
            None => event.status,
        };
        if resulting_status == ActivityStatus::Running {
            for (index, entry) in self.entries.iter_mut().enumerate() {
                if Some(index) != target && entry.is_running() {
                    entry.status = ActivityStatus::Done;
                }
            }
        }

        let outcome = match target {
            Some(index) => {
                let entry = &mut self.entries[index];
                if reopens {
                    tracing::trace!(id = %entry.id, incoming = %event.id, "reopening finished entry");
                    entry.output = None;
                    entry.exit_code = None;
                    entry.error = None;
                }
                merge_into(entry, event, resulting_status);
                UpsertOutcome {
                    id: entry.id.clone(),
                    inserted: false,
                }
            }
            None => {
                let mut event = event;
                event.sequence = self.next_sequence;
                self.next_sequence += 1;
                let id = event.id.clone();
                self.entries.push(event);
                UpsertOutcome { id, inserted: true }
            }
        };

        self.entries
            .sort_by_key(|entry| (entry.sequence, entry.timestamp_ms));
        self.evict_overflow();
        outcome
    }

    /// Upserts `event` and leaves the stored entry in Error, including when it
    /// had already been closed as Done by a later step.
    pub fn upsert_failed(&mut self, event: ActivityEvent) -> UpsertOutcome {
        let error = event.error.clone();
        let outcome = self.upsert(event);
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == outcome.id) {
            entry.status = ActivityStatus::Error;
            if error.is_some() {
                entry.error = error;
            }
        }
        outcome
    }

    /// Marks every Running entry Done. Returns how many changed.
    pub fn finish_running(&mut self) -> usize {
        let mut changed = 0;
        for entry in self.entries.iter_mut().filter(|entry| entry.is_running()) {
            entry.status = ActivityStatus::Done;
            changed += 1;
        }
        changed
    }

    /// Marks every Running entry Error with `reason`. Returns how many changed.
    pub fn fail_running(&mut self, reason: &str) -> usize {
        let mut changed = 0;
        for entry in self.entries.iter_mut().filter(|entry| entry.is_running()) {
            entry.status = ActivityStatus::Error;
            entry.error = Some(reason.to_string());
            changed += 1;
        }
        changed
    }

    #[must_use]
    pub fn entries(&self) -> &[ActivityEvent] {
        &self.entries
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ActivityEvent> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_running()).count()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<ActivityEvent> {
        self.entries.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_sequence = 1;
    }

    fn resolve_target(&self, event: &ActivityEvent) -> Option<usize> {
        let key = event.dedup_key();
        self.entries
            .iter()
            .position(|entry| entry.dedup_key() == key)
            .or_else(|| self.entries.iter().position(|entry| entry.id == event.id))
    }

    fn evict_overflow(&mut self) {
        if self.entries.len() <= self.max_activities {
            return;
        }
        let overflow = self.entries.len() - self.max_activities;
        tracing::debug!(overflow, "evicting oldest timeline entries");
        self.entries.drain(..overflow);
    }
}

fn merge_into(entry: &mut ActivityEvent, incoming: ActivityEvent, status: ActivityStatus) {
    if !incoming.label.is_empty() {
        entry.label = incoming.label;
    }
    if !incoming.detail.is_empty() {
        entry.detail = incoming.detail;
    }
    entry.timestamp_ms = incoming.timestamp_ms;
    entry.status = status;

    if incoming.file_path.is_some() {
        entry.file_path = incoming.file_path;
    }
    if incoming.additions.is_some() {
        entry.additions = incoming.additions;
    }
    if incoming.deletions.is_some() {
        entry.deletions = incoming.deletions;
    }
    if incoming.output.is_some() {
        entry.output = incoming.output;
    }
    if incoming.exit_code.is_some() {
        entry.exit_code = incoming.exit_code;
    }
    if incoming.error.is_some() {
        entry.error = incoming.error;
    }
    if incoming.action_index.is_some() {
        entry.action_index = incoming.action_index;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::activity::ActivityKind;

    fn read(id: &str, path: &str, status: ActivityStatus, ts: i64) -> ActivityEvent {
        ActivityEvent::new(id, ActivityKind::Read, "Reading", path, status, ts)
    }

    fn ids(store: &ActivityStore) -> Vec<&str> {
        store.entries().iter().map(|entry| entry.id.as_str()).collect()
    }

    #[test]
    fn redelivery_keeps_first_observation_order() {
        let mut store = ActivityStore::new(500);
        store.upsert(read("a", "a.rs", ActivityStatus::Running, 10));
        store.upsert(read("b", "b.rs", ActivityStatus::Done, 5));
        store.upsert(read("a", "a.rs", ActivityStatus::Done, 30));
        store.upsert(read("b", "b.rs", ActivityStatus::Done, 40));

        assert_eq!(ids(&store), vec!["a", "b"]);
        let sequences: Vec<u64> = store.entries().iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn identical_upsert_is_idempotent() {
        let mut store = ActivityStore::new(500);
        let event = read("a", "a.rs", ActivityStatus::Done, 10);
        let first = store.upsert(event.clone());
        let before = store.snapshot();
        let second = store.upsert(event);

        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn only_one_entry_runs_at_a_time() {
        let mut store = ActivityStore::new(500);
        store.upsert(read("a", "a.rs", ActivityStatus::Running, 1));
        store.upsert(read("b", "b.rs", ActivityStatus::Running, 2));
        store.upsert(read("c", "c.rs", ActivityStatus::Running, 3));

        assert_eq!(store.running_count(), 1);
        assert_eq!(store.get("a").map(|e| e.status), Some(ActivityStatus::Done));
        assert_eq!(store.get("c").map(|e| e.status), Some(ActivityStatus::Running));
    }

    #[test]
    fn running_entry_merges_by_dedup_key_across_ids() {
        let mut store = ActivityStore::new(500);
        store.upsert(read("first", "src/lib.rs", ActivityStatus::Running, 1));
        let mut done = read("second", "src/lib.rs", ActivityStatus::Done, 2);
        done.label = "Read".to_string();
        let outcome = store.upsert(done);

        assert_eq!(outcome.id, "first");
        assert_eq!(store.len(), 1);
        let entry = &store.entries()[0];
        assert_eq!(entry.label, "Read");
        assert_eq!(entry.status, ActivityStatus::Done);
    }

    #[test]
    fn finished_reports_with_new_ids_merge_into_one_entry() {
        let mut store = ActivityStore::new(500);
        store.upsert(read("r1", "src/a.rs", ActivityStatus::Done, 1));
        let outcome = store.upsert(read("r2", "src/a.rs", ActivityStatus::Done, 2));

        assert!(!outcome.inserted);
        assert_eq!(outcome.id, "r1");
        assert_eq!(ids(&store), vec!["r1"]);
        assert_eq!(store.entries()[0].timestamp_ms, 2);
    }

    #[test]
    fn new_occurrence_reopens_a_finished_entry_in_place() {
        let mut store = ActivityStore::new(500);
        let mut failed = read("first", "src/lib.rs", ActivityStatus::Error, 1);
        failed.error = Some("permission denied".to_string());
        store.upsert(failed);
        store.upsert(read("other", "src/main.rs", ActivityStatus::Done, 2));
        store.upsert(read("second", "src/lib.rs", ActivityStatus::Running, 3));

        assert_eq!(ids(&store), vec!["first", "other"]);
        let entry = store.get("first").expect("entry kept");
        assert_eq!(entry.status, ActivityStatus::Running);
        assert_eq!(entry.error, None);
        assert_eq!(entry.sequence, 1);
    }

    #[test]
    fn terminal_status_is_final_but_fields_update() {
        let mut store = ActivityStore::new(500);
        store.upsert(read("a", "a.rs", ActivityStatus::Error, 1));
        let mut late = read("a", "a.rs", ActivityStatus::Running, 9);
        late.label = "Reading again".to_string();
        store.upsert(late);

        let entry = store.get("a").expect("entry kept");
        assert_eq!(entry.status, ActivityStatus::Error);
        assert_eq!(entry.label, "Reading again");
        assert_eq!(entry.timestamp_ms, 9);
        assert_eq!(store.running_count(), 0);
    }

    #[test]
    fn upsert_failed_overrides_an_implicit_done() {
        let mut store = ActivityStore::new(500);
        store.upsert(read("a", "a.rs", ActivityStatus::Running, 1));
        store.upsert(read("b", "b.rs", ActivityStatus::Running, 2));
        assert_eq!(store.get("a").map(|e| e.status), Some(ActivityStatus::Done));

        let outcome = store.upsert_failed(
            read("a", "a.rs", ActivityStatus::Error, 3).with_error("gave up"),
        );

        assert!(!outcome.inserted);
        let entry = store.get("a").expect("entry kept");
        assert_eq!(entry.status, ActivityStatus::Error);
        assert_eq!(entry.error.as_deref(), Some("gave up"));
        assert_eq!(store.get("b").map(|e| e.status), Some(ActivityStatus::Running));
    }

    #[test]
    fn overflow_evicts_oldest_entries() {
        let mut store = ActivityStore::new(2);
        store.upsert(read("a", "a.rs", ActivityStatus::Done, 1));
        store.upsert(read("b", "b.rs", ActivityStatus::Done, 2));
        store.upsert(read("c", "c.rs", ActivityStatus::Done, 3));

        assert_eq!(ids(&store), vec!["b", "c"]);
    }

    #[test]
    fn fail_running_records_reason() {
        let mut store = ActivityStore::new(500);
        store.upsert(read("a", "a.rs", ActivityStatus::Done, 1));
        store.upsert(read("b", "b.rs", ActivityStatus::Running, 2));

        assert_eq!(store.fail_running("Cancelled"), 1);
        let entry = store.get("b").expect("entry");
        assert_eq!(entry.status, ActivityStatus::Error);
        assert_eq!(entry.error.as_deref(), Some("Cancelled"));
        assert_eq!(store.get("a").and_then(|e| e.error.clone()), None);
    }

    #[test]
    fn finish_running_completes_everything() {
        let mut store = ActivityStore::new(500);
        store.upsert(read("a", "a.rs", ActivityStatus::Running, 1));
        assert_eq!(store.finish_running(), 1);
        assert_eq!(store.running_count(), 0);
        store.clear();
        assert!(store.is_empty());
    }
}
