//! Per-collection change classification.
//!
//! Each differ keeps the last record observed for every entity id and turns
//! a new observation into zero or more [`Event`]s. The stored record is
//! replaced on every observation, so comparisons are always against the
//! immediately preceding state rather than the last state that fired.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::records::{ClientRecord, ProposalRecord};
use crate::types::{ChangeType, EntitySnapshot, Event, EventKind, SessionUser};

/// Last observed record per entity id.
pub struct SnapshotMap<R> {
    inner: Mutex<HashMap<String, R>>,
}

impl<R: Clone> SnapshotMap<R> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Store `current` and return what it replaced, in one critical section.
    pub fn swap(&self, id: &str, current: R) -> Option<R> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(id.to_string(), current)
    }

    pub fn forget(&self, id: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(id);
    }

    pub fn get(&self, id: &str) -> Option<R> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl<R: Clone> Default for SnapshotMap<R> {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Clients ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ClientDiffer {
    snapshots: SnapshotMap<ClientRecord>,
}

impl ClientDiffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, change: ChangeType, current: ClientRecord) -> Vec<Event> {
        let id = current.id.clone();
        if change == ChangeType::Removed {
            self.snapshots.forget(&id);
            return Vec::new();
        }

        let previous = self.snapshots.swap(&id, current.clone());

        if change == ChangeType::Added {
            return vec![Event::new(
                EventKind::ClientCreated,
                id,
                None,
                EntitySnapshot::Client(current),
            )];
        }

        // Nothing to compare against yet; this observation becomes the baseline.
        let Some(previous) = previous else {
            return Vec::new();
        };

        let mut events = Vec::with_capacity(2);
        let status_changed = current.status != previous.status;
        let previous = EntitySnapshot::Client(previous);
        let snapshot = EntitySnapshot::Client(current);
        if status_changed {
            events.push(Event::new(
                EventKind::ClientStatusChanged,
                id.clone(),
                Some(previous.clone()),
                snapshot.clone(),
            ));
        }
        events.push(Event::new(
            EventKind::ClientUpdated,
            id,
            Some(previous),
            snapshot,
        ));
        events
    }

    pub fn forget(&self, id: &str) {
        self.snapshots.forget(id);
    }

    pub fn snapshot(&self, id: &str) -> Option<ClientRecord> {
        self.snapshots.get(id)
    }

    pub fn tracked(&self) -> usize {
        self.snapshots.len()
    }

    pub fn reset(&self) {
        self.snapshots.reset();
    }
}

// ─── Proposals ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ProposalDiffer {
    snapshots: SnapshotMap<ProposalRecord>,
}

impl ProposalDiffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `actor` is the session user, stamped on pipeline stage changes.
    pub fn observe(
        &self,
        change: ChangeType,
        current: ProposalRecord,
        actor: Option<&SessionUser>,
    ) -> Vec<Event> {
        let id = current.id.clone();
        if change == ChangeType::Removed {
            self.snapshots.forget(&id);
            return Vec::new();
        }

        let previous = self.snapshots.swap(&id, current.clone());

        if change == ChangeType::Added {
            return vec![Event::new(
                EventKind::ProposalCreated,
                id,
                None,
                EntitySnapshot::Proposal(current),
            )];
        }

        let Some(previous) = previous else {
            return Vec::new();
        };

        let status_changed = current.status != previous.status;
        // A new note only counts while the proposal awaits correction.
        let pendency_changed = current.has_pendencies_status()
            && current.latest_pendency() != previous.latest_pendency();
        let pipeline_changed = current.pipeline_status != previous.pipeline_status;
        let updated = !status_changed && current.significant() != previous.significant();

        let prev_snapshot = EntitySnapshot::Proposal(previous);
        let snapshot = EntitySnapshot::Proposal(current);
        let mut events = Vec::new();

        // Pendency-only changes are reported as status changes on purpose;
        // consumers rely on the status-changed payload for new notes.
        if status_changed || pendency_changed {
            events.push(Event::new(
                EventKind::ProposalStatusChanged,
                id.clone(),
                Some(prev_snapshot.clone()),
                snapshot.clone(),
            ));
        }

        if pipeline_changed {
            let mut event = Event::new(
                EventKind::PipelineStatusChanged,
                id.clone(),
                Some(prev_snapshot.clone()),
                snapshot.clone(),
            );
            if let Some(actor) = actor {
                event = event.with_actor(actor.clone());
            }
            events.push(event);
        }

        if updated {
            events.push(Event::new(
                EventKind::ProposalUpdated,
                id,
                Some(prev_snapshot),
                snapshot,
            ));
        }

        events
    }

    pub fn forget(&self, id: &str) {
        self.snapshots.forget(id);
    }

    pub fn snapshot(&self, id: &str) -> Option<ProposalRecord> {
        self.snapshots.get(id)
    }

    pub fn tracked(&self) -> usize {
        self.snapshots.len()
    }

    pub fn reset(&self) {
        self.snapshots.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use serde_json::json;

    fn kinds(events: &[Event]) -> Vec<EventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    fn client(status: &str) -> ClientRecord {
        ClientRecord {
            id: "c1".into(),
            name: Some("Ana".into()),
            status: Some(status.into()),
            ..Default::default()
        }
    }

    fn proposal(status: &str, pipeline: &str) -> ProposalRecord {
        ProposalRecord {
            id: "p1".into(),
            client_id: Some("c1".into()),
            status: Some(status.into()),
            pipeline_status: Some(pipeline.into()),
            ..Default::default()
        }
    }

    fn actor() -> SessionUser {
        SessionUser {
            id: "u-admin".into(),
            name: "Bruna".into(),
            role: Role::Admin,
            email: None,
        }
    }

    #[test]
    fn unit_client_added_emits_created_only() {
        let differ = ClientDiffer::new();
        let events = differ.observe(ChangeType::Added, client("pending"));
        assert_eq!(kinds(&events), vec![EventKind::ClientCreated]);
        assert!(events[0].previous.is_none());
    }

    #[test]
    fn unit_client_status_change_emits_status_and_update() {
        let differ = ClientDiffer::new();
        differ.observe(ChangeType::Added, client("pending"));
        let events = differ.observe(ChangeType::Modified, client("approved"));
        assert_eq!(
            kinds(&events),
            vec![EventKind::ClientStatusChanged, EventKind::ClientUpdated]
        );
        let prev = events[0].previous.as_ref().unwrap();
        assert_eq!(prev.status(), Some("pending"));
        assert_eq!(events[0].current.status(), Some("approved"));
    }

    #[test]
    fn unit_client_same_snapshot_twice_has_no_status_change() {
        let differ = ClientDiffer::new();
        differ.observe(ChangeType::Added, client("pending"));
        differ.observe(ChangeType::Modified, client("approved"));
        let events = differ.observe(ChangeType::Modified, client("approved"));
        assert_eq!(kinds(&events), vec![EventKind::ClientUpdated]);
    }

    #[test]
    fn unit_client_modified_without_baseline_only_seeds() {
        let differ = ClientDiffer::new();
        assert!(differ.observe(ChangeType::Modified, client("approved")).is_empty());
        assert_eq!(differ.tracked(), 1);
    }

    #[test]
    fn unit_removed_forgets_snapshot() {
        let differ = ClientDiffer::new();
        differ.observe(ChangeType::Added, client("pending"));
        assert!(differ.observe(ChangeType::Removed, client("pending")).is_empty());
        assert_eq!(differ.tracked(), 0);
    }

    #[test]
    fn unit_proposal_added_emits_created() {
        let differ = ProposalDiffer::new();
        let events = differ.observe(ChangeType::Added, proposal("pending", "submitted"), None);
        assert_eq!(kinds(&events), vec![EventKind::ProposalCreated]);
    }

    #[test]
    fn unit_proposal_same_snapshot_twice_is_silent() {
        let differ = ProposalDiffer::new();
        differ.observe(ChangeType::Added, proposal("pending", "submitted"), None);
        let first = differ.observe(ChangeType::Modified, proposal("approved", "credit"), None);
        assert!(!first.is_empty());
        let second = differ.observe(ChangeType::Modified, proposal("approved", "credit"), None);
        assert!(second.is_empty());
    }

    #[test]
    fn unit_proposal_status_change_suppresses_generic_update() {
        let differ = ProposalDiffer::new();
        differ.observe(ChangeType::Added, proposal("pending", "submitted"), None);
        let mut next = proposal("approved", "submitted");
        next.bank = Some("Banco X".into());
        let events = differ.observe(ChangeType::Modified, next, None);
        assert_eq!(kinds(&events), vec![EventKind::ProposalStatusChanged]);
    }

    #[test]
    fn unit_pendency_note_with_unchanged_status_is_a_status_change() {
        let differ = ProposalDiffer::new();
        let mut first = proposal("with_pendencies", "credit");
        first.pendency_text = Some("missing payslip".into());
        first.pendency_created_at = Some(json!("2024-03-01T10:00:00Z"));
        first.pendency_created_by = Some("analyst-1".into());
        differ.observe(ChangeType::Added, first, None);

        let mut second = proposal("with_pendencies", "credit");
        second.pendency_text = Some("missing proof of address".into());
        second.pendency_created_at = Some(json!("2024-03-02T09:00:00Z"));
        second.pendency_created_by = Some("analyst-2".into());
        let events = differ.observe(ChangeType::Modified, second, None);

        assert_eq!(kinds(&events), vec![EventKind::ProposalStatusChanged]);
        let prev = events[0].previous.as_ref().unwrap();
        assert_eq!(prev.status(), Some("with_pendencies"));
    }

    #[test]
    fn unit_pendency_churn_outside_pendency_status_is_ignored() {
        let differ = ProposalDiffer::new();
        differ.observe(ChangeType::Added, proposal("in_analysis", "credit"), None);

        let mut next = proposal("in_analysis", "credit");
        next.observations = Some("client called back".into());
        next.updated_at = Some(json!("2024-03-05T12:00:00Z"));
        next.pendency_text = Some("old note".into());
        next.pendency_created_by = Some("analyst-1".into());
        next.pendencies.push(json!({ "text": "old note" }));
        next.observations_timeline.push(json!({ "text": "client called back" }));

        assert!(differ.observe(ChangeType::Modified, next, None).is_empty());
    }

    #[test]
    fn unit_significant_field_change_emits_update() {
        let differ = ProposalDiffer::new();
        differ.observe(ChangeType::Added, proposal("in_analysis", "credit"), None);
        let mut next = proposal("in_analysis", "credit");
        next.amount = Some(json!(250000));
        let events = differ.observe(ChangeType::Modified, next, None);
        assert_eq!(kinds(&events), vec![EventKind::ProposalUpdated]);
    }

    #[test]
    fn unit_pipeline_change_carries_actor_alongside_status_change() {
        let differ = ProposalDiffer::new();
        differ.observe(ChangeType::Added, proposal("in_analysis", "credit"), None);
        let events = differ.observe(
            ChangeType::Modified,
            proposal("approved", "legal"),
            Some(&actor()),
        );
        assert_eq!(
            kinds(&events),
            vec![
                EventKind::ProposalStatusChanged,
                EventKind::PipelineStatusChanged
            ]
        );
        let pipeline = &events[1];
        assert_eq!(pipeline.actor.as_ref().unwrap().name, "Bruna");
        let prev = pipeline.previous.as_ref().unwrap().as_proposal().unwrap();
        assert_eq!(prev.pipeline_status.as_deref(), Some("credit"));
    }

    #[test]
    fn unit_pipeline_only_change_also_counts_as_update() {
        let differ = ProposalDiffer::new();
        differ.observe(ChangeType::Added, proposal("in_analysis", "credit"), None);
        let events = differ.observe(ChangeType::Modified, proposal("in_analysis", "legal"), None);
        assert_eq!(
            kinds(&events),
            vec![EventKind::PipelineStatusChanged, EventKind::ProposalUpdated]
        );
    }

    #[test]
    fn regression_snapshot_replaced_even_when_nothing_fires() {
        let differ = ProposalDiffer::new();
        differ.observe(ChangeType::Added, proposal("in_analysis", "credit"), None);
        let mut quiet = proposal("in_analysis", "credit");
        quiet.observations = Some("note".into());
        assert!(differ.observe(ChangeType::Modified, quiet, None).is_empty());
        let stored = differ.snapshot("p1").unwrap();
        assert_eq!(stored.observations.as_deref(), Some("note"));
    }
}
