use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::snapshot::Snapshot;

#[derive(Debug, PartialEq)]
pub struct OverlayRow<T> {
    pub key: String,
    pub value: Arc<T>,
    pub provisional: bool,
}

struct Pending<T> {
    value: Arc<T>,
    base_revision: Option<u64>,
    seq: u64,
}

/// Local edits layered over an authoritative snapshot until the stream
/// confirms or overrides them.
pub struct OptimisticOverlay<T> {
    pending: HashMap<String, Pending<T>>,
    next_seq: u64,
}

impl<T> Default for OptimisticOverlay<T> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<T> OptimisticOverlay<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_provisional(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Records a provisional value for `key`, remembering which authoritative
    /// write it was based on.
    pub fn apply_local(&mut self, snapshot: &Snapshot<T>, key: impl Into<String>, value: T) {
        let key = key.into();
        let base_revision = snapshot.entry_revision(&key);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(
            key,
            Pending {
                value: Arc::new(value),
                base_revision,
                seq,
            },
        );
    }

    pub fn discard(&mut self, key: &str) -> bool {
        self.pending.remove(key).is_some()
    }

    /// Drops provisional values whose key has been written (or removed) by the
    /// stream since they were recorded. Returns how many were dropped.
    pub fn reconcile(&mut self, snapshot: &Snapshot<T>) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|key, pending| snapshot.entry_revision(key) == pending.base_revision);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!(dropped, "optimistic_reconciled");
        }
        dropped
    }

    /// Authoritative rows in snapshot order with provisional values swapped in;
    /// provisional rows for keys the snapshot lacks follow in local order.
    pub fn view(&self, snapshot: &Snapshot<T>) -> Vec<OverlayRow<T>> {
        let mut rows: Vec<OverlayRow<T>> = snapshot
            .ordered()
            .into_iter()
            .map(|(key, value)| match self.pending.get(key) {
                Some(pending) => OverlayRow {
                    key: key.to_string(),
                    value: Arc::clone(&pending.value),
                    provisional: true,
                },
                None => OverlayRow {
                    key: key.to_string(),
                    value: Arc::clone(value),
                    provisional: false,
                },
            })
            .collect();

        let mut extra: Vec<(&String, &Pending<T>)> = self
            .pending
            .iter()
            .filter(|(key, _)| !snapshot.contains_key(key))
            .collect();
        extra.sort_by_key(|(_, pending)| pending.seq);
        rows.extend(extra.into_iter().map(|(key, pending)| OverlayRow {
            key: key.clone(),
            value: Arc::clone(&pending.value),
            provisional: true,
        }));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::apply_operation;
    use crate::stream_msg::PatchOperation;
    use crate::{Task, TaskStatus};
    use serde_json::{json, Value};

    fn task_json(id: &str, status: &str) -> Value {
        json!({
            "id": id,
            "project_id": "p",
            "title": id,
            "status": status,
            "created_at": "2026-03-01T10:00:00Z",
            "updated_at": "2026-03-01T10:00:00Z"
        })
    }

    fn board() -> Snapshot<Task> {
        apply_operation(
            Snapshot::empty("tasks"),
            &PatchOperation::replace(
                "/tasks",
                json!({"t1": task_json("t1", "todo"), "t2": task_json("t2", "todo")}),
            ),
        )
    }

    fn with_status(snapshot: &Snapshot<Task>, key: &str, status: TaskStatus) -> Task {
        let mut task = snapshot.get(key).expect("task").as_ref().clone();
        task.status = status;
        task
    }

    #[test]
    fn provisional_value_shows_until_stream_writes_key() {
        let snapshot = board();
        let mut overlay = OptimisticOverlay::new();
        overlay.apply_local(&snapshot, "t1", with_status(&snapshot, "t1", TaskStatus::InProgress));

        let rows = overlay.view(&snapshot);
        assert_eq!(rows[0].value.status, TaskStatus::InProgress);
        assert!(rows[0].provisional);
        assert!(!rows[1].provisional);

        let unrelated = apply_operation(
            snapshot,
            &PatchOperation::replace("/tasks/t2", task_json("t2", "done")),
        );
        assert_eq!(overlay.reconcile(&unrelated), 0);
        assert!(overlay.is_provisional("t1"));

        let confirmed = apply_operation(
            unrelated,
            &PatchOperation::replace("/tasks/t1", task_json("t1", "inreview")),
        );
        assert_eq!(overlay.reconcile(&confirmed), 1);
        let rows = overlay.view(&confirmed);
        assert_eq!(rows[0].value.status, TaskStatus::InReview);
        assert!(overlay.is_empty());
    }

    #[test]
    fn provisional_new_rows_append_and_clear_on_arrival() {
        let snapshot = board();
        let mut overlay = OptimisticOverlay::new();
        let mut draft = with_status(&snapshot, "t1", TaskStatus::Todo);
        draft.id = "t3".to_string();
        overlay.apply_local(&snapshot, "t3", draft);

        let keys: Vec<String> = overlay.view(&snapshot).into_iter().map(|row| row.key).collect();
        assert_eq!(keys, vec!["t1", "t2", "t3"]);

        let arrived = apply_operation(
            snapshot,
            &PatchOperation::add("/tasks/t3", task_json("t3", "todo")),
        );
        assert_eq!(overlay.reconcile(&arrived), 1);
    }

    #[test]
    fn full_resync_discards_everything() {
        let snapshot = board();
        let mut overlay = OptimisticOverlay::new();
        overlay.apply_local(&snapshot, "t2", with_status(&snapshot, "t2", TaskStatus::Done));
        let resynced = apply_operation(
            snapshot,
            &PatchOperation::replace("/tasks", json!({"t2": task_json("t2", "todo")})),
        );
        assert_eq!(overlay.reconcile(&resynced), 1);
        assert!(!overlay.discard("t2"));
    }
}
