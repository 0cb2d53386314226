use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::stream_msg::PatchOperation;
use crate::OrderedEntry;

static NEXT_REVISION: AtomicU64 = AtomicU64::new(1);

fn next_revision() -> u64 {
    NEXT_REVISION.fetch_add(1, AtomicOrdering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("unsupported patch path '{path}'")]
    UnsupportedPath { path: String },
    #[error("patch path '{path}' does not address collection '{expected}'")]
    WrongCollection { expected: String, path: String },
    #[error("remove is not allowed at collection root '{path}'")]
    RootRemove { path: String },
    #[error("collection root '{path}' must be an object or array, got {found}")]
    InvalidRoot { path: String, found: &'static str },
    #[error("invalid value at '{path}': {message}")]
    InvalidValue { path: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    ReplaceAll(Vec<(String, T)>),
    Upsert(String, T),
    Remove(String),
}

struct Slot<T> {
    seq: u64,
    revision: u64,
    value: Arc<T>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            seq: self.seq,
            revision: self.revision,
            value: Arc::clone(&self.value),
        }
    }
}

/// Local copy of one remote collection. Every write bumps `revision`.
pub struct Snapshot<T> {
    collection: String,
    entries: Arc<HashMap<String, Slot<T>>>,
    revision: u64,
    next_seq: u64,
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            entries: Arc::clone(&self.entries),
            revision: self.revision,
            next_seq: self.next_seq,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("collection", &self.collection)
            .field("revision", &self.revision)
            .field("len", &self.entries.len())
            .finish()
    }
}

impl<T: PartialEq> PartialEq for Snapshot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.collection == other.collection
            && self.entries.len() == other.entries.len()
            && self.entries.iter().all(|(key, slot)| {
                other
                    .entries
                    .get(key)
                    .map(|theirs| theirs.value == slot.value)
                    .unwrap_or(false)
            })
    }
}

impl<T> Snapshot<T> {
    pub fn empty(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            entries: Arc::new(HashMap::new()),
            revision: next_revision(),
            next_seq: 0,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Arc<T>> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    pub fn entry_revision(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|slot| slot.revision)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Entries in arrival order. A full replace establishes the initial order
    /// from each record's order hint; later additions append.
    pub fn ordered(&self) -> Vec<(&str, &Arc<T>)> {
        let mut rows: Vec<(&str, &Slot<T>)> = self
            .entries
            .iter()
            .map(|(key, slot)| (key.as_str(), slot))
            .collect();
        rows.sort_by_key(|(_, slot)| slot.seq);
        rows.into_iter().map(|(key, slot)| (key, &slot.value)).collect()
    }

    pub fn ordered_values(&self) -> Vec<Arc<T>> {
        self.ordered()
            .into_iter()
            .map(|(_, value)| Arc::clone(value))
            .collect()
    }
}

impl<T: OrderedEntry> Snapshot<T> {
    pub fn from_records(collection: impl Into<String>, records: Vec<(String, T)>) -> Self {
        let mut snapshot = Self::empty(collection);
        snapshot.apply_change(Change::ReplaceAll(records));
        snapshot
    }

    pub fn apply_change(&mut self, change: Change<T>) -> bool {
        match change {
            Change::ReplaceAll(mut records) => {
                records.sort_by(|(left_key, left), (right_key, right)| {
                    compare_for_display(left_key, left, right_key, right)
                });
                let revision = next_revision();
                let mut entries = HashMap::with_capacity(records.len());
                for (seq, (key, value)) in records.into_iter().enumerate() {
                    entries.insert(
                        key,
                        Slot {
                            seq: seq as u64,
                            revision,
                            value: Arc::new(value),
                        },
                    );
                }
                self.next_seq = entries.len() as u64;
                self.entries = Arc::new(entries);
                self.revision = revision;
                true
            }
            Change::Upsert(key, value) => {
                let revision = next_revision();
                let entries = Arc::make_mut(&mut self.entries);
                match entries.get_mut(&key) {
                    Some(slot) => {
                        slot.value = Arc::new(value);
                        slot.revision = revision;
                    }
                    None => {
                        entries.insert(
                            key,
                            Slot {
                                seq: self.next_seq,
                                revision,
                                value: Arc::new(value),
                            },
                        );
                        self.next_seq += 1;
                    }
                }
                self.revision = revision;
                true
            }
            Change::Remove(key) => {
                if !self.entries.contains_key(&key) {
                    return false;
                }
                Arc::make_mut(&mut self.entries).remove(&key);
                self.revision = next_revision();
                true
            }
        }
    }
}

fn compare_for_display<T: OrderedEntry>(
    left_key: &str,
    left: &T,
    right_key: &str,
    right: &T,
) -> Ordering {
    let by_hint = match (left.order_hint(), right.order_hint()) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => Ordering::Equal,
    };
    by_hint.then_with(|| compare_keys(left_key, right_key))
}

fn compare_keys(left: &str, right: &str) -> Ordering {
    match (left.parse::<u64>(), right.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => left.cmp(right),
    }
}

pub fn escape_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

pub fn unescape_segment(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

pub fn member_path(collection: &str, key: &str) -> String {
    format!("/{}/{}", escape_segment(collection), escape_segment(key))
}

enum Target {
    Root,
    Member(String),
}

fn parse_target(collection: &str, path: &str) -> Result<Target, PatchError> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(PatchError::UnsupportedPath {
            path: path.to_string(),
        });
    };
    let mut segments = rest.split('/');
    let head = segments.next().map(unescape_segment).unwrap_or_default();
    if head.is_empty() {
        return Err(PatchError::UnsupportedPath {
            path: path.to_string(),
        });
    }
    if head != collection {
        return Err(PatchError::WrongCollection {
            expected: collection.to_string(),
            path: path.to_string(),
        });
    }
    match (segments.next(), segments.next()) {
        (None, _) => Ok(Target::Root),
        (Some(id), None) if !id.is_empty() => Ok(Target::Member(unescape_segment(id))),
        _ => Err(PatchError::UnsupportedPath {
            path: path.to_string(),
        }),
    }
}

fn decode_value<T: DeserializeOwned>(path: &str, value: &Value) -> Result<T, PatchError> {
    T::deserialize(value).map_err(|err| PatchError::InvalidValue {
        path: path.to_string(),
        message: err.to_string(),
    })
}

fn decode_root<T: DeserializeOwned>(path: &str, value: &Value) -> Result<Vec<(String, T)>, PatchError> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(key, item)| {
                decode_value(&member_path_from(path, key), item).map(|decoded| (key.clone(), decoded))
            })
            .collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let key = index.to_string();
                decode_value(&member_path_from(path, &key), item).map(|decoded| (key, decoded))
            })
            .collect(),
        Value::Null => Ok(Vec::new()),
        other => Err(PatchError::InvalidRoot {
            path: path.to_string(),
            found: match other {
                Value::Bool(_) => "bool",
                Value::Number(_) => "number",
                _ => "string",
            },
        }),
    }
}

fn member_path_from(root: &str, key: &str) -> String {
    format!("{}/{}", root, escape_segment(key))
}

pub fn resolve_operation<T: DeserializeOwned>(
    collection: &str,
    op: &PatchOperation,
) -> Result<Change<T>, PatchError> {
    let target = parse_target(collection, op.path())?;
    match (op, target) {
        (PatchOperation::Add { path, value } | PatchOperation::Replace { path, value }, Target::Root) => {
            decode_root(path, value).map(Change::ReplaceAll)
        }
        (
            PatchOperation::Add { path, value } | PatchOperation::Replace { path, value },
            Target::Member(id),
        ) => decode_value(path, value).map(|decoded| Change::Upsert(id, decoded)),
        (PatchOperation::Remove { path }, Target::Root) => Err(PatchError::RootRemove {
            path: path.clone(),
        }),
        (PatchOperation::Remove { .. }, Target::Member(id)) => Ok(Change::Remove(id)),
    }
}

/// Invalid operations are logged and leave the snapshot untouched.
pub fn apply_operation<T>(mut snapshot: Snapshot<T>, op: &PatchOperation) -> Snapshot<T>
where
    T: DeserializeOwned + OrderedEntry,
{
    match resolve_operation::<T>(&snapshot.collection, op) {
        Ok(change) => {
            snapshot.apply_change(change);
            snapshot
        }
        Err(err) => {
            warn!("patch_apply_error: {err}");
            snapshot
        }
    }
}

pub fn try_apply_operation<T>(
    snapshot: &Snapshot<T>,
    op: &PatchOperation,
) -> Result<Snapshot<T>, PatchError>
where
    T: DeserializeOwned + OrderedEntry,
{
    let change = resolve_operation::<T>(&snapshot.collection, op)?;
    let mut next = snapshot.clone();
    next.apply_change(change);
    Ok(next)
}

/// Applies `ops` in order; a failing operation is skipped.
pub fn apply_batch<T>(snapshot: Snapshot<T>, ops: &[PatchOperation]) -> Snapshot<T>
where
    T: DeserializeOwned + OrderedEntry,
{
    ops.iter().fold(snapshot, |acc, op| apply_operation(acc, op))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Process {
        id: String,
        #[serde(default)]
        created: i64,
    }

    impl OrderedEntry for Process {
        fn order_hint(&self) -> Option<i64> {
            Some(self.created)
        }
    }

    fn seeded() -> Snapshot<Process> {
        apply_operation(
            Snapshot::empty("execution_processes"),
            &PatchOperation::replace(
                "/execution_processes",
                json!({
                    "b": {"id": "b", "created": 2},
                    "a": {"id": "a", "created": 1},
                    "c": {"id": "c", "created": 3}
                }),
            ),
        )
    }

    fn ids(snapshot: &Snapshot<Process>) -> Vec<String> {
        snapshot
            .ordered_values()
            .iter()
            .map(|process| process.id.clone())
            .collect()
    }

    #[test]
    fn remove_of_absent_key_is_identity() {
        let snapshot = seeded();
        let revision = snapshot.revision();
        let next = apply_operation(
            snapshot.clone(),
            &PatchOperation::remove("/execution_processes/zzz"),
        );
        assert_eq!(next, snapshot);
        assert_eq!(next.revision(), revision);
    }

    #[test]
    fn replace_overwrites_added_value() {
        let snapshot = apply_batch(
            seeded(),
            &[
                PatchOperation::add("/execution_processes/k", json!({"id": "k", "created": 9})),
                PatchOperation::replace(
                    "/execution_processes/k",
                    json!({"id": "k", "created": 10}),
                ),
            ],
        );
        assert_eq!(
            snapshot.get("k").map(|process| process.created),
            Some(10)
        );
        assert_eq!(snapshot.len(), 4);
    }

    #[test]
    fn full_replace_discards_prior_contents() {
        let target = Snapshot::from_records(
            "execution_processes",
            vec![("x".to_string(), Process { id: "x".to_string(), created: 5 })],
        );
        let next = apply_operation(
            seeded(),
            &PatchOperation::add("/execution_processes", json!({"x": {"id": "x", "created": 5}})),
        );
        assert_eq!(next, target);
        assert!(!next.contains_key("a"));
    }

    #[test]
    fn full_replace_orders_by_hint_then_appends_in_arrival_order() {
        let snapshot = seeded();
        assert_eq!(ids(&snapshot), vec!["a", "b", "c"]);

        let snapshot = apply_batch(
            snapshot,
            &[
                PatchOperation::add("/execution_processes/z", json!({"id": "z", "created": 0})),
                PatchOperation::add("/execution_processes/d", json!({"id": "d", "created": 0})),
                PatchOperation::replace("/execution_processes/a", json!({"id": "a", "created": 7})),
            ],
        );
        assert_eq!(ids(&snapshot), vec!["a", "b", "c", "z", "d"]);
    }

    #[test]
    fn numeric_keys_order_numerically() {
        let snapshot: Snapshot<Value> = apply_operation(
            Snapshot::empty("entries"),
            &PatchOperation::replace(
                "/entries",
                json!({"10": "ten", "2": "two", "1": "one"}),
            ),
        );
        let keys: Vec<&str> = snapshot.ordered().into_iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["1", "2", "10"]);
    }

    #[test]
    fn array_root_keys_by_index() {
        let snapshot: Snapshot<Value> = apply_operation(
            Snapshot::empty("entries"),
            &PatchOperation::replace("/entries", json!(["first", "second"])),
        );
        assert_eq!(snapshot.get("1").map(|value| (**value).clone()), Some(json!("second")));
    }

    #[test]
    fn never_mutates_a_shared_snapshot() {
        let original = seeded();
        let held = original.clone();
        let next = apply_operation(original, &PatchOperation::remove("/execution_processes/a"));
        assert!(held.contains_key("a"));
        assert!(!next.contains_key("a"));
        assert_ne!(held.revision(), next.revision());
    }

    #[test]
    fn bad_operations_leave_snapshot_intact() {
        let snapshot = seeded();
        let cases = [
            PatchOperation::add("/execution_processes/a/status", json!("running")),
            PatchOperation::add("/workspaces/a", json!({"id": "a"})),
            PatchOperation::remove("/execution_processes"),
            PatchOperation::add("/execution_processes/a", json!("not a process")),
            PatchOperation::replace("/execution_processes", json!(12)),
            PatchOperation::remove(""),
        ];
        for op in &cases {
            assert!(try_apply_operation(&snapshot, op).is_err(), "{op:?}");
            let next = apply_operation(snapshot.clone(), op);
            assert_eq!(next.revision(), snapshot.revision());
            assert_eq!(next, snapshot);
        }
    }

    #[test]
    fn escaped_member_ids_are_unescaped() {
        let snapshot: Snapshot<Value> = apply_operation(
            Snapshot::empty("tasks"),
            &PatchOperation::add(member_path("tasks", "a/b~c"), json!(1)),
        );
        assert!(snapshot.contains_key("a/b~c"));
        assert_eq!(member_path("tasks", "a/b~c"), "/tasks/a~1b~0c");
    }

    #[test]
    fn entry_revision_tracks_last_write() {
        let snapshot = seeded();
        let before = snapshot.entry_revision("b");
        let snapshot = apply_operation(
            snapshot,
            &PatchOperation::replace("/execution_processes/a", json!({"id": "a", "created": 1})),
        );
        assert_eq!(snapshot.entry_revision("b"), before);
        assert_eq!(snapshot.entry_revision("a"), Some(snapshot.revision()));
    }
}
