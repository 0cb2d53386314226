use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use tb_core::{parse_bool_flag, Task, TaskStatus};
use url::form_urlencoded;

use crate::debounce::{Debounced, DEFAULT_DEBOUNCE};

const QUERY_SEARCH: &str = "q";
const QUERY_GROUP: &str = "group";
const QUERY_STATUS: &str = "status";
const QUERY_HIDE_BLOCKED: &str = "hide_blocked";

/// Board filters, mirrored into the page query string.
#[derive(Debug, Clone)]
pub struct TaskFilters {
    search: Debounced<String>,
    group: Option<String>,
    statuses: BTreeSet<TaskStatus>,
    hide_blocked: bool,
}

impl Default for TaskFilters {
    fn default() -> Self {
        Self::with_debounce(DEFAULT_DEBOUNCE)
    }
}

impl TaskFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debounce(delay: Duration) -> Self {
        Self {
            search: Debounced::new(String::new(), delay),
            group: None,
            statuses: BTreeSet::new(),
            hide_blocked: false,
        }
    }

    /// Applied search text. Edits still inside the debounce window are not
    /// visible here.
    pub fn search(&self) -> &str {
        self.search.applied()
    }

    pub fn pending_search(&self) -> Option<&str> {
        self.search.pending().map(String::as_str)
    }

    pub fn search_deadline(&self) -> Option<Instant> {
        self.search.deadline()
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn statuses(&self) -> &BTreeSet<TaskStatus> {
        &self.statuses
    }

    pub fn hide_blocked(&self) -> bool {
        self.hide_blocked
    }

    pub fn set_search(&mut self, text: impl Into<String>, now: Instant) {
        self.search.set(text.into(), now);
    }

    /// Returns true when a debounced search edit was applied.
    pub fn poll(&mut self, now: Instant) -> bool {
        self.search.poll(now)
    }

    pub fn set_group(&mut self, group: Option<String>) {
        self.group = group.filter(|value| !value.trim().is_empty());
    }

    /// Returns whether `status` is active afterwards.
    pub fn toggle_status(&mut self, status: TaskStatus) -> bool {
        if self.statuses.remove(&status) {
            false
        } else {
            self.statuses.insert(status);
            true
        }
    }

    pub fn set_hide_blocked(&mut self, hide: bool) {
        self.hide_blocked = hide;
    }

    pub fn clear_filters(&mut self) {
        self.search.reset(String::new());
        self.group = None;
        self.statuses.clear();
        self.hide_blocked = false;
    }

    pub fn has_active_filters(&self) -> bool {
        !self.search().trim().is_empty()
            || self.group.is_some()
            || !self.statuses.is_empty()
            || self.hide_blocked
    }

    pub fn matches(&self, task: &Task) -> bool {
        if self.hide_blocked && task.is_blocked {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if let Some(group) = &self.group {
            if task.task_group_id.as_deref() != Some(group.as_str()) {
                return false;
            }
        }
        let needle = self.search().trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        task.title.to_lowercase().contains(&needle)
            || task
                .description
                .as_deref()
                .map(|text| text.to_lowercase().contains(&needle))
                .unwrap_or(false)
    }

    pub fn apply<'a>(&self, tasks: &'a [Task]) -> Vec<&'a Task> {
        tasks.iter().filter(|task| self.matches(task)).collect()
    }

    /// Only non-default filters are written.
    pub fn to_query(&self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        let search = self.search().trim();
        if !search.is_empty() {
            query.append_pair(QUERY_SEARCH, search);
        }
        if let Some(group) = &self.group {
            query.append_pair(QUERY_GROUP, group);
        }
        if !self.statuses.is_empty() {
            let statuses: Vec<&str> = self.statuses.iter().map(TaskStatus::as_str).collect();
            query.append_pair(QUERY_STATUS, &statuses.join(","));
        }
        if self.hide_blocked {
            query.append_pair(QUERY_HIDE_BLOCKED, "true");
        }
        query.finish()
    }

    /// Unknown keys and unparseable values are ignored.
    pub fn from_query(query: &str) -> Self {
        let mut filters = Self::default();
        filters.merge_query(query);
        filters
    }

    fn merge_query(&mut self, query: &str) {
        let query = query.trim_start_matches('?');
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                QUERY_SEARCH => self.search.reset(value.trim().to_string()),
                QUERY_GROUP => self.set_group(Some(value.into_owned())),
                QUERY_STATUS => {
                    self.statuses = value
                        .split(',')
                        .filter_map(|status| status.parse::<TaskStatus>().ok())
                        .collect();
                }
                QUERY_HIDE_BLOCKED => {
                    self.hide_blocked = parse_bool_flag(&value).unwrap_or(false);
                }
                _ => {}
            }
        }
    }
}

/// Keeps the selected row pinned to the same id while the list underneath
/// changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    selected_id: Option<String>,
    index: Option<usize>,
}

impl Selection {
    pub fn selected_id(&self) -> Option<&str> {
        self.selected_id.as_deref()
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// Follows the selected id to its new row. When it disappeared the index
    /// is clamped to the list and the row there becomes the selection.
    pub fn sync<S: AsRef<str>>(&mut self, ids: &[S]) {
        if ids.is_empty() {
            self.index = None;
            self.selected_id = None;
            return;
        }
        if let Some(selected) = &self.selected_id {
            if let Some(position) = ids.iter().position(|id| id.as_ref() == selected) {
                self.index = Some(position);
                return;
            }
        }
        let index = self.index.unwrap_or(0).min(ids.len() - 1);
        self.index = Some(index);
        self.selected_id = Some(ids[index].as_ref().to_string());
    }

    pub fn select_id<S: AsRef<str>>(&mut self, id: &str, ids: &[S]) -> bool {
        match ids.iter().position(|candidate| candidate.as_ref() == id) {
            Some(position) => {
                self.index = Some(position);
                self.selected_id = Some(id.to_string());
                true
            }
            None => false,
        }
    }

    /// Moves by `delta` rows, wrapping at both ends.
    pub fn move_by<S: AsRef<str>>(&mut self, delta: isize, ids: &[S]) {
        if ids.is_empty() {
            return;
        }
        let len = ids.len() as isize;
        let current = self.index.unwrap_or(0) as isize;
        let mut next = current + delta;
        if next < 0 {
            next = len - 1;
        }
        if next >= len {
            next = 0;
        }
        let next = next as usize;
        self.index = Some(next);
        self.selected_id = Some(ids[next].as_ref().to_string());
    }

    pub fn clear(&mut self) {
        self.index = None;
        self.selected_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task(id: &str, title: &str, status: TaskStatus) -> Task {
        Task {
            id: id.into(),
            project_id: "p1".into(),
            title: title.into(),
            description: None,
            status,
            parent_workspace_id: None,
            task_group_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            has_in_progress_attempt: false,
            last_attempt_failed: false,
            is_blocked: false,
            is_queued: false,
            executor: String::new(),
        }
    }

    #[test]
    fn search_applies_after_debounce_window() {
        let start = Instant::now();
        let mut filters = TaskFilters::new();
        filters.set_search("Login", start);
        assert!(!filters.has_active_filters());
        assert!(filters.poll(start + DEFAULT_DEBOUNCE));
        assert_eq!(filters.search(), "Login");
        assert!(filters.has_active_filters());

        let tasks = vec![
            task("t1", "Fix login redirect", TaskStatus::Todo),
            task("t2", "Write docs", TaskStatus::Todo),
        ];
        let ids: Vec<&str> = filters.apply(&tasks).into_iter().map(|task| task.id.as_str()).collect();
        assert_eq!(ids, vec!["t1"]);
    }

    #[test]
    fn combined_filters_narrow_the_board() {
        let mut blocked = task("t3", "Blocked work", TaskStatus::InProgress);
        blocked.is_blocked = true;
        let mut grouped = task("t4", "Grouped", TaskStatus::InProgress);
        grouped.task_group_id = Some("g1".into());
        grouped.description = Some("Touches the API".into());
        let tasks = vec![task("t1", "Plain", TaskStatus::Todo), blocked, grouped];

        let mut filters = TaskFilters::new();
        assert!(filters.toggle_status(TaskStatus::InProgress));
        filters.set_hide_blocked(true);
        let ids: Vec<&str> = filters.apply(&tasks).into_iter().map(|task| task.id.as_str()).collect();
        assert_eq!(ids, vec!["t4"]);

        filters.set_group(Some("g2".into()));
        assert!(filters.apply(&tasks).is_empty());
        filters.set_group(Some("g1".into()));
        filters.set_search("api", Instant::now());
        filters.poll(Instant::now() + Duration::from_secs(1));
        assert_eq!(filters.apply(&tasks).len(), 1);
        assert!(!filters.toggle_status(TaskStatus::InProgress));
    }

    #[test]
    fn clear_filters_resets_everything_including_pending_search() {
        let now = Instant::now();
        let mut filters = TaskFilters::new();
        filters.set_search("abc", now);
        filters.poll(now + DEFAULT_DEBOUNCE);
        filters.set_search("abcd", now + DEFAULT_DEBOUNCE);
        filters.set_group(Some("g1".into()));
        filters.toggle_status(TaskStatus::Done);
        filters.set_hide_blocked(true);

        filters.clear_filters();
        assert!(!filters.has_active_filters());
        assert_eq!(filters.search(), "");
        assert!(filters.pending_search().is_none());
        assert!(!filters.poll(now + Duration::from_secs(10)));
    }

    #[test]
    fn query_string_survives_reload() {
        let now = Instant::now();
        let mut filters = TaskFilters::new();
        filters.set_search("fix bug", now);
        filters.poll(now + DEFAULT_DEBOUNCE);
        filters.set_group(Some("g1".into()));
        filters.toggle_status(TaskStatus::InReview);
        filters.toggle_status(TaskStatus::Todo);
        filters.set_hide_blocked(true);

        let query = filters.to_query();
        assert_eq!(query, "q=fix+bug&group=g1&status=todo%2Cinreview&hide_blocked=true");

        let restored = TaskFilters::from_query(&format!("?{query}"));
        assert_eq!(restored.search(), "fix bug");
        assert_eq!(restored.group(), Some("g1"));
        assert_eq!(restored.statuses(), filters.statuses());
        assert!(restored.hide_blocked());
        assert_eq!(TaskFilters::new().to_query(), "");
    }

    #[test]
    fn malformed_query_values_fall_back_to_defaults() {
        let filters = TaskFilters::from_query("status=done,bogus&hide_blocked=perhaps&page=3&group=");
        assert_eq!(filters.statuses().iter().copied().collect::<Vec<_>>(), vec![TaskStatus::Done]);
        assert!(!filters.hide_blocked());
        assert_eq!(filters.group(), None);
    }

    #[test]
    fn selection_follows_id_and_clamps() {
        let mut selection = Selection::default();
        selection.sync(&["a", "b", "c"]);
        assert_eq!(selection.selected_id(), Some("a"));

        assert!(selection.select_id("c", &["a", "b", "c"]));
        selection.sync(&["c", "a", "b"]);
        assert_eq!(selection.index(), Some(0));
        assert_eq!(selection.selected_id(), Some("c"));

        selection.move_by(-1, &["c", "a", "b"]);
        assert_eq!(selection.selected_id(), Some("b"));
        selection.sync(&["x"]);
        assert_eq!(selection.index(), Some(0));
        assert_eq!(selection.selected_id(), Some("x"));

        selection.sync::<&str>(&[]);
        assert_eq!(selection.selected_id(), None);
        assert!(!selection.select_id("missing", &["x"]));
    }
}
