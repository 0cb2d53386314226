use std::collections::HashSet;
use std::sync::Arc;

use tb_core::history::{HistoryError, HistoryPage, HistorySource, Keyed, PageCursor};
use tb_core::Snapshot;
use tracing::{debug, warn};

pub const DEFAULT_TOP_THRESHOLD_ROWS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: PageCursor,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Skipped,
    Stale,
    Loaded { inserted: usize },
    Failed(HistoryError),
}

struct MergedCache<E> {
    historic_revision: u64,
    live_revision: Option<u64>,
    rows: Arc<Vec<Keyed<E>>>,
}

/// Older entries fetched on demand merged with the live snapshot of the same
/// stream. Keys are unique in the merged list and the live copy wins.
pub struct HistoryPager<E> {
    historic: Vec<Keyed<E>>,
    historic_keys: HashSet<String>,
    historic_revision: u64,
    live: Option<Snapshot<E>>,
    cursor: PageCursor,
    has_more: bool,
    loading: bool,
    error: Option<HistoryError>,
    generation: u64,
    pages_loaded: usize,
    cache: Option<MergedCache<E>>,
}

impl<E> Default for HistoryPager<E> {
    fn default() -> Self {
        Self {
            historic: Vec::new(),
            historic_keys: HashSet::new(),
            historic_revision: 0,
            live: None,
            cursor: PageCursor::start(),
            has_more: true,
            loading: false,
            error: None,
            generation: 0,
            pages_loaded: 0,
            cache: None,
        }
    }
}

impl<E> HistoryPager<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn can_load(&self) -> bool {
        !self.loading && self.has_more
    }

    pub fn error(&self) -> Option<&HistoryError> {
        self.error.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pages_loaded(&self) -> usize {
        self.pages_loaded
    }

    pub fn historic_len(&self) -> usize {
        self.historic.len()
    }

    pub fn live(&self) -> Option<&Snapshot<E>> {
        self.live.as_ref()
    }

    pub fn begin_load(&mut self) -> Option<PageRequest> {
        if !self.can_load() {
            return None;
        }
        self.loading = true;
        Some(PageRequest {
            cursor: self.cursor.clone(),
            generation: self.generation,
        })
    }

    pub fn complete_load(
        &mut self,
        request: &PageRequest,
        result: Result<HistoryPage<E>, HistoryError>,
    ) -> LoadOutcome {
        if request.generation != self.generation {
            debug!(
                request_generation = request.generation,
                generation = self.generation,
                "history_page_stale"
            );
            return LoadOutcome::Stale;
        }
        self.loading = false;
        let page = match result {
            Ok(page) => page,
            Err(err) => {
                warn!("history_load_error: {err}");
                self.error = Some(err.clone());
                return LoadOutcome::Failed(err);
            }
        };

        let mut older = Vec::with_capacity(page.entries.len() + self.historic.len());
        for (key, value) in page.entries {
            if self.historic_keys.insert(key.clone()) {
                older.push(Keyed {
                    key,
                    value: Arc::new(value),
                });
            }
        }
        let inserted = older.len();
        if inserted > 0 {
            older.append(&mut self.historic);
            self.historic = older;
            self.historic_revision += 1;
        }

        self.has_more = page.has_more && page.next_cursor.is_some();
        if let Some(cursor) = page.next_cursor {
            self.cursor = cursor;
        }
        self.error = None;
        self.pages_loaded += 1;
        debug!(inserted, has_more = self.has_more, "history_page_loaded");
        LoadOutcome::Loaded { inserted }
    }

    pub async fn load_more(&mut self, source: &dyn HistorySource<E>) -> LoadOutcome {
        let Some(request) = self.begin_load() else {
            return LoadOutcome::Skipped;
        };
        let result = source.fetch_page(&request.cursor).await;
        self.complete_load(&request, result)
    }

    pub fn set_live(&mut self, snapshot: Snapshot<E>) {
        self.live = Some(snapshot);
    }

    /// Historic entries not shadowed by the live snapshot, then live entries
    /// in arrival order. Recomputed only when either side changed.
    pub fn merged(&mut self) -> Arc<Vec<Keyed<E>>> {
        let live_revision = self.live.as_ref().map(Snapshot::revision);
        if let Some(cache) = &self.cache {
            if cache.historic_revision == self.historic_revision
                && cache.live_revision == live_revision
            {
                return Arc::clone(&cache.rows);
            }
        }

        let live_len = self.live.as_ref().map_or(0, Snapshot::len);
        let mut rows = Vec::with_capacity(self.historic.len() + live_len);
        match &self.live {
            Some(live) => {
                rows.extend(
                    self.historic
                        .iter()
                        .filter(|entry| !live.contains_key(&entry.key))
                        .cloned(),
                );
                rows.extend(live.ordered().into_iter().map(|(key, value)| Keyed {
                    key: key.to_string(),
                    value: Arc::clone(value),
                }));
            }
            None => rows.extend(self.historic.iter().cloned()),
        }

        let rows = Arc::new(rows);
        self.cache = Some(MergedCache {
            historic_revision: self.historic_revision,
            live_revision,
            rows: Arc::clone(&rows),
        });
        rows
    }

    pub fn reset(&mut self) {
        let generation = self.generation + 1;
        let historic_revision = self.historic_revision + 1;
        *self = Self::default();
        self.generation = generation;
        self.historic_revision = historic_revision;
    }
}

/// Edge-triggered "near the top" detector. Fires once on entering the zone
/// and re-arms after the view scrolls back out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopTrigger {
    threshold_rows: usize,
    armed: bool,
}

impl Default for TopTrigger {
    fn default() -> Self {
        Self::new(DEFAULT_TOP_THRESHOLD_ROWS)
    }
}

impl TopTrigger {
    pub fn new(threshold_rows: usize) -> Self {
        Self {
            threshold_rows,
            armed: true,
        }
    }

    pub fn threshold_rows(&self) -> usize {
        self.threshold_rows
    }

    pub fn observe(&mut self, first_visible_row: usize, can_load: bool) -> bool {
        if first_visible_row > self.threshold_rows {
            self.armed = true;
            return false;
        }
        if self.armed && can_load {
            self.armed = false;
            return true;
        }
        false
    }
}
