use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use thiserror::Error;

/// Opaque position in an older-entries listing. The default cursor asks for
/// the newest page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PageCursor(Option<String>);

impl PageCursor {
    pub fn start() -> Self {
        Self(None)
    }

    pub fn from_token(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn token(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_start(&self) -> bool {
        self.0.is_none()
    }
}

/// One page of history, entries oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage<E> {
    pub entries: Vec<(String, E)>,
    pub next_cursor: Option<PageCursor>,
    pub has_more: bool,
}

impl<E> HistoryPage<E> {
    pub fn last(entries: Vec<(String, E)>) -> Self {
        Self {
            entries,
            next_cursor: None,
            has_more: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("history fetch failed: {0}")]
    Fetch(String),
    #[error("history page decode failed: {0}")]
    Decode(String),
}

pub trait HistorySource<E>: Send + Sync {
    fn fetch_page<'a>(
        &'a self,
        cursor: &'a PageCursor,
    ) -> BoxFuture<'a, Result<HistoryPage<E>, HistoryError>>;
}

/// An entry of a merged history + live list.
#[derive(Debug, PartialEq)]
pub struct Keyed<E> {
    pub key: String,
    pub value: Arc<E>,
}

impl<E> Clone for Keyed<E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: Arc::clone(&self.value),
        }
    }
}

/// Serves fixed history from memory. The cursor token is the exclusive end
/// index of the next page.
pub struct StaticHistory<E> {
    entries: Vec<(String, E)>,
    page_size: usize,
}

impl<E: Clone + Send + Sync> StaticHistory<E> {
    pub fn new(entries: Vec<(String, E)>, page_size: usize) -> Self {
        Self {
            entries,
            page_size: page_size.max(1),
        }
    }

    fn page(&self, cursor: &PageCursor) -> Result<HistoryPage<E>, HistoryError> {
        let end = match cursor.token() {
            None => self.entries.len(),
            Some(token) => token
                .parse::<usize>()
                .map_err(|err| HistoryError::Decode(format!("bad cursor '{token}': {err}")))?
                .min(self.entries.len()),
        };
        let start = end.saturating_sub(self.page_size);
        let has_more = start > 0;
        Ok(HistoryPage {
            entries: self.entries[start..end].to_vec(),
            next_cursor: has_more.then(|| PageCursor::from_token(start.to_string())),
            has_more,
        })
    }
}

impl<E: Clone + Send + Sync> HistorySource<E> for StaticHistory<E> {
    fn fetch_page<'a>(
        &'a self,
        cursor: &'a PageCursor,
    ) -> BoxFuture<'a, Result<HistoryPage<E>, HistoryError>> {
        Box::pin(future::ready(self.page(cursor)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(count: usize) -> Vec<(String, usize)> {
        (0..count).map(|index| (index.to_string(), index)).collect()
    }

    #[tokio::test]
    async fn static_history_pages_backwards() {
        let source = StaticHistory::new(numbered(5), 2);
        let first = source.fetch_page(&PageCursor::start()).await.expect("first");
        assert_eq!(first.entries, vec![("3".to_string(), 3), ("4".to_string(), 4)]);
        assert!(first.has_more);

        let cursor = first.next_cursor.expect("cursor");
        let second = source.fetch_page(&cursor).await.expect("second");
        assert_eq!(second.entries.len(), 2);

        let cursor = second.next_cursor.expect("cursor");
        let third = source.fetch_page(&cursor).await.expect("third");
        assert_eq!(third.entries, vec![("0".to_string(), 0)]);
        assert!(!third.has_more);
        assert!(third.next_cursor.is_none());
    }

    #[tokio::test]
    async fn static_history_rejects_garbage_cursor() {
        let source = StaticHistory::new(numbered(3), 2);
        let err = source
            .fetch_page(&PageCursor::from_token("nope"))
            .await
            .expect_err("bad cursor");
        assert!(matches!(err, HistoryError::Decode(_)));
    }
}
