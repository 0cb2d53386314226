use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tb_core::history::{HistoryError, HistoryPage, HistorySource, PageCursor};
use tb_core::{ApiResponse, ConversationEntry, HistoricEntry, Task};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_ENTRIES_LIMIT: usize = 200;
pub const MAX_ENTRIES_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("response decode failed: {0}")]
    Decode(String),
}

/// One page of the normalized-entries endpoint. Entries are oldest first.
#[derive(Debug, Clone, Deserialize)]
pub struct EntriesPage {
    pub entries: Vec<HistoricEntry>,
    #[serde(default)]
    pub next_before_index: Option<i64>,
    pub has_more: bool,
}

impl EntriesPage {
    pub fn into_history_page(self) -> HistoryPage<ConversationEntry> {
        let has_more = self.has_more;
        let mut entries = self.entries;
        entries.sort_by_key(|entry| entry.entry_index);
        HistoryPage {
            entries: entries
                .into_iter()
                .map(|entry| (entry.key(), entry.into_conversation_entry()))
                .collect(),
            next_cursor: self
                .next_before_index
                .filter(|_| has_more)
                .map(|index| PageCursor::from_token(index.to_string())),
            has_more,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TasksPage {
    pub tasks: Vec<Task>,
    pub total: i64,
    pub has_more: bool,
}

pub fn clamp_entries_limit(limit: Option<usize>) -> usize {
    limit
        .unwrap_or(DEFAULT_ENTRIES_LIMIT)
        .clamp(1, MAX_ENTRIES_LIMIT)
}

/// Typed client for the paginated HTTP endpoints the live views backfill from.
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    pub async fn normalized_entries_page(
        &self,
        execution_id: &str,
        before_index: Option<i64>,
        limit: Option<usize>,
    ) -> Result<EntriesPage, ApiError> {
        let limit = clamp_entries_limit(limit);
        let mut query = vec![("limit", limit.to_string())];
        if let Some(before_index) = before_index {
            query.push(("before_index", before_index.to_string()));
        }
        debug!(execution_id, ?before_index, limit, "fetch_normalized_entries");
        let resp = self
            .client
            .get(self.url(&format!(
                "/execution-processes/{execution_id}/normalized-entries"
            )))
            .query(&query)
            .send()
            .await?;
        parse_response(resp).await
    }

    pub async fn tasks_page(
        &self,
        project_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<TasksPage, ApiError> {
        let resp = self
            .client
            .get(self.url("/tasks"))
            .query(&[
                ("project_id", project_id.to_string()),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;
        parse_response(resp).await
    }
}

async fn parse_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            body,
        });
    }
    let body = resp.text().await?;
    decode_envelope(&body)
}

pub fn decode_envelope<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    let envelope: ApiResponse<T> =
        serde_json::from_str(body).map_err(|err| ApiError::Decode(err.to_string()))?;
    if !envelope.success {
        return Err(ApiError::Rejected(
            envelope
                .message
                .unwrap_or_else(|| "request failed without a message".to_string()),
        ));
    }
    envelope
        .data
        .ok_or_else(|| ApiError::Decode("response has no data".to_string()))
}

/// Older normalized entries of one execution process.
pub struct HttpEntrySource {
    client: Arc<ApiClient>,
    execution_id: String,
    page_size: usize,
}

impl HttpEntrySource {
    pub fn new(client: Arc<ApiClient>, execution_id: impl Into<String>, page_size: usize) -> Self {
        Self {
            client,
            execution_id: execution_id.into(),
            page_size: clamp_entries_limit(Some(page_size)),
        }
    }
}

impl HistorySource<ConversationEntry> for HttpEntrySource {
    fn fetch_page<'a>(
        &'a self,
        cursor: &'a PageCursor,
    ) -> BoxFuture<'a, Result<HistoryPage<ConversationEntry>, HistoryError>> {
        Box::pin(async move {
            let before_index = match cursor.token() {
                None => None,
                Some(token) => Some(token.parse::<i64>().map_err(|err| {
                    HistoryError::Decode(format!("bad cursor '{token}': {err}"))
                })?),
            };
            let page = self
                .client
                .normalized_entries_page(&self.execution_id, before_index, Some(self.page_size))
                .await
                .map_err(|err| HistoryError::Fetch(err.to_string()))?;
            Ok(page.into_history_page())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    /// Answers a single request with `status` and `body`, reporting the
    /// request line it received.
    fn serve_once(status: &str, body: &str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind server");
        let port = listener.local_addr().expect("server addr").port();
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buffer = [0u8; 4096];
                let read = stream.read(&mut buffer).unwrap_or(0);
                let request = String::from_utf8_lossy(&buffer[..read]).to_string();
                let _ = tx.send(request.lines().next().unwrap_or_default().to_string());
                let _ = stream.write_all(response.as_bytes());
            }
        });
        (format!("http://127.0.0.1:{port}/"), rx)
    }

    fn entry_json(index: i64, content: &str) -> serde_json::Value {
        serde_json::json!({
            "entry_index": index,
            "entry": {
                "timestamp": null,
                "entry_type": {"type": "assistant_message"},
                "content": content
            }
        })
    }

    #[test]
    fn envelope_failures_are_typed() {
        let rejected = decode_envelope::<EntriesPage>(r#"{"success":false,"message":"gone"}"#)
            .expect_err("rejected");
        assert!(matches!(rejected, ApiError::Rejected(message) if message == "gone"));
        let empty = decode_envelope::<EntriesPage>(r#"{"success":true}"#).expect_err("empty");
        assert!(matches!(empty, ApiError::Decode(_)));
        let garbage = decode_envelope::<EntriesPage>("<html>").expect_err("garbage");
        assert!(matches!(garbage, ApiError::Decode(_)));
    }

    #[test]
    fn limit_is_clamped() {
        assert_eq!(clamp_entries_limit(None), 200);
        assert_eq!(clamp_entries_limit(Some(0)), 1);
        assert_eq!(clamp_entries_limit(Some(9000)), 500);
    }

    #[test]
    fn entries_page_maps_to_history_page() {
        let page: EntriesPage = serde_json::from_value(serde_json::json!({
            "entries": [entry_json(7, "b"), entry_json(6, "a")],
            "next_before_index": 6,
            "has_more": true
        }))
        .expect("page");
        let history = page.into_history_page();
        let keys: Vec<&str> = history.entries.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["6", "7"]);
        assert_eq!(history.next_cursor, Some(PageCursor::from_token("6")));
        assert!(history.has_more);
    }

    #[tokio::test]
    async fn fetches_entries_page_with_cursor() {
        let body = serde_json::json!({
            "success": true,
            "data": {
                "entries": [entry_json(3, "older")],
                "next_before_index": null,
                "has_more": false
            }
        })
        .to_string();
        let (base, requests) = serve_once("200 OK", &body);
        let client = Arc::new(ApiClient::new(&base, Duration::from_secs(5)).expect("client"));
        let source = HttpEntrySource::new(client, "proc-1", 50);

        let page = source
            .fetch_page(&PageCursor::from_token("4"))
            .await
            .expect("page");
        assert_eq!(page.entries.len(), 1);
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());

        let request_line = requests.recv().expect("request line");
        assert!(request_line.starts_with(
            "GET /api/execution-processes/proc-1/normalized-entries?limit=50&before_index=4 "
        ), "{request_line}");
    }

    #[tokio::test]
    async fn http_errors_surface_status_and_body() {
        let (base, _requests) = serve_once("404 Not Found", r#"{"success":false}"#);
        let client = ApiClient::new(&base, Duration::from_secs(5)).expect("client");
        let err = client.tasks_page("p1", 0, 25).await.expect_err("404");
        assert!(matches!(err, ApiError::Status { status: 404, .. }), "{err}");
    }

    #[tokio::test]
    async fn bad_cursor_is_a_decode_error() {
        let client =
            Arc::new(ApiClient::new("http://127.0.0.1:9", Duration::from_secs(1)).expect("client"));
        let source = HttpEntrySource::new(client, "proc-1", 10);
        let err = source
            .fetch_page(&PageCursor::from_token("later"))
            .await
            .expect_err("cursor");
        assert!(matches!(err, HistoryError::Decode(_)));
    }
}
