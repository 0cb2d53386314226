use std::fmt;

use tb_core::FrameMode;
use url::Url;

use crate::StreamError;

/// Identity of one live subscription: which endpoint, scoped how, and which
/// collection its patches address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    path: String,
    query: Vec<(String, String)>,
    collection: String,
    mode: FrameMode,
}

impl SubscriptionKey {
    pub fn new(
        path: impl Into<String>,
        query: Vec<(String, String)>,
        collection: impl Into<String>,
        mode: FrameMode,
    ) -> Self {
        let mut query = query;
        query.sort();
        Self {
            path: path.into(),
            query,
            collection: collection.into(),
            mode,
        }
    }

    pub fn execution_processes_for_workspace(workspace_id: &str, show_soft_deleted: bool) -> Self {
        Self::new(
            "/api/execution-processes/stream/ws",
            vec![
                ("workspace_id".to_string(), workspace_id.to_string()),
                ("show_soft_deleted".to_string(), show_soft_deleted.to_string()),
            ],
            "execution_processes",
            FrameMode::JsonPatch,
        )
    }

    pub fn execution_processes_for_conversation(session_id: &str, show_soft_deleted: bool) -> Self {
        Self::new(
            "/api/execution-processes/stream/ws",
            vec![
                ("conversation_session_id".to_string(), session_id.to_string()),
                ("show_soft_deleted".to_string(), show_soft_deleted.to_string()),
            ],
            "execution_processes",
            FrameMode::JsonPatch,
        )
    }

    pub fn tasks_for_project(project_id: &str) -> Self {
        Self::new(
            "/api/tasks/stream/ws",
            vec![
                ("project_id".to_string(), project_id.to_string()),
                ("include_snapshot".to_string(), "true".to_string()),
            ],
            "tasks",
            FrameMode::JsonPatch,
        )
    }

    pub fn workspaces_for_task(task_id: &str) -> Self {
        Self::new(
            "/api/task-attempts/stream/ws",
            vec![
                ("task_id".to_string(), task_id.to_string()),
                ("include_snapshot".to_string(), "true".to_string()),
            ],
            "workspaces",
            FrameMode::JsonPatch,
        )
    }

    pub fn normalized_logs(execution_process_id: &str) -> Self {
        Self::new(
            format!("/api/execution-processes/{execution_process_id}/normalized-logs/ws"),
            Vec::new(),
            "entries",
            FrameMode::JsonPatch,
        )
    }

    pub fn raw_logs(execution_process_id: &str) -> Self {
        Self::new(
            format!("/api/execution-processes/{execution_process_id}/raw-logs/ws"),
            Vec::new(),
            "entries",
            FrameMode::JsonPatch,
        )
    }

    pub fn server_logs() -> Self {
        Self::new(
            "/api/server-logs/ws",
            Vec::new(),
            "entries",
            FrameMode::AppendRecords,
        )
    }

    pub fn notifications(project_id: Option<&str>) -> Self {
        let mut query = vec![("include_snapshot".to_string(), "true".to_string())];
        if let Some(project_id) = project_id {
            query.push(("project_id".to_string(), project_id.to_string()));
        }
        Self::new(
            "/api/notifications/stream/ws",
            query,
            "notifications",
            FrameMode::JsonPatch,
        )
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)?;
        for (index, (name, value)) in self.query.iter().enumerate() {
            let sep = if index == 0 { '?' } else { '&' };
            write!(f, "{sep}{name}={value}")?;
        }
        Ok(())
    }
}

/// Builds the streaming endpoint for `key` under `base`, swapping the HTTP
/// scheme for its WebSocket counterpart.
pub fn stream_url(base: &Url, key: &SubscriptionKey) -> Result<Url, StreamError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(StreamError::UnsupportedScheme(other.to_string())),
    };
    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|_| StreamError::UnsupportedScheme(base.scheme().to_string()))?;

    let prefix = base.path().trim_end_matches('/');
    url.set_path(&format!("{prefix}{}", key.path()));
    url.set_fragment(None);
    if key.query().is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut()
            .clear()
            .extend_pairs(key.query().iter().map(|(name, value)| (name.as_str(), value.as_str())));
    }
    Ok(url)
}
