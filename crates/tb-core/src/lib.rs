use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub mod history;
pub mod optimistic;
pub mod snapshot;
pub mod stream_msg;

pub use snapshot::{apply_batch, apply_operation, try_apply_operation, PatchError, Snapshot};
pub use stream_msg::{FrameError, FrameMode, PatchOperation, StreamMsg};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Todo,
    InProgress,
    InReview,
    Done,
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Todo
    }
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::InReview,
        TaskStatus::Done,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "inprogress",
            TaskStatus::InReview => "inreview",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "todo" | "pending" => Ok(TaskStatus::Todo),
            "inprogress" | "in-progress" | "in_progress" => Ok(TaskStatus::InProgress),
            "inreview" | "in-review" | "in_review" | "review" => Ok(TaskStatus::InReview),
            "done" => Ok(TaskStatus::Done),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub parent_workspace_id: Option<String>,
    #[serde(default)]
    pub task_group_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub has_in_progress_attempt: bool,
    #[serde(default)]
    pub last_attempt_failed: bool,
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub is_queued: bool,
    #[serde(default)]
    pub executor: String,
}

/// A task attempt: one branch/worktree a coding agent works in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub task_id: String,
    pub branch: String,
    #[serde(default)]
    pub target_branch: Option<String>,
    #[serde(default)]
    pub container_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProcessStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunReason {
    SetupScript,
    CleanupScript,
    CodingAgent,
    DevServer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProcess {
    pub id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub run_reason: RunReason,
    pub status: ExecutionProcessStatus,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub dropped: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionProcess {
    pub fn is_running(&self) -> bool {
        self.status == ExecutionProcessStatus::Running
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEntry {
    #[serde(default)]
    pub timestamp: Option<String>,
    pub entry_type: Value,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Payload stored under `/entries/<index>` of a log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationEntry {
    Stdout(String),
    Stderr(String),
    NormalizedEntry(NormalizedEntry),
}

/// One row of the paginated normalized-entries endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricEntry {
    pub entry_index: i64,
    pub entry: NormalizedEntry,
}

impl HistoricEntry {
    pub fn key(&self) -> String {
        self.entry_index.to_string()
    }

    pub fn into_conversation_entry(self) -> ConversationEntry {
        ConversationEntry::NormalizedEntry(self.entry)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub tool_call_id: String,
    pub execution_process_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub timeout_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Envelope every JSON HTTP endpoint answers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    RawOutput,
    StructuredEvent,
    Record,
}

/// Display ordering hooks for records held in a [`Snapshot`].
pub trait OrderedEntry {
    fn kind(&self) -> EntryKind {
        EntryKind::Record
    }

    /// Source timestamp or index used to order a full snapshot. Records
    /// without one are ordered by their key.
    fn order_hint(&self) -> Option<i64> {
        None
    }
}

impl OrderedEntry for Task {
    fn order_hint(&self) -> Option<i64> {
        Some(self.created_at.timestamp_millis())
    }
}

impl OrderedEntry for Workspace {
    fn order_hint(&self) -> Option<i64> {
        Some(self.created_at.timestamp_millis())
    }
}

impl OrderedEntry for ExecutionProcess {
    fn order_hint(&self) -> Option<i64> {
        Some(self.created_at.timestamp_millis())
    }
}

impl OrderedEntry for ConversationEntry {
    fn kind(&self) -> EntryKind {
        match self {
            ConversationEntry::Stdout(_) | ConversationEntry::Stderr(_) => EntryKind::RawOutput,
            ConversationEntry::NormalizedEntry(_) => EntryKind::StructuredEvent,
        }
    }
}

impl OrderedEntry for ApprovalRequest {
    fn order_hint(&self) -> Option<i64> {
        Some(self.created_at.timestamp_millis())
    }
}

impl OrderedEntry for ServerLogEntry {
    fn kind(&self) -> EntryKind {
        EntryKind::RawOutput
    }

    fn order_hint(&self) -> Option<i64> {
        Some(self.timestamp.timestamp_millis())
    }
}

impl OrderedEntry for Value {}

/// Accepts the usual spellings of a boolean switch in env vars and query
/// strings.
pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_parses_aliases() {
        assert_eq!("in-progress".parse::<TaskStatus>(), Ok(TaskStatus::InProgress));
        assert_eq!("In_Review".parse::<TaskStatus>(), Ok(TaskStatus::InReview));
        assert_eq!("canceled".parse::<TaskStatus>(), Ok(TaskStatus::Cancelled));
        assert!("later".parse::<TaskStatus>().is_err());
        assert_eq!(TaskStatus::InProgress.to_string(), "inprogress");
    }

    #[test]
    fn bool_flags_parse() {
        assert_eq!(parse_bool_flag(" YES "), Some(true));
        assert_eq!(parse_bool_flag("off"), Some(false));
        assert_eq!(parse_bool_flag("maybe"), None);
    }

    #[test]
    fn task_defaults_stream_derived_fields() {
        let task: Task = serde_json::from_value(serde_json::json!({
            "id": "t-1",
            "project_id": "p-1",
            "title": "Wire up sync",
            "status": "inreview",
            "created_at": "2026-02-07T21:00:00Z",
            "updated_at": "2026-02-07T21:05:00Z"
        }))
        .expect("task");
        assert_eq!(task.status, TaskStatus::InReview);
        assert!(!task.is_blocked);
        assert!(task.description.is_none());
        assert_eq!(task.executor, "");
    }

    #[test]
    fn conversation_entry_uses_type_tag() {
        let stdout: ConversationEntry =
            serde_json::from_value(serde_json::json!({"type": "STDOUT", "content": "hello"}))
                .expect("stdout");
        assert_eq!(stdout, ConversationEntry::Stdout("hello".to_string()));
        assert_eq!(stdout.kind(), EntryKind::RawOutput);

        let normalized: ConversationEntry = serde_json::from_value(serde_json::json!({
            "type": "NORMALIZED_ENTRY",
            "content": {
                "timestamp": null,
                "entry_type": {"type": "assistant_message"},
                "content": "Done."
            }
        }))
        .expect("normalized");
        assert_eq!(normalized.kind(), EntryKind::StructuredEvent);
    }

    #[test]
    fn historic_entry_key_matches_live_path_segment() {
        let entry = HistoricEntry {
            entry_index: 42,
            entry: NormalizedEntry {
                timestamp: None,
                entry_type: serde_json::json!({"type": "user_message"}),
                content: "hi".to_string(),
                metadata: None,
            },
        };
        assert_eq!(entry.key(), "42");
        assert_eq!(entry.into_conversation_entry().kind(), EntryKind::StructuredEvent);
    }

    #[test]
    fn envelope_without_data_decodes_for_any_payload() {
        let envelope: ApiResponse<ExecutionProcess> =
            serde_json::from_str(r#"{"success":false,"message":"not found"}"#).expect("envelope");
        assert!(!envelope.success);
        assert!(envelope.data.is_none());
        assert_eq!(envelope.message.as_deref(), Some("not found"));

        let bare: ApiResponse<Vec<Task>> =
            serde_json::from_str(r#"{"success":true}"#).expect("bare envelope");
        assert!(bare.data.is_none() && bare.message.is_none());
    }
}
