use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tb_core::{
    ConversationEntry, ExecutionProcess, ExecutionProcessStatus, RunReason, ServerLogEntry, Task,
};
use tb_view::countdown::{format_remaining, Countdown};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowChange {
    New,
    Updated,
    Unchanged,
}

/// Last printed value per row key, so in-place replacements print again.
pub struct PrintedRows<T> {
    rows: HashMap<String, Arc<T>>,
}

impl<T: PartialEq> PrintedRows<T> {
    pub fn new() -> Self {
        Self {
            rows: HashMap::new(),
        }
    }

    pub fn observe(&mut self, key: &str, value: &Arc<T>) -> RowChange {
        match self.rows.get(key) {
            Some(previous) if previous == value => RowChange::Unchanged,
            Some(_) => {
                self.rows.insert(key.to_string(), Arc::clone(value));
                RowChange::Updated
            }
            None => {
                self.rows.insert(key.to_string(), Arc::clone(value));
                RowChange::New
            }
        }
    }
}

pub fn with_change(line: String, change: RowChange) -> Option<String> {
    match change {
        RowChange::New => Some(line),
        RowChange::Updated => Some(format!("{line} (updated)")),
        RowChange::Unchanged => None,
    }
}

pub fn conversation_line(key: &str, entry: &ConversationEntry) -> String {
    match entry {
        ConversationEntry::Stdout(text) => format!("[{key}] {}", text.trim_end()),
        ConversationEntry::Stderr(text) => format!("[{key}] ! {}", text.trim_end()),
        ConversationEntry::NormalizedEntry(entry) => {
            let kind = entry
                .entry_type
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("entry");
            format!("[{key}] {kind}: {}", entry.content.trim_end())
        }
    }
}

fn status_label(status: ExecutionProcessStatus) -> &'static str {
    match status {
        ExecutionProcessStatus::Running => "running",
        ExecutionProcessStatus::Completed => "completed",
        ExecutionProcessStatus::Failed => "failed",
        ExecutionProcessStatus::Killed => "killed",
    }
}

fn run_reason_label(reason: RunReason) -> &'static str {
    match reason {
        RunReason::SetupScript => "setup",
        RunReason::CleanupScript => "cleanup",
        RunReason::CodingAgent => "agent",
        RunReason::DevServer => "dev-server",
    }
}

pub fn process_line(process: &ExecutionProcess) -> String {
    let mut line = format!(
        "{} {:<10} {:<9}",
        process.id,
        run_reason_label(process.run_reason),
        status_label(process.status)
    );
    if let Some(code) = process.exit_code {
        line.push_str(&format!(" exit={code}"));
    }
    if process.dropped {
        line.push_str(" (dropped)");
    }
    line.trim_end().to_string()
}

pub fn task_line(task: &Task) -> String {
    let mut flags = Vec::new();
    if task.has_in_progress_attempt {
        flags.push("running");
    }
    if task.last_attempt_failed {
        flags.push("failed");
    }
    if task.is_blocked {
        flags.push("blocked");
    }
    if task.is_queued {
        flags.push("queued");
    }
    let flags = if flags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", flags.join(","))
    };
    format!("{:<10} {}{} ({})", task.status.as_str(), task.title, flags, task.id)
}

pub fn server_log_line(entry: &ServerLogEntry) -> String {
    format!(
        "{} {:>5} {}: {}",
        entry.timestamp.format("%H:%M:%S"),
        entry.level.to_uppercase(),
        entry.target,
        entry.message
    )
}

pub fn countdown_label(countdown: &Countdown) -> String {
    if countdown.is_expired() {
        return "expired".to_string();
    }
    format!(
        "{} left ({}%)",
        format_remaining(countdown.seconds_remaining),
        countdown.percent_remaining
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tb_core::{NormalizedEntry, TaskStatus};

    #[test]
    fn renders_conversation_entries() {
        assert_eq!(
            conversation_line("3", &ConversationEntry::Stdout("hello\n".into())),
            "[3] hello"
        );
        assert_eq!(
            conversation_line("4", &ConversationEntry::Stderr("boom".into())),
            "[4] ! boom"
        );
        let normalized = ConversationEntry::NormalizedEntry(NormalizedEntry {
            timestamp: None,
            entry_type: json!({ "type": "assistant_message" }),
            content: "done".into(),
            metadata: None,
        });
        assert_eq!(conversation_line("5", &normalized), "[5] assistant_message: done");
    }

    #[test]
    fn renders_task_flags() {
        let now = Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0).single().expect("ts");
        let task = Task {
            id: "t1".into(),
            project_id: "p1".into(),
            title: "Ship it".into(),
            description: None,
            status: TaskStatus::InReview,
            parent_workspace_id: None,
            task_group_id: None,
            created_at: now,
            updated_at: now,
            has_in_progress_attempt: false,
            last_attempt_failed: true,
            is_blocked: true,
            is_queued: false,
            executor: String::new(),
        };
        assert_eq!(task_line(&task), "inreview   Ship it [failed,blocked] (t1)");
    }

    #[test]
    fn replaced_rows_print_again() {
        let mut printed = PrintedRows::new();
        let pending = Arc::new(ConversationEntry::Stdout("approval pending".into()));
        assert_eq!(printed.observe("2", &pending), RowChange::New);
        let replayed = Arc::new(ConversationEntry::Stdout("approval pending".into()));
        assert_eq!(printed.observe("2", &replayed), RowChange::Unchanged);
        let approved = Arc::new(ConversationEntry::Stdout("approval granted".into()));
        assert_eq!(printed.observe("2", &approved), RowChange::Updated);
        assert_eq!(
            with_change(conversation_line("2", &approved), RowChange::Updated).as_deref(),
            Some("[2] approval granted (updated)")
        );
        assert_eq!(with_change("x".into(), RowChange::Unchanged), None);
    }

    #[test]
    fn renders_countdowns() {
        let live = Countdown {
            seconds_remaining: 249,
            percent_remaining: 42,
            total_seconds: 600,
        };
        assert_eq!(countdown_label(&live), "4m 09s left (42%)");
        assert_eq!(countdown_label(&Countdown::default()), "expired");
    }
}
