use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tb_core::{ConversationEntry, ExecutionProcess, ServerLogEntry, Task};
use tb_storage::{MemoryBackend, PreferenceStore, SqliteBackend, StorageBackend};
use tb_stream::{
    ApiClient, ConnectionConfig, ConnectionManager, ConnectionStatus, HttpEntrySource,
    StreamState, SubscriptionKey, WsConnector,
};
use tb_view::countdown::{spawn_countdown, SystemClock};
use tb_view::{LiveView, Selection, TaskFilters};
use tokio::sync::watch;
use tracing::{debug, info, warn};

mod config;
mod logging;
mod render;

use config::{load_config, RuntimeConfig};
use logging::init_logging;
use render::{PrintedRows, RowChange};

#[derive(Parser)]
#[command(name = "taskboard")]
#[command(about = "Follow live task board streams from the terminal", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Server base url (http or https)
    #[arg(long, global = true, default_value = "")]
    pub base_url: String,
    /// Path to config.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true, default_value = "")]
    pub log_dir: String,
    /// Consecutive failed connects before giving up
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the execution processes of a workspace or conversation session
    WatchProcesses {
        #[arg(long, conflicts_with = "session", required_unless_present = "session")]
        workspace: Option<String>,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        show_soft_deleted: bool,
    },
    /// Follow the tasks of a project
    WatchTasks {
        #[arg(long)]
        project: String,
        /// Filter query string, e.g. "q=login&status=todo,inprogress"
        #[arg(long, default_value = "")]
        filter: String,
    },
    /// Follow the log entries of one execution process
    WatchLogs {
        #[arg(long)]
        process: String,
        /// Raw stdout/stderr instead of normalized entries
        #[arg(long)]
        raw: bool,
        /// Backfill older entries before following
        #[arg(long)]
        history: bool,
    },
    /// Follow the server's own log output
    WatchServerLogs,
    /// Follow notifications, optionally for one project
    WatchNotifications {
        #[arg(long)]
        project: Option<String>,
    },
    /// Tick an approval countdown until it expires
    Countdown {
        #[arg(long)]
        requested_at: DateTime<Utc>,
        #[arg(long)]
        timeout_at: DateTime<Utc>,
    },
    /// Normalize a board filter query string
    Filter { query: String },
    /// Show or change stored client preferences
    Prefs {
        #[command(subcommand)]
        action: PrefsCommands,
    },
}

#[derive(Subcommand)]
enum PrefsCommands {
    Show {
        #[arg(long)]
        project: Option<String>,
    },
    Compact { enabled: String },
    Collapse { section: String, collapsed: String },
    BaseBranch {
        project: String,
        branch: Option<String>,
    },
}

impl Commands {
    fn log_name(&self) -> &'static str {
        match self {
            Commands::WatchProcesses { .. } => "processes",
            Commands::WatchTasks { .. } => "tasks",
            Commands::WatchLogs { .. } => "logs",
            Commands::WatchServerLogs => "server-logs",
            Commands::WatchNotifications { .. } => "notifications",
            Commands::Countdown { .. } => "countdown",
            Commands::Filter { .. } => "filter",
            Commands::Prefs { .. } => "prefs",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.global)?;
    let _log_guard = init_logging(&config, cli.command.log_name());

    match cli.command {
        Commands::WatchProcesses {
            workspace,
            session,
            show_soft_deleted,
        } => {
            let key = match (workspace, session) {
                (Some(workspace), _) => {
                    SubscriptionKey::execution_processes_for_workspace(&workspace, show_soft_deleted)
                }
                (None, Some(session)) => SubscriptionKey::execution_processes_for_conversation(
                    &session,
                    show_soft_deleted,
                ),
                (None, None) => bail!("either --workspace or --session is required"),
            };
            watch_processes(&config, key).await
        }
        Commands::WatchTasks { project, filter } => watch_tasks(&config, &project, &filter).await,
        Commands::WatchLogs {
            process,
            raw,
            history,
        } => watch_logs(&config, &process, raw, history).await,
        Commands::WatchServerLogs => watch_server_logs(&config).await,
        Commands::WatchNotifications { project } => {
            watch_notifications(&config, project.as_deref()).await
        }
        Commands::Countdown {
            requested_at,
            timeout_at,
        } => run_countdown(requested_at, timeout_at).await,
        Commands::Filter { query } => {
            let filters = TaskFilters::from_query(&query);
            println!("{}", filters.to_query());
            println!("active: {}", filters.has_active_filters());
            Ok(())
        }
        Commands::Prefs { action } => run_prefs(&config, action),
    }
}

fn connection_manager<T>(config: &RuntimeConfig) -> ConnectionManager<T> {
    let connection = ConnectionConfig::new(config.base_url.clone()).with_policy(config.policy);
    ConnectionManager::new(connection, Arc::new(WsConnector))
}

enum Next<T> {
    State(StreamState<T>),
    Interrupted,
    Ended,
}

async fn next_state<T>(rx: &mut watch::Receiver<StreamState<T>>) -> Next<T> {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => Next::Interrupted,
        changed = rx.changed() => match changed {
            Ok(()) => Next::State(rx.borrow_and_update().clone()),
            Err(_) => Next::Ended,
        },
    }
}

/// Ok(true) once the stream ended normally.
fn check_status<T>(state: &StreamState<T>) -> Result<bool> {
    match state.status {
        ConnectionStatus::Disconnected => Err(anyhow!(
            "stream disconnected: {}",
            state.error.as_deref().unwrap_or("retries exhausted")
        )),
        ConnectionStatus::Closed => Ok(true),
        ConnectionStatus::Reconnecting { .. } => {
            eprintln!("{}", state.status);
            Ok(false)
        }
        _ => Ok(false),
    }
}

async fn follow<T, F>(config: &RuntimeConfig, key: SubscriptionKey, mut on_state: F) -> Result<()>
where
    T: serde::de::DeserializeOwned + tb_core::OrderedEntry + Send + Sync + 'static,
    F: FnMut(&StreamState<T>) -> Result<()>,
{
    let mut manager = connection_manager::<T>(config);
    let mut rx = manager.watch();
    manager.subscribe(key)?;
    loop {
        match next_state(&mut rx).await {
            Next::State(state) => {
                on_state(&state)?;
                if check_status(&state)? {
                    return Ok(());
                }
            }
            Next::Interrupted => {
                info!("interrupted");
                manager.disable();
                return Ok(());
            }
            Next::Ended => return Ok(()),
        }
    }
}

async fn watch_processes(config: &RuntimeConfig, key: SubscriptionKey) -> Result<()> {
    let mut last_revision = None;
    follow::<ExecutionProcess, _>(config, key, |state| {
        if last_revision == Some(state.snapshot.revision()) {
            return Ok(());
        }
        last_revision = Some(state.snapshot.revision());
        println!("-- {} processes ({})", state.snapshot.len(), state.status);
        for process in state.snapshot.ordered_values() {
            println!("{}", render::process_line(&process));
        }
        Ok(())
    })
    .await
}

async fn watch_tasks(config: &RuntimeConfig, project: &str, filter: &str) -> Result<()> {
    let filters = TaskFilters::from_query(filter);
    let mut selection = Selection::default();
    let mut last_revision = None;
    let key = SubscriptionKey::tasks_for_project(project);
    follow::<Task, _>(config, key, |state| {
        if last_revision == Some(state.snapshot.revision()) {
            return Ok(());
        }
        last_revision = Some(state.snapshot.revision());
        let tasks: Vec<Task> = state
            .snapshot
            .ordered_values()
            .into_iter()
            .map(|task| (*task).clone())
            .collect();
        let shown = filters.apply(&tasks);
        let ids: Vec<&str> = shown.iter().map(|task| task.id.as_str()).collect();
        selection.sync(&ids);
        println!("-- {} of {} tasks ({})", shown.len(), tasks.len(), state.status);
        for task in shown {
            let marker = if selection.selected_id() == Some(task.id.as_str()) {
                ">"
            } else {
                " "
            };
            println!("{marker} {}", render::task_line(task));
        }
        Ok(())
    })
    .await
}

async fn watch_logs(config: &RuntimeConfig, process: &str, raw: bool, history: bool) -> Result<()> {
    if raw && history {
        bail!("--history is only available for normalized logs");
    }
    let key = if raw {
        SubscriptionKey::raw_logs(process)
    } else {
        SubscriptionKey::normalized_logs(process)
    };
    let mut view: LiveView<ConversationEntry> = LiveView::new(history);
    let mut printed = PrintedRows::new();

    if history {
        let client = Arc::new(
            ApiClient::new(config.base_url.as_str(), config.request_timeout)
                .context("failed to build http client")?,
        );
        let source = HttpEntrySource::new(client, process, config.history_page_size);
        let instruction = view.load_more(&source).await;
        debug!(?instruction, "history_backfill");
        if let Some(err) = view.pager().error() {
            warn!("history_backfill_error: {err}");
        }
    }

    let mut manager = connection_manager::<ConversationEntry>(config);
    let mut rx = manager.watch();
    manager.subscribe(key)?;
    loop {
        match next_state(&mut rx).await {
            Next::State(state) => {
                let instruction = view.on_snapshot(state.snapshot.clone());
                debug!(?instruction, "scroll_instruction");
                for row in view.entries().iter() {
                    let change = printed.observe(&row.key, &row.value);
                    let line = render::conversation_line(&row.key, &row.value);
                    if let Some(line) = render::with_change(line, change) {
                        println!("{line}");
                    }
                }
                if check_status(&state)? {
                    return Ok(());
                }
            }
            Next::Interrupted => {
                manager.disable();
                return Ok(());
            }
            Next::Ended => return Ok(()),
        }
    }
}

async fn watch_server_logs(config: &RuntimeConfig) -> Result<()> {
    let mut printed = PrintedRows::new();
    follow::<ServerLogEntry, _>(config, SubscriptionKey::server_logs(), |state| {
        for (key, entry) in state.snapshot.ordered() {
            if printed.observe(key, entry) != RowChange::Unchanged {
                println!("{}", render::server_log_line(entry));
            }
        }
        Ok(())
    })
    .await
}

async fn watch_notifications(config: &RuntimeConfig, project: Option<&str>) -> Result<()> {
    let mut seen: HashSet<String> = HashSet::new();
    follow::<Value, _>(config, SubscriptionKey::notifications(project), |state| {
        for (key, notification) in state.snapshot.ordered() {
            if seen.insert(key.to_string()) {
                let title = notification
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or("(untitled)");
                println!("{key} {title}");
            }
        }
        Ok(())
    })
    .await
}

async fn run_countdown(requested_at: DateTime<Utc>, timeout_at: DateTime<Utc>) -> Result<()> {
    let (pause_tx, pause_rx) = watch::channel(false);
    let (mut rx, handle) = spawn_countdown(requested_at, timeout_at, Arc::new(SystemClock), pause_rx);
    println!("{}", render::countdown_label(&rx.borrow_and_update()));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let _ = pause_tx.send(true);
                break;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("{}", render::countdown_label(&rx.borrow_and_update()));
            }
        }
    }
    handle.await.context("countdown task failed")?;
    Ok(())
}

fn open_preferences(config: &RuntimeConfig) -> PreferenceStore {
    let backend: Box<dyn StorageBackend> = match SqliteBackend::open(&config.prefs_path) {
        Ok(backend) => Box::new(backend),
        Err(err) => {
            warn!("prefs_open_error: {err}");
            Box::new(MemoryBackend::new())
        }
    };
    PreferenceStore::new(backend)
}

fn parse_switch(value: &str) -> Result<bool> {
    tb_core::parse_bool_flag(value).ok_or_else(|| anyhow!("expected on/off, got '{value}'"))
}

fn run_prefs(config: &RuntimeConfig, action: PrefsCommands) -> Result<()> {
    let mut store = open_preferences(config);
    match action {
        PrefsCommands::Show { project } => {
            println!("compact_view: {}", store.compact_view());
            if let Some(project) = project {
                println!(
                    "base_branch[{project}]: {}",
                    store.base_branch(&project).unwrap_or_else(|| "-".to_string())
                );
            }
        }
        PrefsCommands::Compact { enabled } => store.set_compact_view(parse_switch(&enabled)?),
        PrefsCommands::Collapse { section, collapsed } => {
            store.set_section_collapsed(&section, parse_switch(&collapsed)?)
        }
        PrefsCommands::BaseBranch { project, branch } => {
            store.set_base_branch(&project, branch.as_deref())
        }
    }
    for key in store.unsaved_keys() {
        eprintln!("not saved: {key}");
    }
    Ok(())
}
