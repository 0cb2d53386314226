use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tb_core::parse_bool_flag;
use tb_stream::ReconnectPolicy;
use url::Url;

use crate::GlobalArgs;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 200;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Optional `config.toml`; every field can be overridden by a flag or a
/// `TASKBOARD_*` variable.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub base_url: Option<String>,
    pub log_level: Option<String>,
    pub log_dir: Option<String>,
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub history_page_size: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub prefs_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub base_url: Url,
    pub policy: ReconnectPolicy,
    pub history_page_size: usize,
    pub request_timeout: Duration,
    pub log_level: String,
    pub log_dir: String,
    pub log_stderr: bool,
    pub prefs_path: PathBuf,
}

pub fn load_config(args: &GlobalArgs) -> Result<RuntimeConfig> {
    let path = args.config.clone().unwrap_or_else(config_path);
    let file = load_file_config(&path)?;
    build_runtime_config(args, file)
}

pub fn build_runtime_config(args: &GlobalArgs, file: FileConfig) -> Result<RuntimeConfig> {
    let base_url = resolve_base_url(&args.base_url, file.base_url.as_deref())?;
    let log_dir = resolve_log_dir(&args.log_dir, file.log_dir.as_deref());
    let defaults = ReconnectPolicy::default();
    let policy = ReconnectPolicy {
        base_delay: file
            .base_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.base_delay),
        max_delay: file
            .max_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_delay),
        max_retries: args
            .max_retries
            .or_else(|| env_value("TASKBOARD_MAX_RETRIES").and_then(|value| value.parse().ok()))
            .or(file.max_retries)
            .unwrap_or(defaults.max_retries),
    };
    Ok(RuntimeConfig {
        base_url,
        policy,
        history_page_size: file
            .history_page_size
            .unwrap_or(DEFAULT_HISTORY_PAGE_SIZE),
        request_timeout: Duration::from_secs(
            file.request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        ),
        log_level: resolve_log_level(file.log_level.as_deref()),
        log_stderr: resolve_log_stderr(&log_dir),
        log_dir,
        prefs_path: resolve_prefs_path(file.prefs_path.as_deref()),
    })
}

pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_base_url(flag: &str, file: Option<&str>) -> Result<Url> {
    let raw = if !flag.trim().is_empty() {
        flag.trim().to_string()
    } else if let Some(value) = env_value("TASKBOARD_BASE_URL") {
        value
    } else if let Some(value) = file.filter(|value| !value.trim().is_empty()) {
        value.trim().to_string()
    } else {
        DEFAULT_BASE_URL.to_string()
    };
    parse_base_url(&raw)
}

pub fn parse_base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("invalid base url '{raw}'"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => bail!("base url must be http or https, got '{other}'"),
    }
}

fn resolve_log_level(file: Option<&str>) -> String {
    env_value("TASKBOARD_LOG_LEVEL")
        .or_else(|| file.map(str::to_string))
        .unwrap_or_else(|| "info".to_string())
}

fn resolve_log_dir(flag: &str, file: Option<&str>) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Some(value) = env_value("TASKBOARD_LOG_DIR") {
        return value;
    }
    file.map(str::to_string).unwrap_or_default()
}

/// Without a log dir, logs go to stderr unless turned off.
fn resolve_log_stderr(log_dir: &str) -> bool {
    env_value("TASKBOARD_LOG_STDERR")
        .and_then(|value| parse_bool_flag(&value))
        .unwrap_or_else(|| log_dir.trim().is_empty())
}

fn resolve_prefs_path(file: Option<&str>) -> PathBuf {
    if let Some(value) = env_value("TASKBOARD_PREFS_PATH") {
        return PathBuf::from(value);
    }
    if let Some(value) = file.filter(|value| !value.trim().is_empty()) {
        return PathBuf::from(value);
    }
    state_dir().join("taskboard/prefs.sqlite3")
}

fn config_path() -> PathBuf {
    if let Some(path) = env_value("TASKBOARD_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    config_dir().join("taskboard/config.toml")
}

fn state_dir() -> PathBuf {
    if let Some(path) = env_value("XDG_STATE_HOME") {
        return PathBuf::from(path);
    }
    home_dir().join(".local/state")
}

fn config_dir() -> PathBuf {
    if let Some(path) = env_value("XDG_CONFIG_HOME") {
        return PathBuf::from(path);
    }
    home_dir().join(".config")
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}
