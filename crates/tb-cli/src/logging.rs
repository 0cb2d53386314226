use chrono::NaiveDate;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

use crate::config::RuntimeConfig;

/// Filter directives; wins over the configured level.
pub const LOG_FILTER_ENV: &str = "TASKBOARD_LOG";

/// Keeps the shared log file open for the life of the process.
pub struct LogGuard {
    _file: Option<Arc<Mutex<File>>>,
}

/// Log lines go to stderr and/or the log file, never stdout: stdout carries
/// the stream rows.
struct LogSink {
    stderr: bool,
    file: Option<Arc<Mutex<File>>>,
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stderr {
            let _ = io::stderr().write_all(buf);
        }
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stderr {
            let _ = io::stderr().flush();
        }
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.flush();
        }
        Ok(())
    }
}

pub fn log_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_ENV)
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init_logging(config: &RuntimeConfig, command: &str) -> Option<LogGuard> {
    let today = chrono::Local::now().date_naive();
    let file = match open_log_file(&config.log_dir, command, today) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };
    let guard = LogGuard {
        _file: file.clone(),
    };
    let stderr = config.log_stderr;
    let make_writer = BoxMakeWriter::new(move || LogSink {
        stderr,
        file: file.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(log_filter(&config.log_level))
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

/// `<dir>/taskboard-<command>-<date>.log`, one file per command per day.
pub fn log_file_path(log_dir: &Path, command: &str, day: NaiveDate) -> PathBuf {
    log_dir.join(format!(
        "taskboard-{}-{}.log",
        sanitize_component(command),
        day.format("%Y-%m-%d")
    ))
}

fn open_log_file(
    log_dir: &str,
    command: &str,
    day: NaiveDate,
) -> io::Result<Option<Arc<Mutex<File>>>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(log_dir.trim());
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path(&dir, command, day))?;
    Ok(Some(Arc::new(Mutex::new(file))))
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
            _ => '_',
        })
        .collect()
}
