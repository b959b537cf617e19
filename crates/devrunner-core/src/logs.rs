//! Per-session log files.
//!
//! The child's combined stdout/stderr is redirected straight into the session
//! file at launch. The supervisor only appends its own marker lines through
//! the same append-mode file, so readers never race with anything beyond
//! ordinary read-during-append.

use crate::error::{SupervisorError, SupervisorResult};
use chrono::{DateTime, Local};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub const LOG_PREFIX: &str = "dev-runner-";
pub const LOG_EXTENSION: &str = ".log";

/// `dev-runner-<YYYYMMDD-HHMMSS>.log`
pub fn session_file_name(at: &DateTime<Local>) -> String {
    format!("{LOG_PREFIX}{}{LOG_EXTENSION}", at.format("%Y%m%d-%H%M%S"))
}

fn is_session_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(LOG_PREFIX) && name.ends_with(LOG_EXTENSION))
}

/// Sorts session files by timestamp, then by the suffix added on same-second collisions
fn session_order(path: &Path) -> (String, u32) {
    let stem = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_prefix(LOG_PREFIX))
        .and_then(|name| name.strip_suffix(LOG_EXTENSION))
        .unwrap_or_default();
    match stem.rsplit_once('-') {
        Some((stamp, n)) if stamp.contains('-') => (stamp.to_string(), n.parse().unwrap_or(0)),
        _ => (stem.to_string(), 0),
    }
}

/// One launch attempt's log file
#[derive(Debug, Clone)]
pub struct LogSession {
    path: PathBuf,
    opened_at: DateTime<Local>,
    file: Arc<tokio::sync::Mutex<File>>,
}

impl LogSession {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn opened_at(&self) -> DateTime<Local> {
        self.opened_at
    }

    pub async fn append(&self, bytes: &[u8]) -> io::Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(bytes).await?;
        file.flush().await
    }

    /// Supervisor marker line, prefixed so it stands out from child output
    pub async fn note(&self, message: &str) -> io::Result<()> {
        let line = format!(
            "[dev-runner {}] {message}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        self.append(line.as_bytes()).await
    }

    /// Independent handle on the same append-mode file, for child redirection
    pub async fn stdio_file(&self) -> io::Result<std::fs::File> {
        let file = self.file.lock().await;
        Ok(file.try_clone().await?.into_std().await)
    }
}

/// Owns the log directory and the active session
#[derive(Debug)]
pub struct LogSink {
    dir: PathBuf,
    current: Mutex<Option<LogSession>>,
}

impl LogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            current: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start a new session named after the current time
    pub async fn open(&self) -> SupervisorResult<LogSession> {
        self.open_at(Local::now()).await
    }

    pub async fn open_at(&self, opened_at: DateTime<Local>) -> SupervisorResult<LogSession> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| SupervisorError::LogOpenError {
                path: self.dir.clone(),
                source,
            })?;

        let base = session_file_name(&opened_at);
        let stem = base.trim_end_matches(LOG_EXTENSION);
        let mut suffix = 0u32;
        let (path, file) = loop {
            let name = match suffix {
                0 => base.clone(),
                n => format!("{stem}-{n}{LOG_EXTENSION}"),
            };
            let path = self.dir.join(name);
            match OpenOptions::new()
                .create_new(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => break (path, file),
                // Same second as an earlier session; never clobber it
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(source) => return Err(SupervisorError::LogOpenError { path, source }),
            }
        };

        info!(path = %path.display(), "Opened log session");
        let session = LogSession {
            path,
            opened_at,
            file: Arc::new(tokio::sync::Mutex::new(file)),
        };
        self.set_current(Some(session.clone()));
        Ok(session)
    }

    pub fn current(&self) -> Option<LogSession> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_current(&self, session: Option<LogSession>) {
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = session;
    }

    /// The active session file, else the newest `dev-runner-*.log`
    pub async fn latest_log(&self) -> SupervisorResult<PathBuf> {
        if let Some(session) = self.current() {
            return Ok(session.path);
        }

        let no_logs = || SupervisorError::NoLogsFound {
            dir: self.dir.clone(),
        };

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(no_logs()),
            Err(e) => return Err(anyhow::Error::from(e).into()),
        };

        let mut newest: Option<((SystemTime, (String, u32)), PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await.map_err(anyhow::Error::from)? {
            let path = entry.path();
            if !is_session_file(&path) {
                continue;
            }
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            let rank = (modified, session_order(&path));
            if newest.as_ref().is_none_or(|(best, _)| rank > *best) {
                newest = Some((rank, path));
            }
        }

        newest.map(|(_, path)| path).ok_or_else(no_logs)
    }

    /// Last `n` lines of the active or most recent session
    pub async fn tail(&self, n: usize) -> SupervisorResult<Vec<String>> {
        let path = self.latest_log().await?;
        debug!(path = %path.display(), n, "Reading log tail");
        tail_file(&path, n).await.map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => SupervisorError::NoLogsFound {
                dir: self.dir.clone(),
            },
            _ => SupervisorError::LogOpenError { path, source },
        })
    }
}

/// Last `n` lines of a file, oldest first
pub async fn tail_file(path: &Path, n: usize) -> io::Result<Vec<String>> {
    let bytes = tokio::fs::read(path).await?;
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|line| line.to_string()).collect())
}
