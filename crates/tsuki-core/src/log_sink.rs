//! Durable, append-only narrative log shared by every phase.
//!
//! Each line is `[YYYY-MM-DD HH:MM:SS] <text>`, written to the log file and
//! mirrored to the terminal. The file is opened once per run: primary path
//! under the home directory, then a fixed temp path, then a unique temp path.
//! Whichever opens first is used for the rest of the run.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;

use crate::account_db::{chown_to_account, AccountIds};
use crate::atomic_io::set_mode;
use crate::time_utils::{current_unix_timestamp_ms, local_log_timestamp};

pub const DEFAULT_LOG_RELATIVE_PATH: &str = "logs/tsuki-setup.log";
pub const FALLBACK_DIR_NAME: &str = "tsuki-setup";
pub const FALLBACK_FILE_NAME: &str = "tsuki-setup.log";
/// `<prefix><unix ms>.log` names the last-resort per-run file.
pub const UNIQUE_FALLBACK_PREFIX: &str = "tsuki-setup-";
const FALLBACK_DIR_MODE: u32 = 0o1777;

/// Which attempt produced the open log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSinkLocation {
    Primary,
    TempFixed,
    TempUnique,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSinkConfig {
    pub primary_path: PathBuf,
    pub fallback_dir: PathBuf,
    /// Account to hand the file to when running privileged on its behalf.
    pub owner: Option<AccountIds>,
}

impl LogSinkConfig {
    pub fn for_home(home_dir: &Path, owner: Option<AccountIds>) -> Self {
        Self {
            primary_path: home_dir.join(DEFAULT_LOG_RELATIVE_PATH),
            fallback_dir: std::env::temp_dir().join(FALLBACK_DIR_NAME),
            owner,
        }
    }
}

#[derive(Debug, Error)]
#[error("no writable log destination: primary '{}' and fallbacks under '{}' all failed ({last_error})", primary.display(), fallback_dir.display())]
pub struct LogSinkError {
    pub primary: PathBuf,
    pub fallback_dir: PathBuf,
    pub last_error: String,
}

pub struct LogSink {
    path: PathBuf,
    location: LogSinkLocation,
    inner: Mutex<LogSinkInner>,
}

struct LogSinkInner {
    file: File,
    terminal: Box<dyn Write + Send>,
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("path", &self.path)
            .field("location", &self.location)
            .finish()
    }
}

impl LogSink {
    /// Opens the sink mirroring to stdout.
    pub fn open(config: &LogSinkConfig) -> Result<Self, LogSinkError> {
        Self::open_with_terminal(config, Box::new(std::io::stdout()))
    }

    pub fn open_with_terminal(
        config: &LogSinkConfig,
        terminal: Box<dyn Write + Send>,
    ) -> Result<Self, LogSinkError> {
        let mut failures = Vec::new();
        let unique_name = format!("{UNIQUE_FALLBACK_PREFIX}{}.log", current_unix_timestamp_ms());
        let candidates = [
            (LogSinkLocation::Primary, config.primary_path.clone()),
            (
                LogSinkLocation::TempFixed,
                config.fallback_dir.join(FALLBACK_FILE_NAME),
            ),
            (
                LogSinkLocation::TempUnique,
                config.fallback_dir.join(unique_name),
            ),
        ];

        for (location, path) in candidates {
            match open_append(&path, location != LogSinkLocation::Primary) {
                Ok(file) => {
                    if let Some(owner) = config.owner {
                        if let Err(error) = chown_to_account(&path, owner) {
                            tracing::warn!(
                                path = %path.display(),
                                %error,
                                "could not hand log file to target account"
                            );
                        }
                    }
                    let sink = Self {
                        path,
                        location,
                        inner: Mutex::new(LogSinkInner { file, terminal }),
                    };
                    if !failures.is_empty() {
                        let _ = sink.line(&format!(
                            "log fallback in use: {} ({})",
                            sink.path.display(),
                            failures.join("; ")
                        ));
                    }
                    return Ok(sink);
                }
                Err(error) => failures.push(format!("{}: {error:#}", path.display())),
            }
        }

        Err(LogSinkError {
            primary: config.primary_path.clone(),
            fallback_dir: config.fallback_dir.clone(),
            last_error: failures.pop().unwrap_or_default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn location(&self) -> LogSinkLocation {
        self.location
    }

    /// Appends one timestamped line to the file, then mirrors it to the terminal.
    ///
    /// Multi-line text becomes one prefixed line per input line. File errors are
    /// returned; terminal errors are ignored.
    pub fn line(&self, text: &str) -> Result<()> {
        let timestamp = local_log_timestamp();
        let mut rendered = String::new();
        for part in text.lines() {
            rendered.push_str(&format!("[{timestamp}] {part}\n"));
        }
        if rendered.is_empty() {
            rendered = format!("[{timestamp}] \n");
        }

        let mut inner = self.lock();
        inner
            .file
            .write_all(rendered.as_bytes())
            .and_then(|()| inner.file.flush())
            .with_context(|| format!("failed to append to log {}", self.path.display()))?;
        let _ = inner.terminal.write_all(rendered.as_bytes());
        let _ = inner.terminal.flush();
        Ok(())
    }

    /// A second handle on the same append-mode file, for a child's stdout/stderr.
    pub fn file_for_child(&self) -> Result<File> {
        self.lock()
            .file
            .try_clone()
            .with_context(|| format!("failed to duplicate log handle {}", self.path.display()))
    }

    fn lock(&self) -> MutexGuard<'_, LogSinkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn open_append(path: &Path, shared_dir: bool) -> Result<File> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        let existed = parent.is_dir();
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        if shared_dir && !existed {
            if let Err(error) = set_mode(parent, FALLBACK_DIR_MODE) {
                tracing::debug!(%error, "fallback log dir mode left unchanged");
            }
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}
