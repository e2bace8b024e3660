//! PID-stamped guard file serializing orchestrator invocations.
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub const GUARD_FILE_NAME: &str = ".tsuki-setup.lock";
const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("another tsuki-setup invocation (pid {pid}) holds {}", path.display())]
    Busy { path: PathBuf, pid: u32 },
    #[error("failed to acquire guard {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Contents of a guard file: owning pid and the boot it was taken in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardStamp {
    pub pid: u32,
    pub boot_id: Option<String>,
}

impl GuardStamp {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            boot_id: current_boot_id(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let mut fields = raw.split_whitespace();
        let pid = fields.next()?.parse::<u32>().ok()?;
        let boot_id = fields.next().map(str::to_string);
        Some(Self { pid, boot_id })
    }

    pub fn render(&self) -> String {
        match self.boot_id.as_deref() {
            Some(boot_id) => format!("{} {boot_id}\n", self.pid),
            None => format!("{}\n", self.pid),
        }
    }

    /// A stamp is stale when it was taken in another boot or its process is gone.
    pub fn is_stale(&self, current_boot_id: Option<&str>) -> bool {
        if let (Some(recorded), Some(current)) = (self.boot_id.as_deref(), current_boot_id) {
            if recorded != current {
                return true;
            }
        }
        !process_alive(self.pid)
    }
}

/// Held for the lifetime of one invocation; removes the guard file on drop.
#[derive(Debug)]
pub struct InvocationGuard {
    path: PathBuf,
    stamp: GuardStamp,
}

impl InvocationGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        let still_ours = fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| GuardStamp::parse(&raw))
            .is_some_and(|stamp| stamp.pid == self.stamp.pid);
        if still_ours {
            let _ = fs::remove_file(&self.path);
        }
    }
}

pub fn acquire_invocation_guard(path: &Path) -> Result<InvocationGuard, GuardError> {
    let io_error = |source: std::io::Error| GuardError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    let stamp = GuardStamp::current();
    for _ in 0..MAX_ACQUIRE_ATTEMPTS {
        match OpenOptions::new().create_new(true).write(true).open(path) {
            Ok(mut file) => {
                file.write_all(stamp.render().as_bytes())
                    .and_then(|()| file.flush())
                    .map_err(io_error)?;
                return Ok(InvocationGuard {
                    path: path.to_path_buf(),
                    stamp,
                });
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                let existing = fs::read_to_string(path)
                    .ok()
                    .and_then(|raw| GuardStamp::parse(&raw));
                match existing {
                    Some(holder) if !holder.is_stale(stamp.boot_id.as_deref()) => {
                        return Err(GuardError::Busy {
                            path: path.to_path_buf(),
                            pid: holder.pid,
                        });
                    }
                    _ => {
                        tracing::info!(path = %path.display(), "reclaiming stale invocation guard");
                        match fs::remove_file(path) {
                            Ok(()) => {}
                            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                            Err(error) => return Err(io_error(error)),
                        }
                    }
                }
            }
            Err(error) => return Err(io_error(error)),
        }
    }
    Err(io_error(std::io::Error::new(
        std::io::ErrorKind::WouldBlock,
        "guard kept reappearing while reclaiming",
    )))
}

fn current_boot_id() -> Option<String> {
    fs::read_to_string(BOOT_ID_PATH)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn process_alive(pid: u32) -> bool {
    pid != 0 && Path::new("/proc").join(pid.to_string()).exists()
}
