//! Boot-time triggers that re-invoke the orchestrator.
//!
//! Exactly one strategy is active at a time. Installing either strategy first
//! removes the other, so a host never runs the orchestrator twice per boot.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tsuki_core::{set_mode, write_text_atomic, LogSink, TARGET_ACCOUNT_ENV};

use crate::service_unit::{ServiceDefinition, UnitScope, APP_UNIT_NAME};
use crate::unit_install::UnitInstaller;

pub const AUTOSTART_MARKER: &str = "# tsuki-setup autostart";
pub const SERVICE_HOOK_UNIT_NAME: &str = "tsuki-setup.service";
pub const DEFAULT_RC_LOCAL_PATH: &str = "/etc/rc.local";
const RC_LOCAL_BACKUP_SUFFIX: &str = "tsuki-setup.bak";
const RC_LOCAL_SHEBANG: &str = "#!/bin/sh -e";
const RC_LOCAL_EXIT: &str = "exit 0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutostartStrategy {
    InitHook,
    ServiceHook,
}

impl AutostartStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            AutostartStrategy::InitHook => "init-hook",
            AutostartStrategy::ServiceHook => "service-hook",
        }
    }

    /// Scope the triggered orchestrator installs the application unit into.
    pub fn application_scope(self) -> UnitScope {
        match self {
            AutostartStrategy::InitHook => UnitScope::User,
            AutostartStrategy::ServiceHook => UnitScope::System,
        }
    }

    fn other(self) -> Self {
        match self {
            AutostartStrategy::InitHook => AutostartStrategy::ServiceHook,
            AutostartStrategy::ServiceHook => AutostartStrategy::InitHook,
        }
    }
}

#[derive(Debug, Error)]
pub enum AutostartError {
    #[error("installing or removing autostart triggers requires root; re-run with sudo")]
    PrivilegeRequired,
    #[error("failed to {action} {strategy} autostart trigger: {reason}")]
    Failed {
        action: &'static str,
        strategy: &'static str,
        reason: String,
    },
}

/// Which triggers are present on the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstalledTriggers {
    pub init_hook: bool,
    pub service_hook: bool,
}

impl InstalledTriggers {
    pub fn active(self) -> Vec<AutostartStrategy> {
        let mut active = Vec::new();
        if self.init_hook {
            active.push(AutostartStrategy::InitHook);
        }
        if self.service_hook {
            active.push(AutostartStrategy::ServiceHook);
        }
        active
    }

    pub fn is_duplicated(self) -> bool {
        self.init_hook && self.service_hook
    }
}

pub fn render_init_hook_line(orchestrator: &Path, account: &str) -> String {
    format!(
        "{TARGET_ACCOUNT_ENV}={} {} --unit-scope {} &  {AUTOSTART_MARKER}",
        shell_words::quote(account),
        shell_words::quote(&orchestrator.display().to_string()),
        AutostartStrategy::InitHook.application_scope().as_str()
    )
}

/// Returns the script with `line` hooked in, or `None` when the marker is already present.
pub fn apply_init_hook(existing: Option<&str>, line: &str) -> Option<String> {
    let Some(existing) = existing else {
        return Some(format!("{RC_LOCAL_SHEBANG}\n\n{line}\n\n{RC_LOCAL_EXIT}\n"));
    };
    if existing.contains(AUTOSTART_MARKER) {
        return None;
    }

    let mut lines = existing.lines().map(str::to_string).collect::<Vec<_>>();
    let exit_index = lines
        .iter()
        .rposition(|candidate| !candidate.trim().is_empty())
        .filter(|index| lines[*index].trim() == RC_LOCAL_EXIT);
    match exit_index {
        Some(index) => lines.insert(index, line.to_string()),
        None => lines.push(line.to_string()),
    }
    let mut updated = lines.join("\n");
    updated.push('\n');
    Some(updated)
}

/// Removes every marker-tagged line; `None` when nothing was hooked.
pub fn strip_init_hook(existing: &str) -> Option<String> {
    if !existing.contains(AUTOSTART_MARKER) {
        return None;
    }
    let mut kept = existing
        .lines()
        .filter(|line| !line.contains(AUTOSTART_MARKER))
        .collect::<Vec<_>>()
        .join("\n");
    kept.push('\n');
    Some(kept)
}

pub fn service_hook_definition(orchestrator: &Path, account: &str) -> ServiceDefinition {
    ServiceDefinition {
        name: SERVICE_HOOK_UNIT_NAME.to_string(),
        description: "TSUKIMI device provisioning and autostart".to_string(),
        after: vec!["network-online.target".to_string(), APP_UNIT_NAME.to_string()],
        wants: vec!["network-online.target".to_string()],
        service_type: "oneshot".to_string(),
        remain_after_exit: true,
        user: None,
        working_directory: None,
        environment: vec![(TARGET_ACCOUNT_ENV.to_string(), account.to_string())],
        exec_start: vec![
            orchestrator.display().to_string(),
            "--unit-scope".to_string(),
            AutostartStrategy::ServiceHook
                .application_scope()
                .as_str()
                .to_string(),
        ],
        restart_sec: None,
        standard_output: None,
        standard_error: None,
        wanted_by: UnitScope::System.install_target().to_string(),
    }
}

pub struct AutostartSelector<'a> {
    installer: &'a UnitInstaller<'a>,
    sink: &'a LogSink,
    rc_local_path: PathBuf,
    account: String,
    privileged: bool,
}

impl<'a> AutostartSelector<'a> {
    pub fn new(
        installer: &'a UnitInstaller<'a>,
        sink: &'a LogSink,
        rc_local_path: &Path,
        account: &str,
        privileged: bool,
    ) -> Self {
        Self {
            installer,
            sink,
            rc_local_path: rc_local_path.to_path_buf(),
            account: account.to_string(),
            privileged,
        }
    }

    pub fn detect(&self) -> InstalledTriggers {
        detect_triggers(
            &self.rc_local_path,
            &self
                .installer
                .unit_path(SERVICE_HOOK_UNIT_NAME, UnitScope::System),
        )
    }

    /// Removes the other strategy, then installs `strategy` idempotently.
    pub fn install(
        &self,
        strategy: AutostartStrategy,
        orchestrator: &Path,
    ) -> Result<(), AutostartError> {
        if !self.privileged {
            return Err(AutostartError::PrivilegeRequired);
        }
        let other = strategy.other();
        if self.remove(other)? {
            self.note(&format!(
                "removed {} autostart trigger before installing {}",
                other.as_str(),
                strategy.as_str()
            ));
        }

        let outcome = match strategy {
            AutostartStrategy::InitHook => self.install_init_hook(orchestrator),
            AutostartStrategy::ServiceHook => self.install_service_hook(orchestrator),
        };
        outcome.map_err(|error| failed("install", strategy, error))?;
        self.note(&format!(
            "{} autostart trigger active for account {}",
            strategy.as_str(),
            self.account
        ));
        Ok(())
    }

    /// Removes both strategies; returns the ones that were present.
    pub fn remove_all(&self) -> Result<Vec<AutostartStrategy>, AutostartError> {
        if !self.privileged {
            return Err(AutostartError::PrivilegeRequired);
        }
        let mut removed = Vec::new();
        for strategy in [AutostartStrategy::InitHook, AutostartStrategy::ServiceHook] {
            if self.remove(strategy)? {
                self.note(&format!("removed {} autostart trigger", strategy.as_str()));
                removed.push(strategy);
            }
        }
        Ok(removed)
    }

    fn remove(&self, strategy: AutostartStrategy) -> Result<bool, AutostartError> {
        match strategy {
            AutostartStrategy::InitHook => self
                .remove_init_hook()
                .map_err(|error| failed("remove", strategy, error)),
            AutostartStrategy::ServiceHook => self
                .installer
                .remove(SERVICE_HOOK_UNIT_NAME, UnitScope::System)
                .map_err(|error| failed("remove", strategy, error.into())),
        }
    }

    fn install_init_hook(&self, orchestrator: &Path) -> Result<()> {
        let existing = match std::fs::read_to_string(&self.rc_local_path) {
            Ok(content) => Some(content),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read {}", self.rc_local_path.display()))
            }
        };
        let line = render_init_hook_line(orchestrator, &self.account);
        let Some(updated) = apply_init_hook(existing.as_deref(), &line) else {
            self.note(&format!(
                "{} already carries the autostart marker",
                self.rc_local_path.display()
            ));
            return Ok(());
        };
        if let Some(original) = existing.as_deref() {
            self.backup_once(original)?;
        }
        write_text_atomic(&self.rc_local_path, &updated)?;
        set_mode(&self.rc_local_path, 0o755)?;
        self.note(&format!("hooked {}", self.rc_local_path.display()));
        Ok(())
    }

    fn remove_init_hook(&self) -> Result<bool> {
        let existing = match std::fs::read_to_string(&self.rc_local_path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read {}", self.rc_local_path.display()))
            }
        };
        let Some(stripped) = strip_init_hook(&existing) else {
            return Ok(false);
        };
        write_text_atomic(&self.rc_local_path, &stripped)?;
        set_mode(&self.rc_local_path, 0o755)?;
        Ok(true)
    }

    fn install_service_hook(&self, orchestrator: &Path) -> Result<()> {
        let definition = service_hook_definition(orchestrator, &self.account);
        self.installer.install(&definition, UnitScope::System)?;
        Ok(())
    }

    fn backup_once(&self, original: &str) -> Result<()> {
        let backup = backup_path(&self.rc_local_path);
        if backup.exists() {
            return Ok(());
        }
        write_text_atomic(&backup, original)
    }

    fn note(&self, text: &str) {
        if let Err(error) = self.sink.line(text) {
            tracing::error!(error = %format!("{error:#}"), "log sink write failed");
        }
    }
}

/// Reads the host state only; safe without privilege.
pub fn detect_triggers(rc_local_path: &Path, service_hook_unit_path: &Path) -> InstalledTriggers {
    let init_hook = std::fs::read_to_string(rc_local_path)
        .map(|content| content.contains(AUTOSTART_MARKER))
        .unwrap_or(false);
    InstalledTriggers {
        init_hook,
        service_hook: service_hook_unit_path.exists(),
    }
}

pub fn backup_path(rc_local_path: &Path) -> PathBuf {
    let mut name = rc_local_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "rc.local".to_string());
    name.push('.');
    name.push_str(RC_LOCAL_BACKUP_SUFFIX);
    rc_local_path.with_file_name(name)
}

fn failed(action: &'static str, strategy: AutostartStrategy, error: anyhow::Error) -> AutostartError {
    AutostartError::Failed {
        action,
        strategy: strategy.as_str(),
        reason: format!("{error:#}"),
    }
}
