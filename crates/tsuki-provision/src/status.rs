//! Read-only inspection of a host's provisioning and autostart state.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tsuki_core::log_sink::{FALLBACK_FILE_NAME, UNIQUE_FALLBACK_PREFIX};
use tsuki_core::{EnvironmentContext, LogSinkConfig, GUARD_FILE_NAME};
use tsuki_ops::{
    detect_triggers, systemctl_for, ApplicationSpec, CommandRunner, UnitPaths, UnitScope,
    APP_UNIT_NAME, AUDIO_UNIT_NAME, SERVICE_HOOK_UNIT_NAME,
};

use crate::setup_state::{SetupMarker, SetupTracker};

pub const SETUP_STATUS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitStatus {
    pub name: String,
    pub scope: String,
    pub path: String,
    pub installed: bool,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupStatusReport {
    pub schema_version: u32,
    pub account: String,
    pub account_source: String,
    pub home_dir: String,
    pub project_dir: String,
    pub project_dir_exists: bool,
    pub privileged: bool,
    pub setup_complete: bool,
    pub marker_path: String,
    pub marker: Option<SetupMarker>,
    pub log_path: Option<String>,
    pub application_binary: String,
    pub application_binary_exists: bool,
    pub units: Vec<UnitStatus>,
    pub autostart_triggers: Vec<String>,
    pub guard_present: bool,
    pub diagnostics: Vec<String>,
}

pub struct StatusInputs<'a> {
    pub context: &'a EnvironmentContext,
    pub tracker: &'a SetupTracker,
    pub application: &'a ApplicationSpec,
    pub unit_paths: &'a UnitPaths,
    pub rc_local_path: &'a Path,
}

pub fn inspect_setup_status(
    runner: &dyn CommandRunner,
    inputs: &StatusInputs<'_>,
) -> SetupStatusReport {
    let context = inputs.context;
    let mut units = Vec::new();
    for (name, scope) in [
        (APP_UNIT_NAME, UnitScope::System),
        (APP_UNIT_NAME, UnitScope::User),
        (AUDIO_UNIT_NAME, UnitScope::User),
    ] {
        units.push(unit_status(runner, context, inputs.unit_paths, name, scope));
    }

    let triggers = detect_triggers(
        inputs.rc_local_path,
        &inputs.unit_paths.system_dir.join(SERVICE_HOOK_UNIT_NAME),
    );
    let binary = inputs.application.binary_path(context);
    let setup_complete = inputs.tracker.is_complete();
    let application_binary_exists = binary.is_file();
    let app_units_installed = units
        .iter()
        .filter(|unit| unit.name == APP_UNIT_NAME && unit.installed)
        .count();

    let mut diagnostics = Vec::new();
    if triggers.is_duplicated() {
        diagnostics.push("duplicate_autostart_triggers".to_string());
    }
    if triggers.active().is_empty() {
        diagnostics.push("no_autostart_trigger".to_string());
    }
    if !context.project_dir_exists() {
        diagnostics.push("project_dir_missing".to_string());
    }
    if setup_complete && !application_binary_exists {
        diagnostics.push("application_binary_missing".to_string());
    }
    if setup_complete && app_units_installed == 0 {
        diagnostics.push("application_unit_missing".to_string());
    }
    if app_units_installed > 1 {
        diagnostics.push("application_unit_in_both_scopes".to_string());
    }

    SetupStatusReport {
        schema_version: SETUP_STATUS_SCHEMA_VERSION,
        account: context.account().to_string(),
        account_source: context.source().as_str().to_string(),
        home_dir: context.home_dir().display().to_string(),
        project_dir: context.project_dir().display().to_string(),
        project_dir_exists: context.project_dir_exists(),
        privileged: context.privileged(),
        setup_complete,
        marker_path: inputs.tracker.marker_path().display().to_string(),
        marker: inputs.tracker.read(),
        log_path: existing_log_path(&LogSinkConfig::for_home(context.home_dir(), None))
            .map(|path| path.display().to_string()),
        application_binary: binary.display().to_string(),
        application_binary_exists,
        units,
        autostart_triggers: triggers
            .active()
            .into_iter()
            .map(|strategy| strategy.as_str().to_string())
            .collect(),
        guard_present: context.home_dir().join(GUARD_FILE_NAME).exists(),
        diagnostics,
    }
}

pub fn render_setup_status_report(report: &SetupStatusReport) -> String {
    let units = report
        .units
        .iter()
        .map(|unit| {
            format!(
                "{}@{}(installed={} active={})",
                unit.name, unit.scope, unit.installed, unit.active
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "tsuki-setup status: account={} account_source={} home={} project={} project_exists={} privileged={} setup_complete={} marker={} completed_at={} log={} app_binary={} app_binary_exists={} units={} autostart={} guard_present={} diagnostics={}",
        report.account,
        report.account_source,
        report.home_dir,
        report.project_dir,
        report.project_dir_exists,
        report.privileged,
        report.setup_complete,
        report.marker_path,
        report
            .marker
            .as_ref()
            .map(|marker| marker.completed_at.as_str())
            .unwrap_or("none"),
        report.log_path.as_deref().unwrap_or("none"),
        report.application_binary,
        report.application_binary_exists,
        units,
        if report.autostart_triggers.is_empty() {
            "none".to_string()
        } else {
            report.autostart_triggers.join(",")
        },
        report.guard_present,
        if report.diagnostics.is_empty() {
            "none".to_string()
        } else {
            report.diagnostics.join(",")
        }
    )
}

fn unit_status(
    runner: &dyn CommandRunner,
    context: &EnvironmentContext,
    unit_paths: &UnitPaths,
    name: &str,
    scope: UnitScope,
) -> UnitStatus {
    let path = scope.unit_dir(context, &unit_paths.system_dir).join(name);
    let installed = path.exists();
    let active = installed
        && runner.probe(&systemctl_for(scope, context).args(["is-active", "--quiet", name]));
    UnitStatus {
        name: name.to_string(),
        scope: scope.as_str().to_string(),
        path: path.display().to_string(),
        installed,
        active,
    }
}

/// Primary, then fixed temp, then the newest per-run temp file.
fn existing_log_path(config: &LogSinkConfig) -> Option<PathBuf> {
    [
        config.primary_path.clone(),
        config.fallback_dir.join(FALLBACK_FILE_NAME),
    ]
    .into_iter()
    .find(|path| path.is_file())
    .or_else(|| newest_unique_fallback(&config.fallback_dir))
}

fn newest_unique_fallback(fallback_dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(fallback_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_name().to_str().is_some_and(|name| {
                name.starts_with(UNIQUE_FALLBACK_PREFIX) && name.ends_with(".log")
            })
        })
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .max_by_key(|path| {
            (
                path.metadata().and_then(|meta| meta.modified()).ok(),
                path.file_name().map(|name| name.to_os_string()),
            )
        })
}
