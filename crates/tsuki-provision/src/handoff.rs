//! Launches the resident application once provisioning is done.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tsuki_core::{EnvironmentContext, LogSink};
use tsuki_ops::{
    ApplicationSpec, CommandRunner, CommandSpec, CommandStatus, LaunchMode, LaunchOutcome,
    UnitAction, UnitInstaller, UnitPaths, UnitScope, APP_UNIT_NAME,
};

use crate::app_control::installed_application_scope;

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error(
        "application binary {} is missing; remove {} to provision again or build the project manually",
        path.display(),
        marker.display()
    )]
    BinaryMissing { path: PathBuf, marker: PathBuf },
    #[error("failed to launch {}: {reason}", path.display())]
    Launch { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffConfig {
    pub application: ApplicationSpec,
    pub scope: UnitScope,
    pub mode: LaunchMode,
    pub unit_paths: UnitPaths,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffOutcome {
    /// The service manager already runs the application unit.
    AlreadySupervised { scope: UnitScope },
    /// The unit was installed but inactive; the service manager was asked to start it.
    StartedUnit { scope: UnitScope },
    Detached { pid: u32 },
    Exited(CommandStatus),
}

pub fn hand_off(
    runner: &dyn CommandRunner,
    sink: &LogSink,
    context: &EnvironmentContext,
    config: &HandoffConfig,
    marker_path: &Path,
) -> Result<HandoffOutcome, HandoffError> {
    let installer = UnitInstaller::new(runner, sink, context, config.unit_paths.clone());
    let other_scope = match config.scope {
        UnitScope::System => UnitScope::User,
        UnitScope::User => UnitScope::System,
    };
    if let Some(scope) = [config.scope, other_scope]
        .into_iter()
        .find(|scope| installer.is_active(APP_UNIT_NAME, *scope))
    {
        note(
            sink,
            &format!(
                "{APP_UNIT_NAME} is already active in {} scope; not launching a second instance",
                scope.as_str()
            ),
        );
        return Ok(HandoffOutcome::AlreadySupervised { scope });
    }

    let binary = config.application.binary_path(context);
    if !binary.is_file() {
        let error = HandoffError::BinaryMissing {
            path: binary,
            marker: marker_path.to_path_buf(),
        };
        note(sink, &format!("hand-off aborted: {error}"));
        return Err(error);
    }

    if let Some(scope) = installed_application_scope(&installer) {
        note(
            sink,
            &format!(
                "setup already complete; starting {APP_UNIT_NAME} through the {} service manager",
                scope.as_str()
            ),
        );
        let status = installer
            .control(APP_UNIT_NAME, scope, UnitAction::Start)
            .map_err(|error| HandoffError::Launch {
                path: binary.clone(),
                reason: format!("{error:#}"),
            })?;
        if !status.success() {
            return Err(HandoffError::Launch {
                path: binary,
                reason: format!("systemctl start {APP_UNIT_NAME} ended with {}", status.describe()),
            });
        }
        return Ok(HandoffOutcome::StartedUnit { scope });
    }

    let spec = launch_spec(context, &config.application);
    note(
        sink,
        &format!(
            "setup already complete; launching {} as {}",
            binary.display(),
            context.account()
        ),
    );
    let outcome = runner
        .launch(&spec, sink, config.mode)
        .map_err(|error| HandoffError::Launch {
            path: binary.clone(),
            reason: format!("{error:#}"),
        })?;
    Ok(match outcome {
        LaunchOutcome::Spawned { pid } => {
            note(sink, &format!("application running detached (pid {pid})"));
            HandoffOutcome::Detached { pid }
        }
        LaunchOutcome::Exited(status) => {
            note(sink, &format!("application exited with {}", status.describe()));
            HandoffOutcome::Exited(status)
        }
    })
}

fn launch_spec(context: &EnvironmentContext, application: &ApplicationSpec) -> CommandSpec {
    let mut spec = CommandSpec::new(application.binary_path(context).display().to_string())
        .args(application.args.iter().cloned())
        .current_dir(context.project_dir())
        .env("HOME", context.home_dir().display().to_string())
        .env("RUST_LOG", "info");
    if let Some(runtime_dir) = context.runtime_dir() {
        spec = spec
            .env("XDG_RUNTIME_DIR", runtime_dir.display().to_string())
            .env(
                "PULSE_SERVER",
                format!("unix:{}/pulse/native", runtime_dir.display()),
            );
    }
    spec.as_account(context.account())
}

fn note(sink: &LogSink, text: &str) {
    if let Err(error) = sink.line(text) {
        tracing::error!(error = %format!("{error:#}"), "log sink write failed");
    }
}
