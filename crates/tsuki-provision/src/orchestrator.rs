//! Per-invocation phase selection.
//!
//! Takes the invocation guard, consults the setup marker, then either runs the
//! full provisioning sequence or hands off to the resident application. Which
//! boot trigger invoked us is irrelevant here.

use std::path::PathBuf;

use thiserror::Error;
use tsuki_core::{acquire_invocation_guard, EnvironmentContext, GuardError, LogSink, GUARD_FILE_NAME};
use tsuki_ops::{CommandRunner, LaunchMode};

use crate::handoff::{hand_off, HandoffConfig, HandoffError, HandoffOutcome};
use crate::phase_executor::{PhaseConfig, PhaseExecutor, ProvisionError, ProvisionReport};
use crate::setup_state::SetupTracker;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Handoff(#[from] HandoffError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorOutcome {
    Provisioned(ProvisionReport),
    HandedOff(HandoffOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub phase: PhaseConfig,
    pub launch_mode: LaunchMode,
}

/// Guard file location: the account's home, or the log directory when the home is absent.
pub fn guard_path(context: &EnvironmentContext, sink: &LogSink) -> PathBuf {
    if context.home_dir().is_dir() {
        return context.home_dir().join(GUARD_FILE_NAME);
    }
    sink.path()
        .parent()
        .map(|dir| dir.join(GUARD_FILE_NAME))
        .unwrap_or_else(|| context.home_dir().join(GUARD_FILE_NAME))
}

pub fn run_orchestrator(
    runner: &dyn CommandRunner,
    sink: &LogSink,
    context: &EnvironmentContext,
    tracker: &SetupTracker,
    config: &OrchestratorConfig,
) -> Result<OrchestratorOutcome, OrchestratorError> {
    let guard = match acquire_invocation_guard(&guard_path(context, sink)) {
        Ok(guard) => guard,
        Err(error) => {
            note(sink, &format!("not proceeding: {error}"));
            return Err(error.into());
        }
    };
    tracing::debug!(guard = %guard.path().display(), "invocation guard held");

    if tracker.is_complete() {
        note(
            sink,
            &format!(
                "setup marker {} present; handing off",
                tracker.marker_path().display()
            ),
        );
        let handoff = HandoffConfig {
            application: config.phase.application.clone(),
            scope: config.phase.application_scope,
            mode: config.launch_mode,
            unit_paths: config.phase.unit_paths.clone(),
        };
        let outcome = hand_off(runner, sink, context, &handoff, tracker.marker_path())?;
        return Ok(OrchestratorOutcome::HandedOff(outcome));
    }

    if !context.project_dir_exists() {
        note(
            sink,
            &format!(
                "project directory {} not found yet; provisioning will stop at the project check",
                context.project_dir().display()
            ),
        );
    }
    let report = PhaseExecutor::new(runner, sink, context, tracker, &config.phase).run()?;
    Ok(OrchestratorOutcome::Provisioned(report))
}

fn note(sink: &LogSink, text: &str) {
    if let Err(error) = sink.line(text) {
        tracing::error!(error = %format!("{error:#}"), "log sink write failed");
    }
}
