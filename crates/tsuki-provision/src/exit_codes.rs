//! Process exit codes for `tsuki-setup`.

use tsuki_core::GuardError;
use tsuki_ops::{AutostartError, CommandStatus};

use crate::orchestrator::OrchestratorError;
use crate::phase_executor::ProvisionError;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_INVALID_ARGUMENTS: u8 = 10;
pub const EXIT_PRIVILEGE_REQUIRED: u8 = 11;
pub const EXIT_ENVIRONMENT: u8 = 20;
pub const EXIT_PROJECT_MISSING: u8 = 21;
pub const EXIT_STEP_FAILED: u8 = 22;
pub const EXIT_UNIT_INSTALL: u8 = 23;
pub const EXIT_GUARD_BUSY: u8 = 30;

pub fn orchestrator_exit_code(error: &OrchestratorError) -> u8 {
    match error {
        OrchestratorError::Guard(GuardError::Busy { .. }) => EXIT_GUARD_BUSY,
        OrchestratorError::Guard(GuardError::Io { .. }) => EXIT_FAILURE,
        OrchestratorError::Provision(ProvisionError::ProjectMissing { .. }) => EXIT_PROJECT_MISSING,
        OrchestratorError::Provision(ProvisionError::StepFailed { .. }) => EXIT_STEP_FAILED,
        OrchestratorError::Provision(ProvisionError::UnitInstall { .. }) => EXIT_UNIT_INSTALL,
        OrchestratorError::Handoff(_) => EXIT_FAILURE,
    }
}

pub fn autostart_exit_code(error: &AutostartError) -> u8 {
    match error {
        AutostartError::PrivilegeRequired => EXIT_PRIVILEGE_REQUIRED,
        AutostartError::Failed { .. } => EXIT_UNIT_INSTALL,
    }
}

/// A child's status as our own exit code; signals and out-of-range codes become 1.
pub fn child_exit_code(status: CommandStatus) -> u8 {
    status
        .code
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(EXIT_FAILURE)
}
