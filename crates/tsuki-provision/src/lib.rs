//! Provisioning-and-autostart orchestration for a headless TSUKIMI device.
//!
//! Every boot, the orchestrator either runs first-time provisioning (ending in
//! a reboot) or hands off to the resident application, decided solely by the
//! setup marker in the account's home directory.

pub mod app_control;
pub mod exit_codes;
pub mod handoff;
pub mod orchestrator;
pub mod phase_executor;
pub mod setup_state;
pub mod startup_dispatch;
pub mod status;

pub use app_control::{installed_application_scope, run_app_control, AppControlError, AppControlOutcome};
pub use handoff::{hand_off, HandoffConfig, HandoffError, HandoffOutcome};
pub use orchestrator::{
    guard_path, run_orchestrator, OrchestratorConfig, OrchestratorError, OrchestratorOutcome,
};
pub use phase_executor::{
    PhaseConfig, PhaseExecutor, ProvisionError, ProvisionReport, ProvisionStep, StepOutcome,
    StepRecord, PACKAGE_MANIFEST,
};
pub use setup_state::{SetupMarker, SetupTracker, SETUP_MARKER_FILE_NAME};
pub use status::{inspect_setup_status, render_setup_status_report, SetupStatusReport, StatusInputs};
