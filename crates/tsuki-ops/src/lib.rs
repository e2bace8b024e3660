//! Operational plumbing: the command seam, unit rendering and installation,
//! and the boot-time autostart triggers.

pub mod autostart;
pub mod command_runner;
pub mod recording_runner;
pub mod service_unit;
pub mod unit_install;

pub use autostart::{
    apply_init_hook, backup_path, detect_triggers, render_init_hook_line, service_hook_definition,
    strip_init_hook, AutostartError, AutostartSelector, AutostartStrategy, InstalledTriggers,
    AUTOSTART_MARKER, DEFAULT_RC_LOCAL_PATH, SERVICE_HOOK_UNIT_NAME,
};
pub use command_runner::{
    CommandRunner, CommandSpec, CommandStatus, LaunchMode, LaunchOutcome, Privilege,
    ResolvedCommand, SystemCommandRunner,
};
pub use recording_runner::{RecordedCommand, RecordedKind, RecordingRunner};
pub use service_unit::{
    application_definition, audio_server_definition, render_exec_line,
    ApplicationSpec, ServiceDefinition, UnitRenderError, UnitRole, UnitScope, APP_UNIT_NAME,
    AUDIO_UNIT_NAME, DEFAULT_SYSTEM_UNIT_DIR,
};
pub use unit_install::{
    systemctl_for, InstalledUnit, UnitAction, UnitInstallError, UnitInstaller, UnitPaths,
};
