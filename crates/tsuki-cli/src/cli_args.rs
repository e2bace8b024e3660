use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tsuki_core::{DEFAULT_HOME_ROOT, DEFAULT_PROJECT_NAME, TARGET_ACCOUNT_ENV};
use tsuki_ops::DEFAULT_RC_LOCAL_PATH;

use crate::{CliAppControl, CliAutostartStrategy, CliUnitScope};

const DEFAULT_REBOOT_DELAY_SECS: u64 = 5;

#[derive(Debug, Parser)]
#[command(
    name = "tsuki-setup",
    about = "Provision a headless TSUKIMI device once, then hand off to the resident application on every boot",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = TARGET_ACCOUNT_ENV,
        help = "Account that owns the project and runs the application. Defaults to SUDO_USER, the current account, a conventional name, or the first home directory."
    )]
    pub account: Option<String>,

    #[arg(
        long = "home-root",
        env = "TSUKI_HOME_ROOT",
        default_value = DEFAULT_HOME_ROOT,
        help = "Directory holding per-account home directories"
    )]
    pub home_root: PathBuf,

    #[arg(
        long = "project-name",
        env = "TSUKI_PROJECT_NAME",
        default_value = DEFAULT_PROJECT_NAME,
        help = "Project directory name under the account's home"
    )]
    pub project_name: String,

    #[arg(
        long = "app-binary",
        env = "TSUKI_APP_BINARY",
        default_value = DEFAULT_PROJECT_NAME,
        help = "Binary name under <project>/target/release launched as the resident application"
    )]
    pub app_binary: String,

    #[arg(
        long = "app-args",
        env = "TSUKI_APP_ARGS",
        default_value = "",
        allow_hyphen_values = true,
        help = "Shell-quoted arguments passed to the resident application"
    )]
    pub app_args: String,

    #[arg(
        long = "unit-scope",
        env = "TSUKI_UNIT_SCOPE",
        value_enum,
        default_value_t = CliUnitScope::System,
        help = "Where the application unit is installed: system-wide or the account's per-user manager"
    )]
    pub unit_scope: CliUnitScope,

    #[arg(
        long = "reboot-delay-secs",
        env = "TSUKI_REBOOT_DELAY_SECS",
        default_value_t = DEFAULT_REBOOT_DELAY_SECS,
        help = "Seconds to wait after provisioning before requesting a reboot"
    )]
    pub reboot_delay_secs: u64,

    #[arg(
        long = "no-reboot",
        env = "TSUKI_NO_REBOOT",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Finish provisioning without requesting a reboot"
    )]
    pub no_reboot: bool,

    #[arg(
        long = "wait",
        env = "TSUKI_WAIT",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Wait for the launched application and exit with its status instead of detaching"
    )]
    pub wait: bool,

    #[arg(
        long = "autostart-install",
        env = "TSUKI_AUTOSTART_INSTALL",
        value_enum,
        conflicts_with = "autostart_remove",
        conflicts_with = "status",
        conflicts_with = "app_control",
        help = "Install the boot trigger (removing the other one first) and exit"
    )]
    pub autostart_install: Option<CliAutostartStrategy>,

    #[arg(
        long = "autostart-remove",
        env = "TSUKI_AUTOSTART_REMOVE",
        default_value_t = false,
        conflicts_with = "status",
        conflicts_with = "app_control",
        help = "Remove every installed boot trigger and exit"
    )]
    pub autostart_remove: bool,

    #[arg(
        long = "rc-local-path",
        env = "TSUKI_RC_LOCAL_PATH",
        default_value = DEFAULT_RC_LOCAL_PATH,
        help = "Host startup script used by the init-hook trigger"
    )]
    pub rc_local_path: PathBuf,

    #[arg(
        long = "status",
        env = "TSUKI_STATUS",
        default_value_t = false,
        conflicts_with = "app_control",
        help = "Report account, provisioning marker, log, units and triggers, then exit"
    )]
    pub status: bool,

    #[arg(
        long = "status-json",
        env = "TSUKI_STATUS_JSON",
        default_value_t = false,
        requires = "status",
        help = "Render --status output as JSON"
    )]
    pub status_json: bool,

    #[arg(
        long = "app-control",
        env = "TSUKI_APP_CONTROL",
        value_enum,
        help = "Forward start|stop|restart|status to the installed application unit and exit"
    )]
    pub app_control: Option<CliAppControl>,
}
