use anyhow::{bail, Context, Result};
use tsuki_core::PRIVILEGED_ACCOUNT;
use tsuki_ops::{AutostartStrategy, UnitAction};

use crate::Cli;

const MAX_REBOOT_DELAY_SECS: u64 = 3_600;

/// What a single invocation does; exactly one per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    Orchestrate,
    Status { json: bool },
    AutostartInstall(AutostartStrategy),
    AutostartRemove,
    AppControl(UnitAction),
}

impl InvocationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            InvocationMode::Orchestrate => "orchestrate",
            InvocationMode::Status { .. } => "status",
            InvocationMode::AutostartInstall(_) => "autostart-install",
            InvocationMode::AutostartRemove => "autostart-remove",
            InvocationMode::AppControl(_) => "app-control",
        }
    }
}

pub fn validate_cli(cli: &Cli) -> Result<()> {
    validate_path_component("--project-name", &cli.project_name)?;
    validate_path_component("--app-binary", &cli.app_binary)?;
    if let Some(account) = cli.account.as_deref() {
        let account = account.trim();
        if account == PRIVILEGED_ACCOUNT {
            bail!("--account must name a non-privileged account, got '{PRIVILEGED_ACCOUNT}'");
        }
        validate_path_component("--account", account)?;
    }
    app_args(cli)?;
    if cli.reboot_delay_secs > MAX_REBOOT_DELAY_SECS {
        bail!(
            "--reboot-delay-secs must be at most {MAX_REBOOT_DELAY_SECS}, got {}",
            cli.reboot_delay_secs
        );
    }

    let selected = [
        cli.autostart_install.is_some(),
        cli.autostart_remove,
        cli.status,
        cli.app_control.is_some(),
    ]
    .into_iter()
    .filter(|selected| *selected)
    .count();
    if selected > 1 {
        bail!("--autostart-install, --autostart-remove, --status and --app-control are mutually exclusive");
    }
    Ok(())
}

pub fn resolve_invocation_mode(cli: &Cli) -> InvocationMode {
    if let Some(strategy) = cli.autostart_install {
        return InvocationMode::AutostartInstall(strategy.into());
    }
    if cli.autostart_remove {
        return InvocationMode::AutostartRemove;
    }
    if cli.status {
        return InvocationMode::Status {
            json: cli.status_json,
        };
    }
    if let Some(action) = cli.app_control {
        return InvocationMode::AppControl(action.into());
    }
    InvocationMode::Orchestrate
}

/// `--app-args` split with shell rules.
pub fn app_args(cli: &Cli) -> Result<Vec<String>> {
    shell_words::split(&cli.app_args)
        .with_context(|| format!("--app-args is not valid shell syntax: {}", cli.app_args))
}

fn validate_path_component(flag: &str, value: &str) -> Result<()> {
    let value = value.trim();
    if value.is_empty() {
        bail!("{flag} cannot be empty");
    }
    if value == "." || value == ".." || value.contains('/') {
        bail!("{flag} must be a single path component, got '{value}'");
    }
    Ok(())
}
