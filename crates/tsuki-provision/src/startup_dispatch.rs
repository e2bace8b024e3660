//! Maps a parsed command line onto one invocation mode and an exit code.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tsuki_cli::{app_args, resolve_invocation_mode, validate_cli, Cli, InvocationMode};
use tsuki_core::{resolve_environment, EnvironmentContext, LogSink, LogSinkConfig, ResolverInputs};
use tsuki_ops::{
    ApplicationSpec, AutostartSelector, AutostartStrategy, LaunchMode, SystemCommandRunner,
    UnitAction, UnitInstaller, UnitPaths,
};

use crate::app_control::run_app_control;
use crate::exit_codes::{
    autostart_exit_code, child_exit_code, orchestrator_exit_code, EXIT_ENVIRONMENT, EXIT_FAILURE,
    EXIT_INVALID_ARGUMENTS, EXIT_SUCCESS,
};
use crate::handoff::HandoffOutcome;
use crate::orchestrator::{run_orchestrator, OrchestratorConfig, OrchestratorOutcome};
use crate::phase_executor::PhaseConfig;
use crate::setup_state::SetupTracker;
use crate::status::{inspect_setup_status, render_setup_status_report, StatusInputs};

pub fn run_cli(cli: &Cli) -> u8 {
    if let Err(error) = validate_cli(cli) {
        eprintln!("tsuki-setup: {error:#}");
        return EXIT_INVALID_ARGUMENTS;
    }
    let arguments = match app_args(cli) {
        Ok(arguments) => arguments,
        Err(error) => {
            eprintln!("tsuki-setup: {error:#}");
            return EXIT_INVALID_ARGUMENTS;
        }
    };
    let mode = resolve_invocation_mode(cli);

    let inputs = ResolverInputs::from_process(cli.account.as_deref(), &cli.home_root, &cli.project_name);
    let context = match resolve_environment(&inputs) {
        Ok(context) => context,
        Err(error) => {
            eprintln!("tsuki-setup: {error}");
            return EXIT_ENVIRONMENT;
        }
    };
    let owner = context.ids().filter(|_| context.privileged());
    let tracker = SetupTracker::for_home(context.home_dir(), owner);
    let runner = SystemCommandRunner::new(context.privileged());
    let unit_paths = UnitPaths::default();
    let log_config = LogSinkConfig::for_home(context.home_dir(), owner);

    if let InvocationMode::Status { json } = mode {
        let application = ApplicationSpec {
            binary_name: cli.app_binary.trim().to_string(),
            args: arguments,
            log_path: log_config.primary_path.clone(),
        };
        let report = inspect_setup_status(
            &runner,
            &StatusInputs {
                context: &context,
                tracker: &tracker,
                application: &application,
                unit_paths: &unit_paths,
                rc_local_path: &cli.rc_local_path,
            },
        );
        if json {
            match serde_json::to_string_pretty(&report) {
                Ok(rendered) => println!("{rendered}"),
                Err(error) => {
                    eprintln!("tsuki-setup: failed to render status report: {error}");
                    return EXIT_FAILURE;
                }
            }
        } else {
            println!("{}", render_setup_status_report(&report));
        }
        return EXIT_SUCCESS;
    }

    let sink = match LogSink::open(&log_config) {
        Ok(sink) => sink,
        Err(error) => {
            eprintln!("tsuki-setup: {error}");
            return EXIT_FAILURE;
        }
    };
    announce(&sink, &context, mode);
    let application = application_for_sink(cli, arguments, &sink);

    match mode {
        InvocationMode::Status { .. } => EXIT_SUCCESS,
        InvocationMode::AutostartInstall(strategy) => {
            install_autostart(&runner, &sink, &context, &unit_paths, cli, Some(strategy))
        }
        InvocationMode::AutostartRemove => {
            install_autostart(&runner, &sink, &context, &unit_paths, cli, None)
        }
        InvocationMode::AppControl(action) => {
            match run_app_control(&runner, &sink, &context, &unit_paths, action) {
                Ok(outcome) if action == UnitAction::Status => child_exit_code(outcome.status),
                Ok(_) => EXIT_SUCCESS,
                Err(error) => report_failure(&sink, &error.to_string(), EXIT_FAILURE),
            }
        }
        InvocationMode::Orchestrate => {
            let config = orchestrator_config(cli, application, unit_paths);
            match run_orchestrator(&runner, &sink, &context, &tracker, &config) {
                Ok(OrchestratorOutcome::Provisioned(report)) => {
                    note(
                        &sink,
                        &format!(
                            "provisioning finished ({} steps, reboot_requested={})",
                            report.steps.len(),
                            report.reboot_requested
                        ),
                    );
                    EXIT_SUCCESS
                }
                Ok(OrchestratorOutcome::HandedOff(HandoffOutcome::Exited(status))) => {
                    child_exit_code(status)
                }
                Ok(OrchestratorOutcome::HandedOff(_)) => EXIT_SUCCESS,
                Err(error) => {
                    let code = orchestrator_exit_code(&error);
                    tracing::debug!(code, error = %error, "orchestrator failed");
                    code
                }
            }
        }
    }
}

/// The application writes into whichever file the sink actually opened.
fn application_for_sink(cli: &Cli, arguments: Vec<String>, sink: &LogSink) -> ApplicationSpec {
    ApplicationSpec {
        binary_name: cli.app_binary.trim().to_string(),
        args: arguments,
        log_path: sink.path().to_path_buf(),
    }
}

fn orchestrator_config(
    cli: &Cli,
    application: ApplicationSpec,
    unit_paths: UnitPaths,
) -> OrchestratorConfig {
    let mut phase = PhaseConfig::new(cli.unit_scope.into(), application);
    phase.unit_paths = unit_paths;
    phase.reboot_delay = Duration::from_secs(cli.reboot_delay_secs);
    phase.request_reboot = !cli.no_reboot;
    OrchestratorConfig {
        phase,
        launch_mode: if cli.wait {
            LaunchMode::Wait
        } else {
            LaunchMode::Detached
        },
    }
}

fn install_autostart(
    runner: &SystemCommandRunner,
    sink: &LogSink,
    context: &EnvironmentContext,
    unit_paths: &UnitPaths,
    cli: &Cli,
    strategy: Option<AutostartStrategy>,
) -> u8 {
    let installer = UnitInstaller::new(runner, sink, context, unit_paths.clone());
    let selector = AutostartSelector::new(
        &installer,
        sink,
        &cli.rc_local_path,
        context.account(),
        context.privileged(),
    );
    let outcome = match strategy {
        Some(strategy) => match orchestrator_executable() {
            Ok(executable) => selector.install(strategy, &executable),
            Err(error) => return report_failure(sink, &format!("{error:#}"), EXIT_FAILURE),
        },
        None => selector.remove_all().map(|removed| {
            if removed.is_empty() {
                note(sink, "no autostart trigger was installed");
            }
        }),
    };
    match outcome {
        Ok(()) => EXIT_SUCCESS,
        Err(error) => report_failure(sink, &error.to_string(), autostart_exit_code(&error)),
    }
}

fn orchestrator_executable() -> Result<PathBuf> {
    let executable = std::env::current_exe().context("failed to resolve tsuki-setup executable")?;
    Ok(executable.canonicalize().unwrap_or(executable))
}

fn announce(sink: &LogSink, context: &EnvironmentContext, mode: InvocationMode) {
    note(
        sink,
        &format!(
            "tsuki-setup {} started: mode={} account={} (via {}) home={} project={} privileged={}",
            env!("CARGO_PKG_VERSION"),
            mode.as_str(),
            context.account(),
            context.source().as_str(),
            context.home_dir().display(),
            context.project_dir().display(),
            context.privileged()
        ),
    );
}

fn report_failure(sink: &LogSink, message: &str, code: u8) -> u8 {
    note(sink, message);
    code
}

fn note(sink: &LogSink, text: &str) {
    if let Err(error) = sink.line(text) {
        tracing::error!(error = %format!("{error:#}"), "log sink write failed");
        eprintln!("tsuki-setup: {text}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tsuki_core::LogSinkLocation;
    use tsuki_ops::{application_definition, UnitScope};

    #[test]
    fn regression_application_unit_logs_to_fallback_when_primary_is_unwritable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        let home = root.join("home/pi");
        std::fs::create_dir_all(&home).expect("home");
        std::fs::write(home.join("logs"), "not a directory").expect("block primary log dir");
        let context = resolve_environment(&ResolverInputs {
            identity_hints: vec!["pi".to_string()],
            current_account: None,
            privileged: true,
            home_root: root.join("home"),
            project_name: "tsukimi-device".to_string(),
            passwd_path: root.join("passwd"),
        })
        .expect("context");
        let mut log_config = LogSinkConfig::for_home(context.home_dir(), None);
        log_config.fallback_dir = root.join("tmp/tsuki-setup");
        let sink = LogSink::open_with_terminal(&log_config, Box::new(std::io::sink()))
            .expect("sink");
        assert_eq!(sink.location(), LogSinkLocation::TempFixed);

        let cli = Cli::try_parse_from(["tsuki-setup", "--unit-scope", "user"]).expect("parse");
        let application = application_for_sink(&cli, Vec::new(), &sink);
        let config = orchestrator_config(&cli, application, UnitPaths::default());
        assert_eq!(config.phase.application.log_path, sink.path());
        assert_eq!(config.phase.application_scope, UnitScope::User);

        let rendered = application_definition(UnitScope::User, &context, &config.phase.application)
            .expect("render")
            .render();
        let target = format!("append:{}", sink.path().display());
        assert!(rendered.contains(&format!("StandardOutput={target}\n")));
        assert!(rendered.contains(&format!("StandardError={target}\n")));
        assert!(!rendered.contains(&log_config.primary_path.display().to_string()));
    }
}
