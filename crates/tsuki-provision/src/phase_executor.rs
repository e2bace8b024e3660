//! First-time provisioning: ten fixed steps, fail-fast.
//!
//! Every step runs to completion before the next one starts. Any failure stops
//! the run with the setup marker still unset, so the next invocation restarts
//! from step 1. The marker is written only after every earlier step succeeded.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;
use tsuki_core::{EnvironmentContext, LogSink};
use tsuki_ops::{
    application_definition, audio_server_definition, ApplicationSpec, CommandRunner, CommandSpec,
    UnitInstallError, UnitInstaller, UnitPaths, UnitScope,
};

use crate::setup_state::SetupTracker;

pub const PACKAGE_MANIFEST: &[&str] = &[
    "alsa-utils",
    "pulseaudio",
    "pulseaudio-module-bluetooth",
    "gstreamer1.0-tools",
    "gstreamer1.0-plugins-base",
    "gstreamer1.0-plugins-good",
    "gstreamer1.0-alsa",
    "gstreamer1.0-pulseaudio",
    "libgstreamer1.0-dev",
    "libgstreamer-plugins-base1.0-dev",
    "libasound2-dev",
    "bluez",
    "libdbus-1-dev",
    "build-essential",
    "pkg-config",
    "libssl-dev",
    "protobuf-compiler",
    "curl",
    "git",
];

pub const RUSTUP_INSTALL_SCRIPT: &str =
    "curl --proto '=https' --tlsv1.2 -sSf https://sh.rustup.rs | sh -s -- -y";
const BLUETOOTH_UNIT: &str = "bluetooth.service";
const COMPLETION_NOTE: &str = "provisioned by tsuki-setup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    SystemUpdate,
    PackageInstall,
    Toolchain,
    ProjectCheck,
    Build,
    Bluetooth,
    AudioUnit,
    ApplicationUnit,
    MarkComplete,
    Reboot,
}

impl ProvisionStep {
    pub const ALL: [ProvisionStep; 10] = [
        ProvisionStep::SystemUpdate,
        ProvisionStep::PackageInstall,
        ProvisionStep::Toolchain,
        ProvisionStep::ProjectCheck,
        ProvisionStep::Build,
        ProvisionStep::Bluetooth,
        ProvisionStep::AudioUnit,
        ProvisionStep::ApplicationUnit,
        ProvisionStep::MarkComplete,
        ProvisionStep::Reboot,
    ];

    pub fn number(self) -> u8 {
        match self {
            ProvisionStep::SystemUpdate => 1,
            ProvisionStep::PackageInstall => 2,
            ProvisionStep::Toolchain => 3,
            ProvisionStep::ProjectCheck => 4,
            ProvisionStep::Build => 5,
            ProvisionStep::Bluetooth => 6,
            ProvisionStep::AudioUnit => 7,
            ProvisionStep::ApplicationUnit => 8,
            ProvisionStep::MarkComplete => 9,
            ProvisionStep::Reboot => 10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProvisionStep::SystemUpdate => "system update",
            ProvisionStep::PackageInstall => "package install",
            ProvisionStep::Toolchain => "rust toolchain",
            ProvisionStep::ProjectCheck => "project directory check",
            ProvisionStep::Build => "release build",
            ProvisionStep::Bluetooth => "bluetooth service",
            ProvisionStep::AudioUnit => "audio server unit",
            ProvisionStep::ApplicationUnit => "application unit",
            ProvisionStep::MarkComplete => "mark setup complete",
            ProvisionStep::Reboot => "reboot",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(
        "project directory {} is missing; clone the project there (for example `git clone <repository> {}`) and run tsuki-setup again",
        path.display(),
        path.display()
    )]
    ProjectMissing { path: PathBuf },
    #[error("step {} ({}) failed: {reason}", step.number(), step.as_str())]
    StepFailed { step: ProvisionStep, reason: String },
    #[error("step {} ({}) failed: {source}", step.number(), step.as_str())]
    UnitInstall {
        step: ProvisionStep,
        #[source]
        source: UnitInstallError,
    },
}

impl ProvisionError {
    pub fn step(&self) -> ProvisionStep {
        match self {
            ProvisionError::ProjectMissing { .. } => ProvisionStep::ProjectCheck,
            ProvisionError::StepFailed { step, .. } | ProvisionError::UnitInstall { step, .. } => {
                *step
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: ProvisionStep,
    pub outcome: StepOutcome,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub steps: Vec<StepRecord>,
    pub reboot_requested: bool,
}

impl ProvisionReport {
    pub fn completed_steps(&self) -> Vec<ProvisionStep> {
        self.steps.iter().map(|record| record.step).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseConfig {
    pub application_scope: UnitScope,
    pub application: ApplicationSpec,
    pub unit_paths: UnitPaths,
    pub packages: Vec<String>,
    pub reboot_delay: Duration,
    pub request_reboot: bool,
}

impl PhaseConfig {
    pub fn new(application_scope: UnitScope, application: ApplicationSpec) -> Self {
        Self {
            application_scope,
            application,
            unit_paths: UnitPaths::default(),
            packages: PACKAGE_MANIFEST.iter().map(|name| name.to_string()).collect(),
            reboot_delay: Duration::from_secs(5),
            request_reboot: true,
        }
    }
}

pub struct PhaseExecutor<'a> {
    runner: &'a dyn CommandRunner,
    sink: &'a LogSink,
    context: &'a EnvironmentContext,
    tracker: &'a SetupTracker,
    config: &'a PhaseConfig,
}

impl<'a> PhaseExecutor<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        sink: &'a LogSink,
        context: &'a EnvironmentContext,
        tracker: &'a SetupTracker,
        config: &'a PhaseConfig,
    ) -> Self {
        Self {
            runner,
            sink,
            context,
            tracker,
            config,
        }
    }

    pub fn run(&self) -> Result<ProvisionReport, ProvisionError> {
        let installer = UnitInstaller::new(
            self.runner,
            self.sink,
            self.context,
            self.config.unit_paths.clone(),
        );
        let mut report = ProvisionReport::default();
        self.note(&format!(
            "provisioning {} for account {} ({} steps)",
            self.context.project_dir().display(),
            self.context.account(),
            ProvisionStep::ALL.len()
        ));

        for step in ProvisionStep::ALL {
            self.note(&format!(
                "[{}/{}] {}",
                step.number(),
                ProvisionStep::ALL.len(),
                step.as_str()
            ));
            let started = Instant::now();
            let outcome = match self.run_step(step, &installer) {
                Ok(outcome) => outcome,
                Err(error) => {
                    self.note(&format!("provisioning aborted: {error}"));
                    tracing::error!(step = step.number(), error = %error, "provisioning step failed");
                    return Err(error);
                }
            };
            if let StepOutcome::Skipped { reason } = &outcome {
                self.note(&format!("skipped {}: {reason}", step.as_str()));
            }
            if step == ProvisionStep::Reboot {
                report.reboot_requested = outcome == StepOutcome::Completed;
            }
            report.steps.push(StepRecord {
                step,
                outcome,
                elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            });
        }
        Ok(report)
    }

    fn run_step(
        &self,
        step: ProvisionStep,
        installer: &UnitInstaller<'_>,
    ) -> Result<StepOutcome, ProvisionError> {
        let failed = |error: anyhow::Error| ProvisionError::StepFailed {
            step,
            reason: format!("{error:#}"),
        };
        let unit_failed = |source: UnitInstallError| ProvisionError::UnitInstall { step, source };

        match step {
            ProvisionStep::SystemUpdate => {
                self.checked(apt_get().arg("update")).map_err(failed)?;
                self.checked(apt_get().args(["-y", "upgrade"]))
                    .map_err(failed)?;
            }
            ProvisionStep::PackageInstall => {
                self.checked(
                    apt_get()
                        .args(["install", "-y"])
                        .args(self.config.packages.iter().cloned()),
                )
                .map_err(failed)?;
            }
            ProvisionStep::Toolchain => {
                let cargo = self.cargo_path();
                let probe = self.as_account(CommandSpec::new(cargo.display().to_string()).arg("--version"));
                if self.runner.probe(&probe) {
                    return Ok(StepOutcome::Skipped {
                        reason: format!("{} already present", cargo.display()),
                    });
                }
                self.checked(
                    self.as_account(CommandSpec::new("sh").args(["-c", RUSTUP_INSTALL_SCRIPT])),
                )
                .map_err(failed)?;
            }
            ProvisionStep::ProjectCheck => {
                if !self.context.project_dir_exists() {
                    return Err(ProvisionError::ProjectMissing {
                        path: self.context.project_dir().to_path_buf(),
                    });
                }
            }
            ProvisionStep::Build => {
                self.checked(
                    self.as_account(
                        CommandSpec::new(self.cargo_path().display().to_string())
                            .args(["build", "--release"])
                            .current_dir(self.context.project_dir()),
                    ),
                )
                .map_err(failed)?;
            }
            ProvisionStep::Bluetooth => {
                self.checked(systemctl().args(["enable", BLUETOOTH_UNIT]))
                    .map_err(failed)?;
                self.checked(systemctl().args(["start", BLUETOOTH_UNIT]))
                    .map_err(failed)?;
            }
            ProvisionStep::AudioUnit => {
                self.checked(
                    CommandSpec::new("loginctl")
                        .args(["enable-linger", self.context.account()])
                        .elevated(),
                )
                .map_err(failed)?;
                self.start_user_manager().map_err(failed)?;
                let definition = audio_server_definition(UnitScope::User, self.context)
                    .map_err(|error| failed(error.into()))?;
                installer
                    .install(&definition, UnitScope::User)
                    .map_err(unit_failed)?;
            }
            ProvisionStep::ApplicationUnit => {
                let scope = self.config.application_scope;
                let definition =
                    application_definition(scope, self.context, &self.config.application)
                        .map_err(|error| failed(error.into()))?;
                installer.install(&definition, scope).map_err(unit_failed)?;
                installer.reload(scope).map_err(failed)?;
            }
            ProvisionStep::MarkComplete => {
                let marker = self
                    .tracker
                    .mark_complete(self.context.account(), COMPLETION_NOTE)
                    .map_err(failed)?;
                self.note(&format!(
                    "setup marker written at {} ({})",
                    self.tracker.marker_path().display(),
                    marker.completed_at
                ));
            }
            ProvisionStep::Reboot => {
                if !self.config.request_reboot {
                    return Ok(StepOutcome::Skipped {
                        reason: "reboot disabled; reboot manually to finish".to_string(),
                    });
                }
                self.note(&format!(
                    "rebooting in {} seconds",
                    self.config.reboot_delay.as_secs()
                ));
                if !self.config.reboot_delay.is_zero() {
                    std::thread::sleep(self.config.reboot_delay);
                }
                self.checked(systemctl().arg("reboot")).map_err(failed)?;
            }
        }
        Ok(StepOutcome::Completed)
    }

    /// User-scope `systemctl` needs the account's manager running, even with nobody logged in.
    fn start_user_manager(&self) -> Result<()> {
        match self.context.ids() {
            Some(ids) => self.checked(
                systemctl()
                    .arg("start")
                    .arg(format!("user@{}.service", ids.uid)),
            ),
            None => {
                self.note(&format!(
                    "uid of {} unknown; relying on lingering to start its user manager",
                    self.context.account()
                ));
                Ok(())
            }
        }
    }

    fn checked(&self, spec: CommandSpec) -> Result<()> {
        self.runner.run_checked(&spec, self.sink)
    }

    fn cargo_path(&self) -> PathBuf {
        self.context.home_dir().join(".cargo").join("bin").join("cargo")
    }

    fn as_account(&self, spec: CommandSpec) -> CommandSpec {
        spec.env("HOME", self.context.home_dir().display().to_string())
            .as_account(self.context.account())
    }

    fn note(&self, text: &str) {
        if let Err(error) = self.sink.line(text) {
            tracing::error!(error = %format!("{error:#}"), "log sink write failed");
        }
    }
}

fn apt_get() -> CommandSpec {
    CommandSpec::new("apt-get")
        .env("DEBIAN_FRONTEND", "noninteractive")
        .elevated()
}

fn systemctl() -> CommandSpec {
    CommandSpec::new("systemctl").elevated()
}
