//! Writes rendered units into their scope and drives `systemctl`.
//!
//! Installing is write, reload, enable. Overwriting an existing unit of the
//! same name is the normal idempotent path. System-scope writes from an
//! unprivileged orchestrator go through a staged file and `sudo install`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tsuki_core::{chown_to_account, write_text_atomic, EnvironmentContext, LogSink};

use crate::command_runner::{CommandRunner, CommandSpec, CommandStatus};
use crate::service_unit::{ServiceDefinition, UnitScope, DEFAULT_SYSTEM_UNIT_DIR};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to {action} unit {name} in {scope} scope: {reason}")]
pub struct UnitInstallError {
    pub action: &'static str,
    pub name: String,
    pub scope: &'static str,
    pub reason: String,
}

/// Filesystem locations the installer writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPaths {
    pub system_dir: PathBuf,
    pub staging_dir: PathBuf,
}

impl Default for UnitPaths {
    fn default() -> Self {
        Self {
            system_dir: PathBuf::from(DEFAULT_SYSTEM_UNIT_DIR),
            staging_dir: std::env::temp_dir().join("tsuki-setup-units"),
        }
    }
}

/// Lifecycle verbs forwarded to the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitAction {
    Start,
    Stop,
    Restart,
    Status,
}

impl UnitAction {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitAction::Start => "start",
            UnitAction::Stop => "stop",
            UnitAction::Restart => "restart",
            UnitAction::Status => "status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledUnit {
    pub name: String,
    pub scope: UnitScope,
    pub path: PathBuf,
}

pub struct UnitInstaller<'a> {
    runner: &'a dyn CommandRunner,
    sink: &'a LogSink,
    context: &'a EnvironmentContext,
    paths: UnitPaths,
}

impl<'a> UnitInstaller<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        sink: &'a LogSink,
        context: &'a EnvironmentContext,
        paths: UnitPaths,
    ) -> Self {
        Self {
            runner,
            sink,
            context,
            paths,
        }
    }

    pub fn unit_path(&self, name: &str, scope: UnitScope) -> PathBuf {
        scope
            .unit_dir(self.context, &self.paths.system_dir)
            .join(name)
    }

    pub fn systemctl(&self, scope: UnitScope) -> CommandSpec {
        systemctl_for(scope, self.context)
    }

    pub fn install(
        &self,
        definition: &ServiceDefinition,
        scope: UnitScope,
    ) -> Result<InstalledUnit, UnitInstallError> {
        let path = self.unit_path(&definition.name, scope);
        self.write_unit(&path, &definition.render(), scope)
            .map_err(|error| self.error("write", &definition.name, scope, error))?;
        self.sink_line(&format!(
            "installed {} unit {} at {}",
            scope.as_str(),
            definition.name,
            path.display()
        ));

        self.reload(scope)
            .map_err(|error| self.error("reload", &definition.name, scope, error))?;
        self.runner
            .run_checked(&self.systemctl(scope).args(["enable", &definition.name]), self.sink)
            .map_err(|error| self.error("enable", &definition.name, scope, error))?;

        Ok(InstalledUnit {
            name: definition.name.clone(),
            scope,
            path,
        })
    }

    pub fn reload(&self, scope: UnitScope) -> Result<()> {
        self.runner
            .run_checked(&self.systemctl(scope).arg("daemon-reload"), self.sink)
    }

    /// Disables and deletes a unit; a missing unit is not an error.
    pub fn remove(&self, name: &str, scope: UnitScope) -> Result<bool, UnitInstallError> {
        let path = self.unit_path(name, scope);
        if !path.exists() {
            return Ok(false);
        }
        let disable = self.runner.run(&self.systemctl(scope).args(["disable", name]), self.sink);
        if let Err(error) = &disable {
            tracing::warn!(unit = name, error = %format!("{error:#}"), "disable failed; removing unit file anyway");
        }
        let removal = if scope == UnitScope::System && !self.context.privileged() {
            self.runner.run_checked(
                &CommandSpec::new("rm")
                    .args(["-f", &path.display().to_string()])
                    .elevated(),
                self.sink,
            )
        } else {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))
        };
        removal.map_err(|error| self.error("remove", name, scope, error))?;
        self.sink_line(&format!("removed {} unit {name}", scope.as_str()));
        self.reload(scope)
            .map_err(|error| self.error("reload", name, scope, error))?;
        Ok(true)
    }

    /// Forwards a lifecycle verb; output is mirrored into the log.
    pub fn control(&self, name: &str, scope: UnitScope, action: UnitAction) -> Result<CommandStatus> {
        let spec = self.systemctl(scope).args([action.as_str(), "--no-pager", name]);
        self.runner.run(&spec, self.sink)
    }

    /// Whether the service manager currently runs `name`.
    pub fn is_active(&self, name: &str, scope: UnitScope) -> bool {
        self.runner
            .probe(&self.systemctl(scope).args(["is-active", "--quiet", name]))
    }

    fn write_unit(&self, path: &Path, content: &str, scope: UnitScope) -> Result<()> {
        match scope {
            UnitScope::System if !self.context.privileged() => {
                let staged = self.paths.staging_dir.join(
                    path.file_name()
                        .context("unit path has no file name")?,
                );
                write_text_atomic(&staged, content)?;
                self.runner.run_checked(
                    &CommandSpec::new("install")
                        .args(["-D", "-m", "0644"])
                        .arg(staged.display().to_string())
                        .arg(path.display().to_string())
                        .elevated(),
                    self.sink,
                )
            }
            UnitScope::System => write_text_atomic(path, content),
            UnitScope::User => {
                let created = missing_ancestors(path, self.context.home_dir());
                write_text_atomic(path, content)?;
                if self.context.privileged() {
                    if let Some(ids) = self.context.ids() {
                        for entry in created.iter().map(PathBuf::as_path).chain([path]) {
                            if let Err(error) = chown_to_account(entry, ids) {
                                tracing::warn!(path = %entry.display(), %error, "could not hand unit path to account");
                            }
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn error(
        &self,
        action: &'static str,
        name: &str,
        scope: UnitScope,
        error: anyhow::Error,
    ) -> UnitInstallError {
        let reason = format!("{error:#}");
        self.sink_line(&format!("unit {action} failed for {name}: {reason}"));
        UnitInstallError {
            action,
            name: name.to_string(),
            scope: scope.as_str(),
            reason,
        }
    }

    fn sink_line(&self, text: &str) {
        if let Err(error) = self.sink.line(text) {
            tracing::error!(error = %format!("{error:#}"), "log sink write failed");
        }
    }
}

/// `systemctl` addressed at `scope`; user scope from root targets the account's manager.
pub fn systemctl_for(scope: UnitScope, context: &EnvironmentContext) -> CommandSpec {
    match scope {
        UnitScope::System => CommandSpec::new("systemctl").elevated(),
        UnitScope::User if context.privileged() => CommandSpec::new("systemctl")
            .arg("--user")
            .arg(format!("--machine={}@", context.account())),
        UnitScope::User => CommandSpec::new("systemctl").arg("--user"),
    }
}

/// Directories between `stop` (exclusive) and `path`'s parent that do not exist yet.
fn missing_ancestors(path: &Path, stop: &Path) -> Vec<PathBuf> {
    let mut missing = path
        .ancestors()
        .skip(1)
        .take_while(|dir| *dir != stop && dir.starts_with(stop))
        .filter(|dir| !dir.exists())
        .map(Path::to_path_buf)
        .collect::<Vec<_>>();
    missing.reverse();
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording_runner::RecordingRunner;
    use crate::service_unit::{audio_server_definition, UnitScope};
    use tsuki_core::{resolve_environment, LogSinkConfig, ResolverInputs};

    struct Fixture {
        _temp: tempfile::TempDir,
        root: PathBuf,
        sink: LogSink,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let root = temp.path().to_path_buf();
            let sink = LogSink::open_with_terminal(
                &LogSinkConfig {
                    primary_path: root.join("log/setup.log"),
                    fallback_dir: root.join("fallback"),
                    owner: None,
                },
                Box::new(std::io::sink()),
            )
            .expect("sink");
            Self {
                _temp: temp,
                root,
                sink,
            }
        }

        fn context(&self, privileged: bool) -> EnvironmentContext {
            resolve_environment(&ResolverInputs {
                identity_hints: vec!["pi".to_string()],
                current_account: None,
                privileged,
                home_root: self.root.join("home"),
                project_name: "tsukimi-device".to_string(),
                passwd_path: self.root.join("passwd"),
            })
            .expect("context")
        }

        fn paths(&self) -> UnitPaths {
            UnitPaths {
                system_dir: self.root.join("etc/systemd/system"),
                staging_dir: self.root.join("staging"),
            }
        }
    }

    #[test]
    fn functional_user_scope_install_writes_reloads_and_enables_for_account_manager() {
        let fixture = Fixture::new();
        let context = fixture.context(true);
        let runner = RecordingRunner::new();
        let installer = UnitInstaller::new(&runner, &fixture.sink, &context, fixture.paths());

        let definition = audio_server_definition(UnitScope::User, &context).expect("audio");
        let installed = installer
            .install(&definition, UnitScope::User)
            .expect("install");
        assert_eq!(
            installed.path,
            fixture
                .root
                .join("home/pi/.config/systemd/user/tsuki-pulseaudio.service")
        );
        assert_eq!(
            std::fs::read_to_string(&installed.path).expect("unit"),
            definition.render()
        );
        assert_eq!(
            runner.run_lines(),
            vec![
                "systemctl --user --machine=pi@ daemon-reload",
                "systemctl --user --machine=pi@ enable tsuki-pulseaudio.service",
            ]
        );
    }

    #[test]
    fn functional_reinstall_overwrites_existing_unit() {
        let fixture = Fixture::new();
        let context = fixture.context(true);
        let runner = RecordingRunner::new();
        let installer = UnitInstaller::new(&runner, &fixture.sink, &context, fixture.paths());
        let mut definition = audio_server_definition(UnitScope::System, &context).expect("audio");

        installer
            .install(&definition, UnitScope::System)
            .expect("first install");
        definition.description = "changed".to_string();
        let installed = installer
            .install(&definition, UnitScope::System)
            .expect("second install");
        let text = std::fs::read_to_string(installed.path).expect("unit");
        assert!(text.contains("Description=changed\n"));
    }

    #[test]
    fn integration_unprivileged_system_install_stages_and_uses_sudo_install() {
        let fixture = Fixture::new();
        let context = fixture.context(false);
        let runner = RecordingRunner::new();
        let installer = UnitInstaller::new(&runner, &fixture.sink, &context, fixture.paths());
        let definition = audio_server_definition(UnitScope::System, &context).expect("audio");

        installer
            .install(&definition, UnitScope::System)
            .expect("install");
        let staged = fixture.root.join("staging/tsuki-pulseaudio.service");
        assert!(staged.exists());
        let history = runner.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].spec.program, "install");
        assert_eq!(history[0].spec.privilege, crate::Privilege::Elevated);
        assert_eq!(history[1].spec.privilege, crate::Privilege::Elevated);
        assert_eq!(runner.run_lines()[2], "systemctl enable tsuki-pulseaudio.service");
    }

    #[test]
    fn regression_enable_failure_surfaces_as_install_error() {
        let fixture = Fixture::new();
        let context = fixture.context(true);
        let runner = RecordingRunner::new().fail_when("enable");
        let installer = UnitInstaller::new(&runner, &fixture.sink, &context, fixture.paths());
        let definition = audio_server_definition(UnitScope::User, &context).expect("audio");

        let error = installer
            .install(&definition, UnitScope::User)
            .expect_err("enable failure must surface");
        assert_eq!(error.action, "enable");
        assert_eq!(error.scope, "user");
        let log = std::fs::read_to_string(fixture.sink.path()).expect("log");
        assert!(log.contains("unit enable failed for tsuki-pulseaudio.service"));
    }

    #[test]
    fn functional_remove_disables_deletes_and_tolerates_missing_unit() {
        let fixture = Fixture::new();
        let context = fixture.context(true);
        let runner = RecordingRunner::new();
        let installer = UnitInstaller::new(&runner, &fixture.sink, &context, fixture.paths());
        assert!(!installer
            .remove("tsuki-setup.service", UnitScope::System)
            .expect("missing ok"));

        let definition = audio_server_definition(UnitScope::System, &context).expect("audio");
        let installed = installer
            .install(&definition, UnitScope::System)
            .expect("install");
        assert!(installer
            .remove(&definition.name, UnitScope::System)
            .expect("remove"));
        assert!(!installed.path.exists());
        assert!(runner
            .run_lines()
            .contains(&"systemctl disable tsuki-pulseaudio.service".to_string()));
    }

    #[test]
    fn unit_missing_ancestors_lists_only_new_dirs_below_home() {
        let temp = tempfile::tempdir().expect("tempdir");
        let home = temp.path().join("home/pi");
        std::fs::create_dir_all(home.join(".config")).expect("config");
        let path = home.join(".config/systemd/user/x.service");
        assert_eq!(
            missing_ancestors(&path, &home),
            vec![home.join(".config/systemd"), home.join(".config/systemd/user")]
        );
    }
}
