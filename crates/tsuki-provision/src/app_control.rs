//! Lifecycle commands for the installed application unit.

use thiserror::Error;
use tsuki_core::{EnvironmentContext, LogSink};
use tsuki_ops::{
    CommandRunner, CommandStatus, UnitAction, UnitInstaller, UnitPaths, UnitScope, APP_UNIT_NAME,
};

#[derive(Debug, Error)]
pub enum AppControlError {
    #[error("{APP_UNIT_NAME} is not installed in system or user scope; run tsuki-setup to provision first")]
    NotInstalled,
    #[error("`{action}` on {APP_UNIT_NAME} ({scope} scope) failed: {reason}")]
    Failed {
        action: &'static str,
        scope: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppControlOutcome {
    pub scope: UnitScope,
    pub status: CommandStatus,
}

/// Scope holding the application unit; system wins when both exist.
pub fn installed_application_scope(
    installer: &UnitInstaller<'_>,
) -> Option<UnitScope> {
    [UnitScope::System, UnitScope::User]
        .into_iter()
        .find(|scope| installer.unit_path(APP_UNIT_NAME, *scope).exists())
}

/// `status` reports whatever the service manager says; other verbs must succeed.
pub fn run_app_control(
    runner: &dyn CommandRunner,
    sink: &LogSink,
    context: &EnvironmentContext,
    unit_paths: &UnitPaths,
    action: UnitAction,
) -> Result<AppControlOutcome, AppControlError> {
    let installer = UnitInstaller::new(runner, sink, context, unit_paths.clone());
    let scope = installed_application_scope(&installer).ok_or(AppControlError::NotInstalled)?;
    let failed = |reason: String| AppControlError::Failed {
        action: action.as_str(),
        scope: scope.as_str(),
        reason,
    };
    let status = installer
        .control(APP_UNIT_NAME, scope, action)
        .map_err(|error| failed(format!("{error:#}")))?;
    if action != UnitAction::Status && !status.success() {
        return Err(failed(status.describe()));
    }
    Ok(AppControlOutcome { scope, status })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tsuki_core::{resolve_environment, LogSinkConfig, ResolverInputs};
    use tsuki_ops::RecordingRunner;

    struct Host {
        _temp: tempfile::TempDir,
        root: PathBuf,
        sink: LogSink,
        context: EnvironmentContext,
        unit_paths: UnitPaths,
    }

    impl Host {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let root = temp.path().to_path_buf();
            let context = resolve_environment(&ResolverInputs {
                identity_hints: vec!["pi".to_string()],
                current_account: None,
                privileged: true,
                home_root: root.join("home"),
                project_name: "tsukimi-device".to_string(),
                passwd_path: root.join("passwd"),
            })
            .expect("context");
            let sink = LogSink::open_with_terminal(
                &LogSinkConfig::for_home(context.home_dir(), None),
                Box::new(std::io::sink()),
            )
            .expect("sink");
            Self {
                unit_paths: UnitPaths {
                    system_dir: root.join("etc/systemd/system"),
                    staging_dir: root.join("staging"),
                },
                root,
                sink,
                context,
                _temp: temp,
            }
        }

        fn install_user_unit(&self) {
            let dir = self.root.join("home/pi/.config/systemd/user");
            std::fs::create_dir_all(&dir).expect("user unit dir");
            std::fs::write(dir.join(APP_UNIT_NAME), "[Unit]\n").expect("unit");
        }
    }

    #[test]
    fn functional_restart_targets_the_scope_holding_the_unit() {
        let host = Host::new();
        host.install_user_unit();
        let runner = RecordingRunner::new();
        let outcome = run_app_control(
            &runner,
            &host.sink,
            &host.context,
            &host.unit_paths,
            UnitAction::Restart,
        )
        .expect("restart");
        assert_eq!(outcome.scope, UnitScope::User);
        assert_eq!(
            runner.run_lines(),
            vec!["systemctl --user --machine=pi@ restart --no-pager tsuki-app.service"]
        );
    }

    #[test]
    fn regression_missing_unit_is_reported_without_systemctl() {
        let host = Host::new();
        let runner = RecordingRunner::new();
        let error = run_app_control(
            &runner,
            &host.sink,
            &host.context,
            &host.unit_paths,
            UnitAction::Start,
        )
        .expect_err("not installed");
        assert!(matches!(error, AppControlError::NotInstalled));
        assert!(runner.history().is_empty());
    }

    #[test]
    fn regression_status_of_inactive_unit_is_not_an_error_but_stop_failure_is() {
        let host = Host::new();
        host.install_user_unit();
        let runner = RecordingRunner::new().fail_when("tsuki-app.service");
        let outcome = run_app_control(
            &runner,
            &host.sink,
            &host.context,
            &host.unit_paths,
            UnitAction::Status,
        )
        .expect("status");
        assert!(!outcome.status.success());

        let error = run_app_control(
            &runner,
            &host.sink,
            &host.context,
            &host.unit_paths,
            UnitAction::Stop,
        )
        .expect_err("stop failure");
        assert!(error.to_string().contains("`stop`"));
    }
}
