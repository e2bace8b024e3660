use std::path::{Path, PathBuf};

use thiserror::Error;
use tsuki_core::{EnvironmentContext, PRIVILEGED_ACCOUNT};

pub const APP_UNIT_NAME: &str = "tsuki-app.service";
pub const AUDIO_UNIT_NAME: &str = "tsuki-pulseaudio.service";
pub const APP_RESTART_SEC: u64 = 10;
pub const AUDIO_RESTART_SEC: u64 = 2;
pub const DEFAULT_SYSTEM_UNIT_DIR: &str = "/etc/systemd/system";
pub const USER_UNIT_RELATIVE_DIR: &str = ".config/systemd/user";
pub const PULSEAUDIO_PROGRAM: &str = "/usr/bin/pulseaudio";
const APP_DESCRIPTION: &str = "TSUKIMI device client";
const AUDIO_DESCRIPTION: &str = "PulseAudio server for the TSUKIMI device client";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitRole {
    Application,
    AudioServer,
}

impl UnitRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitRole::Application => "application",
            UnitRole::AudioServer => "audio-server",
        }
    }
}

/// Installation scope of a unit: host-wide or the account's user manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitScope {
    System,
    User,
}

impl UnitScope {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitScope::System => "system",
            UnitScope::User => "user",
        }
    }

    pub fn install_target(self) -> &'static str {
        match self {
            UnitScope::System => "multi-user.target",
            UnitScope::User => "default.target",
        }
    }

    /// Unit directory for this scope; `system_dir` is the host-wide directory.
    pub fn unit_dir(self, context: &EnvironmentContext, system_dir: &Path) -> PathBuf {
        match self {
            UnitScope::System => system_dir.to_path_buf(),
            UnitScope::User => context.home_dir().join(USER_UNIT_RELATIVE_DIR),
        }
    }
}

/// Declarative service description rendered as `[Unit]/[Service]/[Install]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub name: String,
    pub description: String,
    pub after: Vec<String>,
    pub wants: Vec<String>,
    pub service_type: String,
    pub remain_after_exit: bool,
    pub user: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub environment: Vec<(String, String)>,
    pub exec_start: Vec<String>,
    /// `Restart=always` with this backoff in seconds.
    pub restart_sec: Option<u64>,
    pub standard_output: Option<String>,
    pub standard_error: Option<String>,
    pub wanted_by: String,
}

impl ServiceDefinition {
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("[Unit]\n");
        out.push_str(&format!("Description={}\n", self.description));
        if !self.after.is_empty() {
            out.push_str(&format!("After={}\n", self.after.join(" ")));
        }
        if !self.wants.is_empty() {
            out.push_str(&format!("Wants={}\n", self.wants.join(" ")));
        }

        out.push_str("\n[Service]\n");
        out.push_str(&format!("Type={}\n", self.service_type));
        if self.remain_after_exit {
            out.push_str("RemainAfterExit=yes\n");
        }
        if let Some(user) = self.user.as_deref() {
            out.push_str(&format!("User={user}\n"));
        }
        if let Some(dir) = self.working_directory.as_deref() {
            out.push_str(&format!("WorkingDirectory={}\n", dir.display()));
        }
        for (key, value) in &self.environment {
            out.push_str(&format!(
                "Environment=\"{}\"\n",
                escape_systemd_value(&format!("{key}={value}"))
            ));
        }
        out.push_str(&format!("ExecStart={}\n", render_exec_line(&self.exec_start)));
        if let Some(restart_sec) = self.restart_sec {
            out.push_str("Restart=always\n");
            out.push_str(&format!("RestartSec={restart_sec}\n"));
        }
        if let Some(output) = self.standard_output.as_deref() {
            out.push_str(&format!("StandardOutput={output}\n"));
        }
        if let Some(error) = self.standard_error.as_deref() {
            out.push_str(&format!("StandardError={error}\n"));
        }

        out.push_str("\n[Install]\n");
        out.push_str(&format!("WantedBy={}\n", self.wanted_by));
        out
    }
}

/// What the application unit starts and where its output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationSpec {
    pub binary_name: String,
    pub args: Vec<String>,
    pub log_path: PathBuf,
}

impl ApplicationSpec {
    /// `<project>/target/release/<binary>`.
    pub fn binary_path(&self, context: &EnvironmentContext) -> PathBuf {
        context
            .project_dir()
            .join("target")
            .join("release")
            .join(&self.binary_name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnitRenderError {
    #[error("refusing to render a system-scope {role} unit running as '{account}'")]
    PrivilegedUser { role: &'static str, account: String },
    #[error("application binary name must be a single non-empty path component, got '{0}'")]
    InvalidBinaryName(String),
}

pub fn application_definition(
    scope: UnitScope,
    context: &EnvironmentContext,
    application: &ApplicationSpec,
) -> Result<ServiceDefinition, UnitRenderError> {
    let binary = application.binary_name.as_str();
    if binary.trim() != binary
        || binary.is_empty()
        || binary.contains('/')
        || binary == "."
        || binary == ".."
    {
        return Err(UnitRenderError::InvalidBinaryName(
            application.binary_name.clone(),
        ));
    }
    let user = system_scope_user(UnitRole::Application, scope, context)?;

    let (after, wants) = match scope {
        UnitScope::System => {
            let mut after = vec![
                "network-online.target".to_string(),
                "bluetooth.service".to_string(),
                "sound.target".to_string(),
            ];
            let mut wants = vec![
                "network-online.target".to_string(),
                "bluetooth.service".to_string(),
            ];
            if let Some(ids) = context.ids() {
                let user_manager = format!("user@{}.service", ids.uid);
                after.push(user_manager.clone());
                wants.push(user_manager);
            }
            (after, wants)
        }
        UnitScope::User => (
            vec![AUDIO_UNIT_NAME.to_string()],
            vec![AUDIO_UNIT_NAME.to_string()],
        ),
    };

    let mut environment = vec![("RUST_LOG".to_string(), "info".to_string())];
    if let Some(runtime_dir) = context.runtime_dir() {
        environment.push((
            "XDG_RUNTIME_DIR".to_string(),
            runtime_dir.display().to_string(),
        ));
        environment.push((
            "PULSE_SERVER".to_string(),
            format!("unix:{}/pulse/native", runtime_dir.display()),
        ));
    }

    let mut exec_start = vec![application.binary_path(context).display().to_string()];
    exec_start.extend(application.args.iter().cloned());
    let log_target = format!("append:{}", application.log_path.display());

    Ok(ServiceDefinition {
        name: APP_UNIT_NAME.to_string(),
        description: format!("{APP_DESCRIPTION} ({})", context.account()),
        after,
        wants,
        service_type: "simple".to_string(),
        remain_after_exit: false,
        user,
        working_directory: Some(context.project_dir().to_path_buf()),
        environment,
        exec_start,
        restart_sec: Some(APP_RESTART_SEC),
        standard_output: Some(log_target.clone()),
        standard_error: Some(log_target),
        wanted_by: scope.install_target().to_string(),
    })
}

pub fn audio_server_definition(
    scope: UnitScope,
    context: &EnvironmentContext,
) -> Result<ServiceDefinition, UnitRenderError> {
    let user = system_scope_user(UnitRole::AudioServer, scope, context)?;
    let after = match scope {
        UnitScope::System => vec!["sound.target".to_string(), "bluetooth.service".to_string()],
        UnitScope::User => Vec::new(),
    };
    Ok(ServiceDefinition {
        name: AUDIO_UNIT_NAME.to_string(),
        description: AUDIO_DESCRIPTION.to_string(),
        after,
        wants: Vec::new(),
        service_type: "simple".to_string(),
        remain_after_exit: false,
        user,
        working_directory: None,
        environment: vec![("RUST_LOG".to_string(), "info".to_string())],
        exec_start: vec![
            PULSEAUDIO_PROGRAM.to_string(),
            "--daemonize=no".to_string(),
            "--log-target=journal".to_string(),
        ],
        restart_sec: Some(AUDIO_RESTART_SEC),
        standard_output: Some("journal".to_string()),
        standard_error: Some("journal".to_string()),
        wanted_by: scope.install_target().to_string(),
    })
}

fn system_scope_user(
    role: UnitRole,
    scope: UnitScope,
    context: &EnvironmentContext,
) -> Result<Option<String>, UnitRenderError> {
    if context.account() == PRIVILEGED_ACCOUNT {
        return Err(UnitRenderError::PrivilegedUser {
            role: role.as_str(),
            account: context.account().to_string(),
        });
    }
    Ok(match scope {
        UnitScope::System => Some(context.account().to_string()),
        UnitScope::User => None,
    })
}

/// Quotes each word for systemd's command-line parser and escapes specifiers.
pub fn render_exec_line(words: &[String]) -> String {
    words
        .iter()
        .map(|word| escape_systemd_specifiers(&quote_exec_word(word)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_exec_word(word: &str) -> String {
    let needs_quotes = word.is_empty()
        || word
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';'));
    if needs_quotes {
        format!("\"{}\"", word.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        word.to_string()
    }
}

fn escape_systemd_specifiers(value: &str) -> String {
    value.replace('%', "%%").replace('$', "$$")
}

fn escape_systemd_value(value: &str) -> String {
    escape_systemd_specifiers(&value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsuki_core::{resolve_environment, ResolverInputs};

    fn context_for(account: &str, home_root: &Path, passwd: Option<&str>) -> EnvironmentContext {
        let passwd_path = home_root.join("passwd-fixture");
        if let Some(raw) = passwd {
            std::fs::create_dir_all(home_root).expect("home root");
            std::fs::write(&passwd_path, raw).expect("passwd");
        }
        resolve_environment(&ResolverInputs {
            identity_hints: vec![account.to_string()],
            current_account: None,
            privileged: true,
            home_root: home_root.to_path_buf(),
            project_name: "tsukimi-device".to_string(),
            passwd_path,
        })
        .expect("context")
    }

    fn application(log_path: &str) -> ApplicationSpec {
        ApplicationSpec {
            binary_name: "tsukimi-device".to_string(),
            args: Vec::new(),
            log_path: PathBuf::from(log_path),
        }
    }

    #[test]
    fn unit_application_unit_binds_paths_to_resolved_project_for_any_account() {
        for account in ["pi", "kaguya", "ops-user"] {
            let home_root = PathBuf::from("/srv/homes");
            let context = context_for(account, &home_root, None);
            let rendered = application_definition(
                UnitScope::System,
                &context,
                &application("/srv/homes/x/logs/tsuki-setup.log"),
            )
            .expect("render")
            .render();
            assert!(rendered.contains(&format!(
                "WorkingDirectory=/srv/homes/{account}/tsukimi-device\n"
            )));
            assert!(rendered.contains(&format!(
                "ExecStart=/srv/homes/{account}/tsukimi-device/target/release/tsukimi-device\n"
            )));
            assert!(rendered.contains(&format!("User={account}\n")));
        }
    }

    #[test]
    fn unit_application_unit_has_restart_policy_ordering_and_log_routing() {
        let context = context_for("pi", Path::new("/home"), None);
        let rendered = application_definition(
            UnitScope::System,
            &context,
            &application("/home/pi/logs/tsuki-setup.log"),
        )
        .expect("render")
        .render();
        assert!(rendered.starts_with("[Unit]\nDescription=TSUKIMI device client (pi)\n"));
        assert!(rendered.contains("After=network-online.target bluetooth.service sound.target\n"));
        assert!(rendered.contains("Wants=network-online.target bluetooth.service\n"));
        assert!(rendered.contains("Restart=always\nRestartSec=10\n"));
        assert!(rendered.contains("StandardOutput=append:/home/pi/logs/tsuki-setup.log\n"));
        assert!(rendered.contains("StandardError=append:/home/pi/logs/tsuki-setup.log\n"));
        assert!(rendered.contains("Environment=\"RUST_LOG=info\"\n"));
        assert!(rendered.ends_with("[Install]\nWantedBy=multi-user.target\n"));
    }

    #[test]
    fn functional_system_app_unit_orders_after_account_user_manager_when_uid_known() {
        let temp = tempfile::tempdir().expect("tempdir");
        let context = context_for(
            "pi",
            temp.path(),
            Some("pi:x:1000:1000::/home/pi:/bin/bash\n"),
        );
        let rendered = application_definition(
            UnitScope::System,
            &context,
            &application("/tmp/log"),
        )
        .expect("render")
        .render();
        assert!(rendered.contains("user@1000.service"));
        assert!(rendered.contains("Environment=\"XDG_RUNTIME_DIR=/run/user/1000\"\n"));
        assert!(rendered.contains("Environment=\"PULSE_SERVER=unix:/run/user/1000/pulse/native\"\n"));
    }

    #[test]
    fn functional_user_scope_units_follow_audio_and_omit_user_binding() {
        let context = context_for("pi", Path::new("/home"), None);
        let app = application_definition(UnitScope::User, &context, &application("/tmp/log"))
            .expect("render app")
            .render();
        assert!(!app.contains("User="));
        assert!(app.contains("After=tsuki-pulseaudio.service\n"));
        assert!(app.contains("Wants=tsuki-pulseaudio.service\n"));
        assert!(app.contains("WantedBy=default.target\n"));

        let audio = audio_server_definition(UnitScope::User, &context)
            .expect("render audio")
            .render();
        assert!(audio.contains("ExecStart=/usr/bin/pulseaudio --daemonize=no --log-target=journal\n"));
        assert!(audio.contains("Restart=always\nRestartSec=2\n"));
        assert!(!audio.contains("User="));
        assert!(audio.contains("WantedBy=default.target\n"));
    }

    #[test]
    fn unit_exec_line_quotes_and_escapes_specifiers() {
        let words = vec![
            "/opt/app".to_string(),
            "--label".to_string(),
            "two words".to_string(),
            "100%".to_string(),
            "say \"hi\"".to_string(),
        ];
        assert_eq!(
            render_exec_line(&words),
            "/opt/app --label \"two words\" 100%% \"say \\\"hi\\\"\""
        );
    }

    #[test]
    fn regression_invalid_binary_name_is_rejected() {
        let context = context_for("pi", Path::new("/home"), None);
        let mut app = application("/tmp/log");
        app.binary_name = "../../bin/sh".to_string();
        let error = application_definition(UnitScope::System, &context, &app)
            .expect_err("must reject");
        assert!(matches!(error, UnitRenderError::InvalidBinaryName(_)));
    }

    #[test]
    fn regression_binary_name_with_surrounding_whitespace_is_rejected() {
        let context = context_for("pi", Path::new("/home"), None);
        let mut app = application("/tmp/log");
        app.binary_name = " tsukimi-device\n".to_string();
        let error = application_definition(UnitScope::System, &context, &app)
            .expect_err("must reject padded name");
        assert_eq!(
            error,
            UnitRenderError::InvalidBinaryName(" tsukimi-device\n".to_string())
        );
    }
}
