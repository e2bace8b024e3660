use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use tempfile::TempDir;
use tsuki_core::{
    resolve_environment, EnvironmentContext, LogSink, LogSinkConfig, LogSinkLocation,
    ResolverInputs,
};
use tsuki_ops::{ApplicationSpec, LaunchMode, RecordedKind, RecordingRunner, UnitPaths, UnitScope};
use tsuki_provision::exit_codes::orchestrator_exit_code;
use tsuki_provision::{
    run_orchestrator, HandoffOutcome, OrchestratorConfig, OrchestratorError, OrchestratorOutcome,
    PhaseConfig, ProvisionError, ProvisionStep, SetupTracker,
};

const ACCOUNT: &str = "kaguya";
const PROJECT: &str = "tsukimi-device";

struct DeviceHost {
    _temp: TempDir,
    root: PathBuf,
}

impl DeviceHost {
    fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        fs::create_dir_all(root.join("home").join(ACCOUNT)).expect("home");
        Self { _temp: temp, root }
    }

    fn home(&self) -> PathBuf {
        self.root.join("home").join(ACCOUNT)
    }

    fn with_project(self) -> Self {
        fs::create_dir_all(self.home().join(PROJECT).join("target/release")).expect("project");
        fs::write(
            self.home().join(PROJECT).join("target/release").join(PROJECT),
            "",
        )
        .expect("release binary");
        self
    }

    fn context(&self) -> EnvironmentContext {
        resolve_environment(&ResolverInputs {
            identity_hints: Vec::new(),
            current_account: Some("root".to_string()),
            privileged: true,
            home_root: self.root.join("home"),
            project_name: PROJECT.to_string(),
            passwd_path: self.root.join("etc/passwd"),
        })
        .expect("context")
    }

    fn log_config(&self, context: &EnvironmentContext) -> LogSinkConfig {
        let mut config = LogSinkConfig::for_home(context.home_dir(), None);
        config.fallback_dir = self.root.join("tmp/tsuki-setup");
        config
    }

    fn open_sink(&self, context: &EnvironmentContext) -> LogSink {
        LogSink::open_with_terminal(&self.log_config(context), Box::new(std::io::sink()))
            .expect("sink")
    }

    fn config(&self, sink: &LogSink) -> OrchestratorConfig {
        let mut phase = PhaseConfig::new(
            UnitScope::System,
            ApplicationSpec {
                binary_name: PROJECT.to_string(),
                args: Vec::new(),
                log_path: sink.path().to_path_buf(),
            },
        );
        phase.unit_paths = UnitPaths {
            system_dir: self.root.join("etc/systemd/system"),
            staging_dir: self.root.join("tmp/units"),
        };
        phase.reboot_delay = Duration::ZERO;
        OrchestratorConfig {
            phase,
            launch_mode: LaunchMode::Detached,
        }
    }

    fn invoke(
        &self,
        runner: &RecordingRunner,
    ) -> (Result<OrchestratorOutcome, OrchestratorError>, PathBuf) {
        let context = self.context();
        let sink = self.open_sink(&context);
        let tracker = SetupTracker::for_home(context.home_dir(), None);
        let outcome = run_orchestrator(runner, &sink, &context, &tracker, &self.config(&sink));
        (outcome, sink.path().to_path_buf())
    }

    fn marker(&self) -> PathBuf {
        self.home().join(".tsuki-setup-complete")
    }
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).expect("read")
}

#[test]
fn integration_scenario_a_fresh_host_runs_every_step_marks_complete_and_reboots() {
    let host = DeviceHost::new().with_project();
    let runner = RecordingRunner::new();
    let (outcome, log_path) = host.invoke(&runner);

    let OrchestratorOutcome::Provisioned(report) = outcome.expect("provision") else {
        panic!("expected provisioning branch");
    };
    assert_eq!(report.completed_steps(), ProvisionStep::ALL.to_vec());
    assert!(report.reboot_requested);

    let marker = read(&host.marker());
    assert!(!marker.trim().is_empty());
    let parsed: serde_json::Value = serde_json::from_str(&marker).expect("marker json");
    assert_eq!(parsed["account"], ACCOUNT);

    let lines = runner.run_lines();
    assert_eq!(lines.first().map(String::as_str), Some("apt-get update"));
    assert_eq!(lines.last().map(String::as_str), Some("systemctl reboot"));

    let unit = read(&host.root.join("etc/systemd/system/tsuki-app.service"));
    assert!(unit.contains(&format!(
        "WorkingDirectory={}\n",
        host.home().join(PROJECT).display()
    )));
    assert!(unit.contains(&format!("User={ACCOUNT}\n")));

    let log = read(&log_path);
    for step in ProvisionStep::ALL {
        assert!(log.contains(&format!("[{}/10] {}", step.number(), step.as_str())));
    }
    assert!(log.lines().all(|line| line.starts_with('[') || line.is_empty()));
}

#[test]
fn integration_scenario_b_provisioned_host_only_launches_the_application() {
    let host = DeviceHost::new().with_project();
    fs::write(host.marker(), "").expect("marker");
    let runner = RecordingRunner::new();
    let (outcome, log_path) = host.invoke(&runner);

    assert_eq!(
        outcome.expect("hand off"),
        OrchestratorOutcome::HandedOff(HandoffOutcome::Detached { pid: 4242 })
    );
    assert!(runner.run_lines().is_empty());
    let launches = runner.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].kind, RecordedKind::Launch(LaunchMode::Detached));
    assert_eq!(
        launches[0].spec.program,
        host.home()
            .join(PROJECT)
            .join("target/release")
            .join(PROJECT)
            .display()
            .to_string()
    );
    assert!(read(&log_path).contains("launching"));
}

#[test]
fn integration_scenario_c_missing_project_aborts_at_step_four_with_path_in_log() {
    let host = DeviceHost::new();
    let runner = RecordingRunner::new();
    let (outcome, log_path) = host.invoke(&runner);

    let error = outcome.expect_err("must abort");
    assert!(matches!(
        error,
        OrchestratorError::Provision(ProvisionError::ProjectMissing { .. })
    ));
    assert_eq!(orchestrator_exit_code(&error), 21);
    assert!(!host.marker().exists());
    assert!(read(&log_path).contains(&host.home().join(PROJECT).display().to_string()));
    assert!(!runner
        .run_lines()
        .iter()
        .any(|line| line.contains("build --release") || line.contains("systemctl")));
}

#[test]
fn integration_scenario_d_unwritable_primary_log_falls_back_without_dropping_lines() {
    let host = DeviceHost::new().with_project();
    fs::write(host.home().join("logs"), "not a directory").expect("block primary log dir");
    let context = host.context();
    let sink = host.open_sink(&context);
    assert_eq!(sink.location(), LogSinkLocation::TempFixed);
    assert_eq!(sink.path(), host.root.join("tmp/tsuki-setup/tsuki-setup.log"));

    let runner = RecordingRunner::new();
    let tracker = SetupTracker::for_home(context.home_dir(), None);
    run_orchestrator(&runner, &sink, &context, &tracker, &host.config(&sink)).expect("provision");

    let log = read(sink.path());
    assert!(log.contains("log fallback in use"));
    for step in ProvisionStep::ALL {
        assert!(log.contains(&format!("[{}/10] {}", step.number(), step.as_str())));
    }
    let recorded = runner.run_lines().len();
    let commands_logged = log.lines().filter(|line| line.contains("] $ ")).count();
    assert_eq!(commands_logged, recorded);
}

#[test]
fn regression_failed_step_restarts_from_step_one_on_next_invocation() {
    let host = DeviceHost::new().with_project();
    let failing = RecordingRunner::new().fail_when("build --release");
    let (outcome, _) = host.invoke(&failing);
    let error = outcome.expect_err("build failure");
    assert_eq!(orchestrator_exit_code(&error), 22);
    assert!(!host.marker().exists());

    let retry = RecordingRunner::new();
    let (outcome, _) = host.invoke(&retry);
    assert!(matches!(
        outcome.expect("retry"),
        OrchestratorOutcome::Provisioned(_)
    ));
    assert_eq!(retry.run_lines()[0], "apt-get update");
}
