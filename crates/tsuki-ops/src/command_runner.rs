//! The one seam through which external collaborators are invoked.
//!
//! Every package-manager, toolchain, service-manager and application command is
//! described as a [`CommandSpec`] and executed by a [`CommandRunner`]. The
//! system runner streams child output line by line into the [`LogSink`].

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;

use anyhow::{bail, Context, Result};
use tsuki_core::LogSink;

/// Who a command runs as, relative to the orchestrator's own identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Privilege {
    /// Whatever identity the orchestrator has.
    Inherit,
    /// root; prefixed with `sudo` when the orchestrator is unprivileged.
    Elevated,
    /// The named account; wrapped in `runuser` when the orchestrator is root.
    Account(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub privilege: Privilege,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            privilege: Privilege::Inherit,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn elevated(mut self) -> Self {
        self.privilege = Privilege::Elevated;
        self
    }

    pub fn as_account(mut self, account: &str) -> Self {
        self.privilege = Privilege::Account(account.to_string());
        self
    }

    /// Shell-quoted `program args...`, without privilege wrapping.
    pub fn display(&self) -> String {
        let mut words = vec![self.program.as_str()];
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }

    /// Applies the privilege wrapper for an orchestrator that is (or is not) root.
    pub fn resolve(&self, privileged: bool) -> ResolvedCommand {
        match &self.privilege {
            Privilege::Elevated if !privileged => {
                let mut args = Vec::new();
                if !self.env.is_empty() {
                    args.push("env".to_string());
                    args.extend(self.env.iter().map(|(key, value)| format!("{key}={value}")));
                }
                args.push(self.program.clone());
                args.extend(self.args.iter().cloned());
                ResolvedCommand {
                    program: "sudo".to_string(),
                    args,
                    env: Vec::new(),
                }
            }
            Privilege::Account(account) if privileged => {
                let mut args = vec![
                    "-u".to_string(),
                    account.clone(),
                    "--".to_string(),
                    self.program.clone(),
                ];
                args.extend(self.args.iter().cloned());
                ResolvedCommand {
                    program: "runuser".to_string(),
                    args,
                    env: self.env.clone(),
                }
            }
            _ => ResolvedCommand {
                program: self.program.clone(),
                args: self.args.clone(),
                env: self.env.clone(),
            },
        }
    }
}

/// A command line after privilege wrapping, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ResolvedCommand {
    pub fn display(&self) -> String {
        let mut words = vec![self.program.as_str()];
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    pub code: Option<i32>,
}

impl CommandStatus {
    pub const SUCCESS: CommandStatus = CommandStatus { code: Some(0) };

    pub fn success(self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(self) -> String {
        match self.code {
            Some(code) => format!("exit status {code}"),
            None => "termination by signal".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Detached,
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Spawned { pid: u32 },
    Exited(CommandStatus),
}

pub trait CommandRunner {
    /// Runs to completion, mirroring every output line into `sink`.
    fn run(&self, spec: &CommandSpec, sink: &LogSink) -> Result<CommandStatus>;

    /// Runs silently; true only when the command spawned and exited 0.
    fn probe(&self, spec: &CommandSpec) -> bool;

    /// Starts a long-running process with stdout/stderr appended to the sink file.
    fn launch(&self, spec: &CommandSpec, sink: &LogSink, mode: LaunchMode)
        -> Result<LaunchOutcome>;

    /// [`CommandRunner::run`], turning a non-zero exit into an error.
    fn run_checked(&self, spec: &CommandSpec, sink: &LogSink) -> Result<()> {
        let status = self.run(spec, sink)?;
        if !status.success() {
            bail!("`{}` failed with {}", spec.display(), status.describe());
        }
        Ok(())
    }
}

/// Spawns real child processes.
#[derive(Debug, Clone, Copy)]
pub struct SystemCommandRunner {
    privileged: bool,
}

impl SystemCommandRunner {
    pub fn new(privileged: bool) -> Self {
        Self { privileged }
    }

    fn command(&self, spec: &CommandSpec) -> (Command, ResolvedCommand) {
        let resolved = spec.resolve(self.privileged);
        let mut command = Command::new(&resolved.program);
        command.args(&resolved.args);
        if let Some(cwd) = spec.cwd.as_ref() {
            command.current_dir(cwd);
        }
        for (key, value) in &resolved.env {
            command.env(key, value);
        }
        command.stdin(Stdio::null());
        (command, resolved)
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, spec: &CommandSpec, sink: &LogSink) -> Result<CommandStatus> {
        let (mut command, resolved) = self.command(spec);
        sink.line(&format!("$ {}", resolved.display()))?;
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", resolved.display()))?;

        let (sender, receiver) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader("stdout", stdout, sender.clone())?);
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader("stderr", stderr, sender.clone())?);
        }
        drop(sender);

        let mut sink_result = Ok(());
        for line in receiver {
            if sink_result.is_ok() {
                sink_result = sink.line(&format!("  {line}"));
            }
        }
        for reader in readers {
            let _ = reader.join();
        }
        let status = child
            .wait()
            .with_context(|| format!("failed to wait for `{}`", resolved.display()))?;
        sink_result?;
        Ok(CommandStatus {
            code: status.code(),
        })
    }

    fn probe(&self, spec: &CommandSpec) -> bool {
        let (mut command, resolved) = self.command(spec);
        command.stdout(Stdio::null());
        command.stderr(Stdio::null());
        match command.status() {
            Ok(status) => status.success(),
            Err(error) => {
                tracing::debug!(command = %resolved.display(), %error, "probe could not spawn");
                false
            }
        }
    }

    fn launch(
        &self,
        spec: &CommandSpec,
        sink: &LogSink,
        mode: LaunchMode,
    ) -> Result<LaunchOutcome> {
        let (mut command, resolved) = self.command(spec);
        sink.line(&format!("$ {}", resolved.display()))?;
        command.stdout(Stdio::from(sink.file_for_child()?));
        command.stderr(Stdio::from(sink.file_for_child()?));
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to launch `{}`", resolved.display()))?;
        match mode {
            LaunchMode::Detached => Ok(LaunchOutcome::Spawned { pid: child.id() }),
            LaunchMode::Wait => {
                let status = child
                    .wait()
                    .with_context(|| format!("failed to wait for `{}`", resolved.display()))?;
                Ok(LaunchOutcome::Exited(CommandStatus {
                    code: status.code(),
                }))
            }
        }
    }
}

fn spawn_line_reader<R>(
    label: &'static str,
    reader: R,
    sender: mpsc::Sender<String>,
) -> Result<thread::JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("tsuki-{label}-reader"))
        .spawn(move || {
            let mut buffered = BufReader::new(reader);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match buffered.read_until(b'\n', &mut raw) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&raw);
                        let trimmed = line.trim_end_matches(['\n', '\r']);
                        if sender.send(trimmed.to_string()).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        let _ = sender.send(format!("<{label} read failed: {error}>"));
                        break;
                    }
                }
            }
        })
        .with_context(|| format!("failed to spawn {label} reader thread"))
}
