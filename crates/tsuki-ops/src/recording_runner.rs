//! In-memory [`CommandRunner`] that records instead of spawning.
//!
//! Used by tests across the workspace to script failures and probe results by
//! substring and to assert on the exact ordered command history.

use std::sync::{Mutex, PoisonError};

use anyhow::Result;
use tsuki_core::LogSink;

use crate::command_runner::{
    CommandRunner, CommandSpec, CommandStatus, LaunchMode, LaunchOutcome,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedKind {
    Run,
    Probe,
    Launch(LaunchMode),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub kind: RecordedKind,
    pub spec: CommandSpec,
}

impl RecordedCommand {
    /// `program args...` joined with single spaces, unquoted.
    pub fn line(&self) -> String {
        plain_line(&self.spec)
    }
}

#[derive(Debug, Default)]
pub struct RecordingRunner {
    history: Mutex<Vec<RecordedCommand>>,
    failing: Vec<String>,
    probe_success: Vec<String>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any `run` whose plain line contains `needle` exits 1.
    pub fn fail_when(mut self, needle: &str) -> Self {
        self.failing.push(needle.to_string());
        self
    }

    /// Any `probe` whose plain line contains `needle` succeeds; others fail.
    pub fn probe_succeeds_when(mut self, needle: &str) -> Self {
        self.probe_success.push(needle.to_string());
        self
    }

    pub fn history(&self) -> Vec<RecordedCommand> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Plain lines of every `run` call, in order.
    pub fn run_lines(&self) -> Vec<String> {
        self.history()
            .into_iter()
            .filter(|entry| entry.kind == RecordedKind::Run)
            .map(|entry| entry.line())
            .collect()
    }

    pub fn launches(&self) -> Vec<RecordedCommand> {
        self.history()
            .into_iter()
            .filter(|entry| matches!(entry.kind, RecordedKind::Launch(_)))
            .collect()
    }

    fn record(&self, kind: RecordedKind, spec: &CommandSpec) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCommand {
                kind,
                spec: spec.clone(),
            });
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, spec: &CommandSpec, sink: &LogSink) -> Result<CommandStatus> {
        self.record(RecordedKind::Run, spec);
        let line = plain_line(spec);
        sink.line(&format!("$ {}", spec.display()))?;
        if self.failing.iter().any(|needle| line.contains(needle)) {
            sink.line("  simulated failure")?;
            return Ok(CommandStatus { code: Some(1) });
        }
        Ok(CommandStatus::SUCCESS)
    }

    fn probe(&self, spec: &CommandSpec) -> bool {
        self.record(RecordedKind::Probe, spec);
        let line = plain_line(spec);
        self.probe_success.iter().any(|needle| line.contains(needle))
    }

    fn launch(
        &self,
        spec: &CommandSpec,
        sink: &LogSink,
        mode: LaunchMode,
    ) -> Result<LaunchOutcome> {
        self.record(RecordedKind::Launch(mode), spec);
        sink.line(&format!("$ {}", spec.display()))?;
        Ok(match mode {
            LaunchMode::Detached => LaunchOutcome::Spawned { pid: 4242 },
            LaunchMode::Wait => LaunchOutcome::Exited(CommandStatus::SUCCESS),
        })
    }
}

fn plain_line(spec: &CommandSpec) -> String {
    let mut words = vec![spec.program.as_str()];
    words.extend(spec.args.iter().map(String::as_str));
    words.join(" ")
}
