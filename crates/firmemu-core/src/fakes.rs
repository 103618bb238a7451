//! In-memory fakes for the runner traits (testing only)
//!
//! `ScriptedRunner` answers commands from a list of rules and records every
//! invocation, so pipeline behavior can be asserted without the Firmadyne
//! toolchain installed.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{RunnerError, RunnerResult};
use crate::runner::{CommandOutput, CommandRunner, CommandSpec, ProcessHandle, PromptTable};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted result for a matching command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    /// Command completes with `code`, printing `stdout`.
    ///
    /// For `spawn`, the process is reported as already exited.
    Exit { code: i32, stdout: String },
    Timeout,
    LaunchFailure,
    UnexpectedPrompt(String),
}

impl ScriptedReply {
    pub fn exit(code: i32) -> Self {
        ScriptedReply::Exit {
            code,
            stdout: String::new(),
        }
    }

    pub fn stdout(code: i32, stdout: impl Into<String>) -> Self {
        ScriptedReply::Exit {
            code,
            stdout: stdout.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    needle: String,
    reply: ScriptedReply,
    artifact: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    Run,
    Interactive,
    Spawn,
}

/// One recorded call on the runner.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub kind: InvocationKind,
    pub command: CommandSpec,
    pub timeout: Option<Duration>,
}

/// Observable state of a process started through [`ScriptedRunner::spawn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeProcessState {
    pub pid: u32,
    pub running: bool,
    pub terminate_calls: usize,
}

/// Command runner answering from scripted rules.
///
/// Rules are matched in registration order against the program and
/// arguments; the first rule whose needle appears wins. Commands no rule
/// matches exit zero with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Vec<Rule>,
    invocations: Mutex<Vec<Invocation>>,
    processes: Mutex<Vec<Arc<Mutex<FakeProcessState>>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `reply` to any command mentioning `needle`.
    pub fn on(mut self, needle: impl Into<String>, reply: ScriptedReply) -> Self {
        self.rules.push(Rule {
            needle: needle.into(),
            reply,
            artifact: None,
        });
        self
    }

    /// Like [`on`](Self::on), also creating `artifact` as the command's side
    /// effect.
    pub fn on_with_artifact(
        mut self,
        needle: impl Into<String>,
        reply: ScriptedReply,
        artifact: impl Into<PathBuf>,
    ) -> Self {
        self.rules.push(Rule {
            needle: needle.into(),
            reply,
            artifact: Some(artifact.into()),
        });
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.invocations).clone()
    }

    /// Number of recorded calls whose command mentions `needle`.
    pub fn count_matching(&self, needle: &str) -> usize {
        lock(&self.invocations)
            .iter()
            .filter(|inv| inv.command.mentions(needle))
            .count()
    }

    pub fn processes(&self) -> Vec<FakeProcessState> {
        lock(&self.processes)
            .iter()
            .map(|state| lock(state).clone())
            .collect()
    }

    fn record(&self, kind: InvocationKind, command: &CommandSpec, timeout: Option<Duration>) {
        lock(&self.invocations).push(Invocation {
            kind,
            command: command.clone(),
            timeout,
        });
    }

    fn reply_for(&self, command: &CommandSpec) -> Option<ScriptedReply> {
        let rule = self.rules.iter().find(|rule| command.mentions(&rule.needle))?;
        if let Some(artifact) = &rule.artifact {
            if let Some(parent) = artifact.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            std::fs::write(artifact, b"").ok();
        }
        Some(rule.reply.clone())
    }

    fn complete(&self, command: &CommandSpec, timeout: Duration) -> RunnerResult<CommandOutput> {
        match self.reply_for(command) {
            None => Ok(output(0, String::new())),
            Some(ScriptedReply::Exit { code, stdout }) => Ok(output(code, stdout)),
            Some(ScriptedReply::Timeout) => Err(RunnerError::Timeout {
                command: command.to_string(),
                limit_ms: timeout.as_millis() as u64,
            }),
            Some(ScriptedReply::LaunchFailure) => Err(launch_failure(command)),
            Some(ScriptedReply::UnexpectedPrompt(prompt)) => Err(RunnerError::UnexpectedPrompt {
                command: command.to_string(),
                prompt,
            }),
        }
    }
}

fn output(exit_code: i32, stdout: String) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout,
        stderr: String::new(),
        duration_ms: 0,
    }
}

fn launch_failure(command: &CommandSpec) -> RunnerError {
    RunnerError::LaunchFailure {
        command: command.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted launch failure"),
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &CommandSpec, timeout: Duration) -> RunnerResult<CommandOutput> {
        self.record(InvocationKind::Run, command, Some(timeout));
        self.complete(command, timeout)
    }

    async fn run_interactive(
        &self,
        command: &CommandSpec,
        _prompts: &PromptTable,
        timeout: Duration,
    ) -> RunnerResult<CommandOutput> {
        self.record(InvocationKind::Interactive, command, Some(timeout));
        self.complete(command, timeout)
    }

    async fn spawn(&self, command: &CommandSpec) -> RunnerResult<Box<dyn ProcessHandle>> {
        self.record(InvocationKind::Spawn, command, None);
        let running = match self.reply_for(command) {
            None => true,
            Some(ScriptedReply::Exit { .. }) => false,
            Some(_) => return Err(launch_failure(command)),
        };

        let mut processes = lock(&self.processes);
        let state = Arc::new(Mutex::new(FakeProcessState {
            pid: 4000 + processes.len() as u32,
            running,
            terminate_calls: 0,
        }));
        processes.push(state.clone());
        Ok(Box::new(FakeProcess { state }))
    }
}

/// Process handle whose state is shared with the owning [`ScriptedRunner`].
#[derive(Debug)]
pub struct FakeProcess {
    state: Arc<Mutex<FakeProcessState>>,
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn id(&self) -> Option<u32> {
        let state = lock(&self.state);
        state.running.then_some(state.pid)
    }

    async fn is_running(&mut self) -> bool {
        lock(&self.state).running
    }

    async fn terminate(&mut self, _grace: Duration) -> RunnerResult<()> {
        let mut state = lock(&self.state);
        state.terminate_calls += 1;
        state.running = false;
        Ok(())
    }
}
