//! External command execution.
//!
//! Every toolchain script is reached through [`CommandRunner`]: one-shot
//! commands, commands answering scripted prompts, and the detached emulator
//! process. [`LocalRunner`] is the tokio-backed implementation; tests use
//! [`crate::fakes::ScriptedRunner`].

mod interactive;
pub mod local;
pub mod prompt;
#[cfg(target_os = "linux")]
mod terminal;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use crate::error::RunnerResult;
pub use local::{LocalProcess, LocalRunner};
pub use prompt::PromptTable;

/// An external command: executable, arguments and working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable name or path.
    pub program: String,

    /// Arguments, passed verbatim (no shell expansion).
    pub args: Vec<String>,

    /// Working directory, inherited when `None`.
    pub current_dir: Option<PathBuf>,

    /// File a background process appends its output to. Discarded when `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_log: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            output_log: None,
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

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn output_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_log = Some(path.into());
        self
    }

    /// Whether the program or any argument contains `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.program.contains(needle) || self.args.iter().any(|a| a.contains(needle))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (-1 when terminated by a signal).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        let mut out = self.stdout.clone();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&self.stderr);
        out
    }
}

/// Executes external commands on behalf of the pipeline stages.
///
/// Implementations return output regardless of exit code; deciding whether a
/// nonzero exit is a failure is up to the caller.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion within `timeout`.
    async fn run(&self, command: &CommandSpec, timeout: Duration) -> RunnerResult<CommandOutput>;

    /// Run a command to completion, answering every prompt in `prompts`.
    async fn run_interactive(
        &self,
        command: &CommandSpec,
        prompts: &PromptTable,
        timeout: Duration,
    ) -> RunnerResult<CommandOutput>;

    /// Start a background process and return without waiting for it.
    ///
    /// The process outlives the runner: its output goes to
    /// [`CommandSpec::output_log`], never back to the caller.
    async fn spawn(&self, command: &CommandSpec) -> RunnerResult<Box<dyn ProcessHandle>>;
}

/// Exclusive handle on a background process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// OS process id, if the process has not been reaped.
    fn id(&self) -> Option<u32>;

    /// Whether the process is still running.
    async fn is_running(&mut self) -> bool;

    /// Ask the process to stop, forcing it after `grace`.
    ///
    /// Terminating an already exited process succeeds.
    async fn terminate(&mut self, grace: Duration) -> RunnerResult<()>;
}
