//! tokio-backed command runner.

use std::fs::OpenOptions;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{interactive, CommandOutput, CommandRunner, CommandSpec, ProcessHandle, PromptTable};
use crate::error::{RunnerError, RunnerResult};

/// Runs commands as local child processes.
///
/// Every child starts a session of its own, away from the orchestrator's
/// terminal. It leads a process group, so a timeout or teardown reaches
/// everything it started.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    prompt_idle: Duration,
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self {
            prompt_idle: Duration::from_secs(5),
        }
    }
}

impl LocalRunner {
    /// `prompt_idle` bounds how long an unregistered prompt may go unanswered.
    pub fn new(prompt_idle: Duration) -> Self {
        Self { prompt_idle }
    }
}

/// Base `Command` for a spec, with stdin closed.
pub(super) fn command_for(spec: &CommandSpec) -> Command {
    Command::from(std_command_for(spec))
}

pub(super) fn std_command_for(spec: &CommandSpec) -> std::process::Command {
    let mut command = std::process::Command::new(&spec.program);
    command.args(&spec.args).stdin(Stdio::null());
    if let Some(dir) = &spec.current_dir {
        command.current_dir(dir);
    }
    detach(&mut command);
    command
}

#[cfg(unix)]
fn detach(command: &mut std::process::Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: setsid is async-signal-safe.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid()?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn detach(_command: &mut std::process::Command) {}

/// Kill the process group led by `pid`, if any.
pub(super) fn kill_group(spec: &CommandSpec, pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    if let Err(err) = signal_group(pid, GroupSignal::Kill) {
        warn!(command = %spec, pid, error = %err, "Failed to kill process group");
    }
}

pub(super) fn launch_failure(spec: &CommandSpec, source: std::io::Error) -> RunnerError {
    RunnerError::LaunchFailure {
        command: spec.to_string(),
        source,
    }
}

pub(super) fn timeout_error(spec: &CommandSpec, limit: Duration) -> RunnerError {
    RunnerError::Timeout {
        command: spec.to_string(),
        limit_ms: limit.as_millis() as u64,
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> RunnerResult<CommandOutput> {
        let start = Instant::now();
        debug!(command = %spec, "Running command");

        let child = command_for(spec)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| launch_failure(spec, e))?;
        let pid = child.id();

        let waiting = child.wait_with_output();
        tokio::pin!(waiting);
        let output = match tokio::time::timeout(timeout, &mut waiting).await {
            Ok(output) => output.map_err(|e| RunnerError::Interaction {
                command: spec.to_string(),
                reason: e.to_string(),
            })?,
            Err(_) => {
                // The child is not reaped yet, so its pid still names the group.
                kill_group(spec, pid);
                return Err(timeout_error(spec, timeout));
            }
        };

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        debug!(
            command = %spec,
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            "Command finished"
        );
        Ok(result)
    }

    async fn run_interactive(
        &self,
        spec: &CommandSpec,
        prompts: &PromptTable,
        timeout: Duration,
    ) -> RunnerResult<CommandOutput> {
        interactive::drive(spec, prompts, timeout, self.prompt_idle).await
    }

    async fn spawn(&self, spec: &CommandSpec) -> RunnerResult<Box<dyn ProcessHandle>> {
        // The process may outlive this runtime, so nothing it writes may
        // depend on a reader here.
        let (stdout, stderr) = match &spec.output_log {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir).map_err(|e| launch_failure(spec, e))?;
                }
                let log = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| launch_failure(spec, e))?;
                let log_err = log.try_clone().map_err(|e| launch_failure(spec, e))?;
                (Stdio::from(log), Stdio::from(log_err))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let child = command_for(spec)
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| launch_failure(spec, e))?;
        let label = spec.to_string();

        debug!(
            command = %label,
            pid = ?child.id(),
            log = ?spec.output_log,
            "Spawned background process"
        );
        Ok(Box::new(LocalProcess {
            child,
            command: label,
        }))
    }
}

/// A background child process started by [`LocalRunner::spawn`].
#[derive(Debug)]
pub struct LocalProcess {
    child: Child,
    command: String,
}

impl LocalProcess {
    fn exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }
}

#[async_trait]
impl ProcessHandle for LocalProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn is_running(&mut self) -> bool {
        !self.exited()
    }

    async fn terminate(&mut self, grace: Duration) -> RunnerResult<()> {
        if self.exited() {
            return Ok(());
        }
        let Some(pid) = self.child.id() else {
            return Ok(());
        };

        debug!(command = %self.command, pid, "Terminating process group");
        signal_group(pid, GroupSignal::Terminate)?;
        if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
            return Ok(());
        }

        warn!(
            command = %self.command,
            pid,
            grace_ms = grace.as_millis() as u64,
            "Process ignored SIGTERM, killing"
        );
        signal_group(pid, GroupSignal::Kill)?;
        self.child
            .wait()
            .await
            .map(|_| ())
            .map_err(|e| RunnerError::Signal {
                pid,
                reason: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) -> RunnerResult<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(RunnerError::Signal {
            pid,
            reason: errno.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, _signal: GroupSignal) -> RunnerResult<()> {
    Err(RunnerError::Signal {
        pid,
        reason: "process groups are only supported on unix".to_string(),
    })
}
