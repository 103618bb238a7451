//! Toolchain state reset, run before and after every emulation.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::ConfigError;
use crate::runner::{CommandRunner, PromptTable};
use crate::toolchain::Toolchain;

/// Extra bound on the one-shot additional delete script.
const ADDITIONAL_DELETE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPhase {
    Pre,
    Post,
}

impl std::fmt::Display for CleanupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupPhase::Pre => f.write_str("pre"),
            CleanupPhase::Post => f.write_str("post"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupStatus {
    /// Both scripts ran and exited zero.
    Complete,
    /// The delete script succeeded but the additional delete did not.
    Partial,
    /// The delete script failed; the additional delete was skipped.
    Failed,
}

/// Runs the delete scripts for the configured image slot.
///
/// Failures are logged and reported, never propagated.
pub struct Cleanup {
    runner: Arc<dyn CommandRunner>,
    toolchain: Toolchain,
    prompts: PromptTable,
    timeout: Duration,
}

impl Cleanup {
    pub fn new(settings: &Settings, runner: Arc<dyn CommandRunner>) -> Result<Self, ConfigError> {
        Ok(Self {
            runner,
            toolchain: Toolchain::from_settings(settings),
            prompts: settings.credentials.prompt_table()?,
            timeout: settings.timeouts.cleanup(),
        })
    }

    pub async fn run(&self, phase: CleanupPhase) -> CleanupStatus {
        let delete = self.toolchain.delete_command();
        match self
            .runner
            .run_interactive(&delete, &self.prompts, self.timeout)
            .await
        {
            Ok(output) => {
                debug!(phase = %phase, command = %delete, output = %output.combined(), "Cleanup output");
                if !output.success() {
                    warn!(phase = %phase, command = %delete, exit_code = output.exit_code, "Cleanup failed");
                    return CleanupStatus::Failed;
                }
            }
            Err(err) => {
                warn!(phase = %phase, command = %delete, error = %err, "Cleanup failed");
                return CleanupStatus::Failed;
            }
        }

        let additional = self.toolchain.additional_delete_command();
        let status = match self.runner.run(&additional, ADDITIONAL_DELETE_TIMEOUT).await {
            Ok(output) => {
                debug!(phase = %phase, command = %additional, output = %output.combined(), "Cleanup output");
                if output.success() {
                    CleanupStatus::Complete
                } else {
                    warn!(phase = %phase, command = %additional, exit_code = output.exit_code, "Additional cleanup failed");
                    CleanupStatus::Partial
                }
            }
            Err(err) => {
                warn!(phase = %phase, command = %additional, error = %err, "Additional cleanup failed");
                CleanupStatus::Partial
            }
        };
        info!(phase = %phase, status = ?status, "Cleanup finished");
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{InvocationKind, ScriptedReply, ScriptedRunner};
    use std::sync::Mutex;

    fn cleanup(runner: Arc<ScriptedRunner>) -> Cleanup {
        Cleanup::new(&Settings::default(), runner).unwrap()
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[tokio::test]
    async fn test_both_scripts_run_on_success() {
        let runner = Arc::new(ScriptedRunner::new());

        let status = cleanup(runner.clone()).run(CleanupPhase::Pre).await;

        assert_eq!(status, CleanupStatus::Complete);
        let calls = runner.invocations();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].kind, InvocationKind::Interactive);
        assert_eq!(calls[0].command.to_string(), "sudo /opt/firmadyne/scripts/delete.sh 1");
        assert_eq!(calls[0].timeout, Some(Duration::from_secs(120)));
        assert_eq!(calls[1].kind, InvocationKind::Run);
        assert!(calls[1].command.mentions("additional_delete.sh"));
    }

    #[tokio::test]
    async fn test_failed_delete_skips_additional() {
        let runner = Arc::new(ScriptedRunner::new().on("scripts/delete.sh", ScriptedReply::exit(1)));

        let status = cleanup(runner.clone()).run(CleanupPhase::Post).await;

        assert_eq!(status, CleanupStatus::Failed);
        assert_eq!(runner.count_matching("additional_delete.sh"), 0);
    }

    #[tokio::test]
    async fn test_delete_timeout_is_not_fatal() {
        let runner = Arc::new(ScriptedRunner::new().on("scripts/delete.sh", ScriptedReply::Timeout));

        assert_eq!(cleanup(runner).run(CleanupPhase::Pre).await, CleanupStatus::Failed);
    }

    #[tokio::test]
    async fn test_additional_failure_is_partial() {
        let runner = Arc::new(
            ScriptedRunner::new().on("additional_delete.sh", ScriptedReply::LaunchFailure),
        );

        assert_eq!(cleanup(runner).run(CleanupPhase::Post).await, CleanupStatus::Partial);
    }

    #[tokio::test]
    async fn test_cleanup_twice_is_harmless() {
        let runner = Arc::new(ScriptedRunner::new());
        let cleanup = cleanup(runner.clone());

        assert_eq!(cleanup.run(CleanupPhase::Pre).await, CleanupStatus::Complete);
        assert_eq!(cleanup.run(CleanupPhase::Pre).await, CleanupStatus::Complete);
        assert_eq!(runner.count_matching("scripts/delete.sh"), 2);
    }

    #[tokio::test]
    async fn test_script_output_is_logged() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);
        let runner = Arc::new(
            ScriptedRunner::new()
                .on("additional_delete.sh", ScriptedReply::stdout(1, "umount: target is busy"))
                .on("scripts/delete.sh", ScriptedReply::stdout(0, "Deleting image 1")),
        );

        let status = cleanup(runner).run(CleanupPhase::Post).await;

        assert_eq!(status, CleanupStatus::Partial);
        let logs = logs.contents();
        assert!(logs.contains("Deleting image 1"), "delete output missing from logs: {}", logs);
        assert!(logs.contains("umount: target is busy"), "additional delete output missing from logs: {}", logs);
    }
}
