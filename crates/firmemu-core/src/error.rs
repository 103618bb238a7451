//! Error taxonomy for the emulation pipeline.
//!
//! Runner and stage errors never escape a stage: they are folded into a
//! failed [`StageOutcome`](crate::report::StageOutcome). Only
//! [`OrchestratorError`] aborts a run.

use std::path::PathBuf;

/// Errors produced while driving an external command.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to launch `{command}`: {source}")]
    LaunchFailure {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {limit_ms}ms")]
    Timeout { command: String, limit_ms: u64 },

    #[error("`{command}` is waiting on an unexpected prompt: {prompt:?}")]
    UnexpectedPrompt { command: String, prompt: String },

    #[error("interaction with `{command}` failed: {reason}")]
    Interaction { command: String, reason: String },

    #[error("failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },
}

/// Result type for runner operations.
pub type RunnerResult<T> = std::result::Result<T, RunnerError>;

/// Failure of a single pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("input path does not exist: {0}")]
    InvalidInput(PathBuf),

    #[error("`{command}` failed: {detail}")]
    ExternalCommandFailure { command: String, detail: String },

    #[error("expected artifact is missing: {0}")]
    ArtifactMissing(PathBuf),

    #[error("interaction failed: {0}")]
    InteractionFailure(String),

    #[error("`{command}` timed out after {limit_ms}ms")]
    Timeout { command: String, limit_ms: u64 },

    #[error("{address} is not reachable")]
    NetworkUnreachable { address: String },

    #[error("emulation lifecycle violation: {0}")]
    Lifecycle(String),
}

impl StageError {
    /// Failure for a command that ran to completion with a nonzero exit code.
    pub fn exit_code(command: impl Into<String>, exit_code: i32) -> Self {
        StageError::ExternalCommandFailure {
            command: command.into(),
            detail: format!("exited with code {}", exit_code),
        }
    }
}

impl From<RunnerError> for StageError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::LaunchFailure { command, source } => StageError::ExternalCommandFailure {
                command,
                detail: format!("could not be started: {}", source),
            },
            RunnerError::Timeout { command, limit_ms } => StageError::Timeout { command, limit_ms },
            RunnerError::UnexpectedPrompt { command, prompt } => StageError::InteractionFailure(
                format!("unexpected prompt {:?} from `{}`", prompt, command),
            ),
            RunnerError::Interaction { command, reason } => {
                StageError::InteractionFailure(format!("`{}`: {}", command, reason))
            }
            RunnerError::Signal { pid, reason } => StageError::ExternalCommandFailure {
                command: format!("pid {}", pid),
                detail: reason,
            },
        }
    }
}

/// Misuse of the run report accumulator or failure to persist it.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("stage {stage} recorded out of order (last recorded: {last})")]
    OutOfOrder {
        stage: &'static str,
        last: &'static str,
    },

    #[error("report is finalized; cannot record {0}")]
    Finalized(&'static str),

    #[error("report summary was already set")]
    AlreadyFinalized,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to write report to {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors resolving settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid prompt pattern: {0}")]
    InvalidPrompt(#[from] regex::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Conditions that abort a run instead of being recorded in the report.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid input: {0:?} does not exist")]
    InvalidInput(PathBuf),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("report error: {0}")]
    Report(#[from] ReportError),
}
