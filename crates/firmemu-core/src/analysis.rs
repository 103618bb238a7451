//! Analysis of the running emulated device.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::Settings;
use crate::error::StageError;
use crate::pipeline::failed;
use crate::report::{RunReport, StageOutcome};
use crate::runner::{CommandRunner, CommandSpec};
use crate::stage::PipelineStage;

pub const ANALYSIS_MESSAGE: &str = "Analysis of the emulated firmware failed";

/// Payload key carrying the analysis command's stdout.
pub const OUTPUT_FIELD: &str = "output";

/// Inspects the device once its network is reachable.
#[async_trait]
pub trait AnalysisStep: Send + Sync {
    async fn analyze(&self, report: &RunReport) -> StageOutcome;
}

/// Runs an external command with the inferred address appended.
pub struct CommandAnalysis {
    runner: Arc<dyn CommandRunner>,
    command: Vec<String>,
    timeout: Duration,
}

impl CommandAnalysis {
    pub fn new(runner: Arc<dyn CommandRunner>, command: Vec<String>, timeout: Duration) -> Self {
        Self {
            runner,
            command,
            timeout,
        }
    }

    pub fn from_settings(runner: Arc<dyn CommandRunner>, settings: &Settings) -> Self {
        Self::new(
            runner,
            settings.analysis.command.clone(),
            settings.timeouts.analysis(),
        )
    }

    fn command_for(&self, address: &str) -> Option<CommandSpec> {
        let (program, args) = self.command.split_first()?;
        Some(CommandSpec::new(program.clone()).args(args.iter().cloned()).arg(address))
    }
}

#[async_trait]
impl AnalysisStep for CommandAnalysis {
    async fn analyze(&self, report: &RunReport) -> StageOutcome {
        let stage = PipelineStage::Analyze;
        let Some(address) = report.inferred_address() else {
            return failed(
                stage,
                ANALYSIS_MESSAGE,
                StageError::Lifecycle("no inferred address to analyze".into()),
            );
        };
        let Some(command) = self.command_for(&address.to_string()) else {
            return failed(
                stage,
                ANALYSIS_MESSAGE,
                StageError::Lifecycle("analysis command is empty".into()),
            );
        };

        info!(stage = %stage, command = %command, "Analyzing emulated device");
        match self.runner.run(&command, self.timeout).await {
            Ok(output) if output.success() => {
                StageOutcome::success().with_data(OUTPUT_FIELD, output.stdout)
            }
            Ok(output) => failed(
                stage,
                ANALYSIS_MESSAGE,
                StageError::exit_code(command.to_string(), output.exit_code),
            ),
            Err(err) => failed(stage, ANALYSIS_MESSAGE, err.into()),
        }
    }
}
