//! Preparation pipeline: the five stages that turn a firmware image into a
//! bootable emulation.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{Settings, StageTimeouts};
use crate::error::{ConfigError, ReportError, StageError};
use crate::network::parse_inferred_address;
use crate::report::{RunReport, StageOutcome, StageStatus, IP_FIELD};
use crate::runner::{CommandOutput, CommandRunner, CommandSpec, PromptTable, RunnerResult};
use crate::stage::PipelineStage;
use crate::toolchain::Toolchain;

pub const INVALID_INPUT_MESSAGE: &str = "Invalid path to the input file";
pub const EXTRACTION_SCRIPT_MESSAGE: &str = "ERROR executing the extraction script";
pub const EXTRACTION_ARTIFACT_MESSAGE: &str = "It wasn't possible to extract the filesystem";
pub const ARCHITECTURE_MESSAGE: &str = "ERROR occurred while executing the store_architecture script";
pub const LOAD_FILESYSTEM_MESSAGE: &str = "ERROR occurred while executing the load_filesystem script";
pub const BUILD_IMAGE_MESSAGE: &str = "It wasn't possible to create the QEMU image";
pub const INFER_NETWORK_MESSAGE: &str = "Error executing infer_network script";
pub const NO_ADDRESS_MESSAGE: &str = "No ip_address could be inferred";

/// Failed outcome carrying the stage message and the underlying error.
pub(crate) fn failed(stage: PipelineStage, message: &str, err: StageError) -> StageOutcome {
    warn!(stage = %stage, error = %err, "{}", message);
    StageOutcome::failure(format!("{}: {}", message, err))
}

/// Output of a command that must exit zero.
fn completed(command: &CommandSpec, result: RunnerResult<CommandOutput>) -> Result<CommandOutput, StageError> {
    let output = result?;
    if !output.success() {
        return Err(StageError::exit_code(command.to_string(), output.exit_code));
    }
    Ok(output)
}

/// Runs extract, detect-architecture, load-filesystem, build-image and
/// infer-network in order, stopping at the first failure.
pub struct PreparationPipeline {
    runner: Arc<dyn CommandRunner>,
    toolchain: Toolchain,
    timeouts: StageTimeouts,
    prompts: PromptTable,
}

impl PreparationPipeline {
    pub fn new(settings: &Settings, runner: Arc<dyn CommandRunner>) -> Result<Self, ConfigError> {
        Ok(Self {
            runner,
            toolchain: Toolchain::from_settings(settings),
            timeouts: settings.timeouts.clone(),
            prompts: settings.credentials.prompt_table()?,
        })
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    /// Execute every preparation stage against `input`, recording each
    /// outcome into `report`.
    ///
    /// Returns `Failure` as soon as one stage fails; later stages are neither
    /// executed nor recorded.
    pub async fn run(&self, input: &Path, report: &mut RunReport) -> Result<StageStatus, ReportError> {
        for stage in PipelineStage::PREPARATION {
            info!(stage = %stage, "Executing stage");
            let outcome = self.run_stage(stage, input).await;
            let passed = outcome.is_success();
            report.record(stage, outcome)?;

            if !passed {
                info!(stage = %stage, "Preparation stopped");
                return Ok(StageStatus::Failure);
            }
            info!(stage = %stage, "Stage succeeded");
        }
        Ok(StageStatus::Success)
    }

    /// Execute a single preparation stage.
    pub async fn run_stage(&self, stage: PipelineStage, input: &Path) -> StageOutcome {
        match stage {
            PipelineStage::Extract => self.extract(input).await,
            PipelineStage::DetectArchitecture => self.detect_architecture().await,
            PipelineStage::LoadFilesystem => self.load_filesystem().await,
            PipelineStage::BuildImage => self.build_image().await,
            PipelineStage::InferNetwork => self.infer_network().await,
            other => failed(
                other,
                "Not a preparation stage",
                StageError::Lifecycle(format!("{} cannot run in the preparation pipeline", other)),
            ),
        }
    }

    async fn extract(&self, input: &Path) -> StageOutcome {
        let stage = PipelineStage::Extract;
        if !input.exists() {
            return failed(stage, INVALID_INPUT_MESSAGE, StageError::InvalidInput(input.to_path_buf()));
        }

        let command = self.toolchain.extract_command(input);
        let result = self.runner.run(&command, self.timeouts.extract()).await;
        if let Err(err) = completed(&command, result) {
            return failed(stage, EXTRACTION_SCRIPT_MESSAGE, err);
        }

        let archive = self.toolchain.archive_path();
        if !archive.exists() {
            return failed(stage, EXTRACTION_ARTIFACT_MESSAGE, StageError::ArtifactMissing(archive));
        }
        StageOutcome::success()
    }

    async fn detect_architecture(&self) -> StageOutcome {
        let command = self.toolchain.architecture_command();
        let result = self
            .runner
            .run_interactive(&command, &self.prompts, self.timeouts.architecture())
            .await;
        match completed(&command, result) {
            Ok(_) => StageOutcome::success(),
            Err(err) => failed(PipelineStage::DetectArchitecture, ARCHITECTURE_MESSAGE, err),
        }
    }

    async fn load_filesystem(&self) -> StageOutcome {
        let command = self.toolchain.load_filesystem_command();
        let result = self.runner.run(&command, self.timeouts.load_filesystem()).await;
        match completed(&command, result) {
            Ok(_) => StageOutcome::success(),
            Err(err) => failed(PipelineStage::LoadFilesystem, LOAD_FILESYSTEM_MESSAGE, err),
        }
    }

    /// The disk image on disk is authoritative; the builder's exit code is not.
    async fn build_image(&self) -> StageOutcome {
        let stage = PipelineStage::BuildImage;
        let command = self.toolchain.build_image_command();
        match self
            .runner
            .run_interactive(&command, &self.prompts, self.timeouts.build_image())
            .await
        {
            Ok(output) if !output.success() => {
                warn!(stage = %stage, exit_code = output.exit_code, "Image builder exited nonzero");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(stage = %stage, error = %err, "Image builder did not complete");
            }
        }

        let image = self.toolchain.disk_image_path();
        if !image.exists() {
            return failed(stage, BUILD_IMAGE_MESSAGE, StageError::ArtifactMissing(image));
        }
        StageOutcome::success()
    }

    async fn infer_network(&self) -> StageOutcome {
        let stage = PipelineStage::InferNetwork;
        let command = self.toolchain.infer_network_command();
        let output = match self
            .runner
            .run_interactive(&command, &self.prompts, self.timeouts.infer_network())
            .await
        {
            Ok(output) => output,
            Err(err) => return failed(stage, INFER_NETWORK_MESSAGE, err.into()),
        };

        match parse_inferred_address(&output.combined()) {
            Some(address) => {
                info!(stage = %stage, ip = %address, "Inferred device address");
                StageOutcome::success().with_data(IP_FIELD, address.to_string())
            }
            None => {
                warn!(stage = %stage, exit_code = output.exit_code, "{}", NO_ADDRESS_MESSAGE);
                StageOutcome::failure(NO_ADDRESS_MESSAGE)
            }
        }
    }
}
