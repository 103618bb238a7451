//! Run coordination: cleanup, preparation, emulation, analysis, teardown and
//! report persistence for one firmware image.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::analysis::{AnalysisStep, CommandAnalysis};
use crate::cleanup::{Cleanup, CleanupPhase};
use crate::config::Settings;
use crate::emulation::EmulationController;
use crate::error::{OrchestratorError, ReportError};
use crate::pipeline::PreparationPipeline;
use crate::report::{firmware_digest, RunReport, StageStatus};
use crate::runner::CommandRunner;
use crate::stage::PipelineStage;

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub status: StageStatus,
    pub report: RunReport,
    pub report_path: PathBuf,
}

/// Drives one run end to end.
pub struct RunCoordinator {
    settings: Settings,
    runner: Arc<dyn CommandRunner>,
    pipeline: PreparationPipeline,
    cleanup: Cleanup,
    analysis: Arc<dyn AnalysisStep>,
}

impl RunCoordinator {
    pub fn new(settings: Settings, runner: Arc<dyn CommandRunner>) -> Result<Self, OrchestratorError> {
        settings.validate()?;
        let pipeline = PreparationPipeline::new(&settings, runner.clone())?;
        let cleanup = Cleanup::new(&settings, runner.clone())?;
        let analysis = Arc::new(CommandAnalysis::from_settings(runner.clone(), &settings));
        Ok(Self {
            settings,
            runner,
            pipeline,
            cleanup,
            analysis,
        })
    }

    /// Replace the analysis step.
    pub fn with_analysis(mut self, analysis: Arc<dyn AnalysisStep>) -> Self {
        self.analysis = analysis;
        self
    }

    pub fn report_path(&self) -> PathBuf {
        self.settings.report_path()
    }

    /// Emulate and analyze `input`, then write the run report.
    ///
    /// Stage failures end up in the report and yield a `Failure` summary;
    /// only a missing input, report misuse or an unwritable report file
    /// return an error.
    pub async fn execute(&self, input: &Path) -> Result<RunSummary, OrchestratorError> {
        if !input.exists() {
            return Err(OrchestratorError::InvalidInput(input.to_path_buf()));
        }

        let start = Instant::now();
        let digest = match firmware_digest(input) {
            Ok(digest) => Some(digest),
            Err(err) => {
                warn!(input = %input.display(), error = %err, "Could not hash firmware image");
                None
            }
        };
        let mut report = RunReport::new(input, self.settings.image_slot).with_firmware_digest(digest);
        info!(
            run_id = %report.run_id(),
            input = %input.display(),
            slot = self.settings.image_slot,
            "Starting emulation run"
        );

        self.cleanup.run(CleanupPhase::Pre).await;

        let mut emulation = EmulationController::new(
            self.runner.clone(),
            self.pipeline.toolchain(),
            self.settings.emulation.clone(),
        );
        let stages = self.run_stages(input, &mut report, &mut emulation).await;
        let status = match &stages {
            Ok(status) => *status,
            Err(_) => StageStatus::Failure,
        };

        emulation.teardown(status).await;
        self.cleanup.run(CleanupPhase::Post).await;
        stages?;

        report.finalize(status)?;
        let report_path = self.report_path();
        report.write(&report_path)?;

        info!(
            run_id = %report.run_id(),
            result = report.result().unwrap_or_default(),
            report = %report_path.display(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Run finished"
        );
        Ok(RunSummary {
            status,
            report,
            report_path,
        })
    }

    async fn run_stages(
        &self,
        input: &Path,
        report: &mut RunReport,
        emulation: &mut EmulationController,
    ) -> Result<StageStatus, ReportError> {
        if !self.pipeline.run(input, report).await?.is_success() {
            return Ok(StageStatus::Failure);
        }

        info!(stage = %PipelineStage::StartEmulation, "Executing stage");
        let emulated = emulation.start(report).await;
        let emulated_ok = emulated.is_success();
        report.record(PipelineStage::StartEmulation, emulated)?;
        if !emulated_ok {
            return Ok(StageStatus::Failure);
        }

        info!(stage = %PipelineStage::Analyze, "Executing stage");
        let analyzed = self.analysis.analyze(report).await;
        let status = analyzed.status();
        report.record(PipelineStage::Analyze, analyzed)?;
        Ok(status)
    }
}
