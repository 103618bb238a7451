//! firmemu core - unattended firmware emulation
//!
//! Provides the orchestration pipeline that:
//! - Prepares an emulation (extract, detect architecture, load filesystem,
//!   build disk image, infer network configuration)
//! - Launches the emulator in the background and waits for its network
//! - Hands the running instance to an analysis step
//! - Records one outcome per stage into a single run report

pub mod analysis;
pub mod cleanup;
pub mod config;
pub mod coordinator;
pub mod emulation;
pub mod error;
pub mod fakes;
pub mod network;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod stage;
pub mod telemetry;
pub mod toolchain;

// Re-export key types
pub use analysis::{AnalysisStep, CommandAnalysis};
pub use cleanup::{Cleanup, CleanupPhase, CleanupStatus};
pub use config::{Settings, TeardownPolicy};
pub use coordinator::{RunCoordinator, RunSummary};
pub use emulation::{EmulationController, EmulationState};
pub use error::{ConfigError, OrchestratorError, ReportError, RunnerError, StageError};
pub use pipeline::PreparationPipeline;
pub use report::{RunReport, StageOutcome, StageStatus};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, LocalRunner, ProcessHandle, PromptTable};
pub use stage::PipelineStage;
pub use telemetry::init_tracing;
pub use toolchain::Toolchain;
