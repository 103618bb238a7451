//! firmemu - unattended firmware emulation
//!
//! Extracts a firmware image, prepares it for QEMU with the Firmadyne
//! toolchain, boots it, checks that its network comes up, analyzes the
//! running device and writes a JSON report of every stage.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use firmemu_core::telemetry::level_for;
use firmemu_core::{init_tracing, LocalRunner, RunCoordinator, Settings};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "firmemu")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Firmware emulation and analysis with Firmadyne", long_about = None)]
struct Cli {
    /// Firmware image to emulate
    input_file: PathBuf,

    /// Settings file (TOML)
    #[arg(long, env = "FIRMEMU_CONFIG")]
    config: Option<PathBuf>,

    /// Root of the Firmadyne installation
    #[arg(long, env = "FIRMADYNE_PATH")]
    firmadyne_path: Option<PathBuf>,

    /// Database password sent to the toolchain scripts
    #[arg(long, env = "FIRMADYNE_PASSWORD", hide_env_values = true)]
    db_password: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let mut settings = Settings::load(self.config.as_deref()).context("Failed to load settings")?;
        if let Some(path) = &self.firmadyne_path {
            settings.firmadyne_path = path.clone();
        }
        if let Some(password) = &self.db_password {
            settings.credentials.password = password.clone();
        }
        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json, level_for(cli.verbose));

    let settings = cli.settings()?;
    debug!(firmadyne_path = %settings.firmadyne_path.display(), "Settings resolved");

    let runner = Arc::new(LocalRunner::new(settings.timeouts.prompt_idle()));
    let coordinator = RunCoordinator::new(settings, runner).context("Failed to set up run")?;
    let summary = coordinator
        .execute(&cli.input_file)
        .await
        .with_context(|| format!("Emulation of {} aborted", cli.input_file.display()))?;

    println!("{}", summary.report.result().unwrap_or_default());
    println!("Report: {}", summary.report_path.display());
    Ok(())
}
