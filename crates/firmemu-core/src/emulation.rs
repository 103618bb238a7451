//! Emulator lifecycle: launch, warm-up, reachability check and teardown.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{EmulationSettings, TeardownPolicy};
use crate::error::StageError;
use crate::network::{is_reachable, probe_command};
use crate::pipeline::failed;
use crate::report::{RunReport, StageOutcome, StageStatus, IP_FIELD};
use crate::runner::{CommandRunner, CommandSpec, ProcessHandle};
use crate::stage::PipelineStage;
use crate::toolchain::Toolchain;

pub const NETWORK_MESSAGE: &str = "Firmadyne wasn't able to start the network while emulating";

/// Extra time the runner allows the probe beyond its own reply wait.
const PROBE_SLACK: Duration = Duration::from_secs(5);

/// Lifecycle of the emulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmulationState {
    NotStarted,
    Launched,
    WarmedUp,
    NetworkChecked,
    Terminated,
}

/// Owns at most one emulator process for the duration of a run.
pub struct EmulationController {
    runner: Arc<dyn CommandRunner>,
    launcher: CommandSpec,
    settings: EmulationSettings,
    state: EmulationState,
    process: Option<Box<dyn ProcessHandle>>,
}

impl EmulationController {
    pub fn new(runner: Arc<dyn CommandRunner>, toolchain: &Toolchain, settings: EmulationSettings) -> Self {
        Self {
            runner,
            launcher: toolchain.emulator_command(),
            settings,
            state: EmulationState::NotStarted,
            process: None,
        }
    }

    pub fn state(&self) -> EmulationState {
        self.state
    }

    /// Whether the controller still holds a process handle.
    pub fn owns_process(&self) -> bool {
        self.process.is_some()
    }

    fn expect_state(&self, expected: EmulationState, action: &str) -> Result<(), StageError> {
        if self.state != expected {
            return Err(StageError::Lifecycle(format!(
                "cannot {} while {:?}",
                action, self.state
            )));
        }
        Ok(())
    }

    /// Start the emulator in the background and return immediately.
    pub async fn launch(&mut self) -> Result<(), StageError> {
        if self.process.is_some() {
            return Err(StageError::Lifecycle("an emulator process is already running".into()));
        }
        self.expect_state(EmulationState::NotStarted, "launch")?;

        let process = self.runner.spawn(&self.launcher).await?;
        info!(command = %self.launcher, pid = ?process.id(), "Emulator launched");
        self.process = Some(process);
        self.state = EmulationState::Launched;
        Ok(())
    }

    /// Fixed boot allowance before the network is probed.
    pub async fn warm_up(&mut self) -> Result<(), StageError> {
        self.expect_state(EmulationState::Launched, "warm up")?;
        let warm_up = self.settings.warm_up();
        debug!(secs = warm_up.as_secs(), "Waiting for the emulated device to boot");
        tokio::time::sleep(warm_up).await;

        if let Some(process) = self.process.as_mut() {
            if !process.is_running().await {
                warn!("Emulator process exited during warm-up");
            }
        }
        self.state = EmulationState::WarmedUp;
        Ok(())
    }

    /// Single reachability probe against `address`.
    pub async fn check_network(&mut self, address: Ipv4Addr) -> Result<(), StageError> {
        self.expect_state(EmulationState::WarmedUp, "check the network")?;
        self.state = EmulationState::NetworkChecked;

        let probe = probe_command(address, self.settings.probe_timeout());
        let reachable = match self
            .runner
            .run(&probe, self.settings.probe_timeout() + PROBE_SLACK)
            .await
        {
            Ok(output) => {
                debug!(command = %probe, output = %output.combined(), "Probe finished");
                is_reachable(&output, &self.settings.reachability_marker)
            }
            Err(err) => {
                warn!(command = %probe, error = %err, "Probe did not complete");
                false
            }
        };

        if !reachable {
            return Err(StageError::NetworkUnreachable {
                address: address.to_string(),
            });
        }
        info!(ip = %address, "Emulated device is reachable");
        Ok(())
    }

    /// Launch, warm up and probe the address inferred earlier in the run.
    pub async fn start(&mut self, report: &RunReport) -> StageOutcome {
        let stage = PipelineStage::StartEmulation;
        let Some(address) = report.inferred_address() else {
            return failed(
                stage,
                NETWORK_MESSAGE,
                StageError::Lifecycle("no inferred address to probe".into()),
            );
        };

        let started = async {
            self.launch().await?;
            self.warm_up().await?;
            self.check_network(address).await
        }
        .await;

        match started {
            Ok(()) => StageOutcome::success().with_data(IP_FIELD, address.to_string()),
            Err(err) => failed(stage, NETWORK_MESSAGE, err),
        }
    }

    /// Release the emulator according to the teardown policy.
    ///
    /// Idempotent: only the first call acts. Termination errors are logged
    /// and swallowed.
    pub async fn teardown(&mut self, run_status: StageStatus) {
        if self.state == EmulationState::Terminated {
            return;
        }
        self.state = EmulationState::Terminated;

        let Some(mut process) = self.process.take() else {
            return;
        };

        let preserve = match self.settings.teardown {
            TeardownPolicy::Terminate => false,
            TeardownPolicy::PreserveOnFailure => !run_status.is_success(),
            TeardownPolicy::Preserve => true,
        };
        if preserve {
            warn!(
                pid = ?process.id(),
                policy = ?self.settings.teardown,
                log = ?self.launcher.output_log,
                "Leaving emulator process running"
            );
            return;
        }

        match process.terminate(self.settings.termination_grace()).await {
            Ok(()) => info!("Emulator terminated"),
            Err(err) => warn!(error = %err, "Failed to terminate emulator"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{InvocationKind, ScriptedReply, ScriptedRunner};
    use std::path::Path;

    fn settings(policy: TeardownPolicy) -> EmulationSettings {
        EmulationSettings {
            warm_up_secs: 0,
            teardown: policy,
            ..EmulationSettings::default()
        }
    }

    fn controller(runner: Arc<ScriptedRunner>, policy: TeardownPolicy) -> EmulationController {
        let toolchain = Toolchain::new("/opt/firmadyne", 1);
        EmulationController::new(runner, &toolchain, settings(policy))
    }

    fn report_with_address(ip: &str) -> RunReport {
        let mut report = RunReport::new(Path::new("/tmp/fw.bin"), 1);
        report
            .record(
                PipelineStage::InferNetwork,
                StageOutcome::success().with_data(IP_FIELD, ip),
            )
            .unwrap();
        report
    }

    #[tokio::test]
    async fn test_start_reachable() {
        let runner = Arc::new(ScriptedRunner::new().on("ping", ScriptedReply::exit(0)));
        let mut ctl = controller(runner.clone(), TeardownPolicy::Terminate);

        let outcome = ctl.start(&report_with_address("192.168.0.1")).await;

        assert!(outcome.is_success());
        assert_eq!(ctl.state(), EmulationState::NetworkChecked);
        assert!(ctl.owns_process());
        let calls = runner.invocations();
        assert_eq!(calls[0].kind, InvocationKind::Spawn);
        assert_eq!(calls[0].command.program, "/opt/firmadyne/scratch/1/run.sh");
        assert_eq!(calls[1].command.to_string(), "ping -c 1 -W 10 192.168.0.1");
    }

    #[tokio::test]
    async fn test_marker_counts_as_reachable() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "ping",
            ScriptedReply::stdout(1, "1 packets transmitted, 1 received, 0% packet loss"),
        ));
        let mut ctl = controller(runner, TeardownPolicy::Terminate);

        assert!(ctl.start(&report_with_address("10.0.0.1")).await.is_success());
    }

    #[tokio::test]
    async fn test_unreachable_network() {
        let runner = Arc::new(ScriptedRunner::new().on(
            "ping",
            ScriptedReply::stdout(1, "1 packets transmitted, 0 received, 100% packet loss"),
        ));
        let mut ctl = controller(runner, TeardownPolicy::Terminate);

        let outcome = ctl.start(&report_with_address("10.0.0.1")).await;

        assert!(outcome.error_message().unwrap().starts_with(NETWORK_MESSAGE));
    }

    #[tokio::test]
    async fn test_probe_timeout_is_unreachable() {
        let runner = Arc::new(ScriptedRunner::new().on("ping", ScriptedReply::Timeout));
        let mut ctl = controller(runner, TeardownPolicy::Terminate);

        let outcome = ctl.start(&report_with_address("10.0.0.1")).await;

        assert!(!outcome.is_success());
        assert_eq!(ctl.state(), EmulationState::NetworkChecked);
    }

    #[tokio::test]
    async fn test_start_without_address_does_not_launch() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut ctl = controller(runner.clone(), TeardownPolicy::Terminate);
        let report = RunReport::new(Path::new("/tmp/fw.bin"), 1);

        let outcome = ctl.start(&report).await;

        assert!(!outcome.is_success());
        assert!(runner.invocations().is_empty());
        assert_eq!(ctl.state(), EmulationState::NotStarted);
    }

    #[tokio::test]
    async fn test_second_launch_rejected() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut ctl = controller(runner.clone(), TeardownPolicy::Terminate);

        ctl.launch().await.unwrap();
        let err = ctl.launch().await.unwrap_err();

        assert!(matches!(err, StageError::Lifecycle(_)));
        assert_eq!(runner.count_matching("run.sh"), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_transitions_rejected() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut ctl = controller(runner, TeardownPolicy::Terminate);

        assert!(ctl.warm_up().await.is_err());
        assert!(ctl.check_network(Ipv4Addr::LOCALHOST).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_warm_up_waits_configured_time() {
        let runner = Arc::new(ScriptedRunner::new());
        let toolchain = Toolchain::new("/opt/firmadyne", 1);
        let mut ctl = EmulationController::new(runner, &toolchain, EmulationSettings::default());

        ctl.launch().await.unwrap();
        let before = tokio::time::Instant::now();
        ctl.warm_up().await.unwrap();

        assert!(before.elapsed() >= Duration::from_secs(40));
        assert_eq!(ctl.state(), EmulationState::WarmedUp);
    }

    #[tokio::test]
    async fn test_teardown_terminates_once() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut ctl = controller(runner.clone(), TeardownPolicy::Terminate);
        ctl.launch().await.unwrap();

        ctl.teardown(StageStatus::Success).await;
        ctl.teardown(StageStatus::Success).await;

        assert_eq!(ctl.state(), EmulationState::Terminated);
        assert!(!ctl.owns_process());
        let processes = runner.processes();
        assert_eq!(processes[0].terminate_calls, 1);
        assert!(!processes[0].running);
    }

    #[tokio::test]
    async fn test_teardown_without_process() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut ctl = controller(runner, TeardownPolicy::Terminate);

        ctl.teardown(StageStatus::Failure).await;

        assert_eq!(ctl.state(), EmulationState::Terminated);
        assert!(ctl.launch().await.is_err());
    }

    #[tokio::test]
    async fn test_preserve_on_failure_keeps_failed_emulator() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut ctl = controller(runner.clone(), TeardownPolicy::PreserveOnFailure);
        ctl.launch().await.unwrap();

        ctl.teardown(StageStatus::Failure).await;

        assert!(!ctl.owns_process());
        assert_eq!(ctl.state(), EmulationState::Terminated);
        let processes = runner.processes();
        assert!(processes[0].running);
        assert_eq!(processes[0].terminate_calls, 0);
    }

    #[tokio::test]
    async fn test_preserve_on_failure_terminates_successful_run() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut ctl = controller(runner.clone(), TeardownPolicy::PreserveOnFailure);
        ctl.launch().await.unwrap();

        ctl.teardown(StageStatus::Success).await;

        assert!(!runner.processes()[0].running);
    }

    #[tokio::test]
    async fn test_preserve_never_terminates() {
        let runner = Arc::new(ScriptedRunner::new());
        let mut ctl = controller(runner.clone(), TeardownPolicy::Preserve);
        ctl.launch().await.unwrap();

        ctl.teardown(StageStatus::Success).await;

        assert!(runner.processes()[0].running);
        assert!(!ctl.owns_process());
    }
}
