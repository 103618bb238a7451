//! Run settings.
//!
//! Everything a run needs to locate the toolchain and bound its waits lives in
//! [`Settings`]. Settings are read from an optional TOML file; any field left
//! out keeps its default. Durations are given in seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::runner::PromptTable;

/// Top-level settings for one orchestrator invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Root of the Firmadyne installation (scripts/, images/, scratch/).
    pub firmadyne_path: PathBuf,

    /// Image slot used to namespace archives and disk images.
    pub image_slot: u32,

    /// Where the run report is written (default: `<firmadyne_path>/results.json`).
    pub report_path: Option<PathBuf>,

    pub credentials: Credentials,
    pub extractor: ExtractorSettings,
    pub timeouts: StageTimeouts,
    pub emulation: EmulationSettings,
    pub analysis: AnalysisSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            firmadyne_path: PathBuf::from("/opt/firmadyne"),
            image_slot: 1,
            report_path: None,
            credentials: Credentials::default(),
            extractor: ExtractorSettings::default(),
            timeouts: StageTimeouts::default(),
            emulation: EmulationSettings::default(),
            analysis: AnalysisSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse settings from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Reject settings no run could succeed with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.firmadyne_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("firmadyne_path must not be empty".into()));
        }
        if self.image_slot == 0 {
            return Err(ConfigError::Invalid("image_slot must be at least 1".into()));
        }
        if self.analysis.command.is_empty() {
            return Err(ConfigError::Invalid("analysis.command must not be empty".into()));
        }
        if self.emulation.reachability_marker.is_empty() {
            return Err(ConfigError::Invalid(
                "emulation.reachability_marker must not be empty".into(),
            ));
        }
        self.credentials.prompt_table()?;
        Ok(())
    }

    /// Resolved report location.
    pub fn report_path(&self) -> PathBuf {
        self.report_path
            .clone()
            .unwrap_or_else(|| self.firmadyne_path.join("results.json"))
    }
}

/// Credential prompt and the answer the toolchain scripts expect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Credentials {
    /// Literal prompt text emitted by the scripts.
    pub prompt: String,

    /// Database password sent in response.
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            prompt: "Password for user firmadyne: ".to_string(),
            password: "firmadyne".to_string(),
        }
    }
}

impl Credentials {
    /// Prompt table answering the credential prompt with the password.
    pub fn prompt_table(&self) -> Result<PromptTable, ConfigError> {
        if self.prompt.is_empty() {
            return Err(ConfigError::Invalid("credentials.prompt must not be empty".into()));
        }
        Ok(PromptTable::new().literal(&self.prompt, self.password.clone())?)
    }
}

/// Arguments forwarded to the firmware extractor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExtractorSettings {
    pub brand: String,
    pub db_host: String,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            brand: "Netgear".to_string(),
            db_host: "127.0.0.1".to_string(),
        }
    }
}

/// Wall-clock limits for each external command, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StageTimeouts {
    pub extract_secs: u64,
    pub architecture_secs: u64,
    pub load_filesystem_secs: u64,
    pub build_image_secs: u64,
    pub infer_network_secs: u64,
    pub analysis_secs: u64,
    pub cleanup_secs: u64,
    /// How long an unanswered prompt may sit before the runner gives up.
    pub prompt_idle_secs: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            extract_secs: 600,
            architecture_secs: 120,
            load_filesystem_secs: 300,
            build_image_secs: 600,
            infer_network_secs: 80,
            analysis_secs: 600,
            cleanup_secs: 120,
            prompt_idle_secs: 5,
        }
    }
}

impl StageTimeouts {
    pub fn extract(&self) -> Duration {
        Duration::from_secs(self.extract_secs)
    }

    pub fn architecture(&self) -> Duration {
        Duration::from_secs(self.architecture_secs)
    }

    pub fn load_filesystem(&self) -> Duration {
        Duration::from_secs(self.load_filesystem_secs)
    }

    pub fn build_image(&self) -> Duration {
        Duration::from_secs(self.build_image_secs)
    }

    pub fn infer_network(&self) -> Duration {
        Duration::from_secs(self.infer_network_secs)
    }

    pub fn analysis(&self) -> Duration {
        Duration::from_secs(self.analysis_secs)
    }

    pub fn cleanup(&self) -> Duration {
        Duration::from_secs(self.cleanup_secs)
    }

    pub fn prompt_idle(&self) -> Duration {
        Duration::from_secs(self.prompt_idle_secs)
    }
}

/// What happens to the emulator process when the run ends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TeardownPolicy {
    /// Always terminate the emulator at run end.
    #[default]
    Terminate,
    /// Keep a failed run's emulator alive for inspection.
    PreserveOnFailure,
    /// Never terminate; the cleanup script is responsible for it.
    Preserve,
}

/// Emulator lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EmulationSettings {
    /// Fixed boot allowance before the reachability probe.
    pub warm_up_secs: u64,

    /// Bound on the single reachability probe.
    pub probe_timeout_secs: u64,

    /// Probe output that counts as reachable even with a nonzero exit code.
    pub reachability_marker: String,

    /// Time between SIGTERM and SIGKILL during teardown.
    pub termination_grace_secs: u64,

    pub teardown: TeardownPolicy,
}

impl Default for EmulationSettings {
    fn default() -> Self {
        Self {
            warm_up_secs: 40,
            probe_timeout_secs: 10,
            reachability_marker: "1 received".to_string(),
            termination_grace_secs: 10,
            teardown: TeardownPolicy::Terminate,
        }
    }
}

impl EmulationSettings {
    pub fn warm_up(&self) -> Duration {
        Duration::from_secs(self.warm_up_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }
}

/// External analysis command run against the emulated device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AnalysisSettings {
    /// Command and leading arguments; the inferred address is appended.
    pub command: Vec<String>,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            command: vec!["nmap".to_string(), "-Pn".to_string(), "-sV".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.image_slot, 1);
        assert_eq!(settings.emulation.warm_up(), Duration::from_secs(40));
        assert_eq!(settings.emulation.probe_timeout(), Duration::from_secs(10));
        assert_eq!(settings.emulation.teardown, TeardownPolicy::Terminate);
        assert_eq!(settings.timeouts.infer_network(), Duration::from_secs(80));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_report_path_defaults_to_firmadyne_root() {
        let settings = Settings {
            firmadyne_path: PathBuf::from("/srv/firmadyne"),
            ..Settings::default()
        };
        assert_eq!(settings.report_path(), PathBuf::from("/srv/firmadyne/results.json"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml(
            r#"
            firmadyne_path = "/data/firmadyne"

            [emulation]
            warm_up_secs = 5
            teardown = "preserve-on-failure"
            "#,
        )
        .expect("parse");

        assert_eq!(settings.firmadyne_path, PathBuf::from("/data/firmadyne"));
        assert_eq!(settings.emulation.warm_up_secs, 5);
        assert_eq!(settings.emulation.probe_timeout_secs, 10);
        assert_eq!(settings.emulation.teardown, TeardownPolicy::PreserveOnFailure);
        assert_eq!(settings.credentials.password, "firmadyne");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().expect("tempfile");
        writeln!(file, "image_slot = 3").expect("write");

        let settings = Settings::load(Some(file.path())).expect("load");
        assert_eq!(settings.image_slot, 3);
    }

    #[test]
    fn test_load_missing_file_is_read_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/firmemu.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_malformed_file_is_parse_error() {
        let mut file = NamedTempFile::new().expect("tempfile");
        writeln!(file, "image_slot = \"one\"").expect("write");

        let err = Settings::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate_rejects_slot_zero() {
        let settings = Settings {
            image_slot: 0,
            ..Settings::default()
        };
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_empty_analysis_command() {
        let mut settings = Settings::default();
        settings.analysis.command.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_credentials_prompt_is_literal() {
        let credentials = Credentials {
            prompt: "Password (db): ".to_string(),
            password: "secret".to_string(),
        };
        let table = credentials.prompt_table().expect("table");
        let (_, response) = table.find("Password (db): ").expect("match");
        assert_eq!(response, "secret");
    }
}
