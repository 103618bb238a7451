//! Run report: one outcome per executed stage plus the run summary.
//!
//! The report is the single source of truth for a run. It is created empty,
//! appended to stage by stage, finalized with a summary string, and written
//! to disk once.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ReportError;
use crate::stage::PipelineStage;

/// Summary written when every stage succeeded.
pub const SUCCESS_SUMMARY: &str = "Firmadyne finished all Steps succesfully!";

/// Summary written when any stage failed.
pub const FAILURE_SUMMARY: &str = "Firmadyne failed!";

/// Payload key carrying the inferred device address.
pub const IP_FIELD: &str = "ip";

/// Status of a stage, or of a whole run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Success,
    Failure,
}

impl StageStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StageStatus::Success)
    }
}

/// Outcome of one stage.
///
/// `error_message` is present exactly when the status is `Failure`; the
/// constructors are the only way to build one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    status: StageStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,

    /// Stage-specific payload fields, flattened next to `status`.
    #[serde(flatten)]
    data: Map<String, Value>,
}

impl StageOutcome {
    pub fn success() -> Self {
        Self {
            status: StageStatus::Success,
            error_message: None,
            data: Map::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failure,
            error_message: Some(message.into()),
            data: Map::new(),
        }
    }

    /// Attach a payload field.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn status(&self) -> StageStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn data(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// Ordered, append-only record of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    run_id: Uuid,
    firmware: PathBuf,
    firmware_sha256: Option<String>,
    image_slot: u32,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    entries: Vec<(PipelineStage, StageOutcome)>,
    result: Option<String>,
}

impl RunReport {
    pub fn new(firmware: &Path, image_slot: u32) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            firmware: firmware.to_path_buf(),
            firmware_sha256: None,
            image_slot,
            started_at: Utc::now(),
            finished_at: None,
            entries: Vec::new(),
            result: None,
        }
    }

    pub fn with_firmware_digest(mut self, digest: Option<String>) -> Self {
        self.firmware_sha256 = digest;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn firmware(&self) -> &Path {
        &self.firmware
    }

    pub fn firmware_sha256(&self) -> Option<&str> {
        self.firmware_sha256.as_deref()
    }

    /// Append the outcome of `stage`.
    ///
    /// Stages must arrive in strictly increasing order, each at most once,
    /// and only before the report is finalized.
    pub fn record(&mut self, stage: PipelineStage, outcome: StageOutcome) -> Result<(), ReportError> {
        if self.result.is_some() {
            return Err(ReportError::Finalized(stage.name()));
        }
        if let Some((last, _)) = self.entries.last() {
            if stage <= *last {
                return Err(ReportError::OutOfOrder {
                    stage: stage.name(),
                    last: last.name(),
                });
            }
        }
        self.entries.push((stage, outcome));
        Ok(())
    }

    pub fn outcome(&self, stage: PipelineStage) -> Option<&StageOutcome> {
        self.entries
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, outcome)| outcome)
    }

    pub fn entries(&self) -> &[(PipelineStage, StageOutcome)] {
        &self.entries
    }

    /// Stages recorded so far, in order.
    pub fn stages(&self) -> Vec<PipelineStage> {
        self.entries.iter().map(|(stage, _)| *stage).collect()
    }

    pub fn has_failure(&self) -> bool {
        self.entries.iter().any(|(_, outcome)| !outcome.is_success())
    }

    /// Address recorded by a successful network inference stage.
    pub fn inferred_address(&self) -> Option<Ipv4Addr> {
        self.outcome(PipelineStage::InferNetwork)
            .filter(|outcome| outcome.is_success())
            .and_then(|outcome| outcome.data(IP_FIELD))
            .and_then(Value::as_str)
            .and_then(|ip| ip.parse().ok())
    }

    /// Set the run summary. Allowed exactly once.
    pub fn finalize(&mut self, status: StageStatus) -> Result<(), ReportError> {
        if self.result.is_some() {
            return Err(ReportError::AlreadyFinalized);
        }
        let summary = match status {
            StageStatus::Success => SUCCESS_SUMMARY,
            StageStatus::Failure => FAILURE_SUMMARY,
        };
        self.result = Some(summary.to_string());
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn is_finalized(&self) -> bool {
        self.result.is_some()
    }

    /// Write the report as pretty JSON, replacing any previous report.
    pub fn write(&self, path: &Path) -> Result<(), ReportError> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ReportError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ReportError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    fn metadata(&self) -> RunMetadata<'_> {
        RunMetadata {
            run_id: self.run_id,
            firmware: &self.firmware,
            firmware_sha256: self.firmware_sha256.as_deref(),
            image_slot: self.image_slot,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

#[derive(Serialize)]
struct RunMetadata<'a> {
    run_id: Uuid,
    firmware: &'a Path,
    #[serde(skip_serializing_if = "Option::is_none")]
    firmware_sha256: Option<&'a str>,
    image_slot: u32,
    started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
}

impl Serialize for RunReport {
    /// Stage entries in order, then `result`, then `run`.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (stage, outcome) in &self.entries {
            map.serialize_entry(stage.report_key(), outcome)?;
        }
        if let Some(result) = &self.result {
            map.serialize_entry("result", result)?;
        }
        map.serialize_entry("run", &self.metadata())?;
        map.end()
    }
}

/// SHA-256 of a firmware image, hex encoded.
pub fn firmware_digest(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
