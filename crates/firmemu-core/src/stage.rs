//! Pipeline stage identities and their fixed order.

use serde::Serialize;

/// Every unit of work in a run, in execution order.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineStage {
    /// Extract the root filesystem from the firmware image.
    Extract,

    /// Determine the target architecture of the extracted filesystem.
    DetectArchitecture,

    /// Load the filesystem listing into the toolchain database.
    LoadFilesystem,

    /// Build the raw QEMU disk image.
    BuildImage,

    /// Infer the network configuration the device will present.
    InferNetwork,

    /// Launch the emulator and wait for its network.
    StartEmulation,

    /// Analyze the running instance.
    Analyze,
}

impl PipelineStage {
    /// All stages in order.
    pub const ALL: [PipelineStage; 7] = [
        PipelineStage::Extract,
        PipelineStage::DetectArchitecture,
        PipelineStage::LoadFilesystem,
        PipelineStage::BuildImage,
        PipelineStage::InferNetwork,
        PipelineStage::StartEmulation,
        PipelineStage::Analyze,
    ];

    /// The stages run by the preparation pipeline.
    pub const PREPARATION: [PipelineStage; 5] = [
        PipelineStage::Extract,
        PipelineStage::DetectArchitecture,
        PipelineStage::LoadFilesystem,
        PipelineStage::BuildImage,
        PipelineStage::InferNetwork,
    ];

    /// Stage name as used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::Extract => "extract",
            PipelineStage::DetectArchitecture => "detect-architecture",
            PipelineStage::LoadFilesystem => "load-filesystem",
            PipelineStage::BuildImage => "build-image",
            PipelineStage::InferNetwork => "infer-network",
            PipelineStage::StartEmulation => "start-emulation",
            PipelineStage::Analyze => "analyze",
        }
    }

    /// Key under which the stage outcome appears in the report file.
    pub fn report_key(&self) -> &'static str {
        match self {
            PipelineStage::Extract => "extraction",
            PipelineStage::DetectArchitecture => "store_architecture",
            PipelineStage::LoadFilesystem => "load_filesystem",
            PipelineStage::BuildImage => "create_qemu_image",
            PipelineStage::InferNetwork => "infer_network_configuration",
            PipelineStage::StartEmulation => "emulation",
            PipelineStage::Analyze => "analysis",
        }
    }

    pub fn is_preparation(&self) -> bool {
        *self <= PipelineStage::InferNetwork
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_total() {
        for pair in PipelineStage::ALL.windows(2) {
            assert!(pair[0] < pair[1], "{} should precede {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_preparation_is_prefix_of_all() {
        assert_eq!(&PipelineStage::ALL[..5], &PipelineStage::PREPARATION[..]);
        assert!(PipelineStage::PREPARATION.iter().all(|s| s.is_preparation()));
        assert!(!PipelineStage::StartEmulation.is_preparation());
        assert!(!PipelineStage::Analyze.is_preparation());
    }

    #[test]
    fn test_report_keys() {
        assert_eq!(PipelineStage::Extract.report_key(), "extraction");
        assert_eq!(PipelineStage::BuildImage.report_key(), "create_qemu_image");
        assert_eq!(
            PipelineStage::InferNetwork.report_key(),
            "infer_network_configuration"
        );
        assert_eq!(PipelineStage::StartEmulation.report_key(), "emulation");
    }

    #[test]
    fn test_display_uses_name() {
        assert_eq!(PipelineStage::DetectArchitecture.to_string(), "detect-architecture");
    }

    #[test]
    fn test_serializes_as_name() {
        for stage in PipelineStage::ALL {
            assert_eq!(serde_json::to_value(stage).unwrap(), stage.name());
        }
    }
}
