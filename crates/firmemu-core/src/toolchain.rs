//! Locations and invocations of the Firmadyne toolchain scripts.
//!
//! The toolchain root and image slot are resolved once from [`Settings`];
//! every stage asks the [`Toolchain`] for its command and artifacts.

use std::path::{Path, PathBuf};

use crate::config::{ExtractorSettings, Settings};
use crate::runner::CommandSpec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    root: PathBuf,
    slot: u32,
    extractor: ExtractorSettings,
}

impl Toolchain {
    pub fn new(root: impl Into<PathBuf>, slot: u32) -> Self {
        Self {
            root: root.into(),
            slot,
            extractor: ExtractorSettings::default(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            root: settings.firmadyne_path.clone(),
            slot: settings.image_slot,
            extractor: settings.extractor.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    fn script(&self, name: &str) -> String {
        self.root.join("scripts").join(name).display().to_string()
    }

    fn in_root(&self, program: impl Into<String>) -> CommandSpec {
        CommandSpec::new(program).current_dir(&self.root)
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Filesystem archive produced by the extractor.
    pub fn archive_path(&self) -> PathBuf {
        self.images_dir().join(format!("{}.tar.gz", self.slot))
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join("scratch").join(self.slot.to_string())
    }

    /// Raw disk image produced by the image builder.
    pub fn disk_image_path(&self) -> PathBuf {
        self.scratch_dir().join("image.raw")
    }

    pub fn extract_command(&self, input: &Path) -> CommandSpec {
        let extractor = self
            .root
            .join("sources")
            .join("extractor")
            .join("extractor.py");
        self.in_root("python3").args([
            extractor.display().to_string(),
            "-b".to_string(),
            self.extractor.brand.clone(),
            "-sql".to_string(),
            self.extractor.db_host.clone(),
            "-np".to_string(),
            "-nk".to_string(),
            input.display().to_string(),
            self.images_dir().display().to_string(),
        ])
    }

    pub fn architecture_command(&self) -> CommandSpec {
        self.in_root("/bin/bash").args([
            self.script("getArch.sh"),
            self.archive_path().display().to_string(),
        ])
    }

    pub fn load_filesystem_command(&self) -> CommandSpec {
        self.in_root("python2").args([
            self.script("tar2db.py"),
            "-i".to_string(),
            self.slot.to_string(),
            "-f".to_string(),
            self.archive_path().display().to_string(),
        ])
    }

    pub fn build_image_command(&self) -> CommandSpec {
        self.in_root("sudo")
            .args([self.script("makeImage.sh"), self.slot.to_string()])
    }

    pub fn infer_network_command(&self) -> CommandSpec {
        self.in_root("/bin/bash")
            .args([self.script("inferNetwork.sh"), self.slot.to_string()])
    }

    /// Console output of the emulator, kept after the run.
    pub fn emulator_log_path(&self) -> PathBuf {
        self.scratch_dir().join("emulator.log")
    }

    /// Launcher generated by network inference; runs until terminated.
    pub fn emulator_command(&self) -> CommandSpec {
        self.in_root(self.scratch_dir().join("run.sh").display().to_string())
            .output_log(self.emulator_log_path())
    }

    pub fn delete_command(&self) -> CommandSpec {
        self.in_root("sudo")
            .args([self.script("delete.sh"), self.slot.to_string()])
    }

    pub fn additional_delete_command(&self) -> CommandSpec {
        self.in_root("sudo").arg(self.script("additional_delete.sh"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toolchain() -> Toolchain {
        Toolchain::new("/opt/firmadyne", 1)
    }

    #[test]
    fn test_artifact_paths_use_slot() {
        let tc = Toolchain::new("/opt/firmadyne", 7);
        assert_eq!(tc.archive_path(), PathBuf::from("/opt/firmadyne/images/7.tar.gz"));
        assert_eq!(
            tc.disk_image_path(),
            PathBuf::from("/opt/firmadyne/scratch/7/image.raw")
        );
    }

    #[test]
    fn test_extract_command() {
        let cmd = toolchain().extract_command(Path::new("/tmp/fw.bin"));
        assert_eq!(cmd.program, "python3");
        assert_eq!(cmd.args[0], "/opt/firmadyne/sources/extractor/extractor.py");
        assert!(cmd.args.windows(2).any(|w| w == ["-b", "Netgear"]));
        assert!(cmd.args.windows(2).any(|w| w == ["-sql", "127.0.0.1"]));
        assert_eq!(cmd.args[cmd.args.len() - 2], "/tmp/fw.bin");
        assert_eq!(cmd.args.last().unwrap(), "/opt/firmadyne/images");
        assert_eq!(cmd.current_dir, Some(PathBuf::from("/opt/firmadyne")));
    }

    #[test]
    fn test_load_filesystem_command() {
        let cmd = toolchain().load_filesystem_command();
        assert_eq!(
            cmd.to_string(),
            "python2 /opt/firmadyne/scripts/tar2db.py -i 1 -f /opt/firmadyne/images/1.tar.gz"
        );
    }

    #[test]
    fn test_interactive_script_commands() {
        let tc = toolchain();
        assert_eq!(
            tc.build_image_command().to_string(),
            "sudo /opt/firmadyne/scripts/makeImage.sh 1"
        );
        assert_eq!(
            tc.infer_network_command().to_string(),
            "/bin/bash /opt/firmadyne/scripts/inferNetwork.sh 1"
        );
        assert_eq!(
            tc.architecture_command().to_string(),
            "/bin/bash /opt/firmadyne/scripts/getArch.sh /opt/firmadyne/images/1.tar.gz"
        );
    }

    #[test]
    fn test_emulator_and_cleanup_commands() {
        let tc = toolchain();
        assert_eq!(tc.emulator_command().program, "/opt/firmadyne/scratch/1/run.sh");
        assert_eq!(
            tc.emulator_command().output_log,
            Some(PathBuf::from("/opt/firmadyne/scratch/1/emulator.log"))
        );
        assert_eq!(tc.delete_command().output_log, None);
        assert_eq!(
            tc.delete_command().to_string(),
            "sudo /opt/firmadyne/scripts/delete.sh 1"
        );
        assert_eq!(
            tc.additional_delete_command().to_string(),
            "sudo /opt/firmadyne/scripts/additional_delete.sh"
        );
    }

    #[test]
    fn test_from_settings() {
        let mut settings = Settings::default();
        settings.firmadyne_path = PathBuf::from("/srv/fd");
        settings.image_slot = 2;
        settings.extractor.brand = "TP-Link".to_string();

        let tc = Toolchain::from_settings(&settings);
        assert_eq!(tc.root(), Path::new("/srv/fd"));
        assert_eq!(tc.slot(), 2);
        assert!(tc.extract_command(Path::new("fw.bin")).mentions("TP-Link"));
    }
}
