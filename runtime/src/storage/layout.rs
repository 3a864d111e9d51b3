//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Directory systemd reads unit files from
pub const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

/// Storage layout for the runtime
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Working directory for native and systemd deployments
    pub fn runtime_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("runtime"))
    }

    /// Rollback backups
    pub fn backups_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("backups"))
    }

    /// Packaged artifact bundles
    pub fn artifacts_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("artifacts"))
    }

    /// Verified artifact downloads
    pub fn downloads_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("downloads"))
    }

    /// Build outputs retained after the temporary build directory is gone
    pub fn builds_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("builds"))
    }

    /// Rendered systemd unit files (linked into the systemd unit directory)
    pub fn units_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("units"))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), DeployError> {
        self.runtime_dir().create().await?;
        self.backups_dir().create().await?;
        self.artifacts_dir().create().await?;
        self.downloads_dir().create().await?;
        self.builds_dir().create().await?;
        self.units_dir().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/ajime");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::temp_dir().join("ajime");

        Self::new(base_dir)
    }
}
