//! Settings file management

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::ArtifactManager;
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::logs::{LogLevel, LogOptions};
use crate::runtime::{RuntimeOptions, RuntimeType};
use crate::storage::layout::StorageLayout;

/// Runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Also log as JSON
    #[serde(default)]
    pub log_json: bool,

    /// Base directory for everything the runtime stores
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Backend used when a build spec does not pick one
    #[serde(default)]
    pub default_runtime: RuntimeType,

    /// Rollback behaviour
    #[serde(default)]
    pub rollback: RollbackSettings,

    /// Artifact bundles
    #[serde(default)]
    pub artifacts: ArtifactSettings,

    /// Image pull attempts for the OCI runtime
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,

    /// Environment for every deployment
    #[serde(default)]
    pub env_vars: HashMap<String, String>,

    /// Labels for every container
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_base_dir() -> PathBuf {
    StorageLayout::default().base_dir
}

fn default_max_retries() -> i32 {
    3
}

fn default_timeout_secs() -> i64 {
    30
}

fn default_max_age_secs() -> u64 {
    24 * 60 * 60
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            base_dir: default_base_dir(),
            default_runtime: RuntimeType::default(),
            rollback: RollbackSettings::default(),
            artifacts: ArtifactSettings::default(),
            max_retries: default_max_retries(),
            env_vars: HashMap::new(),
            labels: HashMap::new(),
        }
    }
}

/// Rollback settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackSettings {
    #[serde(default)]
    pub force: bool,

    /// Graceful stop budget in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: i64,

    #[serde(default = "default_true")]
    pub cleanup_files: bool,

    #[serde(default = "default_true")]
    pub keep_logs: bool,

    #[serde(default = "default_true")]
    pub create_backup: bool,

    #[serde(default = "default_true")]
    pub health_check: bool,

    #[serde(default = "default_true")]
    pub notify_metrics: bool,
}

impl Default for RollbackSettings {
    fn default() -> Self {
        Self {
            force: false,
            timeout_secs: default_timeout_secs(),
            cleanup_files: true,
            keep_logs: true,
            create_backup: true,
            health_check: true,
            notify_metrics: true,
        }
    }
}

/// Artifact manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSettings {
    /// Bundles older than this are pruned
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    #[serde(default = "default_true")]
    pub compression: bool,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age_secs(),
            compression: true,
        }
    }
}

impl RuntimeSettings {
    /// Read settings, falling back to defaults when the file is absent
    pub async fn load(file: &File) -> Result<Self, DeployError> {
        if !file.exists().await {
            debug!("No settings at {:?}, using defaults", file.path());
            return Ok(Self::default());
        }
        file.read_json().await
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.base_dir)
    }

    /// Options for [`crate::runtime::new_runtime`]
    pub fn runtime_options(&self) -> RuntimeOptions {
        let layout = self.layout();
        RuntimeOptions {
            force: self.rollback.force,
            timeout: chrono::Duration::seconds(self.rollback.timeout_secs),
            cleanup_files: self.rollback.cleanup_files,
            keep_logs: self.rollback.keep_logs,
            create_backup: self.rollback.create_backup,
            health_check: self.rollback.health_check,
            notify_metrics: self.rollback.notify_metrics,
            work_dir: Some(layout.runtime_dir().path().to_path_buf()),
            backups_dir: Some(layout.backups_dir().path().to_path_buf()),
            env_vars: self.env_vars.clone(),
            labels: self.labels.clone(),
            log_level: self.log_level.to_string(),
            max_retries: self.max_retries,
        }
    }

    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            log_level: self.log_level,
            stdout: true,
            log_dir: Some(self.layout().logs_dir().path().to_path_buf()),
            json_format: self.log_json,
        }
    }

    /// Artifact manager rooted at the layout's artifacts directory
    pub async fn artifact_manager(&self) -> Result<ArtifactManager, DeployError> {
        let manager = ArtifactManager::new(self.layout().artifacts_dir().path())
            .await?
            .with_max_age(Duration::from_secs(self.artifacts.max_age_secs))
            .with_compression(self.artifacts.compression);
        Ok(manager)
    }
}
