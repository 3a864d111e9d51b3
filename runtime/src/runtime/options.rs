//! Runtime options and their validation

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;

use crate::errors::DeployError;
use crate::logs::LogLevel;
use crate::runtime::rollback::RollbackOptions;
use crate::storage::layout::StorageLayout;

/// Options shared by every runtime backend
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeOptions {
    /// Forced stops only during rollback
    pub force: bool,

    /// Graceful stop budget. Signed so that a negative value can be rejected.
    pub timeout: chrono::Duration,

    pub cleanup_files: bool,
    pub keep_logs: bool,
    pub create_backup: bool,
    pub health_check: bool,
    pub notify_metrics: bool,

    /// Deployment working directory; must already exist when set
    pub work_dir: Option<PathBuf>,

    /// Where rollback backups are written
    pub backups_dir: Option<PathBuf>,

    /// Applied to every deployed process, container, or unit
    pub env_vars: HashMap<String, String>,

    /// Applied to containers
    pub labels: HashMap<String, String>,

    pub log_level: String,

    /// Image pull attempts for the OCI runtime
    pub max_retries: i32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            force: false,
            timeout: chrono::Duration::seconds(30),
            cleanup_files: true,
            keep_logs: true,
            create_backup: true,
            health_check: true,
            notify_metrics: true,
            work_dir: None,
            backups_dir: None,
            env_vars: HashMap::new(),
            labels: HashMap::new(),
            log_level: LogLevel::Info.to_string(),
            max_retries: 3,
        }
    }
}

impl RuntimeOptions {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| StorageLayout::default().runtime_dir().path().to_path_buf())
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.backups_dir
            .clone()
            .unwrap_or_else(|| StorageLayout::default().backups_dir().path().to_path_buf())
    }

    /// Rollback options derived from these runtime options
    pub fn rollback_options(&self) -> RollbackOptions {
        RollbackOptions {
            force: self.force,
            timeout: self.timeout.to_std().unwrap_or_default(),
            cleanup_files: self.cleanup_files,
            keep_logs: self.keep_logs,
            create_backup: self.create_backup,
            health_check: self.health_check,
            notify_metrics: self.notify_metrics,
        }
    }

    /// Pull attempts, never less than one
    pub fn pull_attempts(&self) -> u32 {
        self.max_retries.max(1) as u32
    }
}

/// Check options before a runtime is constructed.
///
/// `None` means defaults and is always valid.
pub fn validate_runtime_options(options: Option<&RuntimeOptions>) -> Result<(), DeployError> {
    let Some(options) = options else {
        return Ok(());
    };

    if options.timeout < chrono::Duration::zero() {
        return Err(DeployError::ValidationError("timeout cannot be negative".to_string()));
    }

    if options.max_retries < 0 {
        return Err(DeployError::ValidationError("max retries cannot be negative".to_string()));
    }

    if let Some(work_dir) = &options.work_dir {
        if !work_dir.is_absolute() {
            return Err(DeployError::ValidationError(format!(
                "work directory must be absolute: {}",
                work_dir.display()
            )));
        }
        match std::fs::metadata(work_dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(DeployError::ValidationError(format!(
                    "work directory is not a directory: {}",
                    work_dir.display()
                )))
            }
            Err(_) => {
                return Err(DeployError::ValidationError(format!(
                    "work directory does not exist: {}",
                    work_dir.display()
                )))
            }
        }
    }

    options
        .log_level
        .parse::<LogLevel>()
        .map_err(DeployError::ValidationError)?;

    debug!("Runtime options validated");
    Ok(())
}
