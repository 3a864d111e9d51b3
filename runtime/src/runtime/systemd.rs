//! Systemd runtime: the build's executable as a transient service unit

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, ArtifactType};
use crate::build::BuildResult;
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::runtime::rollback::{
    self, ResourceStats, RollbackBackend, RollbackOptions, RollbackResult,
};
use crate::runtime::systemctl::{Systemctl, UnitManager, UnitProperties};
use crate::runtime::unit::{resource_limits, unit_name, UnitTemplate};
use crate::runtime::{Runtime, RuntimeOptions, RuntimeStatus, RuntimeType};
use crate::storage::layout::SYSTEMD_UNIT_DIR;
use crate::utils::is_executable;

/// Bound on a single property query during status
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Polling interval while waiting for a killed unit to go inactive
const INACTIVE_POLL: Duration = Duration::from_millis(200);

/// Unit file copy inside a rollback backup
pub const BACKUP_UNIT: &str = "unit.service";

/// Unit properties inside a rollback backup
pub const BACKUP_METADATA: &str = "metadata.json";

struct UnitDeployment {
    unit_name: String,
    unit_path: PathBuf,
    link_path: PathBuf,
    start_time: DateTime<Utc>,
}

/// Runs the build's executable as a systemd service
pub struct SystemdRuntime {
    manager: Arc<dyn UnitManager>,
    options: RuntimeOptions,
    units_dir: PathBuf,
    systemd_dir: PathBuf,
    backups_dir: PathBuf,
    deployment: Option<UnitDeployment>,
}

impl SystemdRuntime {
    /// Use the host's `systemctl`; fails when systemd is not running
    pub async fn new(options: RuntimeOptions) -> Result<Self, DeployError> {
        let systemctl = Systemctl::default();
        systemctl.probe().await?;
        let runtime = Self::with_manager(Arc::new(systemctl), options);
        tokio::fs::create_dir_all(&runtime.units_dir).await?;
        Ok(runtime)
    }

    pub fn with_manager(manager: Arc<dyn UnitManager>, options: RuntimeOptions) -> Self {
        Self {
            manager,
            units_dir: options.work_dir().join("units"),
            systemd_dir: PathBuf::from(SYSTEMD_UNIT_DIR),
            backups_dir: options.backups_dir(),
            options,
            deployment: None,
        }
    }

    /// Directory systemd loads units from
    pub fn with_systemd_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.systemd_dir = dir.into();
        self
    }

    /// Where rendered unit files are written before linking
    pub fn with_units_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.units_dir = dir.into();
        self
    }

    pub fn unit_name(&self) -> Option<&str> {
        self.deployment.as_ref().map(|d| d.unit_name.as_str())
    }

    /// Rendered unit file of the current deployment
    pub fn unit_path(&self) -> Option<&Path> {
        self.deployment.as_ref().map(|d| d.unit_path.as_path())
    }

    fn deployment(&self) -> Result<&UnitDeployment, DeployError> {
        self.deployment
            .as_ref()
            .ok_or_else(|| DeployError::NoDeployment("no unit deployed".to_string()))
    }

    /// Render and start the unit. Nothing is left behind on failure.
    async fn install(
        &self,
        deployment: &UnitDeployment,
        contents: &str,
    ) -> Result<(), DeployError> {
        tokio::fs::create_dir_all(&self.units_dir).await?;
        File::new(&deployment.unit_path).write_atomic(contents.as_bytes()).await?;

        self.manager.link(&deployment.unit_path).await?;
        self.manager.enable(&deployment.unit_name).await?;
        self.manager.reload().await?;
        self.manager.start(&deployment.unit_name).await?;
        Ok(())
    }

    async fn uninstall(&self, deployment: &UnitDeployment) {
        if let Err(e) = self.manager.disable(&deployment.unit_name).await {
            debug!("Disabling {} during cleanup: {}", deployment.unit_name, e);
        }
        for file in [&deployment.unit_path, &deployment.link_path] {
            if let Err(e) = remove_file(file).await {
                warn!("Failed to remove {:?}: {}", file, e);
            }
        }
        if let Err(e) = self.manager.reload().await {
            warn!("Failed to reload systemd: {}", e);
        }
    }

    async fn wait_inactive(&self, unit: &str) -> Result<(), DeployError> {
        loop {
            match self.manager.properties(unit).await {
                Ok(props) if props.is_stopped() => return Ok(()),
                Ok(props) => debug!("{} is still {}", unit, props.active_state),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            }
            tokio::time::sleep(INACTIVE_POLL).await;
        }
    }
}

/// Remove a file or symlink; a missing one is fine
async fn remove_file(path: &Path) -> Result<u64, DeployError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => {
            tokio::fs::remove_file(path).await?;
            Ok(if meta.file_type().is_symlink() { 0 } else { meta.len() })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// The executable artifact: typed as one or executable on disk
fn find_executable(result: &BuildResult) -> Option<&Artifact> {
    result
        .artifact(ArtifactType::Executable)
        .or_else(|| result.artifacts.iter().find(|a| is_executable(&a.file_path())))
}

fn status_from(props: &UnitProperties, fallback_start: Option<DateTime<Utc>>) -> RuntimeStatus {
    let last_error = match props.result.as_str() {
        "" | "success" => String::new(),
        other => other.to_string(),
    };
    RuntimeStatus {
        state: props.active_state.clone(),
        pid: props.main_pid as i64,
        container_id: None,
        memory: props.memory_current.unwrap_or(0),
        cpu: props.cpu_usage_nsec.unwrap_or(0) as f64 / 1e9,
        restarts: props.n_restarts,
        last_error,
        start_time: props.start_timestamp.or(fallback_start),
    }
}

#[async_trait]
impl Runtime for SystemdRuntime {
    fn kind(&self) -> RuntimeType {
        RuntimeType::Systemd
    }

    async fn deploy(&mut self, result: &BuildResult) -> Result<(), DeployError> {
        if self.deployment.is_some() {
            return Err(DeployError::AlreadyDeployed);
        }

        let artifact = find_executable(result)
            .ok_or_else(|| DeployError::NoArtifact("executable".to_string()))?;
        let exec_start = tokio::fs::canonicalize(artifact.file_path()).await?;
        let working_dir = exec_start
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.options.work_dir());

        let mut env = self.options.env_vars.clone();
        env.extend(result.spec.env.clone());

        let contents = UnitTemplate {
            build_id: &result.id,
            exec_start: &exec_start,
            working_dir: &working_dir,
            env: &env,
            limits: resource_limits(&result.spec.config, &result.spec.runtime.resources),
            auto_restart: result.spec.runtime.auto_restart,
        }
        .render();

        let name = unit_name(&result.id);
        let deployment = UnitDeployment {
            unit_path: self.units_dir.join(&name),
            link_path: self.systemd_dir.join(&name),
            unit_name: name,
            start_time: Utc::now(),
        };

        if let Err(e) = self.install(&deployment, &contents).await {
            warn!("Failed to deploy {}: {}", deployment.unit_name, e);
            self.uninstall(&deployment).await;
            return Err(e);
        }

        info!("Started unit {} running {:?}", deployment.unit_name, exec_start);
        self.deployment = Some(deployment);
        Ok(())
    }

    async fn status(&mut self) -> Result<RuntimeStatus, DeployError> {
        let deployment = self.deployment()?;
        let query = self.manager.properties(&deployment.unit_name);
        let props = tokio::time::timeout(STATUS_TIMEOUT, query)
            .await
            .map_err(|_| {
                DeployError::Timeout(format!(
                    "querying {} took longer than {:?}",
                    deployment.unit_name, STATUS_TIMEOUT
                ))
            })??;
        Ok(status_from(&props, Some(deployment.start_time)))
    }

    fn rollback_options(&self) -> RollbackOptions {
        self.options.rollback_options()
    }

    async fn rollback_with(&mut self, options: &RollbackOptions) -> RollbackResult {
        let backups_dir = self.backups_dir.clone();
        rollback::execute(self, options, &backups_dir).await
    }

    async fn close(&mut self) -> Result<(), DeployError> {
        let Some(deployment) = self.deployment.take() else {
            return Ok(());
        };

        let unit = deployment.unit_name.as_str();
        let mut errs = Vec::new();
        for step in [
            self.manager.kill(unit, "SIGKILL").await,
            self.manager.stop(unit).await,
            self.manager.disable(unit).await,
        ] {
            match step {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => errs.push(e),
            }
        }
        for file in [&deployment.unit_path, &deployment.link_path] {
            if let Err(e) = remove_file(file).await {
                errs.push(e);
            }
        }
        if let Err(e) = self.manager.reload().await {
            errs.push(e);
        }
        debug!("Closed unit {}", unit);
        DeployError::aggregate(errs)
    }
}

#[async_trait]
impl RollbackBackend for SystemdRuntime {
    fn backend_name(&self) -> &'static str {
        "systemd"
    }

    fn deployment_id(&self) -> Option<String> {
        self.unit_name().map(str::to_string)
    }

    async fn backup(&mut self, backup_dir: &Path) -> Result<(), DeployError> {
        let deployment = self.deployment()?;
        File::new(&deployment.unit_path)
            .copy_to(&backup_dir.join(BACKUP_UNIT))
            .await?;
        let props = self.manager.properties(&deployment.unit_name).await?;
        File::new(backup_dir.join(BACKUP_METADATA)).write_json(&props).await?;
        Ok(())
    }

    async fn graceful_stop(&mut self, timeout: Duration) -> Result<(), DeployError> {
        let unit = self.deployment()?.unit_name.clone();

        // Detached so an abandoned wait does not cancel the stop job
        let (tx, rx) = oneshot::channel();
        let manager = self.manager.clone();
        let stop_unit = unit.clone();
        tokio::spawn(async move {
            let _ = tx.send(manager.stop(&stop_unit).await);
        });

        tokio::select! {
            outcome = rx => outcome.map_err(|_| {
                DeployError::Internal(format!("stop task for {} vanished", unit))
            })?,
            _ = tokio::time::sleep(timeout) => Err(DeployError::Timeout(format!(
                "{} did not stop within {:?}",
                unit, timeout
            ))),
        }
    }

    async fn force_stop(&mut self) -> Result<(), DeployError> {
        let unit = self.deployment()?.unit_name.clone();
        self.manager.kill(&unit, "SIGKILL").await?;
        self.wait_inactive(&unit).await
    }

    async fn cleanup(&mut self, options: &RollbackOptions) -> Result<ResourceStats, DeployError> {
        let deployment = self.deployment()?;
        let unit = deployment.unit_name.clone();
        let files = [deployment.unit_path.clone(), deployment.link_path.clone()];
        let mut stats = ResourceStats::default();

        match self.manager.properties(&unit).await {
            Ok(props) => stats.memory_freed = props.memory_current.unwrap_or(0),
            Err(e) => debug!("No final properties for {}: {}", unit, e),
        }

        match self.manager.disable(&unit).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("{} already disabled: {}", unit, e),
            Err(e) => return Err(e),
        }

        if options.cleanup_files {
            for file in &files {
                let existed = tokio::fs::symlink_metadata(file).await.is_ok();
                stats.disk_space_freed += remove_file(file).await?;
                if existed {
                    stats.files_removed += 1;
                }
            }
        }

        self.manager.reload().await?;
        Ok(stats)
    }

    async fn verify(&mut self, options: &RollbackOptions) -> Result<(), DeployError> {
        let deployment = self.deployment()?;
        match self.manager.properties(&deployment.unit_name).await {
            Ok(props) if props.is_stopped() => {}
            Ok(props) => {
                return Err(DeployError::Backend(format!(
                    "unit {} is still {}",
                    deployment.unit_name, props.active_state
                )));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if options.cleanup_files {
            for file in [&deployment.unit_path, &deployment.link_path] {
                if tokio::fs::symlink_metadata(file).await.is_ok() {
                    return Err(DeployError::Backend(format!("unit file {:?} still exists", file)));
                }
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(deployment) = self.deployment.take() {
            debug!("Released unit {}", deployment.unit_name);
        }
    }
}
