//! OCI runtime: the build's image as a single container

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::artifact::ArtifactType;
use crate::build::BuildResult;
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::runtime::engine::{ContainerEngine, ContainerSpec, DockerEngine};
use crate::runtime::rollback::{
    self, ResourceStats, RollbackBackend, RollbackOptions, RollbackResult,
};
use crate::runtime::{Runtime, RuntimeOptions, RuntimeStatus, RuntimeType};
use crate::utils::{calc_exp_backoff, env_pairs, CooldownOptions};

/// Label carrying the build id on every container the runtime creates
pub const BUILD_ID_LABEL: &str = "io.ajime.build-id";

/// Container filesystem export inside a rollback backup
pub const BACKUP_EXPORT: &str = "container.tar";

/// Inspection output inside a rollback backup
pub const BACKUP_METADATA: &str = "metadata.json";

/// Upper bound on one inspect + stats round trip
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period docker gives the container during close
const CLOSE_STOP_TIMEOUT: Duration = Duration::from_secs(10);

struct Deployment {
    container_id: String,
    image: String,
    start_time: DateTime<Utc>,
}

/// Runs the build's image as a container
pub struct OciRuntime {
    engine: Arc<dyn ContainerEngine>,
    options: RuntimeOptions,
    backups_dir: PathBuf,
    cooldown: CooldownOptions,
    deployment: Option<Deployment>,
}

impl OciRuntime {
    /// Connect to the local Docker engine
    pub async fn new(options: RuntimeOptions) -> Result<Self, DeployError> {
        let engine = DockerEngine::connect().await?;
        Ok(Self::with_engine(Arc::new(engine), options))
    }

    pub fn with_engine(engine: Arc<dyn ContainerEngine>, options: RuntimeOptions) -> Self {
        Self {
            engine,
            backups_dir: options.backups_dir(),
            options,
            cooldown: CooldownOptions::default(),
            deployment: None,
        }
    }

    /// Backoff between image pull attempts
    pub fn with_cooldown(mut self, cooldown: CooldownOptions) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn container_id(&self) -> Option<&str> {
        self.deployment.as_ref().map(|d| d.container_id.as_str())
    }

    fn container(&self) -> Result<&str, DeployError> {
        self.container_id()
            .ok_or_else(|| DeployError::NoDeployment("no container running".to_string()))
    }

    async fn pull(&self, image: &str) -> Result<(), DeployError> {
        let attempts = self.options.pull_attempts();
        let mut attempt = 0;
        loop {
            match self.engine.pull_image(image).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 >= attempts => {
                    return Err(DeployError::Backend(format!(
                        "failed to pull image {} after {} attempt(s): {}",
                        image, attempts, e
                    )));
                }
                Err(e) => {
                    let delay = calc_exp_backoff(&self.cooldown, attempt);
                    warn!("Pulling {} failed, retrying in {:?}: {}", image, delay, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn container_spec(&self, image: &str, result: &BuildResult) -> ContainerSpec {
        let mut env = self.options.env_vars.clone();
        env.extend(result.spec.env.clone());
        env.extend(result.spec.config.clone());

        let mut labels = self.options.labels.clone();
        labels.insert(BUILD_ID_LABEL.to_string(), result.id.clone());

        let resources = &result.spec.runtime.resources;
        ContainerSpec {
            image: image.to_string(),
            env: env_pairs(&env),
            labels,
            memory_bytes: resources.memory_bytes,
            nano_cpus: resources.cpu_millis * 1_000_000,
            restart_unless_stopped: result.spec.runtime.auto_restart,
        }
    }
}

#[async_trait]
impl Runtime for OciRuntime {
    fn kind(&self) -> RuntimeType {
        RuntimeType::Oci
    }

    async fn deploy(&mut self, result: &BuildResult) -> Result<(), DeployError> {
        if self.deployment.is_some() {
            return Err(DeployError::AlreadyDeployed);
        }

        let image = result
            .artifact(ArtifactType::Oci)
            .map(|a| a.path.clone())
            .ok_or_else(|| DeployError::NoArtifact("OCI".to_string()))?;

        self.pull(&image).await?;
        let id = self
            .engine
            .create_container(&self.container_spec(&image, result))
            .await?;

        if let Err(e) = self.engine.start_container(&id).await {
            if let Err(remove) = self.engine.remove_container(&id, true).await {
                warn!("Failed to remove container {} after start failure: {}", id, remove);
            }
            return Err(e);
        }

        info!("Started container {} from {}", id, image);
        self.deployment = Some(Deployment {
            container_id: id,
            image,
            start_time: Utc::now(),
        });
        Ok(())
    }

    async fn status(&mut self) -> Result<RuntimeStatus, DeployError> {
        let id = self.container()?;
        let sample = async {
            let details = self.engine.inspect_container(id).await?;
            let stats = self.engine.stats(id).await?;
            Ok::<_, DeployError>((details, stats))
        };
        let (details, stats) = tokio::time::timeout(STATUS_TIMEOUT, sample)
            .await
            .map_err(|_| {
                DeployError::Timeout(format!(
                    "querying container {} took longer than {:?}",
                    id, STATUS_TIMEOUT
                ))
            })??;

        Ok(RuntimeStatus {
            state: details.status,
            pid: details.pid,
            container_id: Some(id.to_string()),
            memory: stats.memory_usage,
            cpu: stats.cpu_percent(),
            restarts: details.restart_count.max(0) as u32,
            last_error: details.error,
            start_time: details
                .started_at
                .or_else(|| self.deployment.as_ref().map(|d| d.start_time)),
        })
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

        let id = deployment.container_id;
        let mut errs = Vec::new();
        match self.engine.stop_container(&id, CLOSE_STOP_TIMEOUT).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => errs.push(e),
        }
        match self.engine.remove_container(&id, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => errs.push(e),
        }
        debug!("Closed container {} ({})", id, deployment.image);
        DeployError::aggregate(errs)
    }
}

#[async_trait]
impl RollbackBackend for OciRuntime {
    fn backend_name(&self) -> &'static str {
        "oci"
    }

    fn deployment_id(&self) -> Option<String> {
        self.container_id().map(|id| id.chars().take(12).collect())
    }

    async fn backup(&mut self, backup_dir: &Path) -> Result<(), DeployError> {
        let id = self.container()?;
        let details = self.engine.inspect_container(id).await?;
        File::new(backup_dir.join(BACKUP_METADATA))
            .write_json(&details.raw)
            .await?;
        let size = self
            .engine
            .export_container(id, &backup_dir.join(BACKUP_EXPORT))
            .await?;
        debug!("Exported {} bytes of container {}", size, id);
        Ok(())
    }

    async fn graceful_stop(&mut self, timeout: Duration) -> Result<(), DeployError> {
        let id = self.container()?;
        self.engine.stop_container(id, timeout).await
    }

    async fn force_stop(&mut self) -> Result<(), DeployError> {
        let id = self.container()?;
        self.engine.kill_container(id).await
    }

    async fn cleanup(&mut self, options: &RollbackOptions) -> Result<ResourceStats, DeployError> {
        let id = self.container()?.to_string();
        let mut stats = ResourceStats::default();

        match self.engine.stats(&id).await {
            Ok(sample) => stats.memory_freed = sample.memory_usage,
            Err(e) => debug!("No final stats for {}: {}", id, e),
        }

        match self.engine.remove_container(&id, true).await {
            Ok(()) => stats.files_removed += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if options.cleanup_files {
            stats.disk_space_freed = self.engine.prune_images().await?;
        }
        Ok(stats)
    }

    async fn verify(&mut self, _options: &RollbackOptions) -> Result<(), DeployError> {
        let id = self.container()?;
        match self.engine.inspect_container(id).await {
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
            Ok(details) => Err(DeployError::Backend(format!(
                "container {} still exists ({})",
                id, details.status
            ))),
        }
    }

    fn release(&mut self) {
        if let Some(deployment) = self.deployment.take() {
            debug!("Released container {}", deployment.container_id);
        }
    }
}
