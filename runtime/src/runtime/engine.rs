//! Container engine seam used by the OCI runtime

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, PruneImagesOptions};
use bollard::service::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::errors::DeployError;

/// What to create
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,

    /// `KEY=value` pairs
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,

    /// Bytes; zero means unlimited
    pub memory_bytes: u64,

    /// Billionths of a CPU; zero means unlimited
    pub nano_cpus: u64,

    pub restart_unless_stopped: bool,
}

/// Fields of a container inspection the runtime relies on
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerDetails {
    pub status: String,
    pub running: bool,
    pub pid: i64,
    pub restart_count: i64,
    pub error: String,
    pub started_at: Option<DateTime<Utc>>,

    /// Full engine response, kept for backups
    pub raw: serde_json::Value,
}

/// One stats sample with the previous reading the engine sends along
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerStats {
    pub cpu_total: u64,
    pub precpu_total: u64,
    pub system_total: u64,
    pub presystem_total: u64,
    pub percpu_count: usize,
    pub online_cpus: u64,
    pub memory_usage: u64,
}

impl ContainerStats {
    /// CPU usage in percent of one core, scaled by the number of CPUs
    pub fn cpu_percent(&self) -> f64 {
        let cpu_delta = self.cpu_total.saturating_sub(self.precpu_total) as f64;
        let system_delta = self.system_total.saturating_sub(self.presystem_total) as f64;
        let cpus = if self.percpu_count > 0 {
            self.percpu_count as f64
        } else {
            self.online_cpus as f64
        };
        if system_delta <= 0.0 || cpu_delta <= 0.0 || cpus == 0.0 {
            return 0.0;
        }
        cpu_delta / system_delta * cpus * 100.0
    }
}

/// Container operations the OCI runtime needs.
///
/// Implementations map a missing container to [`DeployError::NotFound`].
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<(), DeployError>;

    /// Create a container and return its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DeployError>;

    async fn start_container(&self, id: &str) -> Result<(), DeployError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, DeployError>;

    async fn stats(&self, id: &str) -> Result<ContainerStats, DeployError>;

    /// Stop with SIGTERM, escalating to SIGKILL after `timeout` inside the engine
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), DeployError>;

    async fn kill_container(&self, id: &str) -> Result<(), DeployError>;

    async fn remove_container(&self, id: &str, remove_volumes: bool) -> Result<(), DeployError>;

    /// Remove dangling images; returns bytes reclaimed
    async fn prune_images(&self) -> Result<u64, DeployError>;

    /// Write the container filesystem as a tarball; returns bytes written
    async fn export_container(&self, id: &str, dest: &Path) -> Result<u64, DeployError>;
}

/// Docker Engine API client
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect through the local socket (or `DOCKER_HOST`)
    pub async fn connect() -> Result<Self, DeployError> {
        let docker = Docker::connect_with_local_defaults().map_err(map_err)?;
        docker.ping().await.map_err(map_err)?;
        Ok(Self { docker })
    }
}

fn map_err(err: BollardError) -> DeployError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => DeployError::NotFound(message),
        other => DeployError::Backend(other.to_string()),
    }
}

fn status_code(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// An image reference with an explicit tag; pulling an untagged name would
/// fetch every tag
pub fn normalize_image(image: &str) -> String {
    if image.contains('@') {
        return image.to_string();
    }
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains(':') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn pull_image(&self, image: &str) -> Result<(), DeployError> {
        let options = CreateImageOptions {
            from_image: normalize_image(image),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DeployError> {
        let host_config = HostConfig {
            memory: (spec.memory_bytes > 0).then_some(spec.memory_bytes as i64),
            nano_cpus: (spec.nano_cpus > 0).then_some(spec.nano_cpus as i64),
            restart_policy: spec.restart_unless_stopped.then(|| RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(map_err)?;
        for warning in &response.warnings {
            debug!("Container create warning: {}", warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), DeployError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_err)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, DeployError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_err)?;
        let raw = serde_json::to_value(&inspect)?;
        let state = inspect.state.unwrap_or_default();

        Ok(ContainerDetails {
            status: state.status.map(|s| s.to_string()).unwrap_or_default(),
            running: state.running.unwrap_or(false),
            pid: state.pid.unwrap_or(0),
            restart_count: inspect.restart_count.unwrap_or(0),
            error: state.error.unwrap_or_default(),
            started_at: state
                .started_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc)),
            raw,
        })
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats, DeployError> {
        let stream = self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        futures::pin_mut!(stream);
        let stats = stream
            .next()
            .await
            .ok_or_else(|| DeployError::Backend(format!("no stats for container {}", id)))?
            .map_err(map_err)?;

        Ok(ContainerStats {
            cpu_total: stats.cpu_stats.cpu_usage.total_usage,
            precpu_total: stats.precpu_stats.cpu_usage.total_usage,
            system_total: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            presystem_total: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
            percpu_count: stats
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(Vec::len)
                .unwrap_or(0),
            online_cpus: stats.cpu_stats.online_cpus.unwrap_or(0),
            memory_usage: stats.memory_stats.usage.unwrap_or(0),
        })
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), DeployError> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn kill_container(&self, id: &str) -> Result<(), DeployError> {
        let options = KillContainerOptions { signal: "SIGKILL" };
        match self.docker.kill_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 409: not running
            Err(e) if status_code(&e) == Some(409) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn remove_container(&self, id: &str, remove_volumes: bool) -> Result<(), DeployError> {
        let options = RemoveContainerOptions {
            force: true,
            v: remove_volumes,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(map_err)
    }

    async fn prune_images(&self) -> Result<u64, DeployError> {
        let response = self
            .docker
            .prune_images(None::<PruneImagesOptions<String>>)
            .await
            .map_err(map_err)?;
        Ok(response.space_reclaimed.unwrap_or(0).max(0) as u64)
    }

    async fn export_container(&self, id: &str, dest: &Path) -> Result<u64, DeployError> {
        let mut file = tokio::fs::File::create(dest).await?;
        let stream = self.docker.export_container(id);
        futures::pin_mut!(stream);

        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_err)?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}
