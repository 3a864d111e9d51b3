//! Deploying build results and rolling them back
//!
//! Every backend implements [`Runtime`] on top of the shared rollback engine
//! in [`rollback`].

pub mod engine;
pub mod native;
pub mod oci;
pub mod options;
pub mod rollback;
pub mod systemctl;
pub mod systemd;
pub mod unit;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::build::BuildResult;
use crate::errors::DeployError;

pub use native::NativeRuntime;
pub use oci::OciRuntime;
pub use options::{validate_runtime_options, RuntimeOptions};
pub use rollback::{ResourceStats, RollbackMetrics, RollbackOptions, RollbackResult, RollbackState};
pub use systemd::SystemdRuntime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Native,
    Oci,
    Systemd,
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuntimeType::Native => "native",
            RuntimeType::Oci => "oci",
            RuntimeType::Systemd => "systemd",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RuntimeType {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "native" => Ok(RuntimeType::Native),
            "oci" | "docker" | "container" => Ok(RuntimeType::Oci),
            "systemd" => Ok(RuntimeType::Systemd),
            other => Err(DeployError::Unsupported(format!("runtime type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Bytes; zero means unlimited
    #[serde(default)]
    pub memory_bytes: u64,

    /// Fractional cores in thousandths (1500 = 1.5 cores); zero means unlimited
    #[serde(default)]
    pub cpu_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub port: u16,
    pub path: String,
    pub interval: Duration,
}

/// Runtime hints carried by a build spec
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default, rename = "type")]
    pub kind: RuntimeType,

    #[serde(default)]
    pub resources: ResourceLimits,

    #[serde(default)]
    pub auto_restart: bool,

    #[serde(default)]
    pub monitoring: Option<MonitoringConfig>,
}

/// Snapshot of a running deployment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub state: String,
    pub pid: i64,

    /// Set by the OCI backend only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,

    /// Bytes
    pub memory: u64,

    /// Percent for processes and containers, CPU seconds for systemd units
    pub cpu: f64,

    pub restarts: u32,
    pub last_error: String,
    pub start_time: Option<DateTime<Utc>>,
}

/// A deployment backend
#[async_trait]
pub trait Runtime: Send {
    fn kind(&self) -> RuntimeType;

    /// Start the build's artifact; fails if a deployment is already held
    async fn deploy(&mut self, result: &BuildResult) -> Result<(), DeployError>;

    async fn status(&mut self) -> Result<RuntimeStatus, DeployError>;

    /// Rollback options derived from the runtime's options
    fn rollback_options(&self) -> RollbackOptions;

    /// Roll back with explicit options, reporting failures in the result
    async fn rollback_with(&mut self, options: &RollbackOptions) -> RollbackResult;

    /// Roll back with the runtime's own options
    async fn rollback(&mut self) -> Result<RollbackResult, DeployError> {
        let options = self.rollback_options();
        self.rollback_with(&options).await.ok()
    }

    /// Release everything the runtime holds. Safe to call repeatedly.
    async fn close(&mut self) -> Result<(), DeployError>;
}

/// Construct a runtime of the given type after validating `options`
pub async fn new_runtime(
    kind: RuntimeType,
    options: Option<RuntimeOptions>,
) -> Result<Box<dyn Runtime>, DeployError> {
    validate_runtime_options(options.as_ref())?;
    let options = options.unwrap_or_default();
    info!("Creating {} runtime", kind);

    let runtime: Box<dyn Runtime> = match kind {
        RuntimeType::Native => Box::new(NativeRuntime::new(options).await?),
        RuntimeType::Oci => Box::new(OciRuntime::new(options).await?),
        RuntimeType::Systemd => Box::new(SystemdRuntime::new(options).await?),
    };
    Ok(runtime)
}
