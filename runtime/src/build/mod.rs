//! Builders turn a source into deployable artifacts

pub mod native;
pub mod nixpack;
pub mod oci;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::artifact::{Artifact, ArtifactType};
use crate::errors::DeployError;
use crate::runtime::RuntimeConfig;
use crate::source::Source;
use crate::utils::generate_uuid;

pub use native::NativeBuilder;
pub use nixpack::NixpackBuilder;
pub use oci::OciBuilder;

/// How a source is turned into artifacts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStrategy {
    #[default]
    Native,
    Oci,
    Nixpack,
}

impl std::fmt::Display for BuildStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildStrategy::Native => "native",
            BuildStrategy::Oci => "oci",
            BuildStrategy::Nixpack => "nixpack",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failed,
}

/// What to build and how
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSpec {
    pub source: Source,

    #[serde(default)]
    pub strategy: BuildStrategy,

    /// Shell commands run in order inside the build directory
    #[serde(default)]
    pub commands: Vec<String>,

    /// Extra environment for build commands and the deployed program
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Version stamped on images and bundle manifests
    #[serde(default)]
    pub version: String,

    /// Free-form strategy and runtime hints (image name, resource limits, ...)
    #[serde(default)]
    pub config: HashMap<String, String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl BuildSpec {
    pub fn new(source: Source, strategy: BuildStrategy) -> Self {
        Self {
            source,
            strategy,
            version: String::new(),
            commands: Vec::new(),
            env: HashMap::new(),
            config: HashMap::new(),
            runtime: RuntimeConfig::default(),
        }
    }

    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands = commands.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub id: String,
    pub status: BuildStatus,
    pub artifacts: Vec<Artifact>,

    /// Combined output of each build step
    #[serde(default)]
    pub logs: Vec<String>,

    #[serde(default)]
    pub error: Option<String>,

    pub start_time: DateTime<Utc>,

    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    pub spec: BuildSpec,
}

impl BuildResult {
    /// A running build with a fresh id
    pub fn start(spec: &BuildSpec) -> Self {
        Self {
            id: generate_uuid(),
            status: BuildStatus::Running,
            artifacts: Vec::new(),
            logs: Vec::new(),
            error: None,
            start_time: Utc::now(),
            end_time: None,
            spec: spec.clone(),
        }
    }

    pub fn succeed(&mut self, artifacts: Vec<Artifact>) {
        info!("Build {} succeeded with {} artifact(s)", self.id, artifacts.len());
        self.artifacts = artifacts;
        self.status = BuildStatus::Success;
        self.end_time = Some(Utc::now());
    }

    pub fn fail(&mut self, err: &DeployError) {
        error!("Build {} failed: {}", self.id, err);
        self.status = BuildStatus::Failed;
        self.error = Some(err.to_string());
        self.end_time = Some(Utc::now());
    }

    /// Settle a finished run. A failure hands the failed result back inside
    /// [`DeployError::BuildFailed`].
    pub fn finish(
        mut self,
        outcome: Result<Vec<Artifact>, DeployError>,
    ) -> Result<Self, DeployError> {
        match outcome {
            Ok(artifacts) => {
                self.succeed(artifacts);
                Ok(self)
            }
            Err(e) => {
                self.fail(&e);
                Err(DeployError::BuildFailed {
                    result: Box::new(self),
                    source: Box::new(e),
                })
            }
        }
    }

    /// First artifact of the given type
    pub fn artifact(&self, kind: ArtifactType) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }
}

/// A build strategy
#[async_trait]
pub trait Builder: Send + Sync {
    fn strategy(&self) -> BuildStrategy;

    /// Run the build described by `spec`
    async fn build(&self, spec: &BuildSpec) -> Result<BuildResult, DeployError>;

    /// Look up a previous build
    async fn status(&self, build_id: &str) -> Result<BuildResult, DeployError>;
}

/// Create a builder with default settings for the given strategy
pub fn new_builder(strategy: BuildStrategy) -> Result<Box<dyn Builder>, DeployError> {
    let builder: Box<dyn Builder> = match strategy {
        BuildStrategy::Native => Box::new(NativeBuilder::new()?),
        BuildStrategy::Nixpack => Box::new(NixpackBuilder::new()?),
        BuildStrategy::Oci => Box::new(OciBuilder::new()?),
    };
    Ok(builder)
}
