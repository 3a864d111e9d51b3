//! Nixpacks builds: turn a source tree into a local image

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::artifact::{Artifact, ArtifactType};
use crate::build::{BuildResult, BuildSpec, BuildStrategy, Builder};
use crate::errors::DeployError;
use crate::process::{combined_output, run_captured};
use crate::source::SourceFetcher;

/// Config key naming the produced image
pub const NAME_KEY: &str = "name";

/// Config key with a comma-separated provider list
pub const PROVIDERS_KEY: &str = "nixpack.providers";

pub struct NixpackBuilder {
    work_dir: PathBuf,
    nixpacks_bin: PathBuf,
    fetcher: SourceFetcher,
}

impl NixpackBuilder {
    pub fn new() -> Result<Self, DeployError> {
        Ok(Self {
            work_dir: std::env::temp_dir(),
            nixpacks_bin: PathBuf::from("nixpacks"),
            fetcher: SourceFetcher::new()?,
        })
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn with_nixpacks_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.nixpacks_bin = bin.into();
        self
    }

    pub fn with_fetcher(mut self, fetcher: SourceFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    async fn run(
        &self,
        result: &mut BuildResult,
        spec: &BuildSpec,
    ) -> Result<Vec<Artifact>, DeployError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let build_dir = tempfile::Builder::new()
            .prefix(&format!("nixpack-build-{}-", result.id))
            .tempdir_in(&self.work_dir)?;

        self.fetcher.fetch(build_dir.path(), &spec.source).await?;

        let name = image_name(spec, &result.id);
        let version = if spec.version.is_empty() { "latest" } else { spec.version.as_str() };

        let mut cmd = Command::new(&self.nixpacks_bin);
        cmd.arg("build").arg(build_dir.path()).arg("--name").arg(&name);
        if let Some(providers) = spec.config.get(PROVIDERS_KEY).filter(|p| !p.is_empty()) {
            cmd.arg("--provider").arg(providers);
        }
        cmd.envs(&spec.env)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        info!("Running nixpacks build for {}", name);
        let output = run_captured(cmd, "nixpacks build").await?;
        let text = combined_output(&output);
        result.logs.push(text.clone());
        if !output.status.success() {
            return Err(DeployError::CommandFailed {
                command: "nixpacks build".to_string(),
                output: text,
            });
        }

        let mut metadata = HashMap::new();
        metadata.insert("builder".to_string(), "nixpack".to_string());
        metadata.insert("version".to_string(), version.to_string());
        Ok(vec![Artifact {
            path: format!("{}:{}", name, version),
            kind: ArtifactType::Oci,
            checksum: String::new(),
            metadata,
        }])
    }
}

/// Image name from the spec, or one derived from the build id
fn image_name(spec: &BuildSpec, build_id: &str) -> String {
    spec.config
        .get(NAME_KEY)
        .filter(|n| !n.is_empty())
        .cloned()
        .unwrap_or_else(|| format!("ajime-{}", &build_id[..build_id.len().min(8)]))
}

#[async_trait]
impl Builder for NixpackBuilder {
    fn strategy(&self) -> BuildStrategy {
        BuildStrategy::Nixpack
    }

    async fn build(&self, spec: &BuildSpec) -> Result<BuildResult, DeployError> {
        let mut result = BuildResult::start(spec);
        let outcome = self.run(&mut result, spec).await;
        result.finish(outcome)
    }

    async fn status(&self, _build_id: &str) -> Result<BuildResult, DeployError> {
        Err(DeployError::Unsupported(
            "status lookup is not available for nixpack builds".to_string(),
        ))
    }
}
