//! Container image builds through the docker CLI

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::artifact::{Artifact, ArtifactType};
use crate::build::{BuildResult, BuildSpec, BuildStrategy, Builder};
use crate::errors::DeployError;
use crate::process::run_checked;
use crate::source::SourceFetcher;
use crate::utils::env_pairs;

pub const DEFAULT_REGISTRY: &str = "localhost";
pub const DEFAULT_BASE_IMAGE: &str = "alpine:latest";

/// Config key overriding the base image
pub const BASE_IMAGE_KEY: &str = "oci.base_image";

pub struct OciBuilder {
    registry: String,
    push: bool,
    docker_bin: PathBuf,
    work_dir: PathBuf,
    fetcher: SourceFetcher,
}

impl OciBuilder {
    pub fn new() -> Result<Self, DeployError> {
        Ok(Self {
            registry: DEFAULT_REGISTRY.to_string(),
            push: false,
            docker_bin: PathBuf::from("docker"),
            work_dir: std::env::temp_dir(),
            fetcher: SourceFetcher::new()?,
        })
    }

    /// Registry prefix for image tags; images are pushed when `push` is set
    pub fn with_registry(mut self, registry: impl Into<String>, push: bool) -> Self {
        self.registry = registry.into();
        self.push = push;
        self
    }

    pub fn with_docker_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.docker_bin = bin.into();
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn with_fetcher(mut self, fetcher: SourceFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    fn tag(&self, build_id: &str) -> String {
        format!("{}/{}:latest", self.registry.trim_end_matches('/'), build_id)
    }

    async fn run(
        &self,
        result: &mut BuildResult,
        spec: &BuildSpec,
    ) -> Result<Vec<Artifact>, DeployError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let build_dir = tempfile::Builder::new()
            .prefix(&format!("oci-build-{}-", result.id))
            .tempdir_in(&self.work_dir)?;

        self.fetcher.fetch(build_dir.path(), &spec.source).await?;
        let dockerfile = write_dockerfile(build_dir.path(), spec).await?;

        let tag = self.tag(&result.id);
        info!("Building image {}", tag);
        let mut build = self.docker();
        build
            .arg("build")
            .arg("-f")
            .arg(&dockerfile)
            .arg("-t")
            .arg(&tag)
            .arg(build_dir.path());
        result.logs.push(run_checked(build, "docker build").await?);

        if self.push {
            info!("Pushing image {}", tag);
            let mut push = self.docker();
            push.arg("push").arg(&tag);
            result.logs.push(run_checked(push, "docker push").await?);
        }

        let mut metadata = HashMap::new();
        metadata.insert("registry".to_string(), self.registry.clone());
        metadata.insert("pushed".to_string(), self.push.to_string());
        Ok(vec![Artifact {
            path: tag,
            kind: ArtifactType::Oci,
            checksum: String::new(),
            metadata,
        }])
    }

    fn docker(&self) -> Command {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.stdin(std::process::Stdio::null()).kill_on_drop(true);
        cmd
    }
}

/// Render the generated Dockerfile for a spec
pub fn render_dockerfile(spec: &BuildSpec) -> String {
    let base = spec
        .config
        .get(BASE_IMAGE_KEY)
        .map(String::as_str)
        .unwrap_or(DEFAULT_BASE_IMAGE);

    let mut lines = vec![format!("FROM {}", base), "WORKDIR /app".to_string()];
    for pair in env_pairs(&spec.env) {
        lines.push(format!("ENV {}", pair));
    }
    lines.push("COPY . /app".to_string());
    for command in &spec.commands {
        lines.push(format!("RUN {}", command));
    }
    lines.join("\n") + "\n"
}

/// Written next to the source so a Dockerfile shipped with it is not clobbered
async fn write_dockerfile(build_dir: &Path, spec: &BuildSpec) -> Result<PathBuf, DeployError> {
    let path = build_dir.join("Dockerfile.ajime");
    tokio::fs::write(&path, render_dockerfile(spec)).await?;
    debug!("Wrote {:?}", path);
    Ok(path)
}

#[async_trait]
impl Builder for OciBuilder {
    fn strategy(&self) -> BuildStrategy {
        BuildStrategy::Oci
    }

    async fn build(&self, spec: &BuildSpec) -> Result<BuildResult, DeployError> {
        let mut result = BuildResult::start(spec);
        let outcome = self.run(&mut result, spec).await;
        result.finish(outcome)
    }

    async fn status(&self, _build_id: &str) -> Result<BuildResult, DeployError> {
        Err(DeployError::Unsupported(
            "status lookup is not available for OCI builds".to_string(),
        ))
    }
}
