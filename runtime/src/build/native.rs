//! Native builds: fetch, run shell commands, collect outputs

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::artifact::{collect_build_outputs, Artifact};
use crate::build::{BuildResult, BuildSpec, BuildStrategy, Builder};
use crate::errors::DeployError;
use crate::process::{combined_output, run_shell};
use crate::source::SourceFetcher;

/// Runs build commands directly on the host
pub struct NativeBuilder {
    work_dir: PathBuf,
    output_dir: PathBuf,
    fetcher: SourceFetcher,
    results: RwLock<HashMap<String, BuildResult>>,
}

impl NativeBuilder {
    /// Builds in the system temp directory; outputs go to `<tmp>/ajime/builds`
    pub fn new() -> Result<Self, DeployError> {
        let tmp = std::env::temp_dir();
        Ok(Self {
            output_dir: tmp.join("ajime").join("builds"),
            work_dir: tmp,
            fetcher: SourceFetcher::new()?,
            results: RwLock::new(HashMap::new()),
        })
    }

    /// Parent directory for temporary build directories
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    /// Where build outputs are kept, one subdirectory per build id
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
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
            .prefix(&format!("build-{}-", result.id))
            .tempdir_in(&self.work_dir)?;
        debug!("Building {} in {:?}", result.id, build_dir.path());

        self.fetcher.fetch(build_dir.path(), &spec.source).await?;

        for command in &spec.commands {
            run_step(result, command, build_dir.path(), spec).await?;
        }

        collect_build_outputs(build_dir.path(), &self.output_dir.join(&result.id)).await
    }
}

async fn run_step(
    result: &mut BuildResult,
    command: &str,
    dir: &Path,
    spec: &BuildSpec,
) -> Result<(), DeployError> {
    info!("Running build command: {}", command);
    let output = run_shell(command, dir, &spec.env).await?;
    let text = combined_output(&output);
    result.logs.push(text.clone());

    if !output.status.success() {
        return Err(DeployError::CommandFailed {
            command: command.to_string(),
            output: text,
        });
    }
    Ok(())
}

#[async_trait]
impl Builder for NativeBuilder {
    fn strategy(&self) -> BuildStrategy {
        BuildStrategy::Native
    }

    async fn build(&self, spec: &BuildSpec) -> Result<BuildResult, DeployError> {
        let mut result = BuildResult::start(spec);
        info!("Starting native build {} from {}", result.id, spec.source.url);

        let outcome = self.run(&mut result, spec).await;
        let finished = result.finish(outcome);

        let record = match &finished {
            Ok(result) => Some(result),
            Err(e) => e.build_result(),
        };
        if let Some(record) = record {
            self.results.write().await.insert(record.id.clone(), record.clone());
        }
        finished
    }

    async fn status(&self, build_id: &str) -> Result<BuildResult, DeployError> {
        self.results
            .read()
            .await
            .get(build_id)
            .cloned()
            .ok_or_else(|| DeployError::NotFound(format!("build {}", build_id)))
    }
}
