//! Fetching git, tarball, and binary sources into a build directory

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::DeployError;
use crate::process::run_checked;
use crate::source::{DomainValidator, ProgressWriter, Source, SourceType, SourceValidator};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// File name used when a binary URL has no usable last path segment
pub const DEFAULT_BINARY_NAME: &str = "binary";

/// Fetch a source with the default fetcher
pub async fn fetch_source(dest_dir: &Path, source: &Source) -> Result<(), DeployError> {
    SourceFetcher::new()?.fetch(dest_dir, source).await
}

/// Downloads or clones sources, retrying transient network failures
#[derive(Clone)]
pub struct SourceFetcher {
    client: reqwest::Client,
    cooldown: CooldownOptions,
    validators: Vec<Arc<dyn SourceValidator>>,
    git_bin: PathBuf,
}

impl SourceFetcher {
    pub fn new() -> Result<Self, DeployError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            cooldown: CooldownOptions::default(),
            validators: vec![Arc::new(DomainValidator::default())],
            git_bin: PathBuf::from("git"),
        })
    }

    pub fn with_cooldown(mut self, cooldown: CooldownOptions) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Add a validator; every validator must accept the source
    pub fn with_validator(mut self, validator: Arc<dyn SourceValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn with_git_bin(mut self, git_bin: impl Into<PathBuf>) -> Self {
        self.git_bin = git_bin.into();
        self
    }

    /// Populate `dest_dir` with the source material.
    ///
    /// Every failure is reported as [`DeployError::SourceFetch`].
    pub async fn fetch(&self, dest_dir: &Path, source: &Source) -> Result<(), DeployError> {
        for validator in &self.validators {
            validator
                .validate(source)
                .map_err(|e| DeployError::SourceFetch(format!("invalid source: {}", e)))?;
        }

        info!("Fetching {} source from {}", source.kind, source.url);
        let result = match source.kind {
            SourceType::Git => self.fetch_git(dest_dir, source).await,
            SourceType::Tarball => self.fetch_tarball(dest_dir, &source.url).await,
            SourceType::Binary => self.fetch_binary(dest_dir, &source.url).await,
        };

        result.map_err(|e| match e {
            DeployError::SourceFetch(_) => e,
            other => DeployError::SourceFetch(other.to_string()),
        })
    }

    async fn fetch_git(&self, dest_dir: &Path, source: &Source) -> Result<(), DeployError> {
        let mut clone = self.git_command();
        clone.arg("clone").arg("--quiet").arg(&source.url).arg(dest_dir);
        run_checked(clone, "git clone")
            .await
            .map_err(|e| git_error("clone", e))?;

        if let Some(reference) = source.reference.as_deref().filter(|r| !r.is_empty()) {
            debug!("Checking out {}", reference);
            let mut checkout = self.git_command();
            checkout
                .arg("checkout")
                .arg("--quiet")
                .arg(reference)
                .current_dir(dest_dir);
            run_checked(checkout, "git checkout")
                .await
                .map_err(|e| git_error("checkout", e))?;
        }

        Ok(())
    }

    fn git_command(&self) -> Command {
        let mut cmd = Command::new(&self.git_bin);
        cmd.env("GIT_TERMINAL_PROMPT", "0")
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn fetch_tarball(&self, dest_dir: &Path, url: &str) -> Result<(), DeployError> {
        // Removed on drop, after extraction
        let archive = tempfile::Builder::new()
            .prefix(".source-")
            .suffix(".tar.gz")
            .tempfile_in(dest_dir)?;

        let response = self.get_with_retry(url).await?;
        let size = stream_to_file(response, archive.path()).await?;
        debug!("Downloaded {} byte archive, extracting", size);

        let archive_path = archive.path().to_path_buf();
        let dest = dest_dir.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<(), DeployError> {
            let file = std::fs::File::open(&archive_path)?;
            let mut tarball = tar::Archive::new(GzDecoder::new(file));
            tarball.set_preserve_permissions(true);
            tarball
                .unpack(&dest)
                .map_err(|e| DeployError::SourceFetch(format!("failed to extract tarball: {}", e)))
        })
        .await
        .map_err(|e| DeployError::Internal(format!("extraction task failed: {}", e)))??;

        drop(archive);
        Ok(())
    }

    async fn fetch_binary(&self, dest_dir: &Path, url: &str) -> Result<(), DeployError> {
        let name = binary_file_name(url);
        let response = self.get_with_retry(url).await?;
        let size = stream_to_file(response, &dest_dir.join(&name)).await?;
        debug!("Downloaded binary {} ({} bytes)", name, size);
        Ok(())
    }

    /// GET with exponential backoff on transport errors.
    ///
    /// A non-200 response is final and is not retried.
    pub async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, DeployError> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status != reqwest::StatusCode::OK {
                        return Err(DeployError::SourceFetch(format!(
                            "unexpected status code: {}",
                            status.as_u16()
                        )));
                    }
                    return Ok(response);
                }
                Err(e) => {
                    let delay = calc_exp_backoff(&self.cooldown, attempt);
                    if started.elapsed() + delay > self.cooldown.max_elapsed {
                        return Err(DeployError::SourceFetch(format!(
                            "giving up after {} attempts: {}",
                            attempt + 1,
                            e
                        )));
                    }
                    warn!(
                        "GET {} failed (attempt {}), retrying in {:?}: {}",
                        url,
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn git_error(step: &str, err: DeployError) -> DeployError {
    match err {
        DeployError::CommandFailed { output, .. } => {
            DeployError::SourceFetch(format!("git {} failed: {}", step, output.trim_end()))
        }
        other => DeployError::SourceFetch(format!("git {} failed: {}", step, other)),
    }
}

/// Last path segment of the URL, or [`DEFAULT_BINARY_NAME`]
pub fn binary_file_name(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.path_segments().and_then(|mut s| s.next_back().map(str::to_string)))
        .filter(|name| !name.is_empty() && name != "." && name != "..")
        .unwrap_or_else(|| DEFAULT_BINARY_NAME.to_string())
}

async fn stream_to_file(mut response: reqwest::Response, path: &Path) -> Result<u64, DeployError> {
    let mut progress = ProgressWriter::new(response.content_length());
    let mut file = tokio::fs::File::create(path).await?;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        progress.advance(chunk.len() as u64);
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(progress.current())
}
