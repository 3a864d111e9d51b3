//! Retrieving artifact bundles with digest verification

use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info};
use url::Url;

use crate::artifact::ArtifactInfo;
use crate::errors::DeployError;
use crate::utils::generate_uuid;

/// Download `info` into `dest_dir` with the default downloader
pub async fn download_artifact(
    info: &ArtifactInfo,
    dest_dir: &Path,
) -> Result<PathBuf, DeployError> {
    ArtifactDownloader::new(dest_dir)?.download(info).await
}

/// Streams artifacts to disk while hashing them.
///
/// The file is only returned if its SHA-256 matches the expected digest;
/// otherwise it is deleted.
#[derive(Debug, Clone)]
pub struct ArtifactDownloader {
    client: reqwest::Client,
    dest_dir: PathBuf,
}

enum Location {
    Remote(Url),
    Local(PathBuf),
}

impl ArtifactDownloader {
    pub fn new(dest_dir: impl Into<PathBuf>) -> Result<Self, DeployError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            dest_dir: dest_dir.into(),
        })
    }

    pub async fn download(&self, info: &ArtifactInfo) -> Result<PathBuf, DeployError> {
        let expected = info.digest.trim().to_lowercase();
        if expected.is_empty() {
            return Err(DeployError::ValidationError("artifact digest is required".to_string()));
        }

        let location = parse_location(&info.url)?;
        tokio::fs::create_dir_all(&self.dest_dir).await?;
        let name = format!("{}-{}", &generate_uuid()[..8], file_name(&location));
        let dest = self.dest_dir.join(name);

        let actual = match self.copy_hashed(&location, &dest).await {
            Ok(digest) => digest,
            Err(e) => {
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(e);
            }
        };

        if actual != expected {
            error!("Digest mismatch for {}: expected {}, got {}", info.url, expected, actual);
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(DeployError::Integrity { expected, actual });
        }

        info!("Downloaded artifact {} to {:?}", info.url, dest);
        Ok(dest)
    }

    async fn copy_hashed(&self, location: &Location, dest: &Path) -> Result<String, DeployError> {
        let mut out = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut total = 0u64;

        match location {
            Location::Remote(url) => {
                let mut response = self.client.get(url.clone()).send().await?;
                if response.status() != reqwest::StatusCode::OK {
                    return Err(DeployError::Backend(format!(
                        "unexpected status code: {}",
                        response.status().as_u16()
                    )));
                }
                while let Some(chunk) = response.chunk().await? {
                    hasher.update(&chunk);
                    out.write_all(&chunk).await?;
                    total += chunk.len() as u64;
                }
            }
            Location::Local(path) => {
                if tokio::fs::metadata(path).await?.is_dir() {
                    return Err(DeployError::Unsupported(format!(
                        "cannot download a bundle directory: {:?}",
                        path
                    )));
                }
                let mut input = tokio::fs::File::open(path).await?;
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let n = input.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    out.write_all(&buf[..n]).await?;
                    total += n as u64;
                }
            }
        }

        out.flush().await?;
        out.sync_all().await?;
        debug!("Wrote {} bytes to {:?}", total, dest);
        Ok(hex::encode(hasher.finalize()))
    }
}

fn parse_location(raw: &str) -> Result<Location, DeployError> {
    match Url::parse(raw) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => Ok(Location::Remote(url)),
        Ok(url) if url.scheme() == "file" => url
            .to_file_path()
            .map(Location::Local)
            .map_err(|_| DeployError::ValidationError(format!("invalid file URL: {}", raw))),
        Ok(url) if url.scheme().len() > 1 => Err(DeployError::Unsupported(format!(
            "unsupported artifact URL scheme: {}",
            url.scheme()
        ))),
        // Plain paths (and Windows drive letters parsed as schemes)
        _ => Ok(Location::Local(PathBuf::from(raw))),
    }
}

fn file_name(location: &Location) -> String {
    let name = match location {
        Location::Remote(url) => url
            .path_segments()
            .and_then(|mut s| s.next_back().map(str::to_string)),
        Location::Local(path) => path.file_name().map(|n| n.to_string_lossy().into_owned()),
    };
    name.filter(|n| !n.is_empty())
        .unwrap_or_else(|| "artifact".to_string())
}
