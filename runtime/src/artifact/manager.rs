//! Packaging build directories into artifact bundles

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info, warn};

use crate::artifact::collect::copy_tree;
use crate::artifact::{ArtifactInfo, ArtifactMetadata, ArtifactType, METADATA_FILE};
use crate::build::BuildSpec;
use crate::errors::DeployError;
use crate::filesys::dir::{Dir, RemovalStats};
use crate::utils::{generate_uuid, sha256_file};

/// Default retention for packaged bundles
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Version recorded when the build spec does not carry one
const DEFAULT_VERSION: &str = "latest";

/// Packages build directories into bundles under a base directory
#[derive(Debug, Clone)]
pub struct ArtifactManager {
    base_dir: Dir,
    max_age: Duration,
    compression: bool,
}

impl ArtifactManager {
    /// Create a manager rooted at `base_dir`, creating it if needed
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self, DeployError> {
        let base_dir = Dir::new(base_dir.into());
        base_dir.create().await?;
        Ok(Self {
            base_dir,
            max_age: DEFAULT_MAX_AGE,
            compression: true,
        })
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    pub fn base_dir(&self) -> &Path {
        self.base_dir.path()
    }

    /// Copy `build_dir` into a new bundle with a `metadata.json` manifest.
    ///
    /// Compressed bundles are returned as `<id>.tar.gz` with the archive's
    /// digest. Uncompressed bundles point at the bundle directory and carry
    /// the manifest's digest. Nothing is left behind on failure.
    pub async fn package(
        &self,
        build_dir: &Path,
        spec: &BuildSpec,
    ) -> Result<ArtifactInfo, DeployError> {
        let id = generate_uuid();
        let bundle = self.base_dir.subdir(&id);

        match self.write_bundle(&id, &bundle, build_dir, spec).await {
            Ok(info) => {
                info!("Packaged {:?} as {} ({})", build_dir, info.url, info.kind);
                Ok(info)
            }
            Err(e) => {
                if let Err(cleanup) = bundle.delete().await {
                    warn!("Failed to remove partial bundle {:?}: {}", bundle.path(), cleanup);
                }
                let _ = tokio::fs::remove_file(self.archive_path(&id)).await;
                Err(DeployError::Packaging(e.to_string()))
            }
        }
    }

    async fn write_bundle(
        &self,
        id: &str,
        bundle: &Dir,
        build_dir: &Path,
        spec: &BuildSpec,
    ) -> Result<ArtifactInfo, DeployError> {
        bundle.create().await?;
        let copied = copy_tree(build_dir, bundle.path()).await?;

        let metadata = ArtifactMetadata {
            build_id: id.to_string(),
            version: if spec.version.is_empty() {
                DEFAULT_VERSION.to_string()
            } else {
                spec.version.clone()
            },
            created_at: Utc::now(),
            checksums: copied
                .iter()
                .map(|f| (f.entry.path.clone(), f.entry.checksum.clone()))
                .collect(),
            files: copied.into_iter().map(|f| f.entry).collect(),
            dependencies: Default::default(),
            config: spec.config.clone(),
        };
        let manifest = bundle.file(METADATA_FILE);
        manifest.write_json(&metadata).await?;
        debug!("Wrote manifest for {} file(s)", metadata.files.len());

        if !self.compression {
            return Ok(ArtifactInfo {
                url: bundle.path().to_string_lossy().into_owned(),
                digest: sha256_file(manifest.path()).await?,
                kind: ArtifactType::Directory,
            });
        }

        let archive = self.archive_path(id);
        write_archive(bundle.path().to_path_buf(), archive.clone()).await?;
        bundle.delete().await?;

        Ok(ArtifactInfo {
            url: archive.to_string_lossy().into_owned(),
            digest: sha256_file(&archive).await?,
            kind: ArtifactType::Archive,
        })
    }

    fn archive_path(&self, id: &str) -> PathBuf {
        self.base_dir.path().join(format!("{}.tar.gz", id))
    }

    /// Remove bundles whose modification time is older than the retention
    pub async fn prune_expired(&self) -> Result<RemovalStats, DeployError> {
        let mut stats = RemovalStats::default();
        let mut entries = match tokio::fs::read_dir(self.base_dir.path()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < self.max_age {
                continue;
            }

            let path = entry.path();
            debug!("Pruning expired artifact {:?} (age {:?})", path, age);
            if meta.is_dir() {
                let dir = Dir::new(&path);
                stats.bytes_freed += dir.disk_usage().await?;
                dir.delete().await?;
            } else {
                stats.bytes_freed += meta.len();
                tokio::fs::remove_file(&path).await?;
            }
            stats.files_removed += 1;
        }

        if stats.files_removed > 0 {
            info!(
                "Pruned {} expired artifact(s), freed {} bytes",
                stats.files_removed, stats.bytes_freed
            );
        }
        Ok(stats)
    }
}

/// Write `src` as a gzip-compressed tarball at `dest`
async fn write_archive(src: PathBuf, dest: PathBuf) -> Result<(), DeployError> {
    tokio::task::spawn_blocking(move || -> Result<(), DeployError> {
        let partial = dest.with_extension("gz.partial");
        let file = std::fs::File::create(&partial)?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        builder.follow_symlinks(false);
        builder.append_dir_all(".", &src)?;
        let encoder = builder.into_inner()?;
        encoder.finish()?.sync_all()?;
        std::fs::rename(&partial, &dest)?;
        Ok(())
    })
    .await
    .map_err(|e| DeployError::Internal(format!("archive task failed: {}", e)))?
}
