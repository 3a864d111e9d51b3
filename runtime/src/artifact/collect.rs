//! Copying build outputs out of a build directory

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::artifact::{is_vcs_path, Artifact, ArtifactFile, ArtifactType};
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::utils::{file_mode, mode_is_executable, sha256_file};

/// A file copied from a build directory
#[derive(Debug, Clone)]
pub(crate) struct CopiedFile {
    pub entry: ArtifactFile,
    pub dest: PathBuf,
}

/// Copy every regular file below `src` into `dest`, keeping relative paths
pub(crate) async fn copy_tree(src: &Path, dest: &Path) -> Result<Vec<CopiedFile>, DeployError> {
    let mut copied = Vec::new();
    for path in Dir::new(src).walk_files().await? {
        let rel = path
            .strip_prefix(src)
            .map_err(|e| DeployError::Internal(format!("path outside build dir: {}", e)))?;
        if is_vcs_path(rel) {
            continue;
        }

        let meta = tokio::fs::metadata(&path).await?;
        let mode = file_mode(&meta);
        let checksum = sha256_file(&path).await?;
        let target = dest.join(rel);
        File::new(&path).copy_to(&target).await?;

        copied.push(CopiedFile {
            entry: ArtifactFile {
                path: rel.to_string_lossy().into_owned(),
                size: meta.len(),
                mode,
                executable: mode_is_executable(mode),
                checksum,
            },
            dest: target,
        });
    }
    Ok(copied)
}

/// Record every file a build produced as an artifact.
///
/// Files are copied to `output_dir` so that they outlive the temporary
/// build directory; artifact paths point at the copies. On failure
/// `output_dir` is removed.
pub async fn collect_build_outputs(
    build_dir: &Path,
    output_dir: &Path,
) -> Result<Vec<Artifact>, DeployError> {
    let output = Dir::new(output_dir);
    output.create().await?;

    let copied = match copy_tree(build_dir, output_dir).await {
        Ok(copied) => copied,
        Err(e) => {
            let _ = output.delete().await;
            return Err(DeployError::Packaging(e.to_string()));
        }
    };

    let artifacts = copied
        .into_iter()
        .map(|file| {
            let kind = if file.entry.executable {
                ArtifactType::Executable
            } else {
                ArtifactType::File
            };
            let mut metadata = HashMap::new();
            metadata.insert("relative_path".to_string(), file.entry.path.clone());
            metadata.insert("size".to_string(), file.entry.size.to_string());
            metadata.insert("executable".to_string(), file.entry.executable.to_string());
            Artifact {
                path: file.dest.to_string_lossy().into_owned(),
                kind,
                checksum: file.entry.checksum,
                metadata,
            }
        })
        .collect::<Vec<_>>();

    debug!("Collected {} artifact(s) into {:?}", artifacts.len(), output_dir);
    Ok(artifacts)
}
