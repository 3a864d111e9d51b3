//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;
use walkdir::WalkDir;

use crate::errors::DeployError;
use crate::filesys::file::File;

/// Totals from a recursive file removal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalStats {
    pub files_removed: usize,
    pub bytes_freed: u64,
}

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), DeployError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Delete the directory and all contents
    pub async fn delete(&self) -> Result<(), DeployError> {
        match fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    /// Get a subdirectory
    pub fn subdir(&self, name: &str) -> Dir {
        Dir::new(self.path.join(name))
    }

    /// Recursively list regular files, sorted by path
    pub async fn walk_files(&self) -> Result<Vec<PathBuf>, DeployError> {
        let root = self.path.clone();
        blocking(move || {
            let mut files = Vec::new();
            for entry in WalkDir::new(&root).sort_by_file_name() {
                let entry = entry?;
                if entry.file_type().is_file() {
                    files.push(entry.into_path());
                }
            }
            Ok(files)
        })
        .await
    }

    /// Total size in bytes of all regular files below this directory
    pub async fn disk_usage(&self) -> Result<u64, DeployError> {
        let root = self.path.clone();
        blocking(move || {
            let mut size = 0u64;
            for entry in WalkDir::new(&root) {
                let entry = entry?;
                if entry.file_type().is_file() {
                    size += entry.metadata()?.len();
                }
            }
            Ok(size)
        })
        .await
    }

    /// Remove every regular file for which `keep` returns false, then prune
    /// directories left empty. The root itself is removed once empty.
    pub async fn remove_files<F>(&self, keep: F) -> Result<RemovalStats, DeployError>
    where
        F: Fn(&Path) -> bool + Send + 'static,
    {
        let root = self.path.clone();
        blocking(move || {
            let mut stats = RemovalStats::default();
            if !root.exists() {
                return Ok(stats);
            }

            for entry in WalkDir::new(&root) {
                let entry = entry?;
                if !entry.file_type().is_file() && !entry.file_type().is_symlink() {
                    continue;
                }
                if keep(entry.path()) {
                    continue;
                }
                let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => {
                        stats.files_removed += 1;
                        stats.bytes_freed += len;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }

            // Deepest first so parents are empty by the time we reach them
            for entry in WalkDir::new(&root).contents_first(true) {
                let entry = entry?;
                if entry.file_type().is_dir() {
                    let _ = std::fs::remove_dir(entry.path());
                }
            }
            Ok(stats)
        })
        .await
    }

    /// Regular files remaining below this directory that `keep` does not match
    pub async fn leftover_files<F>(&self, keep: F) -> Result<Vec<PathBuf>, DeployError>
    where
        F: Fn(&Path) -> bool,
    {
        if !self.exists().await {
            return Ok(Vec::new());
        }
        Ok(self
            .walk_files()
            .await?
            .into_iter()
            .filter(|p| !keep(p))
            .collect())
    }
}

async fn blocking<T, F>(f: F) -> Result<T, DeployError>
where
    F: FnOnce() -> Result<T, DeployError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DeployError::Internal(format!("blocking task failed: {}", e)))?
}
