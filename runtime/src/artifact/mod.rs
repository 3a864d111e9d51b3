//! Build artifacts, packaging, and verified retrieval

pub mod collect;
pub mod download;
pub mod manager;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use collect::collect_build_outputs;
pub use download::{download_artifact, ArtifactDownloader};
pub use manager::ArtifactManager;

/// Kind of an artifact or artifact bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    /// Regular file with an execute bit
    Executable,

    /// Container image reference
    Oci,

    /// Any other regular file
    File,

    /// Compressed bundle (`<id>.tar.gz`)
    Archive,

    /// Uncompressed bundle directory
    Directory,
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArtifactType::Executable => "executable",
            ArtifactType::Oci => "oci",
            ArtifactType::File => "file",
            ArtifactType::Archive => "archive",
            ArtifactType::Directory => "directory",
        };
        f.write_str(s)
    }
}

/// A single build output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Absolute file path, or an image reference for OCI artifacts
    pub path: String,

    #[serde(rename = "type")]
    pub kind: ArtifactType,

    /// Hex SHA-256 of the file contents; empty for image references
    #[serde(default)]
    pub checksum: String,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Artifact {
    pub fn file_path(&self) -> &Path {
        Path::new(&self.path)
    }
}

/// Reference to a packaged bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    /// Local path or URL
    pub url: String,

    /// Hex SHA-256 of the bundle the URL points at
    pub digest: String,

    #[serde(rename = "type")]
    pub kind: ArtifactType,
}

/// One file inside a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// Path relative to the bundle root
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub executable: bool,
    pub checksum: String,
}

/// Manifest written as `metadata.json` at the root of every bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub build_id: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub files: Vec<ArtifactFile>,

    #[serde(default)]
    pub dependencies: HashMap<String, String>,

    #[serde(default)]
    pub config: HashMap<String, String>,

    /// Relative path to hex SHA-256
    pub checksums: BTreeMap<String, String>,
}

/// Name of the manifest file inside a bundle
pub const METADATA_FILE: &str = "metadata.json";

/// Version-control metadata is never packaged
pub(crate) fn is_vcs_path(rel: &Path) -> bool {
    rel.components()
        .any(|c| matches!(c.as_os_str().to_str(), Some(".git") | Some(".hg") | Some(".svn")))
}
