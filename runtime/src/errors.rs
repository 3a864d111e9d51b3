//! Error types for the build-and-deploy runtime

use thiserror::Error;

use crate::build::BuildResult;
use crate::runtime::rollback::RollbackState;

/// Main error type for builds, artifacts, and runtimes
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("failed to fetch source: {0}")]
    SourceFetch(String),

    #[error("build command failed: {command}: {output}")]
    CommandFailed { command: String, output: String },

    /// A build that reached `Failed`; the result keeps its logs and error
    #[error("build {} failed: {source}", .result.id)]
    BuildFailed {
        result: Box<BuildResult>,
        #[source]
        source: Box<DeployError>,
    },

    #[error("failed to package artifacts: {0}")]
    Packaging(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("no {0} artifact found")]
    NoArtifact(String),

    #[error("runtime already has a deployment")]
    AlreadyDeployed,

    #[error("no deployment: {0}")]
    NoDeployment(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("rollback failed in state {state}: {source}")]
    RollbackFailed {
        state: RollbackState,
        #[source]
        source: Box<DeployError>,
    },

    #[error("multiple errors during cleanup: {}", join_errors(.0))]
    Multiple(Vec<DeployError>),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Whether the error means the resource is already gone.
    ///
    /// Rollback and cleanup treat these as success.
    pub fn is_not_found(&self) -> bool {
        match self {
            DeployError::NotFound(_) => true,
            DeployError::IoError(e) => e.kind() == std::io::ErrorKind::NotFound,
            DeployError::Multiple(errs) => {
                !errs.is_empty() && errs.iter().all(|e| e.is_not_found())
            }
            _ => false,
        }
    }

    /// The failed build carried by [`DeployError::BuildFailed`]
    pub fn build_result(&self) -> Option<&BuildResult> {
        match self {
            DeployError::BuildFailed { result, .. } => Some(result.as_ref()),
            _ => None,
        }
    }

    /// The stage error behind a failed build, or the error itself
    pub fn cause(&self) -> &DeployError {
        match self {
            DeployError::BuildFailed { source, .. } => source.cause(),
            other => other,
        }
    }

    /// Whether the error is a bounded wait running out
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeployError::Timeout(_))
    }

    /// Collapse a list of teardown errors into one result
    pub fn aggregate(mut errs: Vec<DeployError>) -> Result<(), DeployError> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(DeployError::Multiple(errs)),
        }
    }
}

fn join_errors(errs: &[DeployError]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(err.to_string())
    }
}

impl From<walkdir::Error> for DeployError {
    fn from(err: walkdir::Error) -> Self {
        match err.into_io_error() {
            Some(io) => DeployError::IoError(io),
            None => DeployError::Internal("filesystem loop detected".to_string()),
        }
    }
}
