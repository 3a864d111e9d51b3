//! Source descriptions and validation

pub mod fetch;
pub mod progress;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::DeployError;

pub use fetch::{fetch_source, SourceFetcher};
pub use progress::ProgressWriter;

/// Where the source material comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// A git repository, optionally checked out at a reference
    Git,

    /// A gzip-compressed tar archive
    Tarball,

    /// A single file, downloaded as-is
    Binary,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceType::Git => "git",
            SourceType::Tarball => "tarball",
            SourceType::Binary => "binary",
        };
        f.write_str(s)
    }
}

/// Source material for a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    #[serde(rename = "type")]
    pub kind: SourceType,

    pub url: String,

    /// Branch, tag, or commit to check out after cloning
    #[serde(default)]
    pub reference: Option<String>,

    #[serde(default)]
    pub signature: Option<Vec<u8>>,
}

impl Source {
    pub fn git(url: impl Into<String>, reference: Option<String>) -> Self {
        Self {
            kind: SourceType::Git,
            url: url.into(),
            reference,
            signature: None,
        }
    }

    pub fn tarball(url: impl Into<String>) -> Self {
        Self {
            kind: SourceType::Tarball,
            url: url.into(),
            reference: None,
            signature: None,
        }
    }

    pub fn binary(url: impl Into<String>) -> Self {
        Self {
            kind: SourceType::Binary,
            url: url.into(),
            reference: None,
            signature: None,
        }
    }

    /// Host part of the URL, including scp-style git remotes (`git@host:path`)
    pub fn host(&self) -> Result<String, DeployError> {
        match Url::parse(&self.url) {
            Ok(url) => url
                .host_str()
                .map(|h| h.to_string())
                .ok_or_else(|| {
                    DeployError::ValidationError(format!("URL has no host: {}", self.url))
                }),
            Err(e) => scp_host(&self.url)
                .filter(|_| self.kind == SourceType::Git)
                .ok_or_else(|| DeployError::ValidationError(format!("invalid URL: {}", e))),
        }
    }
}

fn scp_host(url: &str) -> Option<String> {
    let (user_host, _path) = url.split_once(':')?;
    let host = user_host.rsplit_once('@').map(|(_, h)| h).unwrap_or(user_host);
    if host.is_empty() || host.contains('/') {
        return None;
    }
    Some(host.to_string())
}

/// Checks a source before any network I/O happens
pub trait SourceValidator: Send + Sync {
    fn validate(&self, source: &Source) -> Result<(), DeployError>;
}

/// Restricts sources to an allow-list of domains.
///
/// An empty allow-list accepts every well-formed URL.
#[derive(Debug, Clone, Default)]
pub struct DomainValidator {
    allowed_domains: Vec<String>,
}

impl DomainValidator {
    pub fn new(allowed_domains: Vec<String>) -> Self {
        Self {
            allowed_domains: allowed_domains
                .into_iter()
                .map(|d| d.trim_start_matches('.').to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    fn is_allowed(&self, host: &str) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }
        let host = host.to_lowercase();
        self.allowed_domains
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)))
    }
}

impl SourceValidator for DomainValidator {
    fn validate(&self, source: &Source) -> Result<(), DeployError> {
        if source.url.is_empty() {
            return Err(DeployError::ValidationError("source URL is required".to_string()));
        }

        let host = source.host()?;
        if !self.is_allowed(&host) {
            return Err(DeployError::ValidationError(format!("domain not allowed: {}", host)));
        }

        Ok(())
    }
}
