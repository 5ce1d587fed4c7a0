//! Seams to the harvester's external collaborators.
//!
//! The registry engine never touches git, build tools or manifest syntax
//! directly; it drives these traits. Default implementations live in
//! [`crate::harvest::sources`], [`crate::harvest::formats`] and
//! [`crate::executor`].

use crate::config::SourceSpec;
use crate::harvest::formats::RawManifest;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Failed to parse content: {0}")]
    InvalidContent(String),
    #[error("No manifest format handles {0}")]
    UnsupportedFormat(PathBuf),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}")]
    CommandFailed { command: String, status: String },
    #[error("Source directory {0} does not exist")]
    MissingDirectory(PathBuf),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Build timed out after {0}s")]
    Timeout(u64),
}

/// Completion status reported by a [`PackageBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildStatus {
    /// Exit code, `None` when the process was killed by a signal
    pub code: Option<i32>,
}

impl BuildStatus {
    pub fn success() -> Self {
        Self { code: Some(0) }
    }

    pub fn failed(code: Option<i32>) -> Self {
        Self { code }
    }

    /// Status of a finished process, successful or not.
    pub fn from_code(code: Option<i32>) -> Self {
        Self { code }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "termination by signal"),
        }
    }
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// A manifest syntax (YAML, TOML, ...).
pub trait ManifestFormat: Send + Sync {
    /// Returns the format ID (e.g., "yaml", "toml").
    fn format_id(&self) -> &str;

    /// Whether this format claims the given manifest file.
    fn can_parse(&self, path: &Path) -> bool;

    /// Decodes raw file content. Validation happens afterwards, in
    /// [`RawManifest::into_record`].
    fn parse(&self, content: &[u8]) -> Result<RawManifest, ParseError>;
}

/// Makes a source collection available as a local directory.
#[async_trait]
pub trait SourceSync: Send + Sync {
    /// Returns the directory holding the source's manifests.
    async fn sync(&self, source: &SourceSpec) -> Result<PathBuf, SyncError>;
}

/// Builds one package in place.
///
/// The artifact is a side effect on disk; the pipeline locates it afterwards.
#[async_trait]
pub trait PackageBuilder: Send + Sync {
    /// Human-readable name for logging.
    fn builder_name(&self) -> &str;

    async fn build(&self, package_dir: &Path) -> Result<BuildStatus, BuildError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_status_from_code() {
        assert!(BuildStatus::from_code(Some(0)).is_success());
        assert_eq!(BuildStatus::from_code(Some(0)), BuildStatus::success());
        assert!(!BuildStatus::from_code(Some(2)).is_success());
        assert!(!BuildStatus::from_code(None).is_success());
        assert_eq!(BuildStatus::from_code(None).to_string(), "termination by signal");
    }
}
