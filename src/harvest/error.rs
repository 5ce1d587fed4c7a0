//! Error taxonomy for a harvest run.
//!
//! [`ManifestError`] is scoped to one manifest and never aborts a run;
//! [`HarvestError`] is fatal.

use crate::traits::{BuildError, BuildStatus, ParseError};
use std::path::PathBuf;
use thiserror::Error;

/// A rendered path template that would leave the output root.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Path `{rendered}` escapes the output root")]
pub struct UnsafePath {
    pub rendered: String,
}

/// Reasons a single manifest was not harvested.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Invalid manifest {path}: missing required field `{field}`")]
    InvalidManifest { path: PathBuf, field: &'static str },

    /// Not a failure: the version is already in the registry.
    #[error("{slug} {version} is already harvested")]
    DuplicateVersion { slug: String, version: String },

    #[error("Failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    #[error("Build of {slug} failed with {status}")]
    BuildFailed { slug: String, status: BuildStatus },

    #[error("Build of {slug} could not complete: {source}")]
    Build {
        slug: String,
        #[source]
        source: BuildError,
    },

    #[error("No artifact found for {slug} (searched {searched:?})")]
    ArtifactNotFound { slug: String, searched: Vec<PathBuf> },

    #[error("Failed to place artifact at {path}: {source}")]
    Placement {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    UnsafePath(#[from] UnsafePath),
}

impl ManifestError {
    /// Whether this outcome means "nothing to do" rather than a failure.
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::DuplicateVersion { .. })
    }
}

/// Errors that terminate a run.
#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Registry {path} is corrupt: {message}")]
    CorruptRegistry { path: PathBuf, message: String },

    #[error("Failed to read registry {path}: {source}")]
    RegistryRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write registry {path}: {source}")]
    RegistryWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write tag index for `{tag}` at {path}: {source}")]
    TagIndexWriteFailed {
        tag: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize {what}: {source}")]
    Serialize {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    UnsafePath(#[from] UnsafePath),
}
