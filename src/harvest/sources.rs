//! Source collections: checking them out and finding their manifests.

use crate::config::{SourceKind, SourceSpec};
use crate::harvest::formats::MANIFEST_FILE_NAMES;
use crate::harvest::tags::escape_component;
use crate::traits::{SourceSync, SyncError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Directories never descended into while looking for manifests.
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
];

/// Default [`SourceSync`]: local directories are used in place, git sources
/// are cloned into (or fast-forwarded inside) `work_dir/<name>`.
pub struct SourceSyncer {
    work_dir: PathBuf,
    git: String,
}

impl SourceSyncer {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            git: "git".to_string(),
        }
    }

    /// Overrides the git executable.
    pub fn with_git(mut self, git: impl Into<String>) -> Self {
        self.git = git.into();
        self
    }

    /// Checkout directory for a git source.
    pub fn checkout_dir(&self, source: &SourceSpec) -> PathBuf {
        let name = escape_component(&source.name).unwrap_or_else(|| "source".to_string());
        self.work_dir.join(name)
    }

    async fn git(&self, args: &[&str]) -> Result<(), SyncError> {
        let command = format!("{} {}", self.git, args.join(" "));
        debug!(command = %command, "Running git");

        let status = Command::new(&self.git)
            .args(args)
            .status()
            .await
            .map_err(|source| SyncError::Spawn {
                program: self.git.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(SyncError::CommandFailed {
                command,
                status: status.to_string(),
            })
        }
    }
}

#[async_trait]
impl SourceSync for SourceSyncer {
    async fn sync(&self, source: &SourceSpec) -> Result<PathBuf, SyncError> {
        match source.kind {
            SourceKind::Local => {
                let dir = PathBuf::from(&source.location);
                if dir.is_dir() {
                    Ok(dir)
                } else {
                    Err(SyncError::MissingDirectory(dir))
                }
            }
            SourceKind::Git => {
                let dir = self.checkout_dir(source);
                let dir_str = dir.to_string_lossy().into_owned();

                if dir.join(".git").is_dir() {
                    info!(source = %source.name, dir = %dir.display(), "Updating checkout");
                    self.git(&["-C", &dir_str, "pull", "--ff-only"]).await?;
                } else {
                    info!(source = %source.name, url = %source.location, "Cloning");
                    tokio::fs::create_dir_all(&self.work_dir).await?;
                    let mut args = vec!["clone", "--depth", "1"];
                    if let Some(branch) = &source.branch {
                        args.extend(["--branch", branch.as_str()]);
                    }
                    args.extend([source.location.as_str(), dir_str.as_str()]);
                    self.git(&args).await?;
                }
                Ok(dir)
            }
        }
    }
}

/// Recursively finds manifest files under `root`, in a stable order.
///
/// Unreadable entries are logged and skipped.
pub fn discover_manifests(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                    && e.file_name()
                        .to_str()
                        .map(|name| EXCLUDED_DIRS.contains(&name))
                        .unwrap_or(false))
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable path");
                None
            }
        })
        .filter(|e| {
            e.file_type().is_file()
                && e.file_name()
                    .to_str()
                    .map(|name| MANIFEST_FILE_NAMES.contains(&name))
                    .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect()
}
