//! Per-tag index documents.
//!
//! A [`TagMap`] (tag -> member slugs) is accumulated by the pipeline during
//! a run and handed to [`TagIndexBuilder::generate`] at the end, which
//! writes one [`TagIndexDocument`] per tag beneath the output root.
//!
//! Tag names come from manifests and are untrusted. They are escaped with
//! [`escape_component`] before substitution, and every rendered template is
//! resolved with [`resolve_under`], which refuses anything that would leave
//! the output root.

use crate::harvest::error::{HarvestError, UnsafePath};
use crate::harvest::io::write_atomic;
use crate::model::{PackageEntry, RegistryDocument, TagIndexDocument};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

// ============================================================================
// Tag Map
// ============================================================================

/// Tag -> slugs of the entries carrying it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMap {
    members: BTreeMap<String, BTreeSet<String>>,
}

impl TagMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the map with every entry already in the registry.
    pub fn from_registry(document: &RegistryDocument) -> Self {
        let mut map = Self::new();
        for entry in &document.potatoes {
            map.record(entry);
        }
        map
    }

    /// Makes the map reflect `entry`'s current tags.
    ///
    /// Tags the entry no longer carries lose it as a member.
    pub fn record(&mut self, entry: &PackageEntry) {
        for slugs in self.members.values_mut() {
            slugs.remove(&entry.slug);
        }
        self.members.retain(|_, slugs| !slugs.is_empty());

        for tag in entry.tags.iter().filter(|t| !t.is_empty()) {
            self.members
                .entry(tag.clone())
                .or_default()
                .insert(entry.slug.clone());
        }
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn members(&self, tag: &str) -> Option<&BTreeSet<String>> {
        self.members.get(tag)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// ============================================================================
// Path Handling
// ============================================================================

/// Escapes an untrusted value for use as (part of) a single path component.
///
/// Bytes outside `[A-Za-z0-9_.-]` become `%XX`, as does a leading `.`, so
/// the result is never `.`, `..`, hidden, or contains a separator. Returns
/// `None` for an empty value.
pub fn escape_component(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }

    let mut escaped = String::with_capacity(raw.len());
    for (i, byte) in raw.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || byte == b'_'
            || byte == b'-'
            || (byte == b'.' && i > 0);
        if keep {
            escaped.push(byte as char);
        } else {
            let _ = write!(escaped, "%{:02X}", byte);
        }
    }
    Some(escaped)
}

/// Substitutes `{key}` placeholders in a path template.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{}}}", key), value)
    })
}

/// Joins a rendered template beneath `root`.
///
/// A leading `/` means "the output root", not the filesystem root.
///
/// # Errors
///
/// [`UnsafePath`] if the path is empty or has a `..`, root or prefix
/// component after the leading slashes.
pub fn resolve_under(root: &Path, rendered: &str) -> Result<PathBuf, UnsafePath> {
    let unsafe_path = || UnsafePath {
        rendered: rendered.to_string(),
    };

    let mut resolved = root.to_path_buf();
    let mut has_component = false;
    for component in Path::new(rendered.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                has_component = true;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path());
            }
        }
    }

    if has_component {
        Ok(resolved)
    } else {
        Err(unsafe_path())
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Writes tag index documents beneath an output root.
pub struct TagIndexBuilder {
    output_root: PathBuf,
    template: String,
}

impl TagIndexBuilder {
    pub fn new(output_root: impl Into<PathBuf>, template: impl Into<String>) -> Self {
        Self {
            output_root: output_root.into(),
            template: template.into(),
        }
    }

    pub fn for_registry(output_root: impl Into<PathBuf>, document: &RegistryDocument) -> Self {
        Self::new(output_root, document.tag_index_path_template.clone())
    }

    /// Output location of the document for `tag`.
    pub fn path_for(&self, tag: &str) -> Result<PathBuf, UnsafePath> {
        let escaped = escape_component(tag).ok_or_else(|| UnsafePath {
            rendered: self.template.clone(),
        })?;
        resolve_under(
            &self.output_root,
            &render_template(&self.template, &[("tag", &escaped)]),
        )
    }

    /// Writes one document per tag in `tags`, members listed in registry
    /// order.
    ///
    /// Returns the paths written.
    ///
    /// # Errors
    ///
    /// [`HarvestError::TagIndexWriteFailed`] on the first tag whose file
    /// cannot be written.
    pub fn generate(
        &self,
        registry: &RegistryDocument,
        tags: &TagMap,
    ) -> Result<Vec<PathBuf>, HarvestError> {
        let mut written = Vec::with_capacity(tags.len());

        for (tag, slugs) in &tags.members {
            let members = registry
                .potatoes
                .iter()
                .filter(|entry| slugs.contains(&entry.slug) && entry.tags.contains(tag));
            let document = TagIndexDocument::new(tag, members);
            if document.count == 0 {
                debug!(tag = %tag, "Tag has no members, skipping");
                continue;
            }

            let path = self.path_for(tag)?;
            let mut content =
                serde_json::to_vec_pretty(&document).map_err(|source| HarvestError::Serialize {
                    what: format!("tag index `{}`", tag),
                    source,
                })?;
            content.push(b'\n');

            write_atomic(&path, &content).map_err(|source| HarvestError::TagIndexWriteFailed {
                tag: tag.clone(),
                path: path.clone(),
                source,
            })?;

            debug!(tag = %tag, count = document.count, path = %path.display(), "Wrote tag index");
            written.push(path);
        }

        info!(tags = written.len(), "Tag indexes generated");
        Ok(written)
    }

    /// Deletes tag documents whose tag is not in `indexed_tags`.
    ///
    /// Only works when `{tag}` sits in the file name of the template; other
    /// layouts are left alone. Paths in `protected` are never removed.
    pub fn prune(
        &self,
        indexed_tags: &[String],
        protected: &[&Path],
    ) -> Result<Vec<PathBuf>, HarvestError> {
        let trimmed = self.template.trim_start_matches('/');
        let (dir_template, file_template) = match trimmed.rsplit_once('/') {
            Some((dir, file)) => (dir, file),
            None => ("", trimmed),
        };
        let Some((prefix, suffix)) = file_template.split_once("{tag}") else {
            warn!(template = %self.template, "Tag placeholder is not in the file name, not pruning");
            return Ok(Vec::new());
        };
        if dir_template.contains("{tag}") || suffix.contains("{tag}") {
            warn!(template = %self.template, "Template uses {{tag}} more than once, not pruning");
            return Ok(Vec::new());
        }

        let dir = if dir_template.is_empty() {
            self.output_root.clone()
        } else {
            resolve_under(&self.output_root, dir_template)?
        };

        let keep: BTreeSet<String> = indexed_tags
            .iter()
            .filter_map(|t| escape_component(t))
            .collect();

        let prune_err = |path: &Path, source: std::io::Error| HarvestError::TagIndexWriteFailed {
            tag: String::new(),
            path: path.to_path_buf(),
            source,
        };

        let read_dir = match std::fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(prune_err(&dir, e)),
        };

        let mut removed = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(|e| prune_err(&dir, e))?;
            let path = dir_entry.path();
            if !path.is_file() || protected.iter().any(|p| *p == path) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.len() <= prefix.len() + suffix.len()
                || !name.starts_with(prefix)
                || !name.ends_with(suffix)
            {
                continue;
            }

            let stem = &name[prefix.len()..name.len() - suffix.len()];
            if !keep.contains(stem) {
                std::fs::remove_file(&path).map_err(|e| prune_err(&path, e))?;
                info!(path = %path.display(), "Pruned stale tag index");
                removed.push(path);
            }
        }

        removed.sort();
        Ok(removed)
    }
}

// ============================================================================
// Tests
// ============================================================================
