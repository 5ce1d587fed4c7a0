//! The durable harvest index.
//!
//! [`RegistryStore`] owns the [`RegistryDocument`] for the length of one
//! run: loaded once, mutated in memory, persisted once at the end.

use crate::harvest::error::HarvestError;
use crate::harvest::io::write_atomic;
use crate::model::{ManifestRecord, MergePolicy, PackageEntry, RegistryDocument};
use std::collections::{BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What [`RegistryStore::upsert`] did to the version history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First time this slug was seen
    Created,
    /// Existing slug, version appended
    NewVersion,
    /// Version was already recorded
    Unchanged,
}

pub struct RegistryStore {
    path: PathBuf,
    document: RegistryDocument,
    /// Slug -> index into `document.potatoes`. Entries are never removed,
    /// so positions stay valid for the store's lifetime.
    positions: HashMap<String, usize>,
    dirty: bool,
}

impl RegistryStore {
    /// Loads the registry at `path`, or a default document if the file does
    /// not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, HarvestError> {
        Self::load_or(path, RegistryDocument::default())
    }

    /// Like [`RegistryStore::load`], starting from `fresh` when the file is
    /// missing.
    ///
    /// # Errors
    ///
    /// [`HarvestError::CorruptRegistry`] if the file exists but does not
    /// decode as a registry, holds two entries for the same slug, or has an
    /// entry without any version.
    pub fn load_or(path: impl Into<PathBuf>, fresh: RegistryDocument) -> Result<Self, HarvestError> {
        let path = path.into();

        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "No registry found, starting a fresh one");
                return Self::from_document(path, fresh, true);
            }
            Err(source) => return Err(HarvestError::RegistryRead { path, source }),
        };

        let document: RegistryDocument =
            serde_json::from_slice(&content).map_err(|e| HarvestError::CorruptRegistry {
                path: path.clone(),
                message: e.to_string(),
            })?;

        let store = Self::from_document(path, document, false)?;
        info!(
            path = %store.path.display(),
            potatoes = store.document.potatoes.len(),
            "Loaded registry"
        );
        Ok(store)
    }

    fn from_document(
        path: PathBuf,
        mut document: RegistryDocument,
        dirty: bool,
    ) -> Result<Self, HarvestError> {
        let mut positions = HashMap::with_capacity(document.potatoes.len());
        let mut repaired = false;

        for (i, entry) in document.potatoes.iter_mut().enumerate() {
            if entry.slug.trim().is_empty() {
                return Err(HarvestError::CorruptRegistry {
                    path,
                    message: format!("entry #{} has an empty slug", i),
                });
            }
            if positions.insert(entry.slug.clone(), i).is_some() {
                return Err(HarvestError::CorruptRegistry {
                    path,
                    message: format!("duplicate entry for slug `{}`", entry.slug),
                });
            }
            if entry.repair_versions() {
                warn!(slug = %entry.slug, "Repaired inconsistent version history");
                repaired = true;
            }
            if entry.versions.is_empty() {
                return Err(HarvestError::CorruptRegistry {
                    path,
                    message: format!("entry `{}` has no versions", entry.slug),
                });
            }
        }

        Ok(Self {
            path,
            document,
            positions,
            dirty: dirty || repaired,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &RegistryDocument {
        &self.document
    }

    /// Whether the in-memory document differs from what is on disk.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Exact-match lookup by slug. O(1) through the position map.
    pub fn find_entry(&self, slug: &str) -> Option<&PackageEntry> {
        self.positions
            .get(slug)
            .map(|&i| &self.document.potatoes[i])
    }

    pub fn has_version(&self, slug: &str, version: &str) -> bool {
        self.find_entry(slug)
            .map(|entry| entry.has_version(version))
            .unwrap_or(false)
    }

    /// Records `version` of `manifest.slug`.
    ///
    /// New slugs get a fresh entry. For known slugs the version is appended
    /// if unseen, becomes `current_version`, and descriptive fields are
    /// merged under `policy`. Repeating the same call changes nothing.
    pub fn upsert(
        &mut self,
        manifest: &ManifestRecord,
        version: &str,
        policy: MergePolicy,
    ) -> UpsertOutcome {
        let existing = self.positions.get(&manifest.slug).copied();
        let Some(i) = existing else {
            self.positions
                .insert(manifest.slug.clone(), self.document.potatoes.len());
            self.document
                .potatoes
                .push(PackageEntry::from_manifest(manifest, version));
            self.dirty = true;
            debug!(slug = %manifest.slug, version, "Created registry entry");
            return UpsertOutcome::Created;
        };

        let entry = &mut self.document.potatoes[i];
        let before = entry.clone();
        let added = entry.record_version(version);
        entry.merge_descriptive(manifest, policy);
        if *entry != before {
            self.dirty = true;
        }

        if added {
            debug!(slug = %manifest.slug, version, "Appended version");
            UpsertOutcome::NewVersion
        } else {
            UpsertOutcome::Unchanged
        }
    }

    /// Records where the latest artifact of `slug` was placed.
    pub fn set_artifact(&mut self, slug: &str, artifact: String) {
        if let Some(&i) = self.positions.get(slug) {
            let entry = &mut self.document.potatoes[i];
            if entry.artifact.as_deref() != Some(artifact.as_str()) {
                entry.artifact = Some(artifact);
                self.dirty = true;
            }
        }
    }

    /// Sets `indexed_tags` to the sorted union of every entry's tags.
    ///
    /// Call once after all upserts of a run.
    pub fn recompute_indexed_tags(&mut self) -> &[String] {
        let tags: Vec<String> = self
            .document
            .potatoes
            .iter()
            .flat_map(|entry| entry.tags.iter())
            .filter(|tag| !tag.is_empty())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if tags != self.document.indexed_tags {
            self.document.indexed_tags = tags;
            self.dirty = true;
        }
        &self.document.indexed_tags
    }

    /// Writes the document atomically if it changed since loading.
    ///
    /// Returns `true` if the file was written.
    pub fn persist(&mut self) -> Result<bool, HarvestError> {
        if !self.dirty {
            debug!(path = %self.path.display(), "Registry unchanged, not writing");
            return Ok(false);
        }

        let mut content =
            serde_json::to_vec_pretty(&self.document).map_err(|source| HarvestError::Serialize {
                what: "registry".to_string(),
                source,
            })?;
        content.push(b'\n');

        write_atomic(&self.path, &content).map_err(|source| HarvestError::RegistryWrite {
            path: self.path.clone(),
            source,
        })?;

        self.dirty = false;
        info!(
            path = %self.path.display(),
            potatoes = self.document.potatoes.len(),
            "Registry persisted"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn calc(version: &str) -> ManifestRecord {
        let mut m = ManifestRecord::new("calc", version).with_tags(["official", "math"]);
        m.license = "MIT".to_string();
        m
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let store = RegistryStore::load(temp.path().join("index.json")).unwrap();

        assert_eq!(store.document(), &RegistryDocument::default());
        assert!(store.is_dirty());
    }

    #[test]
    fn test_load_corrupt_file_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("index.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result = RegistryStore::load(&path);
        assert!(matches!(result, Err(HarvestError::CorruptRegistry { .. })));
    }

    #[test]
    fn test_load_rejects_wrong_schema() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("index.json");
        std::fs::write(&path, r#"{"potatoes": "nope"}"#).unwrap();

        let result = RegistryStore::load(&path);
        assert!(matches!(result, Err(HarvestError::CorruptRegistry { .. })));
    }

    #[test]
    fn test_load_rejects_duplicate_slugs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("index.json");
        std::fs::write(
            &path,
            r#"{"potatoes": [
                {"slug": "calc", "current_version": "1", "versions": ["1"]},
                {"slug": "calc", "current_version": "2", "versions": ["2"]}
            ]}"#,
        )
        .unwrap();

        let result = RegistryStore::load(&path);
        assert!(matches!(result, Err(HarvestError::CorruptRegistry { .. })));
    }

    #[test]
    fn test_load_rejects_entry_without_versions() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("index.json");

        for body in [
            r#"{"potatoes": [{"slug": "x"}]}"#,
            r#"{"potatoes": [{"slug": "x", "current_version": "", "versions": []}]}"#,
        ] {
            std::fs::write(&path, body).unwrap();
            let result = RegistryStore::load(&path);
            assert!(
                matches!(result, Err(HarvestError::CorruptRegistry { .. })),
                "{} loaded",
                body
            );
        }

        // A current version alone is enough to rebuild the history
        std::fs::write(&path, r#"{"potatoes": [{"slug": "x", "current_version": "1"}]}"#)
            .unwrap();
        let store = RegistryStore::load(&path).unwrap();
        assert_eq!(store.find_entry("x").unwrap().versions, vec!["1"]);
        assert!(store.is_dirty());
    }

    #[test]
    fn test_upsert_creates_entry() {
        let temp = TempDir::new().unwrap();
        let mut store = RegistryStore::load(temp.path().join("index.json")).unwrap();

        let outcome = store.upsert(&calc("1.0.0"), "1.0.0", MergePolicy::FillIfEmpty);

        assert_eq!(outcome, UpsertOutcome::Created);
        let entry = store.find_entry("calc").unwrap();
        assert_eq!(entry.versions, vec!["1.0.0"]);
        assert_eq!(entry.current_version, "1.0.0");
        assert!(store.has_version("calc", "1.0.0"));
        assert!(!store.has_version("calc", "2.0.0"));
        assert!(store.find_entry("other").is_none());
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mut store = RegistryStore::load(temp.path().join("index.json")).unwrap();

        store.upsert(&calc("1.0.0"), "1.0.0", MergePolicy::FillIfEmpty);
        let snapshot = store.document().clone();
        let outcome = store.upsert(&calc("1.0.0"), "1.0.0", MergePolicy::FillIfEmpty);

        assert_eq!(outcome, UpsertOutcome::Unchanged);
        assert_eq!(store.document(), &snapshot);
    }

    #[test]
    fn test_upsert_appends_and_keeps_first_license() {
        let temp = TempDir::new().unwrap();
        let mut store = RegistryStore::load(temp.path().join("index.json")).unwrap();
        store.upsert(&calc("1.0.0"), "1.0.0", MergePolicy::FillIfEmpty);

        let mut newer = calc("1.1.0");
        newer.license = "GPL".to_string();
        let outcome = store.upsert(&newer, "1.1.0", MergePolicy::FillIfEmpty);

        assert_eq!(outcome, UpsertOutcome::NewVersion);
        let entry = store.find_entry("calc").unwrap();
        assert_eq!(entry.versions, vec!["1.0.0", "1.1.0"]);
        assert_eq!(entry.current_version, "1.1.0");
        assert_eq!(entry.license, "MIT");
    }

    #[test]
    fn test_recompute_indexed_tags() {
        let temp = TempDir::new().unwrap();
        let mut store = RegistryStore::load(temp.path().join("index.json")).unwrap();
        store.upsert(&calc("1.0.0"), "1.0.0", MergePolicy::FillIfEmpty);
        store.upsert(
            &ManifestRecord::new("draw", "0.1").with_tags(["graphics", "official"]),
            "0.1",
            MergePolicy::FillIfEmpty,
        );

        let tags = store.recompute_indexed_tags().to_vec();
        assert_eq!(tags, vec!["graphics", "math", "official"]);
    }

    #[test]
    fn test_persist_round_trip_and_skip_when_clean() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out/index.json");
        let mut store = RegistryStore::load(&path).unwrap();
        store.upsert(&calc("1.0.0"), "1.0.0", MergePolicy::FillIfEmpty);
        store.recompute_indexed_tags();

        assert!(store.persist().unwrap());
        assert!(!store.persist().unwrap());

        let mut reloaded = RegistryStore::load(&path).unwrap();
        assert_eq!(reloaded.document(), store.document());
        assert!(!reloaded.is_dirty());

        reloaded.recompute_indexed_tags();
        assert!(!reloaded.persist().unwrap());
    }

    #[test]
    fn test_persisted_document_layout() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("index.json");
        let mut store = RegistryStore::load(&path).unwrap();
        store.upsert(&calc("1.0.0"), "1.0.0", MergePolicy::FillIfEmpty);
        store.persist().unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["type"], "harvester-v1");
        assert_eq!(json["potatoes"][0]["slug"], "calc");
        assert_eq!(json["potatoes"][0]["versions"][0], "1.0.0");
        assert!(json["tag_index_path_template"].is_string());
    }
}
