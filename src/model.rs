use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Registry document type written into fresh harvest indexes.
pub const REGISTRY_TYPE: &str = "harvester-v1";

/// Artifact name assumed when a manifest does not declare one.
pub const DEFAULT_OUTPUT_ARTIFACT: &str = "package.potato";

pub const DEFAULT_ARTIFACT_PATH_TEMPLATE: &str = "/potatoes/{slug}/{slug}-{version}.potato";
pub const DEFAULT_TAG_INDEX_PATH_TEMPLATE: &str = "/tags/{tag}.json";

/// Tags every fresh registry starts out indexing.
pub const DEFAULT_INDEXED_TAGS: &[&str] = &["official"];

/// A validated package manifest.
///
/// Produced once at the parse boundary (see [`crate::harvest::formats`]);
/// `slug` and `version` are guaranteed non-empty, every other field carries
/// its documented default when the manifest omitted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRecord {
    pub slug: String,
    pub version: String,
    pub name: String,
    pub info: String,
    pub license: String,
    pub author_name: String,
    pub author_email: String,
    pub author_site: String,
    pub tags: BTreeSet<String>,
    /// File name the build tool is expected to produce
    /// (default: [`DEFAULT_OUTPUT_ARTIFACT`])
    pub declared_output_artifact: String,
}

impl ManifestRecord {
    /// Creates a record with only the required fields set.
    pub fn new(slug: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            version: version.into(),
            name: String::new(),
            info: String::new(),
            license: String::new(),
            author_name: String::new(),
            author_email: String::new(),
            author_site: String::new(),
            tags: BTreeSet::new(),
            declared_output_artifact: DEFAULT_OUTPUT_ARTIFACT.to_string(),
        }
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// How descriptive fields of an existing entry react to a newer manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// First non-empty value wins; later manifests only fill gaps.
    #[default]
    FillIfEmpty,
    /// Non-empty values from the latest manifest replace stored ones.
    RefreshFromLatest,
}

/// One package in the harvest index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub slug: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub info: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub author_email: String,
    #[serde(default)]
    pub author_site: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub current_version: String,
    /// Every version ever harvested, in harvest order. Append-only.
    #[serde(default)]
    pub versions: Vec<String>,
    /// Harvest-tree path of the most recently placed artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

impl PackageEntry {
    /// Creates a fresh entry whose only version is `version`.
    pub fn from_manifest(manifest: &ManifestRecord, version: &str) -> Self {
        Self {
            slug: manifest.slug.clone(),
            name: manifest.name.clone(),
            info: manifest.info.clone(),
            tags: manifest.tags.clone(),
            author_name: manifest.author_name.clone(),
            author_email: manifest.author_email.clone(),
            author_site: manifest.author_site.clone(),
            license: manifest.license.clone(),
            current_version: version.to_string(),
            versions: vec![version.to_string()],
            artifact: None,
        }
    }

    pub fn has_version(&self, version: &str) -> bool {
        self.versions.iter().any(|v| v == version)
    }

    /// Appends `version` if unseen and makes it current.
    ///
    /// Returns `true` if the version was new.
    pub fn record_version(&mut self, version: &str) -> bool {
        let added = !self.has_version(version);
        if added {
            self.versions.push(version.to_string());
        }
        self.current_version = version.to_string();
        added
    }

    /// Applies the manifest's descriptive fields according to `policy`.
    pub fn merge_descriptive(&mut self, manifest: &ManifestRecord, policy: MergePolicy) {
        merge_field(&mut self.name, &manifest.name, policy);
        merge_field(&mut self.info, &manifest.info, policy);
        merge_field(&mut self.license, &manifest.license, policy);
        merge_field(&mut self.author_name, &manifest.author_name, policy);
        merge_field(&mut self.author_email, &manifest.author_email, policy);
        merge_field(&mut self.author_site, &manifest.author_site, policy);

        let take_tags = match policy {
            MergePolicy::FillIfEmpty => self.tags.is_empty(),
            MergePolicy::RefreshFromLatest => !manifest.tags.is_empty(),
        };
        if take_tags {
            self.tags = manifest.tags.clone();
        }
    }

    /// Restores the version invariants on an entry read from disk:
    /// no duplicate versions and `current_version` among them.
    ///
    /// Returns `true` if anything had to change.
    pub(crate) fn repair_versions(&mut self) -> bool {
        let before = self.versions.len();
        let mut seen = BTreeSet::new();
        self.versions.retain(|v| seen.insert(v.clone()));
        let mut changed = self.versions.len() != before;

        if !self.current_version.is_empty() && !self.has_version(&self.current_version) {
            self.versions.push(self.current_version.clone());
            changed = true;
        }
        if self.current_version.is_empty() {
            if let Some(last) = self.versions.last() {
                self.current_version = last.clone();
                changed = true;
            }
        }
        changed
    }
}

fn merge_field(slot: &mut String, incoming: &str, policy: MergePolicy) {
    if incoming.is_empty() {
        return;
    }
    let replace = match policy {
        MergePolicy::FillIfEmpty => slot.is_empty(),
        MergePolicy::RefreshFromLatest => slot != incoming,
    };
    if replace {
        *slot = incoming.to_string();
    }
}

/// The persisted harvest index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub info: String,
    #[serde(rename = "type", default = "default_registry_type")]
    pub kind: String,
    #[serde(default = "default_artifact_path_template")]
    pub artifact_path_template: String,
    /// Sorted, deduplicated union of all entry tags
    #[serde(default)]
    pub indexed_tags: Vec<String>,
    #[serde(default = "default_tag_index_path_template")]
    pub tag_index_path_template: String,
    #[serde(default)]
    pub potatoes: Vec<PackageEntry>,
}

impl Default for RegistryDocument {
    fn default() -> Self {
        Self {
            name: String::new(),
            info: String::new(),
            kind: default_registry_type(),
            artifact_path_template: default_artifact_path_template(),
            indexed_tags: DEFAULT_INDEXED_TAGS.iter().map(|t| t.to_string()).collect(),
            tag_index_path_template: default_tag_index_path_template(),
            potatoes: Vec::new(),
        }
    }
}

fn default_registry_type() -> String {
    REGISTRY_TYPE.to_string()
}

fn default_artifact_path_template() -> String {
    DEFAULT_ARTIFACT_PATH_TEMPLATE.to_string()
}

fn default_tag_index_path_template() -> String {
    DEFAULT_TAG_INDEX_PATH_TEMPLATE.to_string()
}

/// Per-tag listing written next to the registry.
#[derive(Debug, Serialize)]
pub struct TagIndexDocument<'a> {
    pub tag: &'a str,
    pub count: usize,
    pub potatoes: Vec<TagMember<'a>>,
}

impl<'a> TagIndexDocument<'a> {
    pub fn new(tag: &'a str, members: impl IntoIterator<Item = &'a PackageEntry>) -> Self {
        let potatoes: Vec<TagMember<'a>> = members.into_iter().map(TagMember::from).collect();
        Self {
            tag,
            count: potatoes.len(),
            potatoes,
        }
    }
}

/// A [`PackageEntry`] as it appears in tag documents: everything except the
/// harvest bookkeeping.
#[derive(Debug, Serialize)]
pub struct TagMember<'a> {
    pub slug: &'a str,
    pub name: &'a str,
    pub info: &'a str,
    pub tags: &'a BTreeSet<String>,
    pub author_name: &'a str,
    pub author_email: &'a str,
    pub author_site: &'a str,
    pub license: &'a str,
    pub current_version: &'a str,
    pub versions: &'a [String],
}

impl<'a> From<&'a PackageEntry> for TagMember<'a> {
    fn from(entry: &'a PackageEntry) -> Self {
        Self {
            slug: &entry.slug,
            name: &entry.name,
            info: &entry.info,
            tags: &entry.tags,
            author_name: &entry.author_name,
            author_email: &entry.author_email,
            author_site: &entry.author_site,
            license: &entry.license,
            current_version: &entry.current_version,
            versions: &entry.versions,
        }
    }
}
