//! Harvester configuration.
//!
//! Loaded from a single file whose format is picked by extension:
//! `.toml`, `.yaml`/`.yml` or `.json`. Every field has a default, so an
//! empty file is a valid configuration (with no sources).

use crate::model::{
    MergePolicy, RegistryDocument, DEFAULT_ARTIFACT_PATH_TEMPLATE, DEFAULT_TAG_INDEX_PATH_TEMPLATE,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {format} config at {path}: {message}")]
    Parse {
        path: PathBuf,
        format: &'static str,
        message: String,
    },

    #[error("Unsupported config format: {extension}")]
    UnsupportedFormat { extension: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvesterConfig {
    /// Root of the harvest tree. Artifacts, tag files and the registry
    /// all live beneath it.
    pub output_root: PathBuf,

    /// Registry file, relative to `output_root`
    pub registry_file: PathBuf,

    /// Checkout directory for remote sources
    pub work_dir: PathBuf,

    /// Settings applied only when the registry is created from scratch
    pub registry: RegistryDefaults,

    pub sources: Vec<SourceSpec>,

    pub build: BuildConfig,

    pub merge_policy: MergePolicy,

    /// Delete tag files whose tag no longer has members
    pub prune_stale_tags: bool,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("harvest"),
            registry_file: PathBuf::from("index.json"),
            work_dir: PathBuf::from("sources"),
            registry: RegistryDefaults::default(),
            sources: Vec::new(),
            build: BuildConfig::default(),
            merge_policy: MergePolicy::default(),
            prune_stale_tags: false,
        }
    }
}

impl HarvesterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let parse_err = |format: &'static str, message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            format,
            message,
        };

        match extension.as_str() {
            "toml" => toml::from_str(&content).map_err(|e| parse_err("TOML", e.to_string())),
            "yaml" | "yml" => {
                serde_yaml::from_str(&content).map_err(|e| parse_err("YAML", e.to_string()))
            }
            "json" => serde_json::from_str(&content).map_err(|e| parse_err("JSON", e.to_string())),
            _ => Err(ConfigError::UnsupportedFormat { extension }),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.output_root.join(&self.registry_file)
    }

    /// The document a first run starts from.
    pub fn fresh_registry(&self) -> RegistryDocument {
        RegistryDocument {
            name: self.registry.name.clone(),
            info: self.registry.info.clone(),
            artifact_path_template: self.registry.artifact_path_template.clone(),
            tag_index_path_template: self.registry.tag_index_path_template.clone(),
            ..RegistryDocument::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryDefaults {
    pub name: String,
    pub info: String,
    pub artifact_path_template: String,
    pub tag_index_path_template: String,
}

impl Default for RegistryDefaults {
    fn default() -> Self {
        Self {
            name: "Potato Harvest".to_string(),
            info: String::new(),
            artifact_path_template: DEFAULT_ARTIFACT_PATH_TEMPLATE.to_string(),
            tag_index_path_template: DEFAULT_TAG_INDEX_PATH_TEMPLATE.to_string(),
        }
    }
}

/// One source collection to harvest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Short name, also the checkout directory name under `work_dir`
    pub name: String,

    /// Git URL or local directory
    pub location: String,

    #[serde(default)]
    pub kind: SourceKind,

    /// Branch to check out (git only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl SourceSpec {
    pub fn local(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            kind: SourceKind::Local,
            branch: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Git,
    #[default]
    Local,
}

/// External build tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            program: "potato".to_string(),
            args: vec!["build".to_string()],
            timeout_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_toml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("harvester.toml");
        std::fs::write(
            &path,
            r#"
output_root = "out"
merge_policy = "refresh-from-latest"

[build]
program = "make"
args = ["dist"]

[[sources]]
name = "core"
location = "https://example.com/core.git"
kind = "git"
branch = "main"
"#,
        )
        .unwrap();

        let config = HarvesterConfig::load(&path).unwrap();
        assert_eq!(config.output_root, PathBuf::from("out"));
        assert_eq!(config.registry_path(), PathBuf::from("out/index.json"));
        assert_eq!(config.merge_policy, MergePolicy::RefreshFromLatest);
        assert_eq!(config.build.program, "make");
        assert_eq!(config.build.timeout_secs, 300);
        assert_eq!(config.sources[0].kind, SourceKind::Git);
        assert_eq!(config.sources[0].branch.as_deref(), Some("main"));
    }

    #[test]
    fn test_load_yaml_defaults_source_kind() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("harvester.yaml");
        std::fs::write(&path, "sources:\n  - name: local\n    location: ./pkgs\n").unwrap();

        let config = HarvesterConfig::load(&path).unwrap();
        assert_eq!(config.sources, vec![SourceSpec::local("local", "./pkgs")]);
        assert!(!config.prune_stale_tags);
    }

    #[test]
    fn test_unsupported_extension() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("harvester.ini");
        std::fs::write(&path, "").unwrap();

        assert!(matches!(
            HarvesterConfig::load(&path),
            Err(ConfigError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_fresh_registry_uses_configured_templates() {
        let mut config = HarvesterConfig::default();
        config.registry.tag_index_path_template = "/by-tag/{tag}.json".to_string();

        let doc = config.fresh_registry();
        assert_eq!(doc.tag_index_path_template, "/by-tag/{tag}.json");
        assert_eq!(doc.indexed_tags, vec!["official"]);
    }
}
