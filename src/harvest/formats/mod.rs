//! Manifest formats.
//!
//! Each format decodes a manifest file into a [`RawManifest`], where every
//! field is optional. [`RawManifest::into_record`] is the single validation
//! point that turns it into a [`ManifestRecord`].

use crate::harvest::error::ManifestError;
use crate::model::{ManifestRecord, DEFAULT_OUTPUT_ARTIFACT};
use crate::traits::{ManifestFormat, ParseError};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeSet;
use std::path::{Component, Path};

/// File names recognized as package manifests.
pub const MANIFEST_FILE_NAMES: &[&str] =
    &["potato.yaml", "potato.yml", "potato.toml", "potato.json"];

/// A manifest as written on disk, before validation.
#[derive(Debug, Default, Deserialize)]
pub struct RawManifest {
    #[serde(default, deserialize_with = "scalar_string")]
    pub slug: Option<String>,
    /// Raw scalar; bare floats are rejected by [`RawManifest::into_record`].
    #[serde(default)]
    pub version: Option<Scalar>,
    #[serde(default, deserialize_with = "scalar_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    pub info: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    pub license: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    pub author_name: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    pub author_email: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    pub author_site: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub build: Option<BuildSection>,
}

/// A bare manifest value. Numbers and booleans are accepted where text is
/// expected (`version: 2`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    pub fn into_text(self) -> String {
        match self {
            Scalar::Str(s) => s,
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => format!("{:?}", f),
            Scalar::Bool(b) => b.to_string(),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Str(value.to_string())
    }
}

/// Optional `build:` table of a manifest.
#[derive(Debug, Default, Deserialize)]
pub struct BuildSection {
    #[serde(default)]
    pub output: Option<String>,
}

impl RawManifest {
    /// Validates required fields and applies defaults.
    ///
    /// # Errors
    ///
    /// [`ManifestError::InvalidManifest`] if `slug` or `version` is missing
    /// or blank, if `version` is an unquoted float (`1.10` would read back
    /// as `1.1`), or if `build.output` leaves the package directory.
    pub fn into_record(self, path: &Path) -> Result<ManifestRecord, ManifestError> {
        let invalid = |field: &'static str| ManifestError::InvalidManifest {
            path: path.to_path_buf(),
            field,
        };
        let required = |value: Option<String>, field: &'static str| {
            normalized(value).ok_or_else(|| invalid(field))
        };

        let slug = required(self.slug, "slug")?;
        let version = match self.version {
            Some(Scalar::Float(_)) => return Err(invalid("version")),
            other => required(other.map(Scalar::into_text), "version")?,
        };

        let tags: BTreeSet<String> = self
            .tags
            .unwrap_or_default()
            .into_iter()
            .filter_map(|t| normalized(Some(t)))
            .collect();

        let declared_output_artifact = match normalized(self.build.and_then(|b| b.output)) {
            Some(declared) if !is_package_relative(&declared) => {
                return Err(invalid("build.output"))
            }
            Some(declared) => declared,
            None => DEFAULT_OUTPUT_ARTIFACT.to_string(),
        };

        Ok(ManifestRecord {
            slug,
            version,
            name: normalized(self.name).unwrap_or_default(),
            info: normalized(self.info).unwrap_or_default(),
            license: normalized(self.license).unwrap_or_default(),
            author_name: normalized(self.author_name).unwrap_or_default(),
            author_email: normalized(self.author_email).unwrap_or_default(),
            author_site: normalized(self.author_site).unwrap_or_default(),
            tags,
            declared_output_artifact,
        })
    }
}

fn normalized(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// True when `declared` names something inside the directory it is joined to.
pub fn is_package_relative(declared: &str) -> bool {
    Path::new(declared)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Scalar>::deserialize(deserializer)?.map(Scalar::into_text))
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

fn utf8(content: &[u8]) -> Result<&str, ParseError> {
    std::str::from_utf8(content).map_err(|e| ParseError::InvalidContent(e.to_string()))
}

pub struct YamlFormat;

impl ManifestFormat for YamlFormat {
    fn format_id(&self) -> &str {
        "yaml"
    }

    fn can_parse(&self, path: &Path) -> bool {
        has_extension(path, &["yaml", "yml"])
    }

    fn parse(&self, content: &[u8]) -> Result<RawManifest, ParseError> {
        serde_yaml::from_slice(content).map_err(|e| ParseError::InvalidContent(e.to_string()))
    }
}

pub struct TomlFormat;

impl ManifestFormat for TomlFormat {
    fn format_id(&self) -> &str {
        "toml"
    }

    fn can_parse(&self, path: &Path) -> bool {
        has_extension(path, &["toml"])
    }

    fn parse(&self, content: &[u8]) -> Result<RawManifest, ParseError> {
        toml::from_str(utf8(content)?).map_err(|e| ParseError::InvalidContent(e.to_string()))
    }
}

pub struct JsonFormat;

impl ManifestFormat for JsonFormat {
    fn format_id(&self) -> &str {
        "json"
    }

    fn can_parse(&self, path: &Path) -> bool {
        has_extension(path, &["json"])
    }

    fn parse(&self, content: &[u8]) -> Result<RawManifest, ParseError> {
        serde_json::from_slice(content).map_err(|e| ParseError::InvalidContent(e.to_string()))
    }
}

/// The set of formats the pipeline tries, in order.
pub struct ManifestParsers {
    formats: Vec<Box<dyn ManifestFormat>>,
}

impl Default for ManifestParsers {
    fn default() -> Self {
        Self {
            formats: vec![
                Box::new(YamlFormat),
                Box::new(TomlFormat),
                Box::new(JsonFormat),
            ],
        }
    }
}

impl ManifestParsers {
    /// Registers a format ahead of the ones already present, so it wins for
    /// any file both can parse.
    pub fn with_format(mut self, format: Box<dyn ManifestFormat>) -> Self {
        self.formats.insert(0, format);
        self
    }

    /// Reads, decodes and validates one manifest file.
    pub fn parse_file(&self, path: &Path) -> Result<ManifestRecord, ManifestError> {
        let parse_err = |source: ParseError| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        };

        let format = self
            .formats
            .iter()
            .find(|f| f.can_parse(path))
            .ok_or_else(|| parse_err(ParseError::UnsupportedFormat(path.to_path_buf())))?;

        let content = std::fs::read(path).map_err(|e| parse_err(e.into()))?;
        let raw = format.parse(&content).map_err(parse_err)?;
        raw.into_record(path)
    }
}
