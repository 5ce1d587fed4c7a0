//! Harvest pipeline executor.
//!
//! [`HarvestPipeline`] drives one full run, strictly sequentially:
//! for each source collection, for each discovered manifest:
//! validate → dedup check → build → locate artifact → place artifact →
//! registry upsert. A manifest that fails at any step is logged and
//! skipped; only registry corruption and tag-index I/O end the run.
//!
//! After the last manifest the registry's tag universe is recomputed, the
//! registry is persisted atomically and every tag document is regenerated.

use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{HarvesterConfig, SourceSpec};
use crate::harvest::error::{HarvestError, ManifestError};
use crate::harvest::formats::{is_package_relative, ManifestParsers};
use crate::harvest::registry::{RegistryStore, UpsertOutcome};
use crate::harvest::sources::discover_manifests;
use crate::harvest::tags::{escape_component, render_template, resolve_under, TagIndexBuilder, TagMap};
use crate::model::{ManifestRecord, MergePolicy, RegistryDocument};
use crate::traits::{PackageBuilder, SourceSync};

/// Artifact names tried after the declared one, package dir first, then the
/// working directory.
pub const FALLBACK_ARTIFACT_NAMES: &[&str] = &["package.potato", "dist/package.potato"];

// ============================================================================
// Pipeline Types
// ============================================================================

/// One manifest that made it all the way into the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Harvested {
    pub slug: String,
    pub version: String,
    pub outcome: UpsertOutcome,
    /// Where the artifact was copied to
    pub artifact: PathBuf,
}

/// Statistics about a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub sources_synced: usize,
    pub sources_failed: usize,
    pub manifests_seen: usize,
    /// Manifests built and recorded
    pub harvested: usize,
    /// Manifests whose version was already in the registry
    pub unchanged: usize,
    /// Manifests dropped because of an error
    pub skipped: usize,
    pub registry_written: bool,
    pub tag_files_written: usize,
    pub tag_files_pruned: usize,
    /// Final `indexed_tags`
    pub tags: Vec<String>,
    pub duration_ms: u64,
}

// ============================================================================
// Pipeline Executor
// ============================================================================

/// Harvest pipeline over a source syncer `S` and a package builder `B`.
///
/// # Example
///
/// ```ignore
/// use potato_harvester::{CommandBuilder, HarvestPipeline, SourceSyncer};
///
/// let pipeline = HarvestPipeline::new(
///     SourceSyncer::new("sources"),
///     CommandBuilder::new("potato", vec!["build".into()]),
///     "harvest",
/// );
/// let summary = pipeline.run(&sources).await?;
/// println!("harvested {} potatoes", summary.harvested);
/// ```
pub struct HarvestPipeline<S, B>
where
    S: SourceSync,
    B: PackageBuilder,
{
    sync: S,
    builder: B,
    parsers: ManifestParsers,
    output_root: PathBuf,
    registry_path: PathBuf,
    /// Document used when no registry exists yet
    fresh_registry: RegistryDocument,
    /// Second place artifacts are looked for
    working_dir: PathBuf,
    merge_policy: MergePolicy,
    prune_stale_tags: bool,
}

impl<S, B> HarvestPipeline<S, B>
where
    S: SourceSync,
    B: PackageBuilder,
{
    /// Creates a pipeline writing beneath `output_root`.
    ///
    /// Default configuration:
    /// - Registry: `<output_root>/index.json`
    /// - Working directory: the process's current directory
    /// - Merge policy: fill-if-empty
    /// - No pruning of stale tag files
    pub fn new(sync: S, builder: B, output_root: impl Into<PathBuf>) -> Self {
        let output_root = output_root.into();
        Self {
            sync,
            builder,
            parsers: ManifestParsers::default(),
            registry_path: output_root.join("index.json"),
            output_root,
            fresh_registry: RegistryDocument::default(),
            working_dir: PathBuf::from("."),
            merge_policy: MergePolicy::default(),
            prune_stale_tags: false,
        }
    }

    pub fn from_config(config: &HarvesterConfig, sync: S, builder: B) -> Self {
        Self::new(sync, builder, config.output_root.clone())
            .with_registry_path(config.registry_path())
            .with_fresh_registry(config.fresh_registry())
            .with_merge_policy(config.merge_policy)
            .with_prune(config.prune_stale_tags)
    }

    pub fn with_registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_path = path.into();
        self
    }

    pub fn with_fresh_registry(mut self, document: RegistryDocument) -> Self {
        self.fresh_registry = document;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_prune(mut self, prune: bool) -> Self {
        self.prune_stale_tags = prune;
        self
    }

    pub fn with_parsers(mut self, parsers: ManifestParsers) -> Self {
        self.parsers = parsers;
        self
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    /// Executes a full run over `sources`.
    ///
    /// # Errors
    ///
    /// Only fatal conditions surface: a corrupt or unreadable registry, a
    /// failed registry write, or a tag document that cannot be written.
    /// Per-manifest failures are logged and counted in the summary.
    pub async fn run(&self, sources: &[SourceSpec]) -> Result<RunSummary, HarvestError> {
        let start = Instant::now();
        let mut store = RegistryStore::load_or(&self.registry_path, self.fresh_registry.clone())?;
        let mut tag_map = TagMap::from_registry(store.document());
        let mut summary = RunSummary::default();

        for source in sources {
            info!(source = %source.name, location = %source.location, "Harvesting source");

            let dir = match self.sync.sync(source).await {
                Ok(dir) => {
                    summary.sources_synced += 1;
                    dir
                }
                Err(e) => {
                    warn!(source = %source.name, error = %e, "Source sync failed, skipping");
                    summary.sources_failed += 1;
                    continue;
                }
            };

            let manifests = discover_manifests(&dir);
            info!(source = %source.name, manifests = manifests.len(), "Discovered manifests");

            for path in manifests {
                summary.manifests_seen += 1;
                match self.process_manifest(&mut store, &mut tag_map, &path).await {
                    Ok(harvested) => {
                        summary.harvested += 1;
                        info!(
                            slug = %harvested.slug,
                            version = %harvested.version,
                            artifact = %harvested.artifact.display(),
                            "Harvested"
                        );
                    }
                    Err(e) if e.is_noop() => {
                        summary.unchanged += 1;
                        info!(path = %path.display(), "{}", e);
                    }
                    Err(e) => {
                        summary.skipped += 1;
                        warn!(path = %path.display(), error = %e, "Skipping manifest");
                    }
                }
            }
        }

        self.finish(store, &tag_map, summary, start)
    }

    /// Recomputes the tag universe and regenerates tag documents from the
    /// registry alone, without syncing or building anything.
    pub fn reindex(&self) -> Result<RunSummary, HarvestError> {
        let start = Instant::now();
        let store = RegistryStore::load_or(&self.registry_path, self.fresh_registry.clone())?;
        let tag_map = TagMap::from_registry(store.document());
        self.finish(store, &tag_map, RunSummary::default(), start)
    }

    fn finish(
        &self,
        mut store: RegistryStore,
        tag_map: &TagMap,
        mut summary: RunSummary,
        start: Instant,
    ) -> Result<RunSummary, HarvestError> {
        store.recompute_indexed_tags();
        summary.registry_written = store.persist()?;

        let document = store.document();
        let tag_builder = TagIndexBuilder::for_registry(&self.output_root, document);
        summary.tag_files_written = tag_builder.generate(document, tag_map)?.len();

        if self.prune_stale_tags {
            summary.tag_files_pruned = tag_builder
                .prune(&document.indexed_tags, &[store.path()])?
                .len();
        }

        summary.tags = document.indexed_tags.clone();
        summary.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            harvested = summary.harvested,
            unchanged = summary.unchanged,
            skipped = summary.skipped,
            duration_ms = summary.duration_ms,
            "Run completed"
        );
        info!(tags = ?summary.tags, "Discovered tags");
        Ok(summary)
    }

    /// Takes one manifest through every step, stopping at the first that
    /// fails.
    async fn process_manifest(
        &self,
        store: &mut RegistryStore,
        tag_map: &mut TagMap,
        manifest_path: &Path,
    ) -> Result<Harvested, ManifestError> {
        let manifest = self.parsers.parse_file(manifest_path)?;

        if store.has_version(&manifest.slug, &manifest.version) {
            return Err(ManifestError::DuplicateVersion {
                slug: manifest.slug,
                version: manifest.version,
            });
        }

        let package_dir = match manifest_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        debug!(slug = %manifest.slug, builder = self.builder.builder_name(), "Building");
        let status = self
            .builder
            .build(package_dir)
            .await
            .map_err(|source| ManifestError::Build {
                slug: manifest.slug.clone(),
                source,
            })?;
        if !status.is_success() {
            return Err(ManifestError::BuildFailed {
                slug: manifest.slug,
                status,
            });
        }

        let candidates = self.artifact_candidates(package_dir, &manifest.declared_output_artifact);
        let found = candidates.iter().find(|c| c.is_file()).cloned();
        let Some(source_artifact) = found else {
            return Err(ManifestError::ArtifactNotFound {
                slug: manifest.slug,
                searched: candidates,
            });
        };

        let (destination, rendered) =
            self.artifact_destination(&store.document().artifact_path_template, &manifest)?;
        place_artifact(&source_artifact, &destination).await?;

        let outcome = store.upsert(&manifest, &manifest.version, self.merge_policy);
        store.set_artifact(&manifest.slug, rendered);
        if let Some(entry) = store.find_entry(&manifest.slug) {
            tag_map.record(entry);
        }

        Ok(Harvested {
            slug: manifest.slug,
            version: manifest.version,
            outcome,
            artifact: destination,
        })
    }

    /// Where a build may have left its artifact, most specific first.
    ///
    /// A declared name that is absolute or climbs out with `..` is ignored.
    pub fn artifact_candidates(&self, package_dir: &Path, declared: &str) -> Vec<PathBuf> {
        let mut ordered = Vec::new();
        if is_package_relative(declared) {
            ordered.push(package_dir.join(declared));
            ordered.push(self.working_dir.join(declared));
        }
        ordered.extend(FALLBACK_ARTIFACT_NAMES.iter().map(|n| package_dir.join(n)));
        ordered.extend(FALLBACK_ARTIFACT_NAMES.iter().map(|n| self.working_dir.join(n)));

        let mut candidates: Vec<PathBuf> = Vec::with_capacity(ordered.len());
        for path in ordered {
            if !candidates.contains(&path) {
                candidates.push(path);
            }
        }
        candidates
    }

    /// Harvest-tree location for a manifest's artifact: a function of slug
    /// and version only.
    ///
    /// Returns the filesystem path and the rendered template recorded in the
    /// registry.
    pub fn artifact_destination(
        &self,
        template: &str,
        manifest: &ManifestRecord,
    ) -> Result<(PathBuf, String), ManifestError> {
        let escape = |value: &str| escape_component(value).unwrap_or_default();
        let slug = escape(&manifest.slug);
        let version = escape(&manifest.version);

        let rendered = render_template(template, &[("slug", &slug), ("version", &version)]);
        let destination = resolve_under(&self.output_root, &rendered)?;
        Ok((destination, rendered))
    }
}

async fn place_artifact(from: &Path, destination: &Path) -> Result<(), ManifestError> {
    let placement_err = |source: std::io::Error| ManifestError::Placement {
        path: destination.to_path_buf(),
        source,
    };

    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(placement_err)?;
    }
    tokio::fs::copy(from, destination)
        .await
        .map_err(placement_err)?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::formats::{RawManifest, Scalar};
    use crate::harvest::sources::SourceSyncer;
    use crate::traits::{BuildError, BuildStatus, ManifestFormat, ParseError};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    // Mock builder: drops `package.potato` into the package dir unless the
    // directory name is listed as failing.
    #[derive(Default)]
    struct MockBuilder {
        calls: AtomicUsize,
        failing: Vec<&'static str>,
        skip_artifact: Vec<&'static str>,
    }

    #[async_trait]
    impl PackageBuilder for MockBuilder {
        fn builder_name(&self) -> &str {
            "mock_builder"
        }

        async fn build(&self, package_dir: &Path) -> Result<BuildStatus, BuildError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let name = package_dir.file_name().unwrap().to_str().unwrap();
            if self.failing.contains(&name) {
                return Ok(BuildStatus::failed(Some(1)));
            }
            if !self.skip_artifact.contains(&name) {
                std::fs::write(package_dir.join("package.potato"), name).unwrap();
            }
            Ok(BuildStatus::success())
        }
    }

    struct Fixture {
        temp: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                temp: TempDir::new().unwrap(),
            }
        }

        fn packages(&self) -> PathBuf {
            self.temp.path().join("packages")
        }

        fn output(&self) -> PathBuf {
            self.temp.path().join("out")
        }

        fn manifest(&self, dir: &str, body: &str) {
            let dir = self.packages().join(dir);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("potato.yaml"), body).unwrap();
        }

        fn pipeline(&self, builder: MockBuilder) -> HarvestPipeline<SourceSyncer, MockBuilder> {
            HarvestPipeline::new(
                SourceSyncer::new(self.temp.path().join("work")),
                builder,
                self.output(),
            )
            .with_working_dir(self.temp.path().join("cwd"))
        }

        fn sources(&self) -> Vec<SourceSpec> {
            vec![SourceSpec::local("local", self.packages().to_string_lossy())]
        }
    }

    #[tokio::test]
    async fn test_harvests_new_package() {
        let fx = Fixture::new();
        fx.manifest("calc", "slug: calc\nversion: 1.0.0\ntags: [official, math]\n");
        let pipeline = fx.pipeline(MockBuilder::default());

        let summary = pipeline.run(&fx.sources()).await.unwrap();

        assert_eq!(summary.harvested, 1);
        assert_eq!(summary.tags, vec!["math", "official"]);
        assert_eq!(summary.tag_files_written, 2);
        assert!(summary.registry_written);
        assert!(fx.output().join("potatoes/calc/calc-1.0.0.potato").is_file());
        assert!(fx.output().join("tags/math.json").is_file());
    }

    #[tokio::test]
    async fn test_duplicate_version_skips_build() {
        let fx = Fixture::new();
        fx.manifest("calc", "slug: calc\nversion: 1.0.0\n");
        let pipeline = fx.pipeline(MockBuilder::default());

        pipeline.run(&fx.sources()).await.unwrap();
        let summary = pipeline.run(&fx.sources()).await.unwrap();

        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.harvested, 0);
        assert!(!summary.registry_written);
        assert_eq!(pipeline.builder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_run() {
        let fx = Fixture::new();
        fx.manifest("broken", "slug: broken\nversion: 1.0.0\n");
        fx.manifest("empty", "slug: empty\nversion: 1.0.0\n");
        fx.manifest("noversion", "slug: noversion\n");
        fx.manifest("ok", "slug: ok\nversion: 2.0.0\n");
        let pipeline = fx.pipeline(MockBuilder {
            failing: vec!["broken"],
            skip_artifact: vec!["empty"],
            ..MockBuilder::default()
        });

        let summary = pipeline.run(&fx.sources()).await.unwrap();

        assert_eq!(summary.manifests_seen, 4);
        assert_eq!(summary.harvested, 1);
        assert_eq!(summary.skipped, 3);

        let store = RegistryStore::load(pipeline.registry_path()).unwrap();
        assert!(store.find_entry("ok").is_some());
        assert!(store.find_entry("broken").is_none());
        assert!(store.find_entry("empty").is_none());
        // The invalid manifest never reached the builder
        assert_eq!(pipeline.builder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_source_is_skipped() {
        let fx = Fixture::new();
        fx.manifest("calc", "slug: calc\nversion: 1.0.0\n");
        let pipeline = fx.pipeline(MockBuilder::default());
        let mut sources = vec![SourceSpec::local("gone", "/definitely/not/here")];
        sources.extend(fx.sources());

        let summary = pipeline.run(&sources).await.unwrap();

        assert_eq!(summary.sources_failed, 1);
        assert_eq!(summary.sources_synced, 1);
        assert_eq!(summary.harvested, 1);
    }

    #[tokio::test]
    async fn test_corrupt_registry_is_fatal() {
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.output()).unwrap();
        std::fs::write(fx.output().join("index.json"), "garbage").unwrap();
        let pipeline = fx.pipeline(MockBuilder::default());

        let result = pipeline.run(&fx.sources()).await;
        assert!(matches!(result, Err(HarvestError::CorruptRegistry { .. })));
    }

    #[tokio::test]
    async fn test_declared_output_outside_package_is_skipped() {
        let fx = Fixture::new();
        let host_file = fx.temp.path().join("host_secret.txt");
        std::fs::write(&host_file, "secret").unwrap();
        fx.manifest(
            "evil",
            &format!(
                "slug: evil\nversion: 1.0.0\nbuild:\n  output: '{}'\n",
                host_file.display()
            ),
        );
        fx.manifest("calc", "slug: calc\nversion: 1.0.0\n");
        let pipeline = fx.pipeline(MockBuilder {
            skip_artifact: vec!["evil"],
            ..MockBuilder::default()
        });

        let summary = pipeline.run(&fx.sources()).await.unwrap();

        assert_eq!(summary.harvested, 1);
        assert_eq!(summary.skipped, 1);
        assert!(!fx.output().join("potatoes/evil").exists());
        let store = RegistryStore::load(pipeline.registry_path()).unwrap();
        assert!(store.find_entry("evil").is_none());
        // Rejected before the build step
        assert_eq!(pipeline.builder.calls.load(Ordering::SeqCst), 1);
    }

    // Flat `key=value` manifests, registered for `.json` files.
    struct KeyValueFormat;

    impl ManifestFormat for KeyValueFormat {
        fn format_id(&self) -> &str {
            "key-value"
        }

        fn can_parse(&self, path: &Path) -> bool {
            path.extension().is_some_and(|e| e == "json")
        }

        fn parse(&self, content: &[u8]) -> Result<RawManifest, ParseError> {
            let text = std::str::from_utf8(content)
                .map_err(|e| ParseError::InvalidContent(e.to_string()))?;
            let mut raw = RawManifest::default();
            for line in text.lines() {
                match line.split_once('=') {
                    Some(("slug", value)) => raw.slug = Some(value.to_string()),
                    Some(("version", value)) => raw.version = Some(Scalar::from(value)),
                    Some(("tags", value)) => {
                        raw.tags = Some(value.split(',').map(str::to_string).collect())
                    }
                    _ => {}
                }
            }
            Ok(raw)
        }
    }

    #[tokio::test]
    async fn test_custom_format_takes_precedence() {
        let fx = Fixture::new();
        let dir = fx.packages().join("calc");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("potato.json"), "slug=calc\nversion=1.0.0\ntags=math\n").unwrap();
        let pipeline = fx
            .pipeline(MockBuilder::default())
            .with_parsers(ManifestParsers::default().with_format(Box::new(KeyValueFormat)));

        let summary = pipeline.run(&fx.sources()).await.unwrap();

        assert_eq!(summary.harvested, 1);
        assert_eq!(summary.tags, vec!["math"]);
        assert!(fx.output().join("potatoes/calc/calc-1.0.0.potato").is_file());

        // Without the override the same file is not valid JSON
        let fx = Fixture::new();
        std::fs::create_dir_all(fx.packages().join("calc")).unwrap();
        std::fs::write(fx.packages().join("calc/potato.json"), "slug=calc\n").unwrap();
        let summary = fx.pipeline(MockBuilder::default()).run(&fx.sources()).await.unwrap();
        assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn test_artifact_candidates_order() {
        let pipeline = HarvestPipeline::new(
            SourceSyncer::new("work"),
            MockBuilder::default(),
            "out",
        )
        .with_working_dir("/cwd");

        let candidates = pipeline.artifact_candidates(Path::new("/pkg"), "custom.potato");
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/pkg/custom.potato"),
                PathBuf::from("/cwd/custom.potato"),
                PathBuf::from("/pkg/package.potato"),
                PathBuf::from("/pkg/dist/package.potato"),
                PathBuf::from("/cwd/package.potato"),
                PathBuf::from("/cwd/dist/package.potato"),
            ]
        );

        // Declared default collapses into the first fallback
        let candidates = pipeline.artifact_candidates(Path::new("/pkg"), "package.potato");
        assert_eq!(candidates.len(), 4);

        for declared in ["/etc/passwd", "../other.potato"] {
            let candidates = pipeline.artifact_candidates(Path::new("/pkg"), declared);
            assert_eq!(candidates.len(), 4);
            assert!(candidates.iter().all(|c| c.starts_with("/pkg") || c.starts_with("/cwd")));
            assert!(candidates.iter().all(|c| c.ends_with("package.potato")));
        }
    }

    #[test]
    fn test_artifact_destination_is_sandboxed() {
        let pipeline = HarvestPipeline::new(
            SourceSyncer::new("work"),
            MockBuilder::default(),
            "/out",
        );
        let manifest = ManifestRecord::new("../../etc", "1.0/../../x");

        let (path, rendered) = pipeline
            .artifact_destination("/potatoes/{slug}/{slug}-{version}.potato", &manifest)
            .unwrap();

        assert!(path.starts_with("/out/potatoes"));
        assert_eq!(path.components().count(), 5);
        assert!(rendered.starts_with("/potatoes/"));
    }
}
