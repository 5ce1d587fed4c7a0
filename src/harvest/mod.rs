//! Harvest module - registry maintenance and the run pipeline.
//!
//! - **Registry**: the durable harvest index via [`RegistryStore`]
//! - **Tags**: per-tag index documents via [`TagIndexBuilder`]
//! - **Pipeline**: one full sequential run via [`HarvestPipeline`]
//! - **Sources / formats**: default collaborators for checkout, discovery
//!   and manifest parsing
//! - **Errors**: manifest-scoped [`ManifestError`], run-fatal [`HarvestError`]

pub mod error;
pub mod formats;
pub mod io;
pub mod pipeline;
pub mod registry;
pub mod sources;
pub mod tags;

// Re-export commonly used types
pub use error::{HarvestError, ManifestError, UnsafePath};
pub use formats::{ManifestParsers, RawManifest, Scalar, MANIFEST_FILE_NAMES};
pub use pipeline::{HarvestPipeline, Harvested, RunSummary, FALLBACK_ARTIFACT_NAMES};
pub use registry::{RegistryStore, UpsertOutcome};
pub use sources::{discover_manifests, SourceSyncer};
pub use tags::{escape_component, resolve_under, TagIndexBuilder, TagMap};
