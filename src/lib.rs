pub mod config;
pub mod executor;
pub mod harvest;
pub mod model;
pub mod traits;

// Re-export common types for convenience
pub use config::*;
pub use executor::*;
pub use harvest::{
    HarvestError, HarvestPipeline, ManifestError, RegistryStore, RunSummary, SourceSyncer,
    TagIndexBuilder, TagMap,
};
pub use model::*;
pub use traits::*;
