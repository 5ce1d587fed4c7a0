//! Potato harvester CLI
//!
//! Syncs the configured sources, builds new package versions and keeps the
//! harvest index and its tag files up to date.

use clap::{Parser, Subcommand};
use potato_harvester::{
    CommandBuilder, ConfigError, HarvestError, HarvestPipeline, HarvesterConfig, MergePolicy,
    RegistryStore, RunSummary, SourceSyncer,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Config file picked up from the current directory when `--config` is not given.
const DEFAULT_CONFIG: &str = "harvester.toml";

/// Potato harvester - build packages from sources and index them
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (.toml, .yaml, .yml or .json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sync sources, build new versions and update the index
    Run {
        /// Delete tag files for tags that no longer have members
        #[arg(long)]
        prune: bool,

        /// Let the latest manifest overwrite stored package metadata
        #[arg(long)]
        refresh: bool,
    },

    /// Regenerate tag files from the registry without building anything
    Reindex {
        /// Delete tag files for tags that no longer have members
        #[arg(long)]
        prune: bool,
    },

    /// List registry entries
    List {
        /// Only show entries carrying this tag
        #[arg(long)]
        tag: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Harvest(#[from] HarvestError),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<HarvesterConfig, ConfigError> {
    match path {
        Some(path) => HarvesterConfig::load(path),
        None if Path::new(DEFAULT_CONFIG).is_file() => {
            HarvesterConfig::load(Path::new(DEFAULT_CONFIG))
        }
        None => {
            tracing::debug!("No config file, using defaults");
            Ok(HarvesterConfig::default())
        }
    }
}

fn build_pipeline(config: &HarvesterConfig) -> HarvestPipeline<SourceSyncer, CommandBuilder> {
    HarvestPipeline::from_config(
        config,
        SourceSyncer::new(config.work_dir.clone()),
        CommandBuilder::from_config(&config.build),
    )
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { prune, refresh } => {
            let mut pipeline = build_pipeline(&config).with_prune(prune || config.prune_stale_tags);
            if refresh {
                pipeline = pipeline.with_merge_policy(MergePolicy::RefreshFromLatest);
            }
            let summary = pipeline.run(&config.sources).await?;
            print_summary(&summary);
        }
        Commands::Reindex { prune } => {
            let summary = build_pipeline(&config)
                .with_prune(prune || config.prune_stale_tags)
                .reindex()?;
            print_summary(&summary);
        }
        Commands::List { tag } => {
            let store = RegistryStore::load_or(config.registry_path(), config.fresh_registry())?;
            for entry in &store.document().potatoes {
                if tag.as_ref().is_some_and(|t| !entry.tags.contains(t)) {
                    continue;
                }
                println!(
                    "{:<24} {:<12} {} version(s)",
                    entry.slug,
                    entry.current_version,
                    entry.versions.len()
                );
            }
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "harvested {}, unchanged {}, skipped {} ({} manifests from {} sources, {} failed)",
        summary.harvested,
        summary.unchanged,
        summary.skipped,
        summary.manifests_seen,
        summary.sources_synced,
        summary.sources_failed,
    );
    println!(
        "{} tag files written, {} pruned",
        summary.tag_files_written, summary.tag_files_pruned
    );
    if summary.tags.is_empty() {
        println!("tags: (none)");
    } else {
        println!("tags: {}", summary.tags.join(", "));
    }
}
