//! Scour - an offline garbage collector for Docker-style registries
//!
//! This is the CLI entry point for scour.

use clap::Parser;
use scour::error::Result;
use scour::registry::{Engine, GcOptions};
use scour::storage::storage_from_config;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Scour - offline registry garbage collector
#[derive(Parser)]
#[command(name = "scour")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "An offline garbage collector for Docker-style container image registries", long_about = None)]
struct Cli {
    /// Path to the registry config file
    #[arg(long)]
    config: PathBuf,

    /// Ignore blobs processing and recycling
    #[arg(long)]
    ignore_blobs: bool,

    /// Number of concurrent jobs to execute
    #[arg(long, default_value_t = 10)]
    jobs: usize,

    /// Number of concurrent parallel walk jobs to execute
    #[arg(long, default_value_t = 10)]
    parallel_walk_jobs: usize,

    /// Walk the repository tree with one job per hash bucket
    #[arg(long)]
    parallel_repository_walk: bool,

    /// Walk the blob tree with one job per hash bucket
    #[arg(long)]
    parallel_blob_walk: bool,

    /// Print errors, but do not fail
    #[arg(long)]
    soft_errors: bool,

    /// Delete data, instead of dry run
    #[arg(long)]
    delete: bool,

    /// When deleting, do not remove, but move to the backup area
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    soft_delete: bool,

    /// Delete old tag versions
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    delete_old_tag_versions: bool,

    /// File to which a CSV with per-repository metrics is written
    #[arg(long)]
    repository_csv_output: Option<PathBuf>,

    /// Local cache directory for S3 reads
    #[arg(long, default_value = "tmp-cache")]
    s3_cache: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

async fn run(cli: Cli) -> Result<()> {
    let storage = storage_from_config(&cli.config, Some(cli.s3_cache))?;

    let options = GcOptions {
        jobs: cli.jobs,
        parallel_walk_jobs: cli.parallel_walk_jobs,
        ignore_blobs: cli.ignore_blobs,
        soft_errors: cli.soft_errors,
        delete: cli.delete,
        soft_delete: cli.soft_delete,
        delete_old_tag_versions: cli.delete_old_tag_versions,
        parallel_repository_walk: cli.parallel_repository_walk,
        parallel_blob_walk: cli.parallel_blob_walk,
        repository_csv_output: cli.repository_csv_output,
    };

    let engine = Engine::new(Arc::clone(&storage), options);

    // An interrupt dumps the accounting so far and terminates; deletions
    // are idempotent, so no cleanup is needed.
    {
        let storage = Arc::clone(&storage);
        let deleter = engine.deleter();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                deleter.info();
                storage.info();
                std::process::exit(1);
            }
        });
    }

    engine.run().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run(cli).await {
        eprintln!("scour: {err}");
        std::process::exit(1);
    }
}
