//! Collection engine
//!
//! Orchestrates a full pass: walk blobs and repositories in parallel, mark
//! everything reachable from tags, sweep dead repository links, sweep dead
//! blobs, then report. Ingestion strictly precedes mark, mark strictly
//! precedes sweep; inside each phase work fans out over the job pools.

use crate::error::Result;
use crate::jobs::JobPool;
use crate::registry::blobs::BlobIndex;
use crate::registry::manifest::ManifestCache;
use crate::registry::repository::RepositorySet;
use crate::registry::GcOptions;
use crate::storage::{DeleteSummary, Deleter, SharedStorage};
use std::sync::Arc;

/// A single offline garbage collection run over one storage backend.
pub struct Engine {
    storage: SharedStorage,
    options: Arc<GcOptions>,
    jobs: JobPool,
    walk_jobs: JobPool,
    blobs: Arc<BlobIndex>,
    repositories: Arc<RepositorySet>,
    manifests: Arc<ManifestCache>,
    deleter: Arc<Deleter>,
}

impl Engine {
    /// Set up pools and empty state. Must be called from within a tokio
    /// runtime.
    pub fn new(storage: SharedStorage, options: GcOptions) -> Self {
        let options = Arc::new(options);
        let jobs = JobPool::new(options.jobs);
        let walk_jobs = JobPool::new(options.parallel_walk_jobs);
        let blobs = Arc::new(BlobIndex::new(Arc::clone(&storage), Arc::clone(&options)));
        let repositories = Arc::new(RepositorySet::new(
            Arc::clone(&storage),
            Arc::clone(&options),
        ));
        let manifests = Arc::new(ManifestCache::new());
        let deleter = Arc::new(Deleter::new(
            Arc::clone(&storage),
            options.delete,
            options.soft_delete,
        ));

        Self {
            storage,
            options,
            jobs,
            walk_jobs,
            blobs,
            repositories,
            manifests,
            deleter,
        }
    }

    /// Handle to the deletion accounting, e.g. for a signal handler that
    /// wants to dump counters on interrupt.
    pub fn deleter(&self) -> Arc<Deleter> {
        Arc::clone(&self.deleter)
    }

    /// Run all phases and return the deletion totals.
    pub async fn run(&self) -> Result<DeleteSummary> {
        if self.options.ignore_blobs {
            self.repositories
                .walk(
                    &self.jobs,
                    &self.walk_jobs,
                    self.options.parallel_repository_walk,
                )
                .await?;
        } else {
            tokio::try_join!(
                self.repositories.walk(
                    &self.jobs,
                    &self.walk_jobs,
                    self.options.parallel_repository_walk,
                ),
                self.blobs
                    .walk(&self.walk_jobs, self.options.parallel_blob_walk),
            )?;
        }

        tracing::info!("Marking REPOSITORIES...");
        self.repositories
            .mark(&self.jobs, &self.blobs, &self.manifests)
            .await?;

        tracing::info!("Sweeping REPOSITORIES...");
        self.repositories.sweep(&self.jobs, &self.deleter).await?;

        if !self.options.ignore_blobs {
            tracing::info!("Sweeping BLOBS...");
            self.blobs.sweep(&self.jobs, &self.deleter).await?;
        }

        self.repositories
            .info(&self.blobs, self.options.repository_csv_output.as_deref())?;
        self.blobs.info();
        self.deleter.info();
        self.storage.info();

        Ok(self.deleter.summary())
    }
}
