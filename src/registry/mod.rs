//! Registry garbage collection
//!
//! The in-memory model of a registry tree (blobs, repositories, manifests,
//! tags) and the concurrent mark-and-sweep engine over it.

pub mod blobs;
pub mod engine;
pub mod links;
pub mod manifest;
pub mod repository;
pub mod tag;

use std::path::PathBuf;

pub use blobs::BlobIndex;
pub use engine::Engine;
pub use manifest::ManifestCache;
pub use repository::{Repository, RepositorySet};
pub use tag::Tag;

/// Operator-facing collection options.
#[derive(Debug, Clone)]
pub struct GcOptions {
    /// General worker pool size.
    pub jobs: usize,
    /// Directory-walk worker pool size.
    pub parallel_walk_jobs: usize,
    /// Skip the blob walk and blob mark/sweep; mark degrades to a
    /// link-walk sanity check.
    pub ignore_blobs: bool,
    /// Demote per-file and per-step errors to warnings.
    pub soft_errors: bool,
    /// Actually delete; unset means dry run.
    pub delete: bool,
    /// When deleting, move into the backup area instead of removing.
    pub soft_delete: bool,
    /// Treat non-current tag versions as dead.
    pub delete_old_tag_versions: bool,
    /// Fan the repository walk out over hash buckets.
    pub parallel_repository_walk: bool,
    /// Fan the blob walk out over hash buckets.
    pub parallel_blob_walk: bool,
    /// Per-repository CSV report destination.
    pub repository_csv_output: Option<PathBuf>,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            jobs: 10,
            parallel_walk_jobs: 10,
            ignore_blobs: false,
            soft_errors: false,
            delete: false,
            soft_delete: true,
            delete_old_tag_versions: true,
            parallel_repository_walk: false,
            parallel_blob_walk: false,
            repository_csv_output: None,
        }
    }
}
