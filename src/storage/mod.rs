//! Object store abstraction
//!
//! The collector talks to the registry's backing store through the
//! [`Storage`] trait. Two drivers are provided: a local filesystem tree and
//! an S3-compatible bucket with an ETag-keyed local read cache. Deletions
//! are funnelled through [`delete::Deleter`] so that dry-run, soft-delete
//! and accounting behave identically for every caller.

pub mod config;
pub mod delete;
pub mod filesystem;
pub mod s3;

use crate::error::Result;
use crate::jobs::JobPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use md5::{Digest as _, Md5};
use std::fmt;
use std::sync::Arc;

pub use config::{storage_from_config, DistributionConfig};
pub use delete::{DeleteSummary, Deleter};
pub use filesystem::FilesystemStorage;
pub use s3::S3Storage;

/// Metadata for one stored object, as reported by a driver.
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    /// Backend-absolute path of the object.
    pub full_path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Advertised ETag; empty when the backend does not provide one.
    pub etag: String,
    /// Last modification time, when known.
    pub last_modified: Option<DateTime<Utc>>,
    /// True for one-level listing entries that are directories.
    pub directory: bool,
}

/// Callback invoked per enumerated object.
///
/// Walk and list present paths relative to the requested base; an error
/// return aborts the enumeration.
pub type WalkVisitor<'a> = &'a (dyn Fn(&str, &FileInfo) -> Result<()> + Send + Sync);

/// The storage operations the collector core consumes.
///
/// All paths are relative to the registry's `docker/registry/v2/` root.
#[async_trait]
pub trait Storage: fmt::Debug + Send + Sync {
    /// Recursively enumerate every file under `path`, presenting each as a
    /// path relative to `base`.
    async fn walk(&self, path: &str, base: &str, visit: WalkVisitor<'_>) -> Result<()>;

    /// Enumerate one level under `path`: files and sub-directories.
    async fn list(&self, path: &str, visit: WalkVisitor<'_>) -> Result<()>;

    /// Fetch object bytes. A non-empty `etag` allows the driver to satisfy
    /// the read from a local cache whose contents hash to that ETag.
    async fn read(&self, path: &str, etag: &str) -> Result<Vec<u8>>;

    /// Remove one object.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Relocate one object into the backup area. `new_path` carries the
    /// `backup/` prefix the deleter requests; drivers resolve it under
    /// their backup root.
    async fn move_to(&self, path: &str, new_path: &str) -> Result<()>;

    /// Log driver counters (api calls, cache hits/misses).
    fn info(&self);
}

/// Shared handle to a storage driver.
pub type SharedStorage = Arc<dyn Storage>;

/// True when `etag` equals the quoted lowercase-hex MD5 of `data`.
pub(crate) fn compare_etag(data: &[u8], etag: &str) -> bool {
    let mut hasher = Md5::new();
    hasher.update(data);
    etag == format!("\"{}\"", hex::encode(hasher.finalize()))
}

/// Render a byte count the way the reports print it.
pub(crate) fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Fan a deep walk out over the one-level children of `root`.
///
/// `root` is listed once, and every child directory (the `sha256/<NN>`
/// buckets of a hash-scoped tree) is walked as its own job on the walk
/// pool. The walk pool must be distinct from the pool the per-file jobs go
/// to, otherwise child walks could starve their own parents.
pub async fn parallel_walk<F, Fut>(
    storage: &SharedStorage,
    walk_pool: &JobPool,
    root: &str,
    walk: F,
) -> Result<()>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let group = walk_pool.group();

    storage
        .list(root, &|entry, info| {
            if !info.directory {
                return Ok(());
            }
            let walk_path = format!("{root}/{}", entry.trim_end_matches('/'));
            group.dispatch(walk(walk_path));
            Ok(())
        })
        .await?;

    group.finish().await
}
