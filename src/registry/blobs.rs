//! Blob index
//!
//! Every file discovered under `blobs/` lands here, keyed by digest. The
//! mark phase increments per-blob reference counters through
//! [`BlobIndex::mark`]; the sweep deletes every blob whose counter stayed
//! at zero.

use crate::digest::Digest;
use crate::error::{Result, ScourError};
use crate::jobs::JobPool;
use crate::registry::GcOptions;
use crate::storage::{human_bytes, parallel_walk, Deleter, FileInfo, SharedStorage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
struct Blob {
    size: u64,
    etag: String,
    references: u64,
}

/// In-memory index of the blob store.
pub struct BlobIndex {
    storage: SharedStorage,
    options: Arc<GcOptions>,
    blobs: Mutex<HashMap<Digest, Blob>>,
}

impl BlobIndex {
    pub fn new(storage: SharedStorage, options: Arc<GcOptions>) -> Self {
        Self {
            storage,
            options,
            blobs: Mutex::new(HashMap::new()),
        }
    }

    fn locked(&self) -> Result<MutexGuard<'_, HashMap<Digest, Blob>>> {
        self.blobs
            .lock()
            .map_err(|_| ScourError::Lock("Failed to acquire blob index lock".to_string()))
    }

    /// Storage path of a blob's data file.
    pub fn data_path(digest: Digest) -> String {
        format!("blobs/{}/data", digest.scoped_path())
    }

    /// Record one blob discovered during the walk. `segments` is the path
    /// relative to `blobs/`: `[sha256, <2 hex>, <64 hex>, data]`.
    pub fn add_blob(&self, segments: &[&str], info: &FileInfo) -> Result<()> {
        if segments.len() != 4 {
            return Err(ScourError::UnparseablePath(format!(
                "blob path should have four components: {segments:?}"
            )));
        }

        if segments[3] != "data" {
            return Err(ScourError::UnparseablePath(format!(
                "blob file needs to be data: {segments:?}"
            )));
        }

        let digest = Digest::from_scoped_path(&segments[0..3])?;

        let mut blobs = self.locked()?;
        blobs.insert(
            digest,
            Blob {
                size: info.size,
                etag: info.etag.clone(),
                references: 0,
            },
        );
        Ok(())
    }

    /// Atomically increment a blob's reference counter.
    ///
    /// With `ignore_blobs` set the index is empty and this is a successful
    /// no-op, which downgrades the mark phase to a link-walk sanity check:
    /// dangling references are no longer detected.
    pub fn mark(&self, digest: Digest) -> Result<()> {
        if self.options.ignore_blobs {
            return Ok(());
        }

        let mut blobs = self.locked()?;
        match blobs.get_mut(&digest) {
            Some(blob) => {
                blob.references += 1;
                Ok(())
            }
            None => Err(ScourError::BlobNotFound(digest.to_string())),
        }
    }

    /// Advertised ETag for a blob, empty when unknown.
    pub fn etag(&self, digest: Digest) -> String {
        self.blobs
            .lock()
            .ok()
            .and_then(|blobs| blobs.get(&digest).map(|blob| blob.etag.clone()))
            .unwrap_or_default()
    }

    /// Recorded size for a blob, zero when unknown.
    pub fn size(&self, digest: Digest) -> u64 {
        self.blobs
            .lock()
            .ok()
            .and_then(|blobs| blobs.get(&digest).map(|blob| blob.size))
            .unwrap_or_default()
    }

    /// Fetch a blob's bytes, letting the read cache shortcut on the ETag.
    pub async fn read_blob(&self, digest: Digest) -> Result<Vec<u8>> {
        self.storage
            .read(&Self::data_path(digest), &self.etag(digest))
            .await
    }

    async fn walk_path(&self, walk_path: &str) -> Result<()> {
        tracing::info!("BLOBS DIR: {walk_path}");
        self.storage
            .walk(walk_path, "blobs", &|path, info| {
                let segments: Vec<&str> = path.split('/').collect();
                if let Err(err) = self.add_blob(&segments, info) {
                    tracing::error!("BLOB: {path}: {err}");
                    if !self.options.soft_errors {
                        return Err(err);
                    }
                }
                Ok(())
            })
            .await
    }

    /// Ingest the blob tree, optionally fanning out over the
    /// `sha256/<NN>` buckets on the walk pool.
    pub async fn walk(self: &Arc<Self>, walk_pool: &JobPool, parallel: bool) -> Result<()> {
        tracing::info!("Walking BLOBS...");

        if parallel {
            let index = Arc::clone(self);
            return parallel_walk(&self.storage, walk_pool, "blobs/sha256", move |walk_path| {
                let index = Arc::clone(&index);
                async move { index.walk_path(&walk_path).await }
            })
            .await;
        }

        self.walk_path("blobs").await
    }

    /// Delete every blob whose reference counter is zero.
    pub async fn sweep(&self, pool: &JobPool, deleter: &Arc<Deleter>) -> Result<()> {
        let dead: Vec<(Digest, u64)> = {
            let blobs = self.locked()?;
            blobs
                .iter()
                .filter(|(_, blob)| blob.references == 0)
                .map(|(digest, blob)| (*digest, blob.size))
                .collect()
        };

        let group = pool.group();
        for (digest, size) in dead {
            let deleter = Arc::clone(deleter);
            group.dispatch(async move {
                deleter
                    .delete_file(&BlobIndex::data_path(digest), size)
                    .await
            });
        }

        group.finish().await
    }

    /// Log used/unused object and byte totals.
    pub fn info(&self) {
        if self.options.ignore_blobs {
            return;
        }

        let mut used = 0u64;
        let mut unused = 0u64;
        let mut used_size = 0u64;
        let mut unused_size = 0u64;

        if let Ok(blobs) = self.blobs.lock() {
            for blob in blobs.values() {
                if blob.references > 0 {
                    used += 1;
                    used_size += blob.size;
                } else {
                    unused += 1;
                    unused_size += blob.size;
                }
            }
        }

        tracing::info!(
            "BLOBS INFO: Objects/Unused: {used}/{unused} Data/Unused: {}/{}",
            human_bytes(used_size),
            human_bytes(unused_size),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FilesystemStorage;
    use tempfile::tempdir;

    const HEX: &str = "abababababababababababababababababababababababababababababababab";

    fn index(options: GcOptions) -> BlobIndex {
        let temp = tempdir().unwrap();
        let storage: SharedStorage = Arc::new(FilesystemStorage::new(temp.path()));
        BlobIndex::new(storage, Arc::new(options))
    }

    fn info_of_size(size: u64) -> FileInfo {
        FileInfo {
            size,
            ..FileInfo::default()
        }
    }

    #[test]
    fn test_add_blob_and_mark() {
        let index = index(GcOptions::default());
        index
            .add_blob(&["sha256", "ab", HEX, "data"], &info_of_size(10))
            .unwrap();

        let digest = Digest::from_path(&["sha256", HEX]).unwrap();
        assert_eq!(index.size(digest), 10);
        index.mark(digest).unwrap();
        index.mark(digest).unwrap();
    }

    #[test]
    fn test_add_blob_rejects_malformed_paths() {
        let index = index(GcOptions::default());
        let info = info_of_size(0);

        assert!(index.add_blob(&["sha256", "ab", HEX], &info).is_err());
        assert!(index
            .add_blob(&["sha256", "ab", HEX, "link"], &info)
            .is_err());
        assert!(index
            .add_blob(&["sha256", "cd", HEX, "data"], &info)
            .is_err());
        assert!(index
            .add_blob(&["sha512", "ab", HEX, "data"], &info)
            .is_err());
    }

    #[test]
    fn test_mark_unknown_blob_fails() {
        let index = index(GcOptions::default());
        let digest = Digest::from_path(&["sha256", HEX]).unwrap();
        let err = index.mark(digest).unwrap_err();
        assert!(matches!(err, ScourError::BlobNotFound(_)));
    }

    #[test]
    fn test_ignore_blobs_downgrades_mark() {
        let index = index(GcOptions {
            ignore_blobs: true,
            ..GcOptions::default()
        });
        let digest = Digest::from_path(&["sha256", HEX]).unwrap();
        index.mark(digest).unwrap();
    }

    #[test]
    fn test_data_path() {
        let digest = Digest::from_path(&["sha256", HEX]).unwrap();
        assert_eq!(
            BlobIndex::data_path(digest),
            format!("blobs/sha256/ab/{HEX}/data")
        );
    }
}
