//! Deletion accounting
//!
//! Every deletion any component schedules goes through [`Deleter`], which
//! classifies the path, keeps running counters, and applies the dry-run /
//! soft-delete / delete policy. Dry run is the default: nothing reaches the
//! driver unless `delete` is set.

use crate::error::Result;
use crate::storage::{human_bytes, SharedStorage};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter snapshot of everything scheduled for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteSummary {
    /// `link` files.
    pub links: u64,
    /// Blob `data` files.
    pub blobs: u64,
    /// Anything else.
    pub other: u64,
    /// Total reported bytes.
    pub bytes: u64,
}

/// Funnel for all deletions, with accounting.
pub struct Deleter {
    storage: SharedStorage,
    delete: bool,
    soft_delete: bool,

    links: AtomicU64,
    blobs: AtomicU64,
    other: AtomicU64,
    bytes: AtomicU64,
}

impl Deleter {
    pub fn new(storage: SharedStorage, delete: bool, soft_delete: bool) -> Self {
        Self {
            storage,
            delete,
            soft_delete,
            links: AtomicU64::new(0),
            blobs: AtomicU64::new(0),
            other: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Schedule one file for deletion, reporting its best-effort size.
    ///
    /// With `delete` unset this only counts. With `soft_delete` set the file
    /// is moved under the storage backup area instead of removed.
    pub async fn delete_file(&self, path: &str, size: u64) -> Result<()> {
        tracing::info!("DELETE {path} {size}");

        let name = path.rsplit('/').next().unwrap_or(path);
        if name == "link" {
            self.links.fetch_add(1, Ordering::Relaxed);
        } else if name == "data" {
            self.blobs.fetch_add(1, Ordering::Relaxed);
        } else {
            self.other.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes.fetch_add(size, Ordering::Relaxed);

        if !self.delete {
            // Dry run: account only.
            return Ok(());
        }

        if self.soft_delete {
            return self.storage.move_to(path, &format!("backup/{path}")).await;
        }

        self.storage.delete(path).await
    }

    pub fn summary(&self) -> DeleteSummary {
        DeleteSummary {
            links: self.links.load(Ordering::Relaxed),
            blobs: self.blobs.load(Ordering::Relaxed),
            other: self.other.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }

    /// Log the deletion totals.
    pub fn info(&self) {
        let summary = self.summary();
        tracing::warn!(
            "DELETEABLE INFO: {} links, {} blobs, {} other, {}",
            summary.links,
            summary.blobs,
            summary.other,
            human_bytes(summary.bytes),
        );
    }
}
