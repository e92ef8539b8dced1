//! Scour - an offline garbage collector for Docker-style registries
//!
//! Scour walks a content-addressed registry tree (local filesystem or an
//! S3-compatible bucket), builds the full cross-reference graph between
//! repositories, tags, manifests and blobs, and removes everything no
//! longer reachable:
//!
//! - Concurrent walks of the blob and repository trees
//! - Reference-counting mark phase resolving manifest content
//! - Concurrent sweep with dry-run, soft-delete and accounting
//! - Per-repository and per-store usage reports

pub mod digest;
pub mod error;
pub mod jobs;
pub mod registry;
pub mod storage;

pub use error::{Result, ScourError};
