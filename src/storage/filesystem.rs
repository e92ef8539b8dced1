//! Local filesystem storage driver

use crate::error::{Result, ScourError};
use crate::storage::{FileInfo, Storage, WalkVisitor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use walkdir::WalkDir;

const V2_PREFIX: &str = "docker/registry/v2";
const BACKUP_PREFIX: &str = "docker_backup/registry/v2";

/// Registry tree on a local filesystem, rooted at the distribution
/// `rootdirectory`.
#[derive(Debug)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(V2_PREFIX).join(path)
    }

    fn backup_full_path(&self, path: &str) -> PathBuf {
        let relative = path.strip_prefix("backup/").unwrap_or(path);
        self.root.join(BACKUP_PREFIX).join(relative)
    }
}

#[async_trait]
impl Storage for FilesystemStorage {
    async fn walk(&self, path: &str, base: &str, visit: WalkVisitor<'_>) -> Result<()> {
        let root = self.full_path(path);
        let base_dir = self.full_path(base);

        let (tx, mut rx) = mpsc::channel::<(String, FileInfo)>(256);
        let walker = tokio::task::spawn_blocking(move || -> Result<()> {
            for entry in WalkDir::new(&root) {
                let entry =
                    entry.map_err(|err| ScourError::Storage(format!("walk {root:?}: {err}")))?;
                if !entry.file_type().is_file() {
                    continue;
                }

                let metadata = entry
                    .metadata()
                    .map_err(|err| ScourError::Storage(format!("walk {root:?}: {err}")))?;
                let relative = entry
                    .path()
                    .strip_prefix(&base_dir)
                    .unwrap_or_else(|_| entry.path())
                    .to_string_lossy()
                    .into_owned();
                let info = FileInfo {
                    full_path: entry.path().to_string_lossy().into_owned(),
                    size: metadata.len(),
                    etag: String::new(),
                    last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                    directory: false,
                };

                // The receiver hanging up means the visitor aborted.
                if tx.blocking_send((relative, info)).is_err() {
                    break;
                }
            }
            Ok(())
        });

        let mut visit_err = None;
        while let Some((relative, info)) = rx.recv().await {
            if let Err(err) = visit(&relative, &info) {
                visit_err = Some(err);
                break;
            }
        }
        drop(rx);

        let walked = walker
            .await
            .map_err(|err| ScourError::Task(err.to_string()))?;
        match visit_err {
            Some(err) => Err(err),
            None => walked,
        }
    }

    async fn list(&self, path: &str, visit: WalkVisitor<'_>) -> Result<()> {
        let dir = self.full_path(path);
        let mut entries = tokio::fs::read_dir(&dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let info = FileInfo {
                full_path: entry.path().to_string_lossy().into_owned(),
                size: if file_type.is_file() { metadata.len() } else { 0 },
                etag: String::new(),
                last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                directory: file_type.is_dir(),
            };
            visit(&name, &info)?;
        }

        Ok(())
    }

    async fn read(&self, path: &str, _etag: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.full_path(path)).await?)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        Ok(tokio::fs::remove_file(self.full_path(path)).await?)
    }

    async fn move_to(&self, path: &str, new_path: &str) -> Result<()> {
        let source = self.full_path(path);
        let destination = self.backup_full_path(new_path);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::rename(&source, &destination).await?)
    }

    fn info(&self) {
        tracing::info!("FS INFO: root: {}", self.root.display());
    }
}

/// Convenience for tests and local runs: the v2 tree under `root`.
pub fn registry_tree(root: &Path) -> PathBuf {
    root.join(V2_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn write_tree(root: &Path, files: &[(&str, &str)]) {
        for (path, contents) in files {
            let full = registry_tree(root).join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, contents).unwrap();
        }
    }

    #[tokio::test]
    async fn test_walk_reports_files_relative_to_base() {
        let temp = tempdir().unwrap();
        write_tree(
            temp.path(),
            &[
                ("blobs/sha256/ab/abcd/data", "payload"),
                ("blobs/sha256/cd/cdef/data", "x"),
            ],
        );

        let storage = FilesystemStorage::new(temp.path());
        let seen = Mutex::new(BTreeMap::new());
        storage
            .walk("blobs", "blobs", &|path, info| {
                seen.lock().unwrap().insert(path.to_string(), info.size);
                Ok(())
            })
            .await
            .unwrap();

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen["sha256/ab/abcd/data"], 7);
        assert_eq!(seen["sha256/cd/cdef/data"], 1);
    }

    #[tokio::test]
    async fn test_walk_visitor_error_aborts() {
        let temp = tempdir().unwrap();
        write_tree(
            temp.path(),
            &[
                ("blobs/sha256/ab/abcd/data", "payload"),
                ("blobs/sha256/cd/cdef/data", "x"),
            ],
        );

        let storage = FilesystemStorage::new(temp.path());
        let err = storage
            .walk("blobs", "blobs", &|_, _| {
                Err(ScourError::Storage("stop".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ScourError::Storage(_)));
    }

    #[tokio::test]
    async fn test_list_one_level() {
        let temp = tempdir().unwrap();
        write_tree(temp.path(), &[("blobs/sha256/ab/abcd/data", "payload")]);

        let storage = FilesystemStorage::new(temp.path());
        let entries = Mutex::new(Vec::new());
        storage
            .list("blobs/sha256", &|name, info| {
                entries
                    .lock()
                    .unwrap()
                    .push((name.to_string(), info.directory));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(entries.into_inner().unwrap(), vec![("ab".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_read_delete_move() {
        let temp = tempdir().unwrap();
        write_tree(
            temp.path(),
            &[
                ("repositories/acme/app/_layers/sha256/abcd/link", "sha256:abcd"),
                ("blobs/sha256/ab/abcd/data", "payload"),
            ],
        );

        let storage = FilesystemStorage::new(temp.path());
        let data = storage.read("blobs/sha256/ab/abcd/data", "").await.unwrap();
        assert_eq!(data, b"payload");

        storage
            .move_to(
                "blobs/sha256/ab/abcd/data",
                "backup/blobs/sha256/ab/abcd/data",
            )
            .await
            .unwrap();
        assert!(!registry_tree(temp.path()).join("blobs/sha256/ab/abcd/data").exists());
        assert!(temp
            .path()
            .join("docker_backup/registry/v2/blobs/sha256/ab/abcd/data")
            .exists());

        storage
            .delete("repositories/acme/app/_layers/sha256/abcd/link")
            .await
            .unwrap();
        assert!(!registry_tree(temp.path())
            .join("repositories/acme/app/_layers/sha256/abcd/link")
            .exists());
    }
}
