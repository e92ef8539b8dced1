//! S3-compatible storage driver
//!
//! Listing, reading, deleting and backup-moving against a bucket holding a
//! distribution registry tree. Reads of immutable objects are served from a
//! local cache directory when the cached bytes hash to the advertised ETag,
//! which avoids a GET per link/manifest on repeated runs.

use crate::error::{Result, ScourError};
use crate::storage::config::S3Settings;
use crate::storage::{compare_etag, FileInfo, Storage, WalkVisitor};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::Client;
use chrono::DateTime;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

const V2_PREFIX: &str = "docker/registry/v2";
const BACKUP_PREFIX: &str = "docker-backup/registry/v2";

/// Registry tree in an S3-compatible bucket.
#[derive(Debug)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    root_directory: String,
    cache_dir: Option<PathBuf>,

    api_calls: AtomicU64,
    expensive_api_calls: AtomicU64,
    free_api_calls: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_errors: AtomicU64,
}

impl S3Storage {
    /// Build a client from distribution config settings. `cache_dir` is the
    /// local ETag-keyed read cache; `None` disables caching.
    pub fn new(settings: &S3Settings, cache_dir: Option<PathBuf>) -> Result<Self> {
        let credentials = Credentials::new(
            settings.accesskey.clone(),
            settings.secretkey.clone(),
            None,
            None,
            "distribution-config",
        );

        let region = settings
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());
        let mut config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region));
        if let Some(endpoint) = &settings.regionendpoint {
            config = config.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(config.build()),
            bucket: settings.bucket.clone(),
            root_directory: settings.rootdirectory.trim_matches('/').to_string(),
            cache_dir,
            api_calls: AtomicU64::new(0),
            expensive_api_calls: AtomicU64::new(0),
            free_api_calls: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_errors: AtomicU64::new(0),
        })
    }

    fn full_path(&self, path: &str) -> String {
        if self.root_directory.is_empty() {
            format!("{V2_PREFIX}/{path}")
        } else {
            format!("{}/{V2_PREFIX}/{path}", self.root_directory)
        }
    }

    fn backup_path(&self, path: &str) -> String {
        let relative = path.strip_prefix("backup/").unwrap_or(path);
        if self.root_directory.is_empty() {
            format!("{BACKUP_PREFIX}/{relative}")
        } else {
            format!("{}/{BACKUP_PREFIX}/{relative}", self.root_directory)
        }
    }

    fn storage_err(context: &str, err: impl std::fmt::Display) -> ScourError {
        ScourError::Storage(format!("S3 {context}: {err}"))
    }

    fn object_info(object: &aws_sdk_s3::types::Object) -> FileInfo {
        FileInfo {
            full_path: object.key().unwrap_or_default().to_string(),
            size: object.size().unwrap_or(0).max(0) as u64,
            etag: object.e_tag().unwrap_or_default().to_string(),
            last_modified: object
                .last_modified()
                .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
            directory: false,
        }
    }
}

fn with_trailing_slash(path: String) -> String {
    if path.ends_with('/') {
        path
    } else {
        format!("{path}/")
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn walk(&self, path: &str, base: &str, visit: WalkVisitor<'_>) -> Result<()> {
        let prefix = with_trailing_slash(self.full_path(path));
        let base_dir = with_trailing_slash(self.full_path(base));
        let mut continuation: Option<String> = None;

        loop {
            self.api_calls.fetch_add(1, Ordering::Relaxed);
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|err| Self::storage_err("list", err))?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                if key.ends_with('/') {
                    continue;
                }
                let relative = key.strip_prefix(&base_dir).unwrap_or(key);
                if relative.is_empty() {
                    continue;
                }
                visit(relative, &Self::object_info(object))?;
            }

            if response.is_truncated().unwrap_or(false) {
                continuation = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(())
    }

    async fn list(&self, path: &str, visit: WalkVisitor<'_>) -> Result<()> {
        let prefix = with_trailing_slash(self.full_path(path));
        let mut continuation: Option<String> = None;

        loop {
            self.api_calls.fetch_add(1, Ordering::Relaxed);
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/");
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|err| Self::storage_err("list", err))?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                let relative = key.strip_prefix(&prefix).unwrap_or(key);
                if relative.is_empty() {
                    continue;
                }
                visit(relative, &Self::object_info(object))?;
            }

            for common_prefix in response.common_prefixes() {
                let Some(key) = common_prefix.prefix() else {
                    continue;
                };
                let relative = key.strip_prefix(&prefix).unwrap_or(key);
                if relative.is_empty() {
                    continue;
                }
                let info = FileInfo {
                    full_path: key.to_string(),
                    directory: true,
                    ..FileInfo::default()
                };
                visit(relative, &info)?;
            }

            if response.is_truncated().unwrap_or(false) {
                continuation = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(())
    }

    async fn read(&self, path: &str, etag: &str) -> Result<Vec<u8>> {
        let cache_path = self.cache_dir.as_ref().map(|dir| dir.join(path));

        if !etag.is_empty() {
            if let Some(cache_path) = &cache_path {
                match tokio::fs::read(cache_path).await {
                    Ok(data) => {
                        if compare_etag(&data, etag) {
                            self.cache_hits.fetch_add(1, Ordering::Relaxed);
                            return Ok(data);
                        }
                        self.cache_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        self.cache_misses.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("CACHE MISS: {path}");
                    }
                    Err(_) => {
                        self.cache_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        self.api_calls.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_path(path))
            .send()
            .await
            .map_err(|err| Self::storage_err("get", err))?;
        let data = response
            .body
            .collect()
            .await
            .map_err(|err| Self::storage_err("get body", err))?
            .into_bytes()
            .to_vec();

        if !etag.is_empty() {
            if let Some(cache_path) = &cache_path {
                if let Some(parent) = cache_path.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                let _ = tokio::fs::write(cache_path, &data).await;
            }
        }

        Ok(data)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.free_api_calls.fetch_add(1, Ordering::Relaxed);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_path(path))
            .send()
            .await
            .map_err(|err| Self::storage_err("delete", err))?;
        Ok(())
    }

    async fn move_to(&self, path: &str, new_path: &str) -> Result<()> {
        self.expensive_api_calls.fetch_add(1, Ordering::Relaxed);
        self.client
            .copy_object()
            .copy_source(format!("{}/{}", self.bucket, self.full_path(path)))
            .bucket(&self.bucket)
            .key(self.backup_path(new_path))
            .send()
            .await
            .map_err(|err| Self::storage_err("copy", err))?;
        self.delete(path).await
    }

    fn info(&self) {
        tracing::info!(
            "S3 INFO: API calls/expensive/free: {}/{}/{} Cache (hit/miss/error): {}/{}/{}",
            self.api_calls.load(Ordering::Relaxed),
            self.expensive_api_calls.load(Ordering::Relaxed),
            self.free_api_calls.load(Ordering::Relaxed),
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
            self.cache_errors.load(Ordering::Relaxed),
        );
    }
}
