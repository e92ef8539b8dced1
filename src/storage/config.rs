//! Distribution registry configuration
//!
//! Reads the subset of the registry's YAML config the collector needs: the
//! storage section. Exactly one of `filesystem` / `s3` must be configured.

use crate::error::{Result, ScourError};
use crate::storage::{FilesystemStorage, S3Storage, SharedStorage};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SUPPORTED_VERSION: &str = "0.1";

/// `storage.filesystem` settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FilesystemSettings {
    pub rootdirectory: String,
}

/// `storage.s3` settings.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Settings {
    #[serde(default)]
    pub accesskey: String,
    #[serde(default)]
    pub secretkey: String,
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub regionendpoint: Option<String>,
    #[serde(default)]
    pub rootdirectory: String,
}

/// `storage` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub filesystem: Option<FilesystemSettings>,
    #[serde(default)]
    pub s3: Option<S3Settings>,
}

/// The distribution config file, as far as the collector reads it.
#[derive(Debug, Clone, Deserialize)]
pub struct DistributionConfig {
    pub version: String,
    pub storage: StorageSettings,
}

impl DistributionConfig {
    /// Parse and validate a YAML config document.
    pub fn parse(data: &str) -> Result<Self> {
        let config: DistributionConfig = serde_yaml::from_str(data)?;

        if config.version != SUPPORTED_VERSION {
            return Err(ScourError::InvalidConfig(format!(
                "only version {SUPPORTED_VERSION} is supported, got {}",
                config.version
            )));
        }

        if config.storage.filesystem.is_some() && config.storage.s3.is_some() {
            return Err(ScourError::InvalidConfig(
                "multiple storages defined".to_string(),
            ));
        }

        if config.storage.filesystem.is_none() && config.storage.s3.is_none() {
            return Err(ScourError::InvalidConfig(
                "unsupported storage".to_string(),
            ));
        }

        Ok(config)
    }

    /// Load from a file on disk.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::parse(&data)
    }
}

/// Build the storage driver named by the config file.
///
/// `s3_cache` is the local read-cache directory used by the S3 driver.
pub fn storage_from_config(config_file: &Path, s3_cache: Option<PathBuf>) -> Result<SharedStorage> {
    let config = DistributionConfig::load(config_file)?;

    if let Some(filesystem) = &config.storage.filesystem {
        return Ok(Arc::new(FilesystemStorage::new(&filesystem.rootdirectory)));
    }
    if let Some(s3) = &config.storage.s3 {
        return Ok(Arc::new(S3Storage::new(s3, s3_cache)?));
    }

    // Unreachable after parse-time validation.
    Err(ScourError::InvalidConfig("unsupported storage".to_string()))
}
