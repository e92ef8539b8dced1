//! Manifest loading and caching
//!
//! Manifest content lives in the blob store; the mark phase needs each
//! manifest's referenced digests exactly once, no matter how many
//! repositories revision it. The cache guarantees a single load per digest
//! with all concurrent readers observing the same outcome.

use crate::digest::Digest;
use crate::error::{Result, ScourError};
use crate::registry::blobs::BlobIndex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

const MEDIA_TYPE_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// A parsed manifest: its own digest plus every digest it references.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub digest: Digest,
    /// Referenced digests, in manifest order: config and layers for an
    /// image manifest, member manifests for a manifest list.
    pub layers: Vec<Digest>,
}

type LoadOutcome = std::result::Result<Arc<Manifest>, String>;

/// Digest-keyed cache of parsed manifests with once-only loading.
#[derive(Default)]
pub struct ManifestCache {
    manifests: Mutex<HashMap<Digest, Arc<OnceCell<LoadOutcome>>>>,
}

impl ManifestCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, digest: Digest) -> Result<Arc<OnceCell<LoadOutcome>>> {
        let mut manifests = self
            .manifests
            .lock()
            .map_err(|_| ScourError::Lock("Failed to acquire manifest cache lock".to_string()))?;
        Ok(Arc::clone(manifests.entry(digest).or_default()))
    }

    /// Return the parsed manifest for `digest`, loading it at most once.
    ///
    /// Concurrent callers for the same digest all wait on the same load and
    /// see the same result, including a failed one.
    pub async fn get(&self, digest: Digest, blobs: &BlobIndex) -> Result<Arc<Manifest>> {
        let entry = self.entry(digest)?;
        let outcome = entry
            .get_or_init(|| async {
                Self::load(digest, blobs)
                    .await
                    .map(Arc::new)
                    .map_err(|err| err.to_string())
            })
            .await;

        match outcome {
            Ok(manifest) => Ok(Arc::clone(manifest)),
            Err(message) => Err(ScourError::Manifest(message.clone())),
        }
    }

    async fn load(digest: Digest, blobs: &BlobIndex) -> Result<Manifest> {
        tracing::info!("MANIFEST: {}: loading...", BlobIndex::data_path(digest));

        let data = blobs.read_blob(digest).await?;
        let references = deserialize_manifest(&data)?;

        let mut layers = Vec::with_capacity(references.len());
        for reference in &references {
            layers.push(Digest::from_reference(reference.as_bytes())?);
        }

        Ok(Manifest { digest, layers })
    }
}

#[derive(Deserialize)]
struct Versioned {
    #[serde(rename = "schemaVersion")]
    schema_version: u64,
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
}

#[derive(Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Deserialize)]
struct SignedManifestV1 {
    #[serde(rename = "fsLayers", default)]
    fs_layers: Vec<FsLayer>,
}

#[derive(Deserialize)]
struct FsLayer {
    #[serde(rename = "blobSum")]
    blob_sum: String,
}

#[derive(Deserialize)]
struct ManifestV2 {
    config: Descriptor,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Deserialize)]
struct ManifestListV2 {
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

/// Extract the referenced digests from manifest bytes, dispatching on
/// `schemaVersion` and, for schema 2, `mediaType`.
fn deserialize_manifest(data: &[u8]) -> Result<Vec<String>> {
    let versioned: Versioned = serde_json::from_slice(data)?;

    match versioned.schema_version {
        1 => {
            let manifest: SignedManifestV1 = serde_json::from_slice(data)?;
            Ok(manifest
                .fs_layers
                .into_iter()
                .map(|layer| layer.blob_sum)
                .collect())
        }
        2 => match versioned.media_type.as_deref() {
            Some(MEDIA_TYPE_MANIFEST) | Some(MEDIA_TYPE_OCI_MANIFEST) => {
                let manifest: ManifestV2 = serde_json::from_slice(data)?;
                let mut references = vec![manifest.config.digest];
                references.extend(manifest.layers.into_iter().map(|layer| layer.digest));
                Ok(references)
            }
            Some(MEDIA_TYPE_MANIFEST_LIST) | Some(MEDIA_TYPE_OCI_INDEX) => {
                let list: ManifestListV2 = serde_json::from_slice(data)?;
                Ok(list
                    .manifests
                    .into_iter()
                    .map(|manifest| manifest.digest)
                    .collect())
            }
            other => Err(ScourError::Manifest(format!(
                "unrecognized manifest content type: {}",
                other.unwrap_or("<none>")
            ))),
        },
        version => Err(ScourError::Manifest(format!(
            "unrecognized manifest schema version {version}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::GcOptions;
    use crate::storage::filesystem::registry_tree;
    use crate::storage::{FileInfo, FilesystemStorage, SharedStorage};
    use tempfile::tempdir;

    const MANIFEST_HEX: &str =
        "1111111111111111111111111111111111111111111111111111111111111111";
    const CONFIG_HEX: &str =
        "2222222222222222222222222222222222222222222222222222222222222222";
    const LAYER_HEX: &str =
        "3333333333333333333333333333333333333333333333333333333333333333";

    fn schema2_manifest() -> String {
        format!(
            concat!(
                "{{\"schemaVersion\":2,",
                "\"mediaType\":\"application/vnd.docker.distribution.manifest.v2+json\",",
                "\"config\":{{\"mediaType\":\"application/vnd.docker.container.image.v1+json\",",
                "\"size\":7023,\"digest\":\"sha256:{config}\"}},",
                "\"layers\":[{{\"mediaType\":\"application/vnd.docker.image.rootfs.diff.tar.gzip\",",
                "\"size\":32654,\"digest\":\"sha256:{layer}\"}}]}}"
            ),
            config = CONFIG_HEX,
            layer = LAYER_HEX,
        )
    }

    #[test]
    fn test_deserialize_schema2_manifest() {
        let references = deserialize_manifest(schema2_manifest().as_bytes()).unwrap();
        assert_eq!(
            references,
            vec![
                format!("sha256:{CONFIG_HEX}"),
                format!("sha256:{LAYER_HEX}")
            ]
        );
    }

    #[test]
    fn test_deserialize_schema2_manifest_list() {
        let data = format!(
            concat!(
                "{{\"schemaVersion\":2,",
                "\"mediaType\":\"application/vnd.docker.distribution.manifest.list.v2+json\",",
                "\"manifests\":[",
                "{{\"digest\":\"sha256:{a}\",\"platform\":{{\"architecture\":\"amd64\"}}}},",
                "{{\"digest\":\"sha256:{b}\",\"platform\":{{\"architecture\":\"arm64\"}}}}",
                "]}}"
            ),
            a = CONFIG_HEX,
            b = LAYER_HEX,
        );
        let references = deserialize_manifest(data.as_bytes()).unwrap();
        assert_eq!(
            references,
            vec![
                format!("sha256:{CONFIG_HEX}"),
                format!("sha256:{LAYER_HEX}")
            ]
        );
    }

    #[test]
    fn test_deserialize_schema1_manifest() {
        let data = format!(
            "{{\"schemaVersion\":1,\"name\":\"acme/app\",\"tag\":\"latest\",\"fsLayers\":[{{\"blobSum\":\"sha256:{LAYER_HEX}\"}},{{\"blobSum\":\"sha256:{CONFIG_HEX}\"}}]}}"
        );
        let references = deserialize_manifest(data.as_bytes()).unwrap();
        assert_eq!(
            references,
            vec![
                format!("sha256:{LAYER_HEX}"),
                format!("sha256:{CONFIG_HEX}")
            ]
        );
    }

    #[test]
    fn test_deserialize_rejects_unknown_shapes() {
        assert!(deserialize_manifest(b"{\"schemaVersion\":3}").is_err());
        assert!(deserialize_manifest(
            b"{\"schemaVersion\":2,\"mediaType\":\"application/json\"}"
        )
        .is_err());
        assert!(deserialize_manifest(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_cache_loads_once_and_shares_errors() {
        let temp = tempdir().unwrap();
        let blob_path = format!("blobs/sha256/11/{MANIFEST_HEX}/data");
        let full = registry_tree(temp.path()).join(&blob_path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, schema2_manifest()).unwrap();

        let storage: SharedStorage = Arc::new(FilesystemStorage::new(temp.path()));
        let options = Arc::new(GcOptions::default());
        let blobs = BlobIndex::new(storage, options);
        blobs
            .add_blob(
                &["sha256", "11", MANIFEST_HEX, "data"],
                &FileInfo::default(),
            )
            .unwrap();

        let digest = Digest::from_path(&["sha256", MANIFEST_HEX]).unwrap();
        let cache = ManifestCache::new();

        let manifest = cache.get(digest, &blobs).await.unwrap();
        assert_eq!(manifest.digest, digest);
        assert_eq!(manifest.layers.len(), 2);
        assert_eq!(manifest.layers[0].hex_hash(), CONFIG_HEX);
        assert_eq!(manifest.layers[1].hex_hash(), LAYER_HEX);

        // second get returns the cached parse
        let again = cache.get(digest, &blobs).await.unwrap();
        assert!(Arc::ptr_eq(&manifest, &again));

        // a missing blob keeps yielding the same recorded error
        let missing = Digest::from_path(&["sha256", CONFIG_HEX]).unwrap();
        assert!(cache.get(missing, &blobs).await.is_err());
        assert!(cache.get(missing, &blobs).await.is_err());
    }
}
