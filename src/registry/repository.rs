//! Per-repository state and the repository collection
//!
//! Ingestion dispatches every walked file into the owning repository's
//! maps; the mark phase resolves tag and manifest references into counter
//! bumps; the sweep deletes every link whose counter stayed at zero. No
//! operation ever touches two repositories, so a single per-repository
//! mutex covers all of it.

use crate::digest::{Digest, REFERENCE_SIZE};
use crate::error::{Result, ScourError};
use crate::jobs::{JobGroup, JobPool};
use crate::registry::blobs::BlobIndex;
use crate::registry::links::{analyze_link, analyze_signature_link, read_link, verify_link};
use crate::registry::manifest::ManifestCache;
use crate::registry::tag::Tag;
use crate::registry::GcOptions;
use crate::storage::{human_bytes, parallel_walk, Deleter, FileInfo, SharedStorage};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct RepoInner {
    layers: HashMap<Digest, u64>,
    manifests: HashMap<Digest, u64>,
    manifest_signatures: HashMap<Digest, Vec<Digest>>,
    tags: HashMap<String, Tag>,
    uploads: Vec<String>,
}

/// Usage totals for one repository, as reported after mark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub name: String,
    pub tags: usize,
    pub tag_versions: usize,
    pub manifests_used: usize,
    pub manifests_unused: usize,
    pub layers_used: usize,
    pub layers_unused: usize,
    pub data_used: u64,
    pub data_unused: u64,
    pub uploads: usize,
}

/// One repository namespace under `repositories/`.
pub struct Repository {
    name: String,
    storage: SharedStorage,
    options: Arc<GcOptions>,
    inner: Mutex<RepoInner>,
}

impl Repository {
    fn new(name: String, storage: SharedStorage, options: Arc<GcOptions>) -> Self {
        Self {
            name,
            storage,
            options,
            inner: Mutex::new(RepoInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn locked(&self) -> Result<MutexGuard<'_, RepoInner>> {
        self.inner
            .lock()
            .map_err(|_| ScourError::Lock("Failed to acquire repository lock".to_string()))
    }

    fn layer_link_path(&self, layer: Digest) -> String {
        format!("repositories/{}/_layers/{}/link", self.name, layer.path())
    }

    fn manifest_revision_path(&self, revision: Digest) -> String {
        format!(
            "repositories/{}/_manifests/revisions/{}/link",
            self.name,
            revision.path()
        )
    }

    fn manifest_revision_signature_path(&self, revision: Digest, signature: Digest) -> String {
        format!(
            "repositories/{}/_manifests/revisions/{}/signatures/{}/link",
            self.name,
            revision.path(),
            signature.path()
        )
    }

    async fn add_layer(&self, args: &[&str], info: &FileInfo) -> Result<()> {
        let link = analyze_link(args)?;
        verify_link(&self.storage, link, &self.layer_link_path(link), &info.etag).await?;

        self.locked()?.layers.entry(link).or_insert(0);
        Ok(())
    }

    async fn add_manifest_revision(&self, args: &[&str], info: &FileInfo) -> Result<()> {
        if let Ok(link) = analyze_link(args) {
            verify_link(
                &self.storage,
                link,
                &self.manifest_revision_path(link),
                &info.etag,
            )
            .await?;

            self.locked()?.manifests.entry(link).or_insert(0);
            return Ok(());
        }

        let (revision, signature) = analyze_signature_link(args)?;
        verify_link(
            &self.storage,
            signature,
            &self.manifest_revision_signature_path(revision, signature),
            &info.etag,
        )
        .await?;

        self.locked()?
            .manifest_signatures
            .entry(revision)
            .or_default()
            .push(signature);
        Ok(())
    }

    async fn add_tag(&self, args: &[&str], info: &FileInfo) -> Result<()> {
        if args.len() < 2 {
            return Err(ScourError::UnparseablePath(format!(
                "invalid components for tag: {args:?}"
            )));
        }

        let name = args[0];
        match args[1] {
            "current" => {
                let path = Tag::current_link_path(&self.name, name);
                let link = read_link(&self.storage, &path, &info.etag).await?;

                self.locked()?.tags.entry(name.to_string()).or_default().current = link;
                tracing::info!("TAG: {}: {name}: is using: {link}", self.name);
                Ok(())
            }
            "index" => {
                let link = analyze_link(&args[2..])?;
                verify_link(
                    &self.storage,
                    link,
                    &Tag::version_link_path(&self.name, name, link),
                    &info.etag,
                )
                .await?;

                self.locked()?
                    .tags
                    .entry(name.to_string())
                    .or_default()
                    .versions
                    .push(link);
                Ok(())
            }
            other => Err(ScourError::UnparseablePath(format!(
                "undefined manifest tag type: {other}"
            ))),
        }
    }

    async fn add_manifest(&self, args: &[&str], info: &FileInfo) -> Result<()> {
        if args.is_empty() {
            return Err(ScourError::UnparseablePath(
                "empty manifest components".to_string(),
            ));
        }

        match args[0] {
            "revisions" => self.add_manifest_revision(&args[1..], info).await,
            "tags" => self.add_tag(&args[1..], info).await,
            other => Err(ScourError::UnparseablePath(format!(
                "undefined manifest type: {other}"
            ))),
        }
    }

    fn add_upload(&self, args: &[&str]) -> Result<()> {
        if args.is_empty() {
            return Err(ScourError::UnparseablePath(
                "empty upload components".to_string(),
            ));
        }

        self.locked()?.uploads.push(args.join("/"));
        Ok(())
    }

    async fn mark_manifest_layers(
        &self,
        blobs: &BlobIndex,
        manifests: &ManifestCache,
        revision: Digest,
    ) -> Result<()> {
        blobs.mark(revision)?;

        let manifest = manifests.get(revision, blobs).await?;

        let mut inner = self.locked()?;
        for layer in &manifest.layers {
            match inner.layers.get_mut(layer) {
                Some(count) => *count += 1,
                None => {
                    return Err(ScourError::LayerNotFound {
                        layer: layer.to_string(),
                        manifest: revision.to_string(),
                    })
                }
            }
        }

        Ok(())
    }

    /// Resolve everything this repository keeps alive into counter bumps:
    /// tags pin manifests, used manifests pin their layers and signatures,
    /// used layers pin blobs.
    pub async fn mark(&self, blobs: &BlobIndex, manifests: &ManifestCache) -> Result<()> {
        {
            let mut inner = self.locked()?;
            let inner = &mut *inner;
            for tag in inner.tags.values() {
                tag.mark(&mut inner.manifests, self.options.delete_old_tag_versions);
            }
        }

        let used_manifests: Vec<Digest> = {
            let inner = self.locked()?;
            inner
                .manifests
                .iter()
                .filter(|(_, used)| **used > 0)
                .map(|(revision, _)| *revision)
                .collect()
        };
        for revision in used_manifests {
            if let Err(err) = self.mark_manifest_layers(blobs, manifests, revision).await {
                tracing::error!("MARK: {}: MANIFEST: {revision}: {err}", self.name);
                if !self.options.soft_errors {
                    return Err(err);
                }
            }
        }

        let signatures: Vec<(Digest, Vec<Digest>)> = {
            let inner = self.locked()?;
            inner
                .manifest_signatures
                .iter()
                .map(|(revision, signatures)| (*revision, signatures.clone()))
                .collect()
        };
        for (revision, revision_signatures) in signatures {
            let used = {
                let inner = self.locked()?;
                inner.manifests.get(&revision).copied().unwrap_or(0)
            };
            if used == 0 {
                continue;
            }
            for signature in revision_signatures {
                if let Err(err) = blobs.mark(signature) {
                    tracing::error!("MARK: {}: MANIFEST SIGNATURE: {revision}: {err}", self.name);
                    if !self.options.soft_errors {
                        return Err(err);
                    }
                }
            }
        }

        let used_layers: Vec<Digest> = {
            let inner = self.locked()?;
            inner
                .layers
                .iter()
                .filter(|(_, used)| **used > 0)
                .map(|(layer, _)| *layer)
                .collect()
        };
        for layer in used_layers {
            if let Err(err) = blobs.mark(layer) {
                tracing::error!("MARK: {}: LAYER: {layer}: {err}", self.name);
                if !self.options.soft_errors {
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Delete every link whose counter stayed at zero: dead tag links,
    /// dead manifest revisions, their signatures, dead layers.
    pub async fn sweep(&self, deleter: &Deleter) -> Result<()> {
        let tags: Vec<(String, Tag)> = {
            let inner = self.locked()?;
            inner
                .tags
                .iter()
                .map(|(name, tag)| (name.clone(), tag.clone()))
                .collect()
        };
        for (name, tag) in tags {
            if let Err(err) = tag
                .sweep(
                    &self.name,
                    &name,
                    deleter,
                    self.options.delete_old_tag_versions,
                )
                .await
            {
                tracing::error!("SWEEP: {}: TAG: {name}: {err}", self.name);
                if !self.options.soft_errors {
                    return Err(err);
                }
            }
        }

        let dead_manifests: Vec<Digest> = {
            let inner = self.locked()?;
            inner
                .manifests
                .iter()
                .filter(|(_, used)| **used == 0)
                .map(|(revision, _)| *revision)
                .collect()
        };
        for revision in dead_manifests {
            if let Err(err) = deleter
                .delete_file(&self.manifest_revision_path(revision), REFERENCE_SIZE)
                .await
            {
                tracing::error!("SWEEP: {}: MANIFEST: {revision}: {err}", self.name);
                if !self.options.soft_errors {
                    return Err(err);
                }
            }
        }

        let signatures: Vec<(Digest, Vec<Digest>)> = {
            let inner = self.locked()?;
            inner
                .manifest_signatures
                .iter()
                .map(|(revision, signatures)| (*revision, signatures.clone()))
                .collect()
        };
        for (revision, revision_signatures) in signatures {
            let used = {
                let inner = self.locked()?;
                inner.manifests.get(&revision).copied().unwrap_or(0)
            };
            if used > 0 {
                continue;
            }
            for signature in revision_signatures {
                if let Err(err) = deleter
                    .delete_file(
                        &self.manifest_revision_signature_path(revision, signature),
                        REFERENCE_SIZE,
                    )
                    .await
                {
                    tracing::error!(
                        "SWEEP: {}: MANIFEST SIGNATURE: {revision}: {err}",
                        self.name
                    );
                    if !self.options.soft_errors {
                        return Err(err);
                    }
                }
            }
        }

        let dead_layers: Vec<Digest> = {
            let inner = self.locked()?;
            inner
                .layers
                .iter()
                .filter(|(_, used)| **used == 0)
                .map(|(layer, _)| *layer)
                .collect()
        };
        for layer in dead_layers {
            if let Err(err) = deleter
                .delete_file(&self.layer_link_path(layer), REFERENCE_SIZE)
                .await
            {
                tracing::error!("SWEEP: {}: LAYER: {layer}: {err}", self.name);
                if !self.options.soft_errors {
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Usage totals after mark.
    pub fn info(&self, blobs: &BlobIndex) -> Result<RepositoryInfo> {
        let inner = self.locked()?;

        let mut info = RepositoryInfo {
            name: self.name.clone(),
            tags: inner.tags.len(),
            tag_versions: inner.tags.values().map(|tag| tag.versions.len()).sum(),
            manifests_used: 0,
            manifests_unused: 0,
            layers_used: 0,
            layers_unused: 0,
            data_used: 0,
            data_unused: 0,
            uploads: inner.uploads.len(),
        };

        for used in inner.manifests.values() {
            if *used > 0 {
                info.manifests_used += 1;
            } else {
                info.manifests_unused += 1;
            }
        }

        for (layer, used) in &inner.layers {
            if *used > 0 {
                info.layers_used += 1;
                info.data_used += blobs.size(*layer);
            } else {
                info.layers_unused += 1;
                info.data_unused += blobs.size(*layer);
            }
        }

        Ok(info)
    }
}

const CSV_HEADER: &str = "Repository,Tags,TagVersions,Manifests,ManifestsUnused,\
Layers,LayersUnused,Data,DataUnused,Data-MB,DataUnused-MB";

/// All repositories discovered under `repositories/`.
pub struct RepositorySet {
    storage: SharedStorage,
    options: Arc<GcOptions>,
    repositories: Mutex<HashMap<String, Arc<Repository>>>,
}

impl RepositorySet {
    pub fn new(storage: SharedStorage, options: Arc<GcOptions>) -> Self {
        Self {
            storage,
            options,
            repositories: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, path: &[&str]) -> Result<Arc<Repository>> {
        let name = path.join("/");

        let mut repositories = self
            .repositories
            .lock()
            .map_err(|_| ScourError::Lock("Failed to acquire repository set lock".to_string()))?;
        let repository = repositories.entry(name.clone()).or_insert_with(|| {
            Arc::new(Repository::new(
                name,
                Arc::clone(&self.storage),
                Arc::clone(&self.options),
            ))
        });
        Ok(Arc::clone(repository))
    }

    fn all(&self) -> Result<Vec<Arc<Repository>>> {
        let repositories = self
            .repositories
            .lock()
            .map_err(|_| ScourError::Lock("Failed to acquire repository set lock".to_string()))?;
        Ok(repositories.values().cloned().collect())
    }

    /// Dispatch one walked file into the owning repository, splitting the
    /// path at the first recognized marker segment.
    pub async fn process(&self, path: &str, info: &FileInfo) -> Result<()> {
        let segments: Vec<&str> = path.split('/').collect();

        for idx in 0..segments.len().saturating_sub(1) {
            let repository = &segments[0..idx];
            let args = &segments[idx + 1..];

            match segments[idx] {
                "_layers" => return self.get(repository)?.add_layer(args, info).await,
                "_manifests" => return self.get(repository)?.add_manifest(args, info).await,
                "_uploads" => return self.get(repository)?.add_upload(args),
                _ => {}
            }
        }

        Err(ScourError::UnparseablePath(path.to_string()))
    }

    async fn walk_file(&self, path: &str, info: &FileInfo) -> Result<()> {
        if let Err(err) = self.process(path, info).await {
            tracing::error!("REPOSITORY: {path}: {err}");
            if !self.options.soft_errors {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn walk_path(self: &Arc<Self>, walk_path: &str, group: &Arc<JobGroup>) -> Result<()> {
        tracing::info!("REPOSITORIES DIR: {walk_path}");

        let set = Arc::clone(self);
        let group = Arc::clone(group);
        self.storage
            .walk(walk_path, "repositories", &move |path, info| {
                let set = Arc::clone(&set);
                let path = path.to_string();
                let info = info.clone();
                group.dispatch(async move { set.walk_file(&path, &info).await });
                Ok(())
            })
            .await
    }

    /// Ingest the repository tree. Per-file processing runs as jobs on the
    /// general pool; with `parallel` the walk itself fans out over hash
    /// buckets on the walk pool.
    pub async fn walk(
        self: &Arc<Self>,
        jobs: &JobPool,
        walk_pool: &JobPool,
        parallel: bool,
    ) -> Result<()> {
        tracing::info!("Walking REPOSITORIES...");

        let group = Arc::new(jobs.group());

        if parallel {
            let set = Arc::clone(self);
            let walk_group = Arc::clone(&group);
            parallel_walk(&self.storage, walk_pool, "repositories", move |walk_path| {
                let set = Arc::clone(&set);
                let group = Arc::clone(&walk_group);
                async move { set.walk_path(&walk_path, &group).await }
            })
            .await?;
        } else {
            self.walk_path("repositories", &group).await?;
        }

        group.finish().await
    }

    /// Mark every repository, one job per repository.
    pub async fn mark(
        &self,
        jobs: &JobPool,
        blobs: &Arc<BlobIndex>,
        manifests: &Arc<ManifestCache>,
    ) -> Result<()> {
        let group = jobs.group();

        for repository in self.all()? {
            let blobs = Arc::clone(blobs);
            let manifests = Arc::clone(manifests);
            group.dispatch(async move { repository.mark(&blobs, &manifests).await });
        }

        group.finish().await
    }

    /// Sweep every repository, one job per repository.
    pub async fn sweep(&self, jobs: &JobPool, deleter: &Arc<Deleter>) -> Result<()> {
        let group = jobs.group();

        for repository in self.all()? {
            let deleter = Arc::clone(deleter);
            group.dispatch(async move { repository.sweep(&deleter).await });
        }

        group.finish().await
    }

    /// Log per-repository usage and optionally write the CSV report.
    pub fn info(&self, blobs: &BlobIndex, csv_output: Option<&Path>) -> Result<()> {
        let mut stream = match csv_output {
            Some(path) => Some(std::fs::File::create(path)?),
            None => None,
        };
        if let Some(stream) = &mut stream {
            writeln!(stream, "{CSV_HEADER}")?;
        }

        let mut repositories = self.all()?;
        repositories.sort_by(|a, b| a.name().cmp(b.name()));

        for repository in repositories {
            let info = repository.info(blobs)?;

            tracing::info!(
                "REPOSITORY INFO: {}: Tags/Versions: {}/{} Manifests/Unused: {}/{} \
                 Layers/Unused: {}/{} Data/Unused: {}/{}",
                info.name,
                info.tags,
                info.tag_versions,
                info.manifests_used,
                info.manifests_unused,
                info.layers_used,
                info.layers_unused,
                human_bytes(info.data_used),
                human_bytes(info.data_unused),
            );

            if let Some(stream) = &mut stream {
                writeln!(
                    stream,
                    "{},{},{},{},{},{},{},{},{},{},{}",
                    info.name,
                    info.tags,
                    info.tag_versions,
                    info.manifests_used,
                    info.manifests_unused,
                    info.layers_used,
                    info.layers_unused,
                    human_bytes(info.data_used),
                    human_bytes(info.data_unused),
                    info.data_used / 1024 / 1024,
                    info.data_unused / 1024 / 1024,
                )?;
            }
        }

        Ok(())
    }
}
