//! Browsing image contents straight from the registry.
//!
//! [`ImageBrowser`] ties the registry client, the blob store, the layer
//! reader and the AUFS filter together. Every public operation goes through
//! the [`ObjectCache`] authorization gate with the scope the registry would
//! demand for it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use layerlens_oci::layer::{list_files_async, normalize_path, read_file_async};
use layerlens_oci::{
    select_image, AufsFilter, Image, Layer, LayerIndex, MemoryLocker, Platform, RegistryClient,
    Step,
};
use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, info};

use crate::cache::ObjectCache;
use crate::config::Config;
use crate::error::{Error, Result};

const CATALOG_SCOPE: &str = "registry:catalog";

fn repository_scope(repository: &str) -> String {
    format!("repository:{repository}")
}

/// A file visible in the merged image view, and the layer providing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub digest: String,
    /// 1 is the newest layer.
    pub depth: u32,
}

pub struct ImageBrowser {
    registry: RegistryClient,
    cache: ObjectCache,
    ttl: Duration,
    lock_hold: Duration,
    lock_timeout: Duration,
}

impl ImageBrowser {
    /// Build a browser for `config.registry.host`, logging in with the
    /// configured credentials if any.
    pub fn new(config: &Config) -> Result<Self> {
        let store = layerlens_oci::BlobStore::new(config.cache.dir.join("blobs"))
            .with_lock_timing(config.cache.lock_hold, config.cache.lock_timeout);
        let registry =
            RegistryClient::new(&config.registry.host, store, config.registry_options())?;
        registry.login(config.registry.username.clone(), config.password());

        let cache = ObjectCache::new(registry.authenticator(), Arc::new(MemoryLocker::new()));
        info!(
            registry = %config.registry.host,
            cache_dir = %config.cache.dir.display(),
            "image browser ready"
        );
        Ok(Self {
            registry,
            cache,
            ttl: config.cache.ttl,
            lock_hold: config.cache.lock_hold,
            lock_timeout: config.cache.lock_timeout,
        })
    }

    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    /// Replace the credentials. Tokens issued for the old ones are dropped,
    /// so cached results are re-authorized against the new identity.
    pub fn login(&self, username: Option<String>, password: Option<SecretString>) {
        self.registry.login(username, password);
    }

    pub async fn catalog(&self) -> Result<Vec<String>> {
        self.cache
            .get_or_compute(CATALOG_SCOPE, "catalog", self.ttl, || async move {
                Ok(self.registry.catalog().await?)
            })
            .await
    }

    pub async fn tags(&self, repository: &str) -> Result<Vec<String>> {
        let key = format!("tags/{repository}");
        self.cache
            .get_or_compute(&repository_scope(repository), &key, self.ttl, || async move {
                Ok(self.registry.tags(repository).await?)
            })
            .await
    }

    /// Every image `reference` resolves to, one per platform for a list.
    pub async fn images(&self, repository: &str, reference: &str) -> Result<Vec<Image>> {
        let key = format!("images/{repository}/{reference}");
        self.cache
            .get_or_compute(&repository_scope(repository), &key, self.ttl, || async move {
                Ok(self.registry.images(repository, reference).await?)
            })
            .await
    }

    /// The image for `platform` (default: the host's), else the first one.
    pub async fn image(
        &self,
        repository: &str,
        reference: &str,
        platform: Option<&Platform>,
    ) -> Result<Image> {
        let images = self.images(repository, reference).await?;
        let target = platform.cloned().unwrap_or_else(Platform::host);
        select_image(&images, &target)
            .or_else(|| {
                if !images.is_empty() {
                    debug!(
                        repository,
                        reference,
                        platform = %target,
                        "no image for platform, using first"
                    );
                }
                images.first()
            })
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{repository}:{reference} has no images")))
    }

    /// The coalesced view of `image`: layers that still provide visible
    /// files, newest first. Indexing runs under a lock so concurrent callers
    /// list a given image once.
    pub async fn layer_indexes(&self, repository: &str, image: &Image) -> Result<Vec<LayerIndex>> {
        let key = format!("index/{}", image.digest);
        let key = key.as_str();
        let indexes: Arc<Vec<LayerIndex>> = self
            .cache
            .get_or_compute(&repository_scope(repository), key, self.ttl, || async move {
                let mut guard = self
                    .cache
                    .take_lock(key, self.lock_hold, self.lock_timeout)
                    .await?;
                if let Some(done) = self.cache.peek::<Arc<Vec<LayerIndex>>>(key) {
                    return Ok(done);
                }

                let mut filter = AufsFilter::new(None);
                for (depth, layer) in image.search_order() {
                    guard.extend(self.lock_hold)?;
                    let files = self.layer_files(repository, layer).await?;
                    filter.push(LayerIndex {
                        digest: layer.digest.clone(),
                        depth,
                        files,
                    })?;
                }
                let indexes = filter.finish();
                info!(
                    image = %image.digest,
                    layers = image.layers.len(),
                    contributing = indexes.len(),
                    "indexed image"
                );
                Ok(Arc::new(indexes))
            })
            .await?;
        Ok(indexes.as_ref().clone())
    }

    /// Every visible file of `image`, sorted by path.
    pub async fn list_files(&self, repository: &str, image: &Image) -> Result<Vec<FileEntry>> {
        let mut entries: Vec<FileEntry> = self
            .layer_indexes(repository, image)
            .await?
            .into_iter()
            .flat_map(|index| {
                let LayerIndex { digest, depth, files } = index;
                files.into_iter().map(move |path| FileEntry {
                    path,
                    digest: digest.clone(),
                    depth,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// The layer providing `path` in the merged view. Layers are read newest
    /// first and only until the path is found or whited out.
    pub async fn find_file(&self, repository: &str, image: &Image, path: &str) -> Result<FileEntry> {
        let target = normalize_path(path)
            .ok_or_else(|| Error::NotFound(format!("{path} is a directory")))?;
        let key = format!("find/{}/{}", image.digest, target);
        let target = target.as_str();
        self.cache
            .get_or_compute(&repository_scope(repository), &key, self.ttl, || async move {
                let mut filter = AufsFilter::new(Some(target));
                for (depth, layer) in image.search_order() {
                    let files = self.layer_files(repository, layer).await?;
                    let step = filter.push(LayerIndex {
                        digest: layer.digest.clone(),
                        depth,
                        files,
                    })?;
                    match step {
                        Step::Continue => continue,
                        Step::Hidden => {
                            debug!(path = %target, depth, "path whited out");
                            break;
                        }
                        Step::Found => {
                            return Ok(FileEntry {
                                path: target.to_string(),
                                digest: layer.digest.clone(),
                                depth,
                            })
                        }
                    }
                }
                Err(Error::NotFound(format!("{target} in {}", image.digest)))
            })
            .await
    }

    /// Contents of `path` as the merged view shows it.
    pub async fn read_file(&self, repository: &str, image: &Image, path: &str) -> Result<Vec<u8>> {
        let entry = self.find_file(repository, image, path).await?;
        let key = format!("file/{}/{}", entry.digest, entry.path);
        let entry = &entry;
        let data: Arc<Vec<u8>> = self
            .cache
            .get_or_compute(&repository_scope(repository), &key, self.ttl, || async move {
                let layer = image
                    .layers
                    .iter()
                    .find(|l| l.digest == entry.digest)
                    .ok_or_else(|| Error::NotFound(format!("layer {}", entry.digest)))?;
                let blob = self.registry.fetch_blob(repository, layer).await?;
                let data =
                    read_file_async(blob, layer.media_type.clone(), entry.path.clone()).await?;
                data.map(Arc::new)
                    .ok_or_else(|| Error::NotFound(format!("{} in {}", entry.path, entry.digest)))
            })
            .await?;
        Ok(data.as_ref().clone())
    }

    /// Raw listing of one layer, whiteouts included. Cached per blob; only
    /// called behind the gate.
    async fn layer_files(&self, repository: &str, layer: &Layer) -> Result<BTreeSet<String>> {
        let key = format!("files/{}", layer.digest);
        if let Some(files) = self.cache.peek::<Arc<BTreeSet<String>>>(&key) {
            return Ok(files.as_ref().clone());
        }
        let blob = self.registry.fetch_blob(repository, layer).await?;
        let files = list_files_async(blob, layer.media_type.clone()).await?;
        self.cache.insert(&key, Arc::new(files.clone()), self.ttl);
        Ok(files)
    }
}
