//! Per-server wiring.
//!
//! A [`Registry`] owns the process-wide services (location cache, in-flight
//! set, write limiter, metrics) and hands out a [`RepositoryBlobs`] view per
//! repository request.

use std::sync::Arc;

use async_trait::async_trait;
use relay_oci::{BlobStore, Descriptor, Digest, RegistryClient};
use tracing::{debug, info};

use crate::blob::{
    BlobReader, BlobRequest, BlobSource, HttpConnector, LocalBlobStore, RemoteConnector,
    ResponseWriter,
};
use crate::cache::{CachedBlobStatter, LocationCache, RepositoryScopedDescriptors};
use crate::catalog::{Catalog, StaticCatalog};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::limiter::AdmissionLimiter;
use crate::locator::RemoteBlobLocator;
use crate::metrics::Metrics;
use crate::pullthrough::{InflightSet, PullThroughBlobStore};

pub struct Registry {
    local: Arc<dyn LocalBlobStore>,
    catalog: Arc<dyn Catalog>,
    connector: Arc<dyn RemoteConnector>,
    cache: Arc<LocationCache>,
    inflight: Arc<InflightSet>,
    limiter: Option<Arc<AdmissionLimiter>>,
    metrics: Arc<Metrics>,
    pullthrough: bool,
    mirror: bool,
}

impl Registry {
    /// Registry over explicit collaborators. The location cache and metrics
    /// start disabled; pull-through and mirroring start enabled.
    pub fn new(
        local: Arc<dyn LocalBlobStore>,
        catalog: Arc<dyn Catalog>,
        connector: Arc<dyn RemoteConnector>,
    ) -> Self {
        Self {
            local,
            catalog,
            connector,
            cache: Arc::new(LocationCache::disabled()),
            inflight: Arc::new(InflightSet::new()),
            limiter: None,
            metrics: Arc::new(Metrics::disabled()),
            pullthrough: true,
            mirror: true,
        }
    }

    /// Build every service from a validated config.
    pub fn from_config(config: &Config) -> Result<Self> {
        let local = Arc::new(BlobStore::new(config.storage.root.clone()));
        let catalog = Arc::new(StaticCatalog::load(
            &config.catalog.path,
            config.catalog.local_registries.clone(),
        )?);
        let connector = Arc::new(HttpConnector::new(RegistryClient::new()?));

        let cache = match config.cache.location_cache() {
            Some(cache_config) => LocationCache::new(cache_config)?,
            None => {
                info!("location cache disabled");
                LocationCache::disabled()
            }
        };

        let write = &config.requests.write;
        let limiter = (write.max_running > 0).then(|| {
            Arc::new(AdmissionLimiter::new(
                write.max_running,
                write.max_in_queue,
                write.max_wait_in_queue,
            ))
        });

        info!(
            storage = %config.storage.root.display(),
            catalog = %config.catalog.path.display(),
            pullthrough = config.pullthrough.enabled,
            mirror = config.pullthrough.mirror,
            "registry configured"
        );

        Ok(Self::new(local, catalog, connector)
            .with_cache(Arc::new(cache))
            .with_limiter(limiter)
            .with_metrics(Arc::new(Metrics::new(config.metrics.enabled)))
            .with_pullthrough(config.pullthrough.enabled, config.pullthrough.mirror))
    }

    pub fn with_cache(mut self, cache: Arc<LocationCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_limiter(mut self, limiter: Option<Arc<AdmissionLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Mirroring only applies when pull-through is enabled.
    pub fn with_pullthrough(mut self, enabled: bool, mirror: bool) -> Self {
        self.pullthrough = enabled;
        self.mirror = enabled && mirror;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn cache(&self) -> &Arc<LocationCache> {
        &self.cache
    }

    pub fn inflight(&self) -> &Arc<InflightSet> {
        &self.inflight
    }

    /// Blob access for `<namespace>/<name>`.
    pub fn repository(&self, name: &str) -> Result<RepositoryBlobs> {
        let (namespace, stream) = split_repository_name(name)?;

        let remote: Arc<dyn BlobSource> = if self.pullthrough {
            Arc::new(RemoteBlobLocator::new(
                self.catalog.image_stream(namespace, stream),
                Arc::clone(&self.connector),
                Arc::clone(&self.cache),
                Arc::clone(&self.metrics),
            ))
        } else {
            Arc::new(NoRemote)
        };

        let store = Arc::new(
            PullThroughBlobStore::new(Arc::clone(&self.local), remote, Arc::clone(&self.inflight))
                .with_mirroring(self.mirror)
                .with_limiter(self.limiter.clone()),
        );

        let statter = CachedBlobStatter::new(
            Arc::clone(&store) as Arc<dyn BlobSource>,
            Arc::clone(&self.cache),
            Arc::clone(&self.metrics),
        );
        let descriptors = RepositoryScopedDescriptors::new(
            name,
            Arc::clone(&self.cache),
            statter,
            Arc::clone(&self.metrics),
        );

        Ok(RepositoryBlobs {
            name: name.to_string(),
            store,
            descriptors,
        })
    }
}

fn split_repository_name(name: &str) -> Result<(&str, &str)> {
    match name.split_once('/') {
        Some((namespace, stream))
            if !namespace.is_empty() && !stream.is_empty() && !stream.contains('/') =>
        {
            Ok((namespace, stream))
        }
        _ => Err(Error::NameInvalid(name.to_string())),
    }
}

/// Blob operations scoped to one repository.
pub struct RepositoryBlobs {
    name: String,
    store: Arc<PullThroughBlobStore>,
    descriptors: RepositoryScopedDescriptors,
}

impl RepositoryBlobs {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Describe a blob, answering from the location cache when possible.
    pub async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        self.descriptors.stat(digest).await
    }

    pub async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.store.get(digest).await
    }

    pub async fn serve_blob(
        &self,
        writer: &mut dyn ResponseWriter,
        request: &BlobRequest,
        digest: &Digest,
    ) -> Result<Descriptor> {
        let desc = self.store.serve_blob(writer, request, digest).await?;
        if let Err(e) = self.descriptors.set_descriptor(&desc) {
            debug!(%digest, repository = %self.name, error = %e, "not caching served descriptor");
        }
        Ok(desc)
    }

    /// Forget that this repository holds `digest`.
    pub fn forget(&self, digest: &Digest) {
        self.descriptors.clear(digest);
    }
}

/// Remote side used when pull-through is disabled.
struct NoRemote;

#[async_trait]
impl BlobSource for NoRemote {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        Err(Error::BlobUnknown(digest.clone()))
    }

    async fn open(&self, digest: &Digest) -> Result<BlobReader> {
        Err(Error::BlobUnknown(digest.clone()))
    }
}
