//! Remote blob location.
//!
//! [`RemoteBlobLocator`] turns a bare digest into a descriptor plus a handle
//! on a remote repository that serves it. Candidates come from the image
//! stream's tag history: the newest location of every tag first, then older
//! history. Within each pass, repositories the location cache already
//! associates with the digest are probed before the rest.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use relay_oci::{Descriptor, Digest, Keyring};
use tracing::{debug, info, warn};

use crate::blob::{BlobReader, BlobSource, RemoteConnector};
use crate::cache::LocationCache;
use crate::catalog::{CandidateSet, CatalogError, ImageStreamCatalog, PullthroughSpec};
use crate::error::{Error, Result};
use crate::metrics::Metrics;

type SourceHandle = Arc<dyn BlobSource>;

pub struct RemoteBlobLocator {
    image_stream: Arc<dyn ImageStreamCatalog>,
    connector: Arc<dyn RemoteConnector>,
    cache: Arc<LocationCache>,
    metrics: Arc<Metrics>,
    /// Last remote store that served each digest. Entries may go stale.
    resolved: RwLock<HashMap<Digest, SourceHandle>>,
}

impl RemoteBlobLocator {
    pub fn new(
        image_stream: Arc<dyn ImageStreamCatalog>,
        connector: Arc<dyn RemoteConnector>,
        cache: Arc<LocationCache>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            image_stream,
            connector,
            cache,
            metrics,
            resolved: RwLock::new(HashMap::new()),
        }
    }

    fn cached_source(&self, digest: &Digest) -> Option<SourceHandle> {
        let hit = self
            .resolved
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(digest)
            .cloned();
        self.metrics.resolved_store_cache(hit.is_some());
        hit
    }

    fn remember_source(&self, digest: &Digest, source: SourceHandle) {
        self.resolved
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(digest.clone(), source);
    }

    /// Stat through a remembered store. The descriptor must agree with the
    /// descriptor cache; `Ok(None)` means the store no longer serves the blob.
    async fn stat_resolved(
        &self,
        source: &SourceHandle,
        digest: &Digest,
    ) -> Result<Option<Descriptor>> {
        match source.stat(digest).await {
            Ok(desc) => {
                self.cache.add(digest, Some(&desc), None)?;
                Ok(Some(desc))
            }
            Err(e) => {
                warn!(%digest, error = %e, "cached remote store failed to stat blob");
                Ok(None)
            }
        }
    }

    /// Resolve `digest` from scratch and remember the winning store.
    async fn resolve(&self, digest: &Digest) -> Result<(Descriptor, SourceHandle)> {
        let (desc, source) = self.find_blob_store(digest).await?;
        self.remember_source(digest, Arc::clone(&source));
        Ok((desc, source))
    }

    async fn find_blob_store(&self, digest: &Digest) -> Result<(Descriptor, SourceHandle)> {
        match self.image_stream.exists().await {
            Ok(true) => {}
            Ok(false) => return Err(Error::BlobUnknown(digest.clone())),
            Err(e) => return Err(catalog_error(digest, e)),
        }

        let cached = self.cache.repositories(digest);
        let keyring = self
            .image_stream
            .secrets()
            .await
            .map_err(|e| catalog_error(digest, e))?;

        let primary = self
            .image_stream
            .identify_candidate_repositories(true)
            .await
            .map_err(|e| catalog_error(digest, e))?;
        if let Some(found) = self
            .find_candidate_repository(&primary, &cached, digest, &keyring)
            .await?
        {
            return Ok(found);
        }

        let secondary = self
            .image_stream
            .identify_candidate_repositories(false)
            .await
            .map_err(|e| catalog_error(digest, e))?
            .without(&primary);
        if let Some(found) = self
            .find_candidate_repository(&secondary, &cached, digest, &keyring)
            .await?
        {
            return Ok(found);
        }

        debug!(%digest, "no candidate repository holds the blob");
        Err(Error::BlobUnknown(digest.clone()))
    }

    /// Probe one candidate set. Probe failures are absorbed; only a
    /// disagreement with the cached descriptor is an error.
    async fn find_candidate_repository(
        &self,
        candidates: &CandidateSet,
        cached: &[String],
        digest: &Digest,
        keyring: &Keyring,
    ) -> Result<Option<(Descriptor, SourceHandle)>> {
        if candidates.is_empty() {
            return Ok(None);
        }
        let mut tried = HashSet::new();

        for repo in cached {
            let Some(spec) = candidates.get(repo) else {
                continue;
            };
            tried.insert(repo.as_str());
            if let Some((desc, source)) = self.proxy_stat(spec, digest, keyring).await {
                info!(%digest, repository = %repo, "found digest location from cache");
                self.cache.add(digest, Some(&desc), Some(repo))?;
                return Ok(Some((desc, source)));
            }
        }

        for (repo, spec) in candidates.iter() {
            if tried.contains(repo) {
                continue;
            }
            if let Some((desc, source)) = self.proxy_stat(spec, digest, keyring).await {
                info!(%digest, repository = %repo, "found digest location by search");
                self.cache.add(digest, Some(&desc), Some(repo))?;
                return Ok(Some((desc, source)));
            }
        }
        Ok(None)
    }

    async fn proxy_stat(
        &self,
        spec: &PullthroughSpec,
        digest: &Digest,
        keyring: &Keyring,
    ) -> Option<(Descriptor, SourceHandle)> {
        let reference = &spec.reference;
        let repository = reference.as_repository().exact();
        info!(
            %digest,
            %repository,
            insecure = spec.insecure,
            "trying to stat blob from remote repository"
        );

        let remote = match self
            .connector
            .connect(
                &reference.registry_url(),
                &reference.repository_name(),
                spec.insecure,
                keyring,
            )
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                warn!(%repository, error = %e, "failed to open remote repository");
                return None;
            }
        };
        let source: SourceHandle = Arc::new(InstrumentedSource {
            inner: remote,
            registry: reference.registry.clone(),
            metrics: Arc::clone(&self.metrics),
        });

        match source.stat(digest).await {
            Ok(desc) => Some((desc, source)),
            Err(e) if e.is_blob_unknown() => {
                debug!(%digest, %repository, "blob not in remote repository");
                None
            }
            Err(e) => {
                warn!(%digest, %repository, error = %e, "failed to stat blob in remote repository");
                None
            }
        }
    }
}

fn catalog_error(digest: &Digest, e: CatalogError) -> Error {
    match e {
        CatalogError::NotFound(stream) => {
            warn!(%stream, "image stream not found");
            Error::BlobUnknown(digest.clone())
        }
        CatalogError::Forbidden(stream) => Error::AccessDenied(stream),
        CatalogError::Unavailable(msg) => Error::CatalogUnavailable(msg),
    }
}

#[async_trait]
impl BlobSource for RemoteBlobLocator {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        if let Some(source) = self.cached_source(digest) {
            if let Some(desc) = self.stat_resolved(&source, digest).await? {
                return Ok(desc);
            }
        }
        let (desc, _) = self.resolve(digest).await?;
        Ok(desc)
    }

    async fn open(&self, digest: &Digest) -> Result<BlobReader> {
        if let Some(source) = self.cached_source(digest) {
            if self.stat_resolved(&source, digest).await?.is_some() {
                match source.open(digest).await {
                    Ok(reader) => return Ok(reader),
                    Err(e) => warn!(%digest, error = %e, "cached remote store failed to open blob"),
                }
            }
        }
        let (_, source) = self.resolve(digest).await?;
        source.open(digest).await
    }

    async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        if let Some(source) = self.cached_source(digest) {
            if self.stat_resolved(&source, digest).await?.is_some() {
                match source.get(digest).await {
                    Ok(data) => return Ok(data),
                    Err(e) => warn!(%digest, error = %e, "cached remote store failed to get blob"),
                }
            }
        }
        let (_, source) = self.resolve(digest).await?;
        source.get(digest).await
    }
}

/// Records duration and failures of every call against one remote registry.
struct InstrumentedSource {
    inner: SourceHandle,
    registry: String,
    metrics: Arc<Metrics>,
}

impl InstrumentedSource {
    fn observe<T>(&self, operation: &str, start: Instant, result: &Result<T>) {
        self.metrics.remote_operation(
            &self.registry,
            operation,
            start.elapsed(),
            result.as_ref().err().map(Error::code),
        );
    }
}

#[async_trait]
impl BlobSource for InstrumentedSource {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        let start = Instant::now();
        let result = self.inner.stat(digest).await;
        self.observe("stat", start, &result);
        result
    }

    async fn open(&self, digest: &Digest) -> Result<BlobReader> {
        let start = Instant::now();
        let result = self.inner.open(digest).await;
        self.observe("open", start, &result);
        result
    }

    async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let start = Instant::now();
        let result = self.inner.get(digest).await;
        self.observe("get", start, &result);
        result
    }
}
