//! In-memory collaborators for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use relay_oci::{Descriptor, Digest, Keyring};
use relay_registry::blob::{BlobReader, BlobSource, BlobWriter, LocalBlobStore, RemoteConnector};
use relay_registry::catalog::{
    identify_candidate_repositories, CandidateSet, Catalog, CatalogError, ImageStream,
    ImageStreamCatalog, TagEvent, TagHistory,
};
use relay_registry::pullthrough::InflightSet;
use relay_registry::{Error, Result};

// ---------------------------------------------------------------------------
// Local store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    blobs: Mutex<HashMap<Digest, Vec<u8>>>,
    writers: AtomicUsize,
    commit_gate: Option<Arc<Semaphore>>,
}

/// Local blob store in memory. Commits can be held on a gate.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commits wait for a permit on `gate` before landing.
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                commit_gate: Some(gate),
                ..Default::default()
            }),
        }
    }

    pub fn insert(&self, data: &[u8]) -> Digest {
        let digest = Digest::from_bytes(data);
        self.inner
            .blobs
            .lock()
            .unwrap()
            .insert(digest.clone(), data.to_vec());
        digest
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.inner.blobs.lock().unwrap().contains_key(digest)
    }

    pub fn writers_created(&self) -> usize {
        self.inner.writers.load(Ordering::SeqCst)
    }

    fn data(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.inner
            .blobs
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::BlobUnknown(digest.clone()))
    }
}

#[async_trait]
impl BlobSource for MemoryStore {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        let data = self.data(digest)?;
        Ok(Descriptor::new(digest.clone(), data.len() as u64))
    }

    async fn open(&self, digest: &Digest) -> Result<BlobReader> {
        Ok(Box::new(Cursor::new(self.data(digest)?)))
    }
}

#[async_trait]
impl LocalBlobStore for MemoryStore {
    async fn create_writer(&self) -> Result<Box<dyn BlobWriter>> {
        self.inner.writers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryWriter {
            store: self.clone(),
            buf: Vec::new(),
        }))
    }
}

struct MemoryWriter {
    store: MemoryStore,
    buf: Vec<u8>,
}

#[async_trait]
impl BlobWriter for MemoryWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>, desc: &Descriptor) -> Result<Descriptor> {
        let MemoryWriter { store, buf } = *self;
        if let Some(gate) = &store.inner.commit_gate {
            let _permit = gate.acquire().await.unwrap();
        }
        let actual = Digest::from_bytes(&buf);
        if actual != desc.digest {
            return Err(Error::DigestMismatch {
                expected: desc.digest.clone(),
                actual,
            });
        }
        store.inner.blobs.lock().unwrap().insert(actual, buf);
        Ok(desc.clone())
    }

    async fn cancel(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Remote repository
// ---------------------------------------------------------------------------

/// A remote repository in memory, counting calls.
#[derive(Default)]
pub struct MemoryRemote {
    blobs: Mutex<HashMap<Digest, Vec<u8>>>,
    reported_size: Mutex<Option<u64>>,
    pub stats: AtomicUsize,
    pub opens: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(data: &[u8]) -> Self {
        let remote = Self::new();
        remote.insert(data);
        remote
    }

    pub fn insert(&self, data: &[u8]) -> Digest {
        let digest = Digest::from_bytes(data);
        self.blobs
            .lock()
            .unwrap()
            .insert(digest.clone(), data.to_vec());
        digest
    }

    pub fn forget(&self, digest: &Digest) {
        self.blobs.lock().unwrap().remove(digest);
    }

    /// Report `size` from stat regardless of content.
    pub fn report_size(&self, size: u64) {
        *self.reported_size.lock().unwrap() = Some(size);
    }

    pub fn stat_count(&self) -> usize {
        self.stats.load(Ordering::SeqCst)
    }

    fn data(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::BlobUnknown(digest.clone()))
    }
}

#[async_trait]
impl BlobSource for MemoryRemote {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        self.stats.fetch_add(1, Ordering::SeqCst);
        let data = self.data(digest)?;
        let size = self.reported_size.lock().unwrap().unwrap_or(data.len() as u64);
        Ok(Descriptor::new(digest.clone(), size))
    }

    async fn open(&self, digest: &Digest) -> Result<BlobReader> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        // Widen the window for concurrent requests to overlap.
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(Box::new(Cursor::new(self.data(digest)?)))
    }
}

/// Hands out [`MemoryRemote`]s keyed by `registry/repository`.
#[derive(Default)]
pub struct FakeConnector {
    remotes: HashMap<String, Arc<MemoryRemote>>,
    connects: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remote(mut self, repository: &str, remote: Arc<MemoryRemote>) -> Self {
        self.remotes.insert(repository.to_string(), remote);
        self
    }

    /// Repositories connected to so far, in order.
    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().unwrap().clone()
    }

    pub fn clear_connects(&self) {
        self.connects.lock().unwrap().clear();
    }
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(
        &self,
        registry_url: &str,
        repository: &str,
        _insecure: bool,
        _keyring: &Keyring,
    ) -> Result<Arc<dyn BlobSource>> {
        let host = registry_url
            .split_once("://")
            .map(|(_, h)| h)
            .unwrap_or(registry_url);
        let key = format!("{}/{}", host, repository);
        self.connects.lock().unwrap().push(key.clone());
        match self.remotes.get(&key) {
            Some(remote) => Ok(Arc::clone(remote) as Arc<dyn BlobSource>),
            None => Ok(Arc::new(MemoryRemote::new())),
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Build a stream whose tags list history newest first.
pub fn image_stream(tags: &[(&str, &[&str])]) -> ImageStream {
    ImageStream {
        namespace: "ns".into(),
        name: "app".into(),
        tags: tags
            .iter()
            .map(|(tag, items)| TagHistory {
                tag: tag.to_string(),
                items: items
                    .iter()
                    .map(|r| TagEvent {
                        docker_image_reference: r.to_string(),
                        image: String::new(),
                    })
                    .collect(),
            })
            .collect(),
        ..Default::default()
    }
}

/// Image stream view with call counters and injectable failures.
pub struct FakeImageStream {
    stream: ImageStream,
    failure: Mutex<Option<CatalogError>>,
    missing: bool,
    pub exists_calls: AtomicUsize,
    pub identify_calls: AtomicUsize,
    pub secrets_calls: AtomicUsize,
}

impl FakeImageStream {
    pub fn new(stream: ImageStream) -> Self {
        Self {
            stream,
            failure: Mutex::new(None),
            missing: false,
            exists_calls: AtomicUsize::new(0),
            identify_calls: AtomicUsize::new(0),
            secrets_calls: AtomicUsize::new(0),
        }
    }

    pub fn missing() -> Self {
        Self {
            missing: true,
            ..Self::new(ImageStream::default())
        }
    }

    pub fn failing(error: CatalogError) -> Self {
        let fake = Self::new(ImageStream::default());
        *fake.failure.lock().unwrap() = Some(error);
        fake
    }

    pub fn identify_count(&self) -> usize {
        self.identify_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> std::result::Result<(), CatalogError> {
        match self.failure.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ImageStreamCatalog for FakeImageStream {
    async fn exists(&self) -> std::result::Result<bool, CatalogError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(!self.missing)
    }

    async fn identify_candidate_repositories(
        &self,
        primary: bool,
    ) -> std::result::Result<CandidateSet, CatalogError> {
        self.identify_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(identify_candidate_repositories(&self.stream, &[], primary))
    }

    async fn secrets(&self) -> std::result::Result<Keyring, CatalogError> {
        self.secrets_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(Keyring::new())
    }
}

/// Catalog handing out one shared stream view for every repository.
pub struct FakeCatalog {
    pub stream: Arc<FakeImageStream>,
}

impl Catalog for FakeCatalog {
    fn image_stream(&self, _namespace: &str, _name: &str) -> Arc<dyn ImageStreamCatalog> {
        Arc::clone(&self.stream) as Arc<dyn ImageStreamCatalog>
    }
}

/// Wait until no background mirror is running.
pub async fn wait_for_mirrors(inflight: &InflightSet) {
    for _ in 0..500 {
        if inflight.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("background mirroring did not finish");
}
