//! Digest location cache.
//!
//! Two independently bounded LRU tiers, both with a time-to-live:
//!
//! - descriptors: `Digest -> Descriptor`, global
//! - repositories: `Digest -> [repository]`, the repositories a digest is
//!   known to live in, in the order they were learnt
//!
//! Membership entries are hints. A listed repository may since have lost the
//! blob, and an unlisted one may have it.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use relay_oci::{Descriptor, Digest};
use tokio::time::Instant;
use tracing::warn;

use crate::blob::BlobSource;
use crate::error::{Error, Result};
use crate::metrics::Metrics;

pub const DEFAULT_DESCRIPTOR_CAPACITY: usize = 6 * 4096;
pub const DEFAULT_REPOSITORY_CAPACITY: usize = 2048;
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationCacheConfig {
    pub descriptor_capacity: usize,
    pub repository_capacity: usize,
    pub ttl: Duration,
}

impl Default for LocationCacheConfig {
    fn default() -> Self {
        Self {
            descriptor_capacity: DEFAULT_DESCRIPTOR_CAPACITY,
            repository_capacity: DEFAULT_REPOSITORY_CAPACITY,
            ttl: DEFAULT_TTL,
        }
    }
}

struct Timed<T> {
    value: T,
    expires: Instant,
}

struct Tiers {
    descriptors: LruCache<Digest, Timed<Descriptor>>,
    repositories: LruCache<Digest, Timed<Vec<String>>>,
    ttl: Duration,
}

impl Tiers {
    fn descriptor(&mut self, digest: &Digest) -> Option<Descriptor> {
        let expired = self.descriptors.get(digest)?.expires <= Instant::now();
        if expired {
            self.descriptors.pop(digest);
            return None;
        }
        self.descriptors.get(digest).map(|t| t.value.clone())
    }

    fn repositories(&mut self, digest: &Digest) -> Option<&mut Timed<Vec<String>>> {
        let expired = self.repositories.get(digest)?.expires <= Instant::now();
        if expired {
            self.repositories.pop(digest);
            return None;
        }
        self.repositories.get_mut(digest)
    }
}

/// Process-wide digest cache. Cheap to share behind an `Arc`.
///
/// A disabled cache accepts every `add` and answers every lookup with a miss.
pub struct LocationCache {
    tiers: Option<Mutex<Tiers>>,
}

impl LocationCache {
    pub fn new(config: LocationCacheConfig) -> Result<Self> {
        let invalid = |what: &str| Error::Config(format!("location cache: {}", what));
        if config.ttl.is_zero() {
            return Err(invalid("ttl must be greater than zero"));
        }
        let descriptor_capacity = NonZeroUsize::new(config.descriptor_capacity)
            .ok_or_else(|| invalid("descriptor capacity must be greater than zero"))?;
        let repository_capacity = NonZeroUsize::new(config.repository_capacity)
            .ok_or_else(|| invalid("repository capacity must be greater than zero"))?;

        Ok(Self {
            tiers: Some(Mutex::new(Tiers {
                descriptors: LruCache::new(descriptor_capacity),
                repositories: LruCache::new(repository_capacity),
                ttl: config.ttl,
            })),
        })
    }

    pub fn disabled() -> Self {
        Self { tiers: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tiers.is_some()
    }

    fn lock(&self) -> Option<MutexGuard<'_, Tiers>> {
        self.tiers
            .as_ref()
            .map(|m| m.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Record what is known about `digest`.
    ///
    /// A descriptor replaces the cached one; it must describe `digest` and
    /// agree on size with any descriptor already cached. A repository is
    /// appended to the digest's membership list unless already present.
    /// Either write refreshes the entry's expiry.
    pub fn add(
        &self,
        digest: &Digest,
        descriptor: Option<&Descriptor>,
        repository: Option<&str>,
    ) -> Result<()> {
        let Some(mut tiers) = self.lock() else {
            return Ok(());
        };
        let expires = Instant::now() + tiers.ttl;

        if let Some(desc) = descriptor {
            if &desc.digest != digest {
                return Err(Error::DigestMismatch {
                    expected: digest.clone(),
                    actual: desc.digest.clone(),
                });
            }
            if let Some(cached) = tiers.descriptor(digest) {
                if cached.size != desc.size {
                    return Err(Error::DescriptorMismatch {
                        digest: digest.clone(),
                        expected: cached.size,
                        actual: desc.size,
                    });
                }
            }
            tiers.descriptors.put(
                digest.clone(),
                Timed {
                    value: desc.clone(),
                    expires,
                },
            );
        }

        if let Some(repo) = repository {
            match tiers.repositories(digest) {
                Some(entry) => {
                    if !entry.value.iter().any(|r| r == repo) {
                        entry.value.push(repo.to_string());
                    }
                    entry.expires = expires;
                }
                None => {
                    tiers.repositories.put(
                        digest.clone(),
                        Timed {
                            value: vec![repo.to_string()],
                            expires,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, digest: &Digest) -> Option<Descriptor> {
        self.lock()?.descriptor(digest)
    }

    /// The descriptor, only if `digest` is also known to live in `repository`.
    pub fn scoped_get(&self, digest: &Digest, repository: &str) -> Option<Descriptor> {
        let mut tiers = self.lock()?;
        let member = tiers
            .repositories(digest)
            .is_some_and(|e| e.value.iter().any(|r| r == repository));
        if !member {
            return None;
        }
        tiers.descriptor(digest)
    }

    /// Forget everything about `digest`.
    pub fn remove(&self, digest: &Digest) {
        if let Some(mut tiers) = self.lock() {
            tiers.descriptors.pop(digest);
            tiers.repositories.pop(digest);
        }
    }

    /// Forget that `digest` lives in `repository`. The descriptor stays.
    pub fn scoped_remove(&self, digest: &Digest, repository: &str) {
        let Some(mut tiers) = self.lock() else {
            return;
        };
        let now_empty = match tiers.repositories(digest) {
            Some(entry) => {
                entry.value.retain(|r| r != repository);
                entry.value.is_empty()
            }
            None => false,
        };
        if now_empty {
            tiers.repositories.pop(digest);
        }
    }

    /// Known repositories for `digest`, oldest first.
    pub fn repositories(&self, digest: &Digest) -> Vec<String> {
        let Some(mut tiers) = self.lock() else {
            return Vec::new();
        };
        tiers
            .repositories(digest)
            .map(|e| e.value.clone())
            .unwrap_or_default()
    }

    pub fn contains_repository(&self, digest: &Digest, repository: &str) -> bool {
        self.repositories(digest).iter().any(|r| r == repository)
    }
}

impl std::fmt::Debug for LocationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationCache")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Cache-backed wrappers
// ---------------------------------------------------------------------------

/// Stat through the global descriptor tier.
pub struct CachedBlobStatter {
    inner: Arc<dyn BlobSource>,
    cache: Arc<LocationCache>,
    metrics: Arc<Metrics>,
}

impl CachedBlobStatter {
    pub fn new(inner: Arc<dyn BlobSource>, cache: Arc<LocationCache>, metrics: Arc<Metrics>) -> Self {
        Self {
            inner,
            cache,
            metrics,
        }
    }

    pub async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        if let Some(desc) = self.cache.get(digest) {
            self.metrics.digest_cache(true);
            return Ok(desc);
        }
        self.metrics.digest_cache(false);

        let desc = self.inner.stat(digest).await?;
        if let Err(e) = self.cache.add(digest, Some(&desc), None) {
            warn!(%digest, error = %e, "not caching descriptor");
        }
        Ok(desc)
    }
}

/// Descriptor service for one repository over the location cache.
///
/// Lookups only hit when the digest is known to belong to the repository;
/// misses fall back to `statter` and record the result under the repository.
pub struct RepositoryScopedDescriptors {
    repository: String,
    cache: Arc<LocationCache>,
    statter: CachedBlobStatter,
    metrics: Arc<Metrics>,
}

impl RepositoryScopedDescriptors {
    pub fn new(
        repository: impl Into<String>,
        cache: Arc<LocationCache>,
        statter: CachedBlobStatter,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            repository: repository.into(),
            cache,
            statter,
            metrics,
        }
    }

    pub async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        if let Some(desc) = self.cache.scoped_get(digest, &self.repository) {
            self.metrics.digest_cache_scoped(true);
            return Ok(desc);
        }
        self.metrics.digest_cache_scoped(false);

        let desc = self.statter.stat(digest).await?;
        if let Err(e) = self.cache.add(digest, Some(&desc), Some(&self.repository)) {
            warn!(%digest, repository = %self.repository, error = %e, "not caching descriptor");
        }
        Ok(desc)
    }

    pub fn set_descriptor(&self, desc: &Descriptor) -> Result<()> {
        self.cache.add(&desc.digest, Some(desc), Some(&self.repository))
    }

    pub fn clear(&self, digest: &Digest) {
        self.cache.scoped_remove(digest, &self.repository);
    }
}
