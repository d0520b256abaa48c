//! Remote blob location through catalog candidates and the location cache.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{image_stream, FakeCatalog, FakeConnector, FakeImageStream, MemoryRemote, MemoryStore};
use relay_oci::{Descriptor, Digest};
use relay_registry::blob::BlobSource;
use relay_registry::cache::{LocationCache, LocationCacheConfig};
use relay_registry::catalog::{identify_candidate_repositories, CatalogError, ImageStream};
use relay_registry::locator::RemoteBlobLocator;
use relay_registry::metrics::{self, Metrics};
use relay_registry::registry::Registry;
use relay_registry::Error;

const BLOB: &[u8] = b"config blob for an older build";

const R1: &str = "r1.example.com/team/app";
const R2: &str = "r2.example.com/team/app";
const R3: &str = "r3.example.com/team/app";

/// `v1` now points at R1; R2 and R3 are older history.
fn history_stream() -> ImageStream {
    image_stream(&[(
        "v1",
        &[
            "r1.example.com/team/app:v1",
            "r2.example.com/team/app:v0",
            "r3.example.com/team/app:v0-rc",
        ],
    )])
}

fn history() -> FakeImageStream {
    FakeImageStream::new(history_stream())
}

fn cache() -> Arc<LocationCache> {
    Arc::new(LocationCache::new(LocationCacheConfig::default()).unwrap())
}

fn locator(
    stream: &Arc<FakeImageStream>,
    connector: &Arc<FakeConnector>,
    cache: &Arc<LocationCache>,
    metrics: &Arc<Metrics>,
) -> RemoteBlobLocator {
    RemoteBlobLocator::new(
        Arc::clone(stream) as _,
        Arc::clone(connector) as _,
        Arc::clone(cache),
        Arc::clone(metrics),
    )
}

#[tokio::test]
async fn older_history_is_searched_after_current_locations() {
    let stream = Arc::new(history());
    let r3 = Arc::new(MemoryRemote::with_blob(BLOB));
    let connector = Arc::new(
        FakeConnector::new()
            .with_remote(R1, Arc::new(MemoryRemote::new()))
            .with_remote(R2, Arc::new(MemoryRemote::new()))
            .with_remote(R3, Arc::clone(&r3)),
    );
    let cache = cache();
    let metrics = Arc::new(Metrics::disabled());
    let digest = Digest::from_bytes(BLOB);

    let primary = identify_candidate_repositories(&history_stream(), &[], true);
    assert!(!primary.contains(R3));

    let first = locator(&stream, &connector, &cache, &metrics);
    let desc = first.stat(&digest).await.unwrap();
    assert_eq!(desc.size, BLOB.len() as u64);
    assert_eq!(connector.connects(), vec![R1, R2, R3]);
    assert_eq!(cache.repositories(&digest), vec![R3.to_string()]);

    // Same request: answered by the resolved store, no catalog round trip.
    let identify = stream.identify_count();
    first.stat(&digest).await.unwrap();
    assert_eq!(stream.identify_count(), identify);
    assert_eq!(connector.connects().len(), 3);

    // A later request probes the remembered repository before R2.
    connector.clear_connects();
    let second = locator(&stream, &connector, &cache, &metrics);
    assert_eq!(second.get(&digest).await.unwrap(), BLOB);
    assert_eq!(connector.connects(), vec![R1, R3]);
}

#[tokio::test]
async fn size_disagreement_is_a_descriptor_mismatch() {
    let stream = Arc::new(history());
    let remote = Arc::new(MemoryRemote::with_blob(BLOB));
    remote.report_size(200);
    let connector = Arc::new(FakeConnector::new().with_remote(R1, remote));
    let cache = cache();
    let metrics = Arc::new(Metrics::disabled());
    let digest = Digest::from_bytes(BLOB);

    cache
        .add(&digest, Some(&Descriptor::new(digest.clone(), 100)), None)
        .unwrap();

    let err = locator(&stream, &connector, &cache, &metrics)
        .stat(&digest)
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::DescriptorMismatch {
                expected: 100,
                actual: 200,
                ..
            }
        ),
        "{err:?}"
    );
    assert_eq!(cache.get(&digest).unwrap().size, 100);
}

#[tokio::test]
async fn remembered_store_reporting_a_new_size_is_a_descriptor_mismatch() {
    let stream = Arc::new(history());
    let r1 = Arc::new(MemoryRemote::with_blob(BLOB));
    let connector = Arc::new(FakeConnector::new().with_remote(R1, Arc::clone(&r1)));
    let cache = cache();
    let digest = Digest::from_bytes(BLOB);
    let locator = locator(&stream, &connector, &cache, &Arc::new(Metrics::disabled()));
    let size = BLOB.len() as u64;

    assert_eq!(locator.stat(&digest).await.unwrap().size, size);
    let identify = stream.identify_count();

    r1.report_size(200);
    let err = locator.stat(&digest).await.unwrap_err();
    assert!(
        matches!(err, Error::DescriptorMismatch { expected, actual: 200, .. } if expected == size),
        "{err:?}"
    );
    assert!(matches!(
        locator.open(&digest).await,
        Err(Error::DescriptorMismatch { actual: 200, .. })
    ));
    assert!(matches!(
        locator.get(&digest).await,
        Err(Error::DescriptorMismatch { actual: 200, .. })
    ));

    // No fallthrough to a fresh resolution.
    assert_eq!(stream.identify_count(), identify);
    assert_eq!(connector.connects(), vec![R1]);
    assert_eq!(cache.get(&digest).unwrap().size, size);
}

#[tokio::test]
async fn catalog_failures_surface_without_probing() {
    let digest = Digest::from_bytes(BLOB);
    let cache = cache();
    let metrics = Arc::new(Metrics::disabled());

    let cases = [
        (FakeImageStream::missing(), "BLOB_UNKNOWN"),
        (
            FakeImageStream::failing(CatalogError::NotFound("ns/app".into())),
            "BLOB_UNKNOWN",
        ),
        (
            FakeImageStream::failing(CatalogError::Forbidden("ns/app".into())),
            "DENIED",
        ),
        (
            FakeImageStream::failing(CatalogError::Unavailable("etcd timeout".into())),
            "UNKNOWN",
        ),
    ];

    for (stream, code) in cases {
        let stream = Arc::new(stream);
        let connector = Arc::new(FakeConnector::new());
        let err = locator(&stream, &connector, &cache, &metrics)
            .stat(&digest)
            .await
            .unwrap_err();
        assert_eq!(err.code(), code, "{err:?}");
        assert!(connector.connects().is_empty());
        assert_eq!(stream.identify_count(), 0);
    }
}

#[tokio::test]
async fn unavailable_catalog_maps_to_catalog_unavailable() {
    let stream = Arc::new(FakeImageStream::failing(CatalogError::Unavailable(
        "etcd timeout".into(),
    )));
    let connector = Arc::new(FakeConnector::new());
    let err = locator(&stream, &connector, &cache(), &Arc::new(Metrics::disabled()))
        .stat(&Digest::from_bytes(BLOB))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CatalogUnavailable(_)));
}

#[tokio::test]
async fn exhausted_candidates_are_blob_unknown() {
    let stream = Arc::new(history());
    let connector = Arc::new(FakeConnector::new());
    let cache = cache();
    let digest = Digest::from_bytes(BLOB);

    let err = locator(&stream, &connector, &cache, &Arc::new(Metrics::disabled()))
        .stat(&digest)
        .await
        .unwrap_err();
    assert!(err.is_blob_unknown());
    assert_eq!(connector.connects(), vec![R1, R2, R3]);
    assert!(cache.repositories(&digest).is_empty());
}

#[tokio::test]
async fn stale_resolved_store_falls_back_to_resolution() {
    let stream = Arc::new(history());
    let r1 = Arc::new(MemoryRemote::with_blob(BLOB));
    let r2 = Arc::new(MemoryRemote::with_blob(BLOB));
    let connector = Arc::new(
        FakeConnector::new()
            .with_remote(R1, Arc::clone(&r1))
            .with_remote(R2, Arc::clone(&r2)),
    );
    let cache = cache();
    let digest = Digest::from_bytes(BLOB);
    let locator = locator(&stream, &connector, &cache, &Arc::new(Metrics::disabled()));

    locator.stat(&digest).await.unwrap();
    assert_eq!(r2.stat_count(), 0);

    r1.forget(&digest);
    let desc = locator.stat(&digest).await.unwrap();
    assert_eq!(desc.size, BLOB.len() as u64);
    assert_eq!(r2.stat_count(), 1);
    assert_eq!(
        cache.repositories(&digest),
        vec![R1.to_string(), R2.to_string()]
    );
}

#[tokio::test]
async fn lookups_are_counted() {
    let stream = Arc::new(history());
    let connector = Arc::new(
        FakeConnector::new()
            .with_remote(R1, Arc::new(MemoryRemote::new()))
            .with_remote(R2, Arc::new(MemoryRemote::with_blob(BLOB))),
    );
    let metrics = Arc::new(Metrics::new(true));
    let digest = Digest::from_bytes(BLOB);
    let locator = locator(&stream, &connector, &cache(), &metrics);

    locator.stat(&digest).await.unwrap();
    locator.stat(&digest).await.unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(
        snapshot.counter(metrics::RESOLVED_STORE_CACHE_REQUESTS, &[("type", "Miss")]),
        Some(1.0)
    );
    assert_eq!(
        snapshot.counter(metrics::RESOLVED_STORE_CACHE_REQUESTS, &[("type", "Hit")]),
        Some(1.0)
    );
    assert_eq!(
        snapshot.counter(
            metrics::REMOTE_ERRORS,
            &[
                ("registry", "r1.example.com"),
                ("operation", "stat"),
                ("code", "BLOB_UNKNOWN")
            ]
        ),
        Some(1.0)
    );
    let r2_stats = snapshot
        .histogram(
            metrics::REMOTE_REQUEST_DURATION,
            &[("registry", "r2.example.com"), ("operation", "stat")],
        )
        .unwrap();
    assert_eq!(r2_stats.count, 2);
}

#[tokio::test]
async fn repository_stat_is_answered_from_the_scoped_cache() {
    let stream = Arc::new(history());
    let remote = Arc::new(MemoryRemote::with_blob(BLOB));
    let connector = Arc::new(FakeConnector::new().with_remote(R1, Arc::clone(&remote)));
    let registry = Registry::new(
        Arc::new(MemoryStore::new()),
        Arc::new(FakeCatalog {
            stream: Arc::clone(&stream),
        }),
        connector,
    )
    .with_cache(cache())
    .with_pullthrough(true, false);
    let digest = Digest::from_bytes(BLOB);

    let blobs = registry.repository("ns/app").unwrap();
    assert_eq!(blobs.stat(&digest).await.unwrap().size, BLOB.len() as u64);
    assert!(registry.cache().contains_repository(&digest, "ns/app"));
    assert!(registry.cache().contains_repository(&digest, R1));

    let blobs = registry.repository("ns/app").unwrap();
    blobs.stat(&digest).await.unwrap();
    assert_eq!(remote.stat_count(), 1);
    assert_eq!(stream.exists_calls.load(Ordering::SeqCst), 1);

    blobs.forget(&digest);
    assert!(!registry.cache().contains_repository(&digest, "ns/app"));
}
