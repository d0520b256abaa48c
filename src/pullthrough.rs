//! Pull-through blob store.
//!
//! Serves blobs from local storage when present and from remote
//! repositories otherwise. With mirroring enabled, the first request for a
//! missing blob also starts a detached background copy into local storage;
//! concurrent requests for the same digest only stream.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use relay_oci::{Descriptor, Digest};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, info_span, Instrument};

use crate::blob::{
    serve_content, BlobReader, BlobRequest, BlobSource, BlobWriter, LocalBlobStore,
    ResponseWriter,
};
use crate::error::Result;
use crate::limiter::AdmissionLimiter;

const COPY_BUFFER: usize = 32 * 1024;

// ---------------------------------------------------------------------------
// In-flight set
// ---------------------------------------------------------------------------

/// Digests with a background mirror copy running.
#[derive(Debug, Default)]
pub struct InflightSet {
    digests: Mutex<HashSet<Digest>>,
}

impl InflightSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<Digest>> {
        self.digests.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark `digest` in flight. `None` if it already was.
    pub fn try_claim(self: &Arc<Self>, digest: &Digest) -> Option<InflightGuard> {
        if !self.lock().insert(digest.clone()) {
            return None;
        }
        Some(InflightGuard {
            set: Arc::clone(self),
            digest: digest.clone(),
        })
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.lock().contains(digest)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Clears the in-flight marker when dropped.
#[derive(Debug)]
pub struct InflightGuard {
    set: Arc<InflightSet>,
    digest: Digest,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.digest);
    }
}

// ---------------------------------------------------------------------------
// copy_content
// ---------------------------------------------------------------------------

/// Where [`copy_content`] sends the blob.
pub enum ContentSink<'a> {
    /// An HTTP response: headers, ranges and conditional requests are handled.
    Response {
        writer: &'a mut dyn ResponseWriter,
        request: &'a BlobRequest,
    },
    /// A raw writer receiving exactly `size` bytes.
    Writer(&'a mut dyn BlobWriter),
}

/// Stat `digest` on `source` and copy its content into `sink`.
pub async fn copy_content(
    source: &dyn BlobSource,
    digest: &Digest,
    sink: ContentSink<'_>,
) -> Result<Descriptor> {
    let desc = source.stat(digest).await?;
    let mut reader = source.open(digest).await?;

    match sink {
        ContentSink::Response { writer, request } => {
            serve_content(writer, request, &desc, &mut reader).await?;
        }
        ContentSink::Writer(writer) => {
            let mut remaining = desc.size;
            let mut buf = vec![0u8; COPY_BUFFER];
            while remaining > 0 {
                let want = remaining.min(COPY_BUFFER as u64) as usize;
                let n = reader.read(&mut buf[..want]).await?;
                if n == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("{} ended {} bytes early", digest, remaining),
                    )
                    .into());
                }
                writer.write(&buf[..n]).await?;
                remaining -= n as u64;
            }
        }
    }
    Ok(desc)
}

/// Copy a remote blob into the local store. The write is committed on
/// success and cancelled on any failure.
pub async fn store_local(
    local: &dyn LocalBlobStore,
    remote: &dyn BlobSource,
    digest: &Digest,
) -> Result<Descriptor> {
    let mut writer = local.create_writer().await?;
    match copy_content(remote, digest, ContentSink::Writer(writer.as_mut())).await {
        Ok(desc) => writer.commit(&desc).await,
        Err(e) => {
            if let Err(cancel) = writer.cancel().await {
                debug!(%digest, error = %cancel, "failed to cancel local write");
            }
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// PullThroughBlobStore
// ---------------------------------------------------------------------------

pub struct PullThroughBlobStore {
    local: Arc<dyn LocalBlobStore>,
    remote: Arc<dyn BlobSource>,
    limiter: Option<Arc<AdmissionLimiter>>,
    inflight: Arc<InflightSet>,
    mirror: bool,
}

impl PullThroughBlobStore {
    pub fn new(
        local: Arc<dyn LocalBlobStore>,
        remote: Arc<dyn BlobSource>,
        inflight: Arc<InflightSet>,
    ) -> Self {
        Self {
            local,
            remote,
            limiter: None,
            inflight,
            mirror: false,
        }
    }

    /// Copy pulled-through blobs into local storage in the background.
    pub fn with_mirroring(mut self, mirror: bool) -> Self {
        self.mirror = mirror;
        self
    }

    /// Gate background copies through `limiter`.
    pub fn with_limiter(mut self, limiter: Option<Arc<AdmissionLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Describe a blob from local storage, or from a remote repository when
    /// not present locally. Never mirrors.
    pub async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        match self.local.stat(digest).await {
            Err(e) if e.is_blob_unknown() => self.remote.stat(digest).await,
            Err(e) => {
                error!(%digest, error = %e, "unable to stat local blob");
                Err(e)
            }
            ok => ok,
        }
    }

    /// Read a whole blob. Never mirrors.
    pub async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        match self.local.get(digest).await {
            Ok(data) => Ok(data),
            Err(e) => {
                debug!(%digest, error = %e, "local get failed, trying remote");
                self.remote.get(digest).await
            }
        }
    }

    /// Serve a blob over HTTP, mirroring it locally in the background when
    /// it had to be pulled through.
    pub async fn serve_blob(
        &self,
        writer: &mut dyn ResponseWriter,
        request: &BlobRequest,
        digest: &Digest,
    ) -> Result<Descriptor> {
        match self.local.serve_blob(writer, request, digest).await {
            Err(e) if e.is_blob_unknown() => {}
            Err(e) => {
                error!(%digest, error = %e, "unable to serve local blob");
                return Err(e);
            }
            ok => return ok,
        }

        if self.mirror {
            match self.inflight.try_claim(digest) {
                Some(guard) => self.store_local_in_background(digest.clone(), guard),
                None => info!(%digest, "serving blob while it is mirrored in the background"),
            }
        }

        copy_content(
            self.remote.as_ref(),
            digest,
            ContentSink::Response { writer, request },
        )
        .await
    }

    /// Spawn the mirror copy. It runs in its own span and does not observe
    /// the triggering request's cancellation.
    fn store_local_in_background(&self, digest: Digest, guard: InflightGuard) {
        let local = Arc::clone(&self.local);
        let remote = Arc::clone(&self.remote);
        let limiter = self.limiter.clone();
        let span = info_span!("mirror", %digest);

        tokio::spawn(
            async move {
                // Owning the guard here clears the marker on every exit,
                // admission rejection included; a rejected digest can be
                // mirrored by a later request.
                let _guard = guard;

                let _permit = match &limiter {
                    Some(limiter) => match limiter.start().await {
                        Some(permit) => Some(permit),
                        None => {
                            info!("skipped background mirroring: write limits reached");
                            return;
                        }
                    },
                    None => None,
                };

                info!("start background mirroring");
                match store_local(local.as_ref(), remote.as_ref(), &digest).await {
                    Ok(desc) => info!(size = desc.size, "completed background mirroring"),
                    Err(e) => error!(error = %e, "background mirroring failed"),
                }
            }
            .instrument(span),
        );
    }
}

#[async_trait]
impl BlobSource for PullThroughBlobStore {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        PullThroughBlobStore::stat(self, digest).await
    }

    async fn open(&self, digest: &Digest) -> Result<BlobReader> {
        match self.local.open(digest).await {
            Err(e) if e.is_blob_unknown() => self.remote.open(digest).await,
            other => other,
        }
    }

    async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        PullThroughBlobStore::get(self, digest).await
    }

    async fn serve_blob(
        &self,
        writer: &mut dyn ResponseWriter,
        request: &BlobRequest,
        digest: &Digest,
    ) -> Result<Descriptor> {
        PullThroughBlobStore::serve_blob(self, writer, request, digest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BufferedResponse;
    use crate::error::Error;
    use std::io::Cursor;

    struct OneBlob {
        data: Vec<u8>,
        size: u64,
    }

    #[async_trait]
    impl BlobSource for OneBlob {
        async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
            Ok(Descriptor::new(digest.clone(), self.size))
        }

        async fn open(&self, _digest: &Digest) -> Result<BlobReader> {
            Ok(Box::new(Cursor::new(self.data.clone())))
        }
    }

    #[derive(Default)]
    struct RecordingWriter {
        data: Vec<u8>,
    }

    #[async_trait]
    impl BlobWriter for RecordingWriter {
        async fn write(&mut self, chunk: &[u8]) -> Result<()> {
            self.data.extend_from_slice(chunk);
            Ok(())
        }

        async fn commit(self: Box<Self>, desc: &Descriptor) -> Result<Descriptor> {
            Ok(desc.clone())
        }

        async fn cancel(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn guard_clears_marker_on_drop() {
        let set = Arc::new(InflightSet::new());
        let d = Digest::from_bytes(b"x");

        let guard = set.try_claim(&d).unwrap();
        assert!(set.contains(&d));
        assert!(set.try_claim(&d).is_none());

        drop(guard);
        assert!(set.is_empty());
        assert!(set.try_claim(&d).is_some());
    }

    #[tokio::test]
    async fn copy_to_writer_copies_exactly_size_bytes() {
        let source = OneBlob {
            data: b"0123456789trailing".to_vec(),
            size: 10,
        };
        let mut writer = RecordingWriter::default();
        let desc = copy_content(&source, &Digest::from_bytes(b"x"), ContentSink::Writer(&mut writer))
            .await
            .unwrap();

        assert_eq!(desc.size, 10);
        assert_eq!(writer.data, b"0123456789");
    }

    #[tokio::test]
    async fn copy_to_writer_fails_on_short_content() {
        let source = OneBlob {
            data: b"short".to_vec(),
            size: 10,
        };
        let mut writer = RecordingWriter::default();
        let err = copy_content(&source, &Digest::from_bytes(b"x"), ContentSink::Writer(&mut writer))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn copy_to_response_sets_headers() {
        let data = b"payload".to_vec();
        let digest = Digest::from_bytes(&data);
        let source = OneBlob {
            size: data.len() as u64,
            data,
        };
        let mut response = BufferedResponse::new();
        let request = BlobRequest::get();
        copy_content(
            &source,
            &digest,
            ContentSink::Response {
                writer: &mut response,
                request: &request,
            },
        )
        .await
        .unwrap();

        assert_eq!(response.body, b"payload");
        assert_eq!(response.header("docker-content-digest"), Some(digest.as_str()));
        assert_eq!(response.header("content-length"), Some("7"));
    }
}
