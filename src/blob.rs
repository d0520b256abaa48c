//! Blob collaborator seams.
//!
//! The pull-through engine only talks to storage through these traits:
//! [`BlobSource`] for anything that can describe and stream blobs (local
//! store, remote repository), [`LocalBlobStore`] for the store mirrored
//! blobs are written into, and [`RemoteConnector`] for opening remote
//! repositories. Implementations for the `relay-oci` filesystem store and
//! HTTP client live at the bottom of this module.

use std::io::SeekFrom;
use std::sync::Arc;

use async_trait::async_trait;
use relay_oci::{
    BlobStore, BlobUpload, Descriptor, Digest, Keyring, RegistryClient, RemoteRepository,
};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::error::Result;

const COPY_BUFFER: usize = 32 * 1024;

/// Upper bound on buffer space reserved up front from a reported size.
const PREALLOC_LIMIT: u64 = 1 << 20;

pub const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Anything that can be read and repositioned.
pub trait SeekableRead: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> SeekableRead for T {}

pub type BlobReader = Box<dyn SeekableRead>;

// ---------------------------------------------------------------------------
// HTTP sink
// ---------------------------------------------------------------------------

/// The parts of an inbound request that affect how a blob is served.
#[derive(Debug, Clone)]
pub struct BlobRequest {
    pub method: Method,
    pub headers: HeaderMap,
}

impl BlobRequest {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: HeaderMap::new(),
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn head() -> Self {
        Self::new(Method::HEAD)
    }

    pub fn with_header(mut self, name: header::HeaderName, value: &str) -> Self {
        if let Ok(v) = HeaderValue::from_str(value) {
            self.headers.insert(name, v);
        }
        self
    }
}

/// An HTTP response under construction. Status and headers must be set
/// before the first body write.
#[async_trait]
pub trait ResponseWriter: Send {
    fn set_status(&mut self, status: StatusCode);

    fn headers_mut(&mut self) -> &mut HeaderMap;

    async fn write_body(&mut self, chunk: &[u8]) -> std::io::Result<()>;
}

/// In-memory response, for callers that need the whole body.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[async_trait]
impl ResponseWriter for BufferedResponse {
    fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_body(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.body.extend_from_slice(chunk);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// A store that can describe and stream blobs.
#[async_trait]
pub trait BlobSource: Send + Sync {
    /// Describe a blob, or `Error::BlobUnknown` when it is not here.
    async fn stat(&self, digest: &Digest) -> Result<Descriptor>;

    async fn open(&self, digest: &Digest) -> Result<BlobReader>;

    /// Read the whole blob into memory.
    async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let desc = self.stat(digest).await?;
        let mut reader = self.open(digest).await?;
        let mut buf = Vec::with_capacity(desc.size.min(PREALLOC_LIMIT) as usize);
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Write the blob to an HTTP response, honouring range and conditional
    /// request headers.
    async fn serve_blob(
        &self,
        writer: &mut dyn ResponseWriter,
        request: &BlobRequest,
        digest: &Digest,
    ) -> Result<Descriptor> {
        let desc = self.stat(digest).await?;
        let mut reader = self.open(digest).await?;
        serve_content(writer, request, &desc, &mut reader).await?;
        Ok(desc)
    }
}

/// A staged blob write. Ends with exactly one of `commit` or `cancel`.
#[async_trait]
pub trait BlobWriter: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// Verify against `desc` and make the blob visible.
    async fn commit(self: Box<Self>, desc: &Descriptor) -> Result<Descriptor>;

    async fn cancel(self: Box<Self>) -> Result<()>;
}

/// The local store pulled-through blobs are mirrored into.
#[async_trait]
pub trait LocalBlobStore: BlobSource {
    async fn create_writer(&self) -> Result<Box<dyn BlobWriter>>;
}

/// Opens a blob source on a remote repository. Implementations own their
/// retry policy and authentication.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(
        &self,
        registry_url: &str,
        repository: &str,
        insecure: bool,
        keyring: &Keyring,
    ) -> Result<Arc<dyn BlobSource>>;
}

// ---------------------------------------------------------------------------
// serve_content
// ---------------------------------------------------------------------------

/// A parsed single `Range: bytes=` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteRange {
    /// Serve `start..=end`.
    Satisfiable { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parse a `Range` header against a blob of `size` bytes. Multi-range and
/// malformed headers are ignored (`None`), which serves the full body.
fn parse_range(value: &str, size: u64) -> Option<ByteRange> {
    let spec = value.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    let range = if start.is_empty() {
        let suffix: u64 = end.parse().ok()?;
        if suffix == 0 || size == 0 {
            ByteRange::Unsatisfiable
        } else {
            ByteRange::Satisfiable {
                start: size.saturating_sub(suffix),
                end: size - 1,
            }
        }
    } else {
        let start: u64 = start.parse().ok()?;
        let end: u64 = if end.is_empty() {
            size.saturating_sub(1)
        } else {
            end.parse().ok()?
        };
        if end < start {
            return None;
        }
        if start >= size {
            ByteRange::Unsatisfiable
        } else {
            ByteRange::Satisfiable {
                start,
                end: end.min(size - 1),
            }
        }
    };
    Some(range)
}

fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    if_none_match
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || candidate == etag || candidate.trim_matches('"') == etag.trim_matches('"'))
}

fn set_header(writer: &mut dyn ResponseWriter, name: header::HeaderName, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        writer.headers_mut().insert(name, v);
    }
}

/// Serve `desc`'s content from a seekable reader as an HTTP response.
pub async fn serve_content(
    writer: &mut dyn ResponseWriter,
    request: &BlobRequest,
    desc: &Descriptor,
    reader: &mut BlobReader,
) -> Result<()> {
    let etag = format!("\"{}\"", desc.digest);
    set_header(writer, header::CONTENT_TYPE, &desc.media_type);
    set_header(
        writer,
        header::HeaderName::from_static(DOCKER_CONTENT_DIGEST),
        desc.digest.as_str(),
    );
    set_header(writer, header::ETAG, &etag);
    set_header(writer, header::ACCEPT_RANGES, "bytes");

    if let Some(inm) = request
        .headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if etag_matches(inm, &etag) {
            writer.set_status(StatusCode::NOT_MODIFIED);
            return Ok(());
        }
    }

    let range = request
        .headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range(v, desc.size));

    let (start, len) = match range {
        Some(ByteRange::Unsatisfiable) => {
            set_header(writer, header::CONTENT_RANGE, &format!("bytes */{}", desc.size));
            writer.set_status(StatusCode::RANGE_NOT_SATISFIABLE);
            return Ok(());
        }
        Some(ByteRange::Satisfiable { start, end }) => {
            set_header(
                writer,
                header::CONTENT_RANGE,
                &format!("bytes {}-{}/{}", start, end, desc.size),
            );
            writer.set_status(StatusCode::PARTIAL_CONTENT);
            (start, end - start + 1)
        }
        None => {
            writer.set_status(StatusCode::OK);
            (0, desc.size)
        }
    };
    set_header(writer, header::CONTENT_LENGTH, &len.to_string());

    if request.method == Method::HEAD {
        return Ok(());
    }

    if start > 0 {
        reader.seek(SeekFrom::Start(start)).await?;
    }
    let mut remaining = len;
    let mut buf = vec![0u8; COPY_BUFFER];
    while remaining > 0 {
        let want = remaining.min(COPY_BUFFER as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} ended {} bytes early", desc.digest, remaining),
            )
            .into());
        }
        writer.write_body(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// relay-oci implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl BlobSource for BlobStore {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        Ok(BlobStore::stat(self, digest).await?)
    }

    async fn open(&self, digest: &Digest) -> Result<BlobReader> {
        Ok(Box::new(BlobStore::open(self, digest).await?))
    }

    async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        Ok(BlobStore::read(self, digest).await?)
    }
}

#[async_trait]
impl LocalBlobStore for BlobStore {
    async fn create_writer(&self) -> Result<Box<dyn BlobWriter>> {
        Ok(Box::new(self.create_upload().await?))
    }
}

#[async_trait]
impl BlobWriter for BlobUpload {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        Ok(BlobUpload::write(self, chunk).await?)
    }

    async fn commit(self: Box<Self>, desc: &Descriptor) -> Result<Descriptor> {
        Ok(BlobUpload::commit(*self, desc).await?)
    }

    async fn cancel(self: Box<Self>) -> Result<()> {
        Ok(BlobUpload::cancel(*self).await?)
    }
}

#[async_trait]
impl BlobSource for RemoteRepository {
    async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        Ok(self.stat_blob(digest).await?)
    }

    async fn open(&self, digest: &Digest) -> Result<BlobReader> {
        Ok(Box::new(self.open_blob(digest).await?))
    }

    async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        Ok(self.fetch_blob(digest).await?)
    }
}

/// Connects to remote repositories over HTTP(S) with the `relay-oci` client.
#[derive(Clone)]
pub struct HttpConnector {
    client: RegistryClient,
}

impl HttpConnector {
    pub fn new(client: RegistryClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteConnector for HttpConnector {
    async fn connect(
        &self,
        registry_url: &str,
        repository: &str,
        insecure: bool,
        keyring: &Keyring,
    ) -> Result<Arc<dyn BlobSource>> {
        let host = registry_url
            .split_once("://")
            .map(|(_, h)| h)
            .unwrap_or(registry_url);
        let credentials = keyring.lookup(host).cloned();
        Ok(Arc::new(self.client.repository(
            registry_url,
            repository,
            insecure,
            credentials,
        )))
    }
}
