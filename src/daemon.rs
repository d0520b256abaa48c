use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use relay_oci::Digest;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::blob::{BlobRequest, ResponseWriter};
use crate::error::{Error, Result};
use crate::registry::Registry;

const MAX_HEAD: usize = 64 * 1024;

/// Bind `addr` and serve until the listener fails.
pub async fn serve(addr: SocketAddr, registry: Arc<Registry>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "relay-registry listening");
    run(listener, registry).await
}

/// Bind `addr` and serve in the background, returning the bound address.
pub async fn spawn(addr: SocketAddr, registry: Arc<Registry>) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = run(listener, registry).await {
            error!(error = %e, "daemon stopped");
        }
    });
    Ok(local)
}

async fn run(listener: TcpListener, registry: Arc<Registry>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = handle_stream(stream, registry).await {
                debug!(%peer, error = %e, "connection error");
            }
        });
    }
}

struct ParsedRequest {
    method: Method,
    path: String,
    headers: HeaderMap,
}

async fn read_request(stream: &mut TcpStream) -> Result<Option<ParsedRequest>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(idx) = find_head_end(&buf) {
            break idx;
        }
        if buf.len() > MAX_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            )
            .into());
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]);
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .unwrap_or(Method::GET);
    let path = parts.next().unwrap_or("/").to_string();

    let mut headers = HeaderMap::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) {
            headers.append(name, value);
        }
    }

    Ok(Some(ParsedRequest {
        method,
        path,
        headers,
    }))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn handle_stream(mut stream: TcpStream, registry: Arc<Registry>) -> Result<()> {
    let Some(req) = read_request(&mut stream).await? else {
        return Ok(());
    };
    let path = req.path.split('?').next().unwrap_or("").to_string();

    let is_get = req.method == Method::GET;
    let is_head = req.method == Method::HEAD;

    if is_get && path == "/healthz" {
        return write_simple(&mut stream, StatusCode::OK, "application/json", br#"{"status":"ok"}"#)
            .await;
    }
    if is_get && path == "/metrics" {
        let text = registry.metrics().snapshot().to_prometheus_text();
        return write_simple(
            &mut stream,
            StatusCode::OK,
            "text/plain; version=0.0.4",
            text.as_bytes(),
        )
        .await;
    }
    if !is_get && !is_head {
        return write_error(
            &mut stream,
            StatusCode::METHOD_NOT_ALLOWED,
            "UNSUPPORTED",
            "method not allowed",
        )
        .await;
    }

    match parse_blob_path(&path) {
        Some((name, digest)) => {
            let span = info_span!("blob", repository = %name, %digest, method = %req.method);
            serve_blob(&mut stream, &registry, name, &digest, req)
                .instrument(span)
                .await
        }
        None => write_error(&mut stream, StatusCode::NOT_FOUND, "NOT_FOUND", "route not found").await,
    }
}

/// Split `/v2/<name>/blobs/<digest>`.
fn parse_blob_path(path: &str) -> Option<(&str, String)> {
    let rest = path.strip_prefix("/v2/")?;
    let (name, digest) = rest.rsplit_once("/blobs/")?;
    if name.is_empty() || digest.is_empty() {
        return None;
    }
    Some((name, digest.to_string()))
}

async fn serve_blob(
    stream: &mut TcpStream,
    registry: &Registry,
    name: &str,
    digest: &str,
    req: ParsedRequest,
) -> Result<()> {
    let digest = match Digest::parse(digest) {
        Ok(d) if d.is_verifiable() => d,
        Ok(d) => {
            let message = format!("unsupported digest algorithm: {}", d.algorithm());
            return write_error(stream, StatusCode::BAD_REQUEST, "DIGEST_INVALID", &message).await;
        }
        Err(e) => {
            return write_error(stream, StatusCode::BAD_REQUEST, "DIGEST_INVALID", &e.to_string())
                .await
        }
    };
    let blobs = match registry.repository(name) {
        Ok(b) => b,
        Err(e) => return write_registry_error(stream, &e).await,
    };

    let request = BlobRequest {
        method: req.method,
        headers: req.headers,
    };
    let mut response = StreamResponse::new(stream);
    match blobs.serve_blob(&mut response, &request, &digest).await {
        Ok(desc) => {
            debug!(size = desc.size, "served blob");
            response.finish().await
        }
        Err(e) if !response.head_sent => {
            let stream = response.into_inner();
            write_registry_error(stream, &e).await
        }
        Err(e) => {
            warn!(error = %e, "blob stream aborted");
            Err(e)
        }
    }
}

fn error_status(e: &Error) -> StatusCode {
    match e {
        Error::BlobUnknown(_) => StatusCode::NOT_FOUND,
        Error::NameInvalid(_) => StatusCode::NOT_FOUND,
        Error::AccessDenied(_) => StatusCode::FORBIDDEN,
        Error::CatalogUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn write_registry_error(stream: &mut TcpStream, e: &Error) -> Result<()> {
    let status = error_status(e);
    if status.is_server_error() {
        error!(error = %e, "blob request failed");
    }
    write_error(stream, status, e.code(), &e.to_string()).await
}

async fn write_error(
    stream: &mut TcpStream,
    status: StatusCode,
    code: &str,
    message: &str,
) -> Result<()> {
    let body = json!({ "errors": [{ "code": code, "message": message }] }).to_string();
    write_simple(stream, status, "application/json", body.as_bytes()).await
}

async fn write_simple(
    stream: &mut TcpStream,
    status: StatusCode,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        content_type,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    Ok(())
}

/// Streams a response straight onto the connection. The head goes out with
/// the first body chunk, or at [`StreamResponse::finish`] for bodiless
/// responses.
struct StreamResponse<'a> {
    stream: &'a mut TcpStream,
    status: StatusCode,
    headers: HeaderMap,
    head_sent: bool,
}

impl<'a> StreamResponse<'a> {
    fn new(stream: &'a mut TcpStream) -> Self {
        Self {
            stream,
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            head_sent: false,
        }
    }

    async fn send_head(&mut self) -> std::io::Result<()> {
        let mut head = format!("HTTP/1.1 {}\r\n", self.status);
        for (name, value) in &self.headers {
            head.push_str(name.as_str());
            head.push_str(": ");
            head.push_str(value.to_str().unwrap_or(""));
            head.push_str("\r\n");
        }
        head.push_str("Connection: close\r\n\r\n");
        self.head_sent = true;
        self.stream.write_all(head.as_bytes()).await
    }

    async fn finish(mut self) -> Result<()> {
        if !self.head_sent {
            if !self.headers.contains_key(header::CONTENT_LENGTH) {
                self.headers
                    .insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
            }
            self.send_head().await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    fn into_inner(self) -> &'a mut TcpStream {
        self.stream
    }
}

#[async_trait]
impl ResponseWriter for StreamResponse<'_> {
    fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_body(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        if !self.head_sent {
            self.send_head().await?;
        }
        self.stream.write_all(chunk).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_paths() {
        let (name, digest) = parse_blob_path("/v2/ns/app/blobs/sha256:abc").unwrap();
        assert_eq!(name, "ns/app");
        assert_eq!(digest, "sha256:abc");

        assert!(parse_blob_path("/v2/ns/app/manifests/latest").is_none());
        assert!(parse_blob_path("/v2//blobs/sha256:abc").is_none());
        assert!(parse_blob_path("/healthz").is_none());
    }

    #[test]
    fn head_end_detection() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\n"), Some(14));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn errors_map_to_statuses() {
        let d = Digest::from_bytes(b"x");
        assert_eq!(error_status(&Error::BlobUnknown(d)), StatusCode::NOT_FOUND);
        assert_eq!(
            error_status(&Error::AccessDenied("ns/app".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            error_status(&Error::CatalogUnavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_status(&Error::Config("bad".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
