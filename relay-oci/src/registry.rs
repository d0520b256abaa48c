use std::sync::Mutex;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::descriptor::{Descriptor, Digest, MEDIA_TYPE_OCTET_STREAM};
use crate::error::{OciError, Result};
use crate::reference::is_docker_hub;

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Username/password pair for a registry.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }
}

/// Credentials keyed by registry host. Docker Hub aliases share one entry.
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    entries: Vec<(String, Credentials)>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, registry: impl Into<String>, credentials: Credentials) {
        let registry = registry.into();
        self.entries.retain(|(host, _)| host != &registry);
        self.entries.push((registry, credentials));
    }

    pub fn lookup(&self, registry: &str) -> Option<&Credentials> {
        self.entries
            .iter()
            .find(|(host, _)| {
                host == registry || (is_docker_hub(host) && is_docker_hub(registry))
            })
            .map(|(_, c)| c)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// Shared HTTP client for talking to remote registries. Cheap to clone.
#[derive(Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
    retries: u32,
    retry_interval: Duration,
}

/// Return the scheme(s) to try for a registry host, in order.
/// Loopback registries only speak HTTP; insecure registries fall back from
/// HTTPS to HTTP on transport failure.
fn registry_schemes(host: &str, insecure: bool) -> &'static [&'static str] {
    let bare = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
    let bare = bare.trim_start_matches('[').trim_end_matches(']');
    if bare == "localhost" || bare == "127.0.0.1" || bare == "::1" {
        &["http"]
    } else if insecure {
        &["https", "http"]
    } else {
        &["https"]
    }
}

impl RegistryClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("relay-registry/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            retries: 2,
            retry_interval: Duration::from_millis(500),
        })
    }

    /// Retry transient network failures `retries` times, `interval` apart.
    pub fn with_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.retries = retries;
        self.retry_interval = interval;
        self
    }

    /// Bind the client to one remote repository.
    ///
    /// `registry_url` may carry a scheme (`https://quay.io`) or be a bare host.
    pub fn repository(
        &self,
        registry_url: &str,
        repository: &str,
        insecure: bool,
        credentials: Option<Credentials>,
    ) -> RemoteRepository {
        let host = registry_url
            .split_once("://")
            .map(|(_, h)| h)
            .unwrap_or(registry_url)
            .trim_end_matches('/')
            .to_string();
        let base_urls = registry_schemes(&host, insecure)
            .iter()
            .map(|scheme| format!("{}://{}", scheme, host))
            .collect();

        RemoteRepository {
            client: self.clone(),
            host,
            repository: repository.to_string(),
            base_urls,
            credentials,
            token: Mutex::new(None),
        }
    }
}

// ---------------------------------------------------------------------------
// RemoteRepository
// ---------------------------------------------------------------------------

/// Blob access to a single repository on a remote registry.
pub struct RemoteRepository {
    client: RegistryClient,
    host: String,
    repository: String,
    base_urls: Vec<String>,
    credentials: Option<Credentials>,
    token: Mutex<Option<String>>,
}

impl RemoteRepository {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// `HEAD` the blob and build its descriptor from the response headers.
    pub async fn stat_blob(&self, digest: &Digest) -> Result<Descriptor> {
        let resp = self.blob_request(Method::HEAD, digest).await?;

        let size = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                OciError::Registry(format!(
                    "HEAD {} on {} returned no content length",
                    digest, self.host
                ))
            })?;

        if let Some(reported) = resp
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
        {
            if reported != digest.as_str() {
                return Err(OciError::DigestMismatch {
                    expected: digest.to_string(),
                    actual: reported.to_string(),
                });
            }
        }

        let media_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(MEDIA_TYPE_OCTET_STREAM);

        Ok(Descriptor::new(digest.clone(), size).with_media_type(media_type))
    }

    /// Download a blob into memory. Verifies sha256 content.
    pub async fn fetch_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let resp = self.blob_request(Method::GET, digest).await?;
        let data = resp.bytes().await?.to_vec();
        verify_sha256(digest, Sha256::new_with_prefix(&data))?;
        Ok(data)
    }

    /// Stream a blob into an anonymous temporary file and return it rewound
    /// to the start. Verifies sha256 content.
    pub async fn open_blob(&self, digest: &Digest) -> Result<tokio::fs::File> {
        let resp = self.blob_request(Method::GET, digest).await?;

        let mut file = tokio::fs::File::from_std(tempfile::tempfile()?);
        let mut hasher = Sha256::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        verify_sha256(digest, hasher)?;

        file.seek(std::io::SeekFrom::Start(0)).await?;
        Ok(file)
    }

    // -- internals ----------------------------------------------------------

    async fn blob_request(&self, method: Method, digest: &Digest) -> Result<reqwest::Response> {
        let path = format!("blobs/{}", digest);
        let resp = self.send(method.clone(), &path).await?;

        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::NOT_FOUND => Err(OciError::BlobNotFound(digest.clone())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(OciError::Unauthorized(
                format!("{} {}/{}", method, self.host, self.repository),
            )),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(OciError::Registry(format!(
                    "{} {} on {}/{} returned {}: {}",
                    method, path, self.host, self.repository, status, body
                )))
            }
        }
    }

    /// Try each base URL in turn; move to the next only on transport errors.
    async fn send(&self, method: Method, path: &str) -> Result<reqwest::Response> {
        let mut last_err = None;
        for base in &self.base_urls {
            let url = format!("{}/v2/{}/{}", base, self.repository, path);
            match self.send_with_retry(&method, &url).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() => {
                    debug!(%url, error = %e, "registry endpoint unreachable");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            OciError::Registry(format!("no endpoint for registry {}", self.host))
        }))
    }

    async fn send_with_retry(&self, method: &Method, url: &str) -> Result<reqwest::Response> {
        let mut attempt = 0;
        loop {
            match self.authenticated(method, url).await {
                Err(e) if e.is_transient() && attempt < self.client.retries => {
                    attempt += 1;
                    debug!(%url, attempt, "retrying after transient error");
                    tokio::time::sleep(self.client.retry_interval).await;
                }
                other => return other,
            }
        }
    }

    /// Perform a request with anonymous-then-challenge auth flow.
    async fn authenticated(&self, method: &Method, url: &str) -> Result<reqwest::Response> {
        let resp = self.authorize(self.client.client.request(method.clone(), url)).send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let retry = self.client.client.request(method.clone(), url);
        let retry = if challenge.to_ascii_lowercase().starts_with("bearer") {
            let token = self.fetch_bearer_token(&challenge).await?;
            let req = retry.header(AUTHORIZATION, format!("Bearer {}", token));
            if let Ok(mut slot) = self.token.lock() {
                *slot = Some(token);
            }
            req
        } else if let Some(creds) = &self.credentials {
            retry.basic_auth(&creds.username, Some(creds.password.expose_secret()))
        } else {
            return Ok(resp);
        };

        Ok(retry.send().await?)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.lock().ok().and_then(|t| t.clone()) {
            Some(token) => req.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => req,
        }
    }

    /// Parse a `www-authenticate: Bearer realm="…",service="…",scope="…"`
    /// header and fetch a token, presenting credentials when we have them.
    async fn fetch_bearer_token(&self, www_auth: &str) -> Result<String> {
        let realm = extract_param(www_auth, "realm").unwrap_or_default();
        let service = extract_param(www_auth, "service").unwrap_or_default();
        let scope = extract_param(www_auth, "scope")
            .unwrap_or_else(|| format!("repository:{}:pull", self.repository));

        if realm.is_empty() {
            return Err(OciError::Registry(
                "www-authenticate header missing realm".to_string(),
            ));
        }

        let token_url = format!("{}?service={}&scope={}", realm, service, scope);
        debug!(%token_url, "fetching bearer token");

        let mut req = self.client.client.get(&token_url);
        if let Some(creds) = &self.credentials {
            req = req.basic_auth(&creds.username, Some(creds.password.expose_secret()));
        }
        let resp = req.send().await?;
        if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::FORBIDDEN {
            return Err(OciError::Unauthorized(format!(
                "token endpoint {} refused credentials",
                realm
            )));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(OciError::Registry(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        let token = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| OciError::Registry("token response missing token field".to_string()))?;

        Ok(token.to_string())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn verify_sha256(digest: &Digest, hasher: Sha256) -> Result<()> {
    if digest.algorithm() != "sha256" {
        return Ok(());
    }
    let actual = Digest::from_sha256(hasher);
    if &actual != digest {
        return Err(OciError::DigestMismatch {
            expected: digest.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Extract a parameter value from a `www-authenticate` header.
/// E.g. `extract_param(header, "realm")` returns the value of `realm="…"`.
fn extract_param(header: &str, param: &str) -> Option<String> {
    let search = format!("{}=\"", param);
    if let Some(start) = header.find(&search) {
        let value_start = start + search.len();
        if let Some(end) = header[value_start..].find('"') {
            return Some(header[value_start..value_start + end].to_string());
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
