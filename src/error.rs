//! Error types for relay-registry

use relay_oci::{Digest, OciError};
use thiserror::Error;

/// Result type alias using relay-registry Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving and serving blobs
#[derive(Error, Debug)]
pub enum Error {
    /// No local store or candidate repository holds the digest
    #[error("blob unknown to registry: {0}")]
    BlobUnknown(Digest),

    /// Catalog access was forbidden, or a remote refused our credentials
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Catalog lookup failed for reasons other than not-found/forbidden
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// Two sources disagree on the size of the same digest
    #[error("descriptor mismatch for {digest}: expected {expected} bytes, got {actual}")]
    DescriptorMismatch {
        digest: Digest,
        expected: u64,
        actual: u64,
    },

    /// The digest does not match the key it was cached under
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    /// Repository name is not `<namespace>/<name>`
    #[error("invalid repository name: {0}")]
    NameInvalid(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors from the remote client or the filesystem store
    #[error("remote error: {0}")]
    Remote(OciError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML deserialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Whether this error means "not here", so callers may try elsewhere.
    pub fn is_blob_unknown(&self) -> bool {
        matches!(self, Error::BlobUnknown(_))
    }

    /// Short machine-readable code, used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            Error::BlobUnknown(_) => "BLOB_UNKNOWN",
            Error::AccessDenied(_) => "DENIED",
            Error::DescriptorMismatch { .. } => "SIZE_INVALID",
            Error::DigestMismatch { .. } => "DIGEST_INVALID",
            Error::NameInvalid(_) => "NAME_INVALID",
            Error::Remote(e) => e.code(),
            _ => "UNKNOWN",
        }
    }
}

impl From<OciError> for Error {
    fn from(e: OciError) -> Self {
        match e {
            OciError::BlobNotFound(digest) => Error::BlobUnknown(digest),
            OciError::SizeMismatch {
                digest,
                expected,
                actual,
            } => Error::DescriptorMismatch {
                digest,
                expected,
                actual,
            },
            OciError::Unauthorized(msg) => Error::AccessDenied(msg),
            OciError::Io(e) => Error::Io(e),
            other => Error::Remote(other),
        }
    }
}
