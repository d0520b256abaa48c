use crate::descriptor::Digest;

/// Errors produced by the registry client and the filesystem blob store.
#[derive(Debug, thiserror::Error)]
pub enum OciError {
    #[error("registry error: {0}")]
    Registry(String),

    #[error("invalid reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("invalid digest {0:?}")]
    InvalidDigest(String),

    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigest(Digest),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("size mismatch for {digest}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        digest: Digest,
        expected: u64,
        actual: u64,
    },

    #[error("access denied: {0}")]
    Unauthorized(String),

    #[error("blob unknown: {0}")]
    BlobNotFound(Digest),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OciError {
    /// Whether the error is worth retrying against the same endpoint.
    pub fn is_transient(&self) -> bool {
        match self {
            OciError::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }

    /// Short machine-readable code, used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            OciError::BlobNotFound(_) => "BLOB_UNKNOWN",
            OciError::Unauthorized(_) => "DENIED",
            OciError::DigestMismatch { .. }
            | OciError::InvalidDigest(_)
            | OciError::UnsupportedDigest(_) => "DIGEST_INVALID",
            OciError::SizeMismatch { .. } => "SIZE_INVALID",
            OciError::InvalidReference { .. } => "NAME_INVALID",
            _ => "UNKNOWN",
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OciError>;
