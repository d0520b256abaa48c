use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{OciError, Result};

// ---------------------------------------------------------------------------
// Digest
// ---------------------------------------------------------------------------

/// An algorithm-prefixed content hash, e.g. `sha256:9f86d0…`.
///
/// Digests are validated on construction and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse and validate a digest string.
    ///
    /// The algorithm component is `[a-z0-9]+([+._-][a-z0-9]+)*`; the encoded
    /// part must be lowercase hex. `sha256` and `sha512` digests must carry
    /// exactly 64 and 128 hex characters.
    pub fn parse(raw: &str) -> Result<Self> {
        let (algorithm, hex) = raw
            .split_once(':')
            .ok_or_else(|| OciError::InvalidDigest(raw.to_string()))?;

        let algorithm_ok = !algorithm.is_empty()
            && algorithm
                .split(['+', '.', '_', '-'])
                .all(|part| {
                    !part.is_empty()
                        && part
                            .chars()
                            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                });
        let hex_ok = !hex.is_empty()
            && hex
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));

        let length_ok = match algorithm {
            "sha256" => hex.len() == 64,
            "sha512" => hex.len() == 128,
            _ => true,
        };

        if !algorithm_ok || !hex_ok || !length_ok {
            return Err(OciError::InvalidDigest(raw.to_string()));
        }

        Ok(Self(raw.to_string()))
    }

    /// Compute the sha256 digest of `data`.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(format!("sha256:{}", hex_encode(&Sha256::digest(data))))
    }

    /// Build a digest from a finished sha256 hasher.
    pub fn from_sha256(hasher: Sha256) -> Self {
        Self(format!("sha256:{}", hex_encode(&hasher.finalize())))
    }

    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or_default()
    }

    /// The encoded (hex) portion after the colon.
    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, h)| h).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether content can be checked against this digest locally. Only
    /// sha256 is hashed on write.
    pub fn is_verifiable(&self) -> bool {
        self.algorithm() == "sha256"
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = OciError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// Metadata describing a blob. Two descriptors for the same digest obtained
/// from different sources must agree on digest and size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub digest: Digest,

    pub size: u64,

    #[serde(rename = "mediaType")]
    pub media_type: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

impl Descriptor {
    pub fn new(digest: Digest, size: u64) -> Self {
        Self {
            digest,
            size,
            media_type: MEDIA_TYPE_OCTET_STREAM.to_string(),
            urls: Vec::new(),
        }
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = media_type.into();
        self
    }

    /// Media type differences are tolerated; digest and size are not.
    pub fn agrees_with(&self, other: &Descriptor) -> bool {
        self.digest == other.digest && self.size == other.size
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
