use std::path::{Path, PathBuf};

use sha2::{Digest as _, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::descriptor::{Descriptor, Digest};
use crate::error::{OciError, Result};

/// Content-addressed blob store under `<root>/blobs/<algorithm>/<hex>`.
///
/// Uploads are staged under `<root>/uploads/` and only become visible once
/// committed, so readers never observe a partially written blob.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn blobs_dir(&self, algorithm: &str) -> PathBuf {
        self.root.join("blobs").join(algorithm)
    }

    fn uploads_dir(&self) -> PathBuf {
        self.root.join("uploads")
    }

    /// Return the expected path for a blob with the given digest.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir(digest.algorithm()).join(digest.hex())
    }

    pub async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        let meta = fs::metadata(self.blob_path(digest))
            .await
            .map_err(|e| not_found_or_io(e, digest))?;
        Ok(Descriptor::new(digest.clone(), meta.len()))
    }

    pub async fn open(&self, digest: &Digest) -> Result<fs::File> {
        fs::File::open(self.blob_path(digest))
            .await
            .map_err(|e| not_found_or_io(e, digest))
    }

    pub async fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        fs::read(self.blob_path(digest))
            .await
            .map_err(|e| not_found_or_io(e, digest))
    }

    /// Start a new upload transaction.
    pub async fn create_upload(&self) -> Result<BlobUpload> {
        let dir = self.uploads_dir();
        fs::create_dir_all(&dir).await?;

        let id = uuid::Uuid::now_v7().to_string();
        let path = dir.join(&id);
        let file = fs::File::create(&path).await?;
        debug!(upload = %id, "created upload");

        Ok(BlobUpload {
            id,
            path,
            file,
            hasher: Sha256::new(),
            written: 0,
            store: self.clone(),
        })
    }

    /// Return a reference to the store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn not_found_or_io(e: std::io::Error, digest: &Digest) -> OciError {
    if e.kind() == std::io::ErrorKind::NotFound {
        OciError::BlobNotFound(digest.clone())
    } else {
        OciError::Io(e)
    }
}

/// An in-progress upload. Exactly one of [`BlobUpload::commit`] or
/// [`BlobUpload::cancel`] should end it; dropping it leaves the staged file
/// behind under `uploads/`.
pub struct BlobUpload {
    id: String,
    path: PathBuf,
    file: fs::File,
    hasher: Sha256,
    written: u64,
    store: BlobStore,
}

impl BlobUpload {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf).await?;
        self.hasher.update(buf);
        self.written += buf.len() as u64;
        Ok(())
    }

    /// Verify the written content against `expected` and move it into place.
    /// On any failure the staged file is removed.
    pub async fn commit(mut self, expected: &Descriptor) -> Result<Descriptor> {
        match self.finish(expected).await {
            Ok(desc) => Ok(desc),
            Err(e) => {
                self.discard().await;
                Err(e)
            }
        }
    }

    async fn finish(&mut self, expected: &Descriptor) -> Result<Descriptor> {
        // Content is only addressable under a digest we can recompute.
        if !expected.digest.is_verifiable() {
            return Err(OciError::UnsupportedDigest(expected.digest.clone()));
        }

        self.file.flush().await?;
        self.file.sync_all().await?;

        if self.written != expected.size {
            return Err(OciError::SizeMismatch {
                digest: expected.digest.clone(),
                expected: expected.size,
                actual: self.written,
            });
        }

        let actual = Digest::from_sha256(self.hasher.clone());
        if actual != expected.digest {
            return Err(OciError::DigestMismatch {
                expected: expected.digest.to_string(),
                actual: actual.to_string(),
            });
        }

        let target = self.store.blob_path(&expected.digest);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&self.path, &target).await?;
        debug!(upload = %self.id, path = %target.display(), "committed blob");

        Ok(Descriptor {
            size: self.written,
            ..expected.clone()
        })
    }

    pub async fn cancel(self) -> Result<()> {
        debug!(upload = %self.id, "cancelled upload");
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn discard(&self) {
        let _ = fs::remove_file(&self.path).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
