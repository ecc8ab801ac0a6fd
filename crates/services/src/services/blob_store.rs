use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use db::models::artifact::ContentRef;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

const LOCATOR_PREFIX: &str = "sha256:";

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Blob not found: {0}")]
    NotFound(String),
    #[error("Invalid blob locator: {0}")]
    InvalidLocator(String),
    #[error("Blob {locator} failed its checksum")]
    ChecksumMismatch { locator: String },
}

/// A blob after it has been written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub locator: String,
    pub byte_size: i64,
    pub checksum: String,
}

impl StoredBlob {
    pub fn into_content_ref(self, mime_type: impl Into<String>) -> ContentRef {
        ContentRef {
            content_locator: self.locator,
            mime_type: mime_type.into(),
            byte_size: self.byte_size,
            checksum: self.checksum,
        }
    }
}

/// Content-addressed storage for artifact bytes. Storing identical bytes twice
/// yields the same locator.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: &[u8]) -> Result<StoredBlob, BlobStoreError>;

    async fn get(&self, locator: &str) -> Result<Bytes, BlobStoreError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn describe(bytes: &[u8]) -> StoredBlob {
    let checksum = sha256_hex(bytes);
    StoredBlob {
        locator: format!("{LOCATOR_PREFIX}{checksum}"),
        byte_size: bytes.len() as i64,
        checksum,
    }
}

/// Hex digest named by `locator`, rejecting anything that could escape the store.
fn digest_of(locator: &str) -> Result<&str, BlobStoreError> {
    let digest = locator
        .strip_prefix(LOCATOR_PREFIX)
        .ok_or_else(|| BlobStoreError::InvalidLocator(locator.to_string()))?;
    if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        return Err(BlobStoreError::InvalidLocator(locator.to_string()));
    }
    Ok(digest)
}

/// Blobs on local disk under `<root>/<first two hex chars>/<digest>`
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, BlobStoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, digest: &str) -> PathBuf {
        self.root.join(&digest[..2]).join(digest)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, bytes: &[u8]) -> Result<StoredBlob, BlobStoreError> {
        let blob = describe(bytes);
        let path = self.path_for(&blob.checksum);
        if fs::try_exists(&path).await? {
            return Ok(blob);
        }

        let Some(dir) = path.parent() else {
            return Err(BlobStoreError::InvalidLocator(blob.locator));
        };
        fs::create_dir_all(dir).await?;

        // Write beside the target and rename so readers never see a partial blob
        let tmp = dir.join(format!(".{}.{}.tmp", blob.checksum, Uuid::new_v4()));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;

        tracing::debug!(locator = %blob.locator, byte_size = blob.byte_size, "Stored blob");
        Ok(blob)
    }

    async fn get(&self, locator: &str) -> Result<Bytes, BlobStoreError> {
        let digest = digest_of(locator)?;
        let bytes = match fs::read(self.path_for(digest)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobStoreError::NotFound(locator.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        if sha256_hex(&bytes) != digest {
            tracing::error!(locator = %locator, "Blob content does not match its locator");
            return Err(BlobStoreError::ChecksumMismatch {
                locator: locator.to_string(),
            });
        }
        Ok(Bytes::from(bytes))
    }
}

/// Process-local store for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Bytes>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: &[u8]) -> Result<StoredBlob, BlobStoreError> {
        let blob = describe(bytes);
        self.blobs
            .entry(blob.locator.clone())
            .or_insert_with(|| Bytes::copy_from_slice(bytes));
        Ok(blob)
    }

    async fn get(&self, locator: &str) -> Result<Bytes, BlobStoreError> {
        digest_of(locator)?;
        self.blobs
            .get(locator)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BlobStoreError::NotFound(locator.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn local_store_round_trips_and_deduplicates() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path()).unwrap();

        let first = store.put(b"frame one").await.unwrap();
        let again = store.put(b"frame one").await.unwrap();
        let other = store.put(b"frame two").await.unwrap();

        assert_eq!(first, again);
        assert_ne!(first.locator, other.locator);
        assert!(first.locator.starts_with("sha256:"));
        assert_eq!(first.byte_size, 9);
        assert_eq!(store.get(&first.locator).await.unwrap().as_ref(), b"frame one");

        let digest = &first.checksum;
        assert!(dir.path().join(&digest[..2]).join(digest).exists());
    }

    #[tokio::test]
    async fn local_store_detects_tampered_blob() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path()).unwrap();
        let blob = store.put(b"original").await.unwrap();

        std::fs::write(store.path_for(&blob.checksum), b"tampered").unwrap();
        assert!(matches!(
            store.get(&blob.locator).await,
            Err(BlobStoreError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn locators_outside_the_store_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::new(dir.path()).unwrap();

        for locator in ["../etc/passwd", "sha256:../../x", "md5:abcd", "sha256:ABCDEF"] {
            assert!(matches!(
                store.get(locator).await,
                Err(BlobStoreError::InvalidLocator(_))
            ));
        }
        let missing = format!("sha256:{}", "0".repeat(64));
        assert!(matches!(store.get(&missing).await, Err(BlobStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn memory_store_matches_local_addressing() {
        let memory = MemoryBlobStore::new();
        let dir = TempDir::new().unwrap();
        let local = LocalBlobStore::new(dir.path()).unwrap();

        let a = memory.put(b"same bytes").await.unwrap();
        let b = local.put(b"same bytes").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(memory.len(), 1);

        let content = a.into_content_ref("image/png");
        assert_eq!(content.mime_type, "image/png");
        assert_eq!(memory.get(&content.content_locator).await.unwrap().as_ref(), b"same bytes");
    }
}
