// sbx-storage: Blob storage behind a single trait, with a local-filesystem
// driver and an S3-compatible object-store driver.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use sbx_core::config::{Config, StorageBackend};
use sbx_core::error::{Error, Result};

pub mod local;
pub mod object;

pub use local::LocalStore;
pub use object::ObjectStore;

/// Streaming blob payload.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Storage backend contract.
///
/// Implementations are thread-safe; callers never coordinate around them.
/// `put` is atomic — a reader can never observe a half-written object —
/// and `delete` on a missing key succeeds.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write a blob, replacing any existing object under `key`.
    /// Returns the number of bytes written.
    async fn put(&self, key: &str, reader: BlobReader) -> Result<u64>;

    /// Open a blob for streaming reads. Missing keys are `NotFound`.
    async fn get(&self, key: &str) -> Result<BlobReader>;

    /// List keys under a prefix in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete a blob. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<u64> {
        self.put(key, Box::new(std::io::Cursor::new(bytes))).await
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let mut reader = self.get(key).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

/// Construct the configured storage backend.
pub fn open_store(config: &Config) -> Result<Arc<dyn BlobStore>> {
    match config.storage.backend {
        StorageBackend::Local => Ok(Arc::new(LocalStore::new(config.storage.root.clone())?)),
        StorageBackend::S3 => Ok(Arc::new(ObjectStore::new(
            &config.storage,
            config.snapshot.multipart_threshold_bytes,
        )?)),
    }
}

/// Validate a storage key: relative, slash-separated, no empty or dot segments.
///
/// Keys become filesystem paths in the local driver, so traversal through
/// the key namespace must be impossible.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > 1024 {
        return Err(Error::invalid(format!("Bad key length: {}", key.len())));
    }
    if key.starts_with('/') || key.ends_with('/') {
        return Err(Error::invalid(format!(
            "Key must be relative without trailing slash: {:?}",
            key
        )));
    }
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(Error::invalid(format!("Bad key segment in {:?}", key)));
        }
    }
    if key.chars().any(|c| c.is_control() || c == '\\') {
        return Err(Error::invalid(format!("Bad character in key {:?}", key)));
    }
    Ok(())
}
