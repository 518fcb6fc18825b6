use std::time::Duration;

use async_trait::async_trait;
use opendal::layers::RetryLayer;
use opendal::{ErrorKind, Operator, services};
use tokio::io::AsyncReadExt;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::debug;

use sbx_core::config::StorageConfig;
use sbx_core::error::{Error, Result};

use crate::{BlobReader, BlobStore, validate_key};

/// Minimum multipart part size accepted by S3-compatible providers.
const MIN_PART_BYTES: u64 = 5 * 1024 * 1024;

/// S3-compatible object store.
///
/// Writes stream through the operator; payloads at or above the multipart
/// threshold are uploaded in parts (each at least 5 MiB except the last).
/// A failed upload is aborted so no incomplete multipart state is left
/// behind. Transient transport errors are retried with exponential backoff
/// by the retry layer.
pub struct ObjectStore {
    op: Operator,
    chunk_bytes: usize,
}

impl ObjectStore {
    pub fn new(config: &StorageConfig, multipart_threshold_bytes: u64) -> Result<Self> {
        let s3 = &config.s3;
        let mut builder = services::S3::default()
            .bucket(&s3.bucket)
            .access_key_id(&s3.access_key)
            .secret_access_key(&s3.secret_key);
        if !s3.endpoint.is_empty() {
            builder = builder.endpoint(&s3.endpoint);
        }
        if !s3.region.is_empty() {
            builder = builder.region(&s3.region);
        }

        let retry = RetryLayer::new()
            .with_max_times(config.retry_attempts as usize)
            .with_min_delay(Duration::from_millis(config.retry_base_delay_ms))
            .with_factor(2.0)
            .with_jitter();

        let op = Operator::new(builder)
            .map_err(map_err)?
            .layer(retry)
            .finish();

        Ok(Self {
            op,
            chunk_bytes: multipart_threshold_bytes.max(MIN_PART_BYTES) as usize,
        })
    }
}

#[async_trait]
impl BlobStore for ObjectStore {
    async fn put(&self, key: &str, mut reader: BlobReader) -> Result<u64> {
        validate_key(key)?;

        let mut writer = self
            .op
            .writer_with(key)
            .chunk(self.chunk_bytes)
            .await
            .map_err(map_err)?;

        let mut written: u64 = 0;
        let mut buf = vec![0u8; 256 * 1024];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    // Abort so the provider drops any in-progress multipart parts.
                    let _ = writer.abort().await;
                    return Err(e.into());
                }
            };
            if let Err(e) = writer.write(buf[..n].to_vec()).await {
                let _ = writer.abort().await;
                return Err(map_err(e));
            }
            written += n as u64;
        }

        writer.close().await.map_err(map_err)?;
        debug!(key, bytes = written, "object written");
        Ok(written)
    }

    async fn get(&self, key: &str) -> Result<BlobReader> {
        validate_key(key)?;
        let meta = self.op.stat(key).await.map_err(map_err)?;
        let reader = self.op.reader(key).await.map_err(map_err)?;
        let stream = reader
            .into_futures_async_read(0..meta.content_length())
            .await
            .map_err(map_err)?;
        Ok(Box::new(stream.compat()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self
            .op
            .list_with(prefix)
            .recursive(true)
            .await
            .map_err(map_err)?;
        let mut keys: Vec<String> = entries
            .into_iter()
            .filter(|e| !e.path().ends_with('/'))
            .map(|e| e.path().to_string())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.op.delete(key).await.map_err(map_err)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.op.exists(key).await.map_err(map_err)
    }
}

/// Map opendal errors into the control-plane taxonomy.
fn map_err(e: opendal::Error) -> Error {
    match e.kind() {
        ErrorKind::NotFound => Error::not_found(e.to_string()),
        ErrorKind::RateLimited => Error::transient(e.to_string()),
        _ if e.is_temporary() => Error::transient(e.to_string()),
        _ => Error::fatal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbx_core::config::StorageConfig;

    fn s3_config() -> StorageConfig {
        let mut config = StorageConfig::default();
        config.s3.bucket = "snapshots".to_string();
        config.s3.endpoint = "http://127.0.0.1:9000".to_string();
        config.s3.region = "us-east-1".to_string();
        config.s3.access_key = "test".to_string();
        config.s3.secret_key = "test".to_string();
        config
    }

    #[test]
    fn test_construct_with_endpoint() {
        let store = ObjectStore::new(&s3_config(), 16 * 1024 * 1024).unwrap();
        assert_eq!(store.chunk_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn test_chunk_never_below_part_minimum() {
        let store = ObjectStore::new(&s3_config(), 1024).unwrap();
        assert_eq!(store.chunk_bytes, MIN_PART_BYTES as usize);
    }

    #[test]
    fn test_error_mapping() {
        let nf = opendal::Error::new(ErrorKind::NotFound, "no such key");
        assert!(matches!(map_err(nf), Error::NotFound(_)));

        let rl = opendal::Error::new(ErrorKind::RateLimited, "slow down");
        assert!(map_err(rl).is_transient());

        let other = opendal::Error::new(ErrorKind::Unexpected, "boom");
        assert!(matches!(map_err(other), Error::Fatal(_)));
    }
}
