use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use sbx_core::error::{Error, Result};

use crate::{BlobReader, BlobStore, validate_key};

/// Local-filesystem blob store.
///
/// Keys map to paths under a configured root. Writes land in a temporary
/// file in the destination directory and are renamed into place, so a
/// concurrent reader or `list` never observes a partial object.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn put(&self, key: &str, mut reader: BlobReader) -> Result<u64> {
        let dest = self.path_for(key)?;
        let parent = dest
            .parent()
            .ok_or_else(|| Error::invalid(format!("Key has no parent: {:?}", key)))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        // Temp file in the destination directory so the final rename is
        // within one filesystem and therefore atomic.
        let tmp = tokio::task::spawn_blocking(move || tempfile::NamedTempFile::new_in(parent))
            .await
            .map_err(|e| Error::fatal(format!("tempfile task: {}", e)))??;
        let (tmp_file, tmp_path) = tmp
            .keep()
            .map_err(|e| Error::fatal(format!("keep tempfile: {}", e)))?;

        let mut file = tokio::fs::File::from_std(tmp_file);
        let written = match tokio::io::copy(&mut reader, &mut file).await {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(e.into());
            }
        };
        if let Err(e) = file.sync_all().await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp_path, &dest).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!(key, bytes = written, "blob written");
        Ok(written)
    }

    async fn get(&self, key: &str) -> Result<BlobReader> {
        let path = self.path_for(key)?;
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("No blob at key {:?}", key))
            } else {
                e.into()
            }
        })?;
        Ok(Box::new(file))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        if !prefix.is_empty() {
            // A prefix is a key fragment, so only the per-segment rules apply.
            for segment in prefix.trim_end_matches('/').split('/') {
                if segment.is_empty() || segment == "." || segment == ".." {
                    return Err(Error::invalid(format!("Bad prefix {:?}", prefix)));
                }
            }
        }
        let root = self.root.clone();
        let prefix = prefix.to_string();

        let mut keys = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut keys = Vec::new();
            let mut stack = vec![root.clone()];
            while let Some(dir) = stack.pop() {
                let entries = match std::fs::read_dir(&dir) {
                    Ok(e) => e,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                for entry in entries {
                    let entry = entry?;
                    let path = entry.path();
                    let name = entry.file_name();
                    if entry.file_type()?.is_dir() {
                        stack.push(path);
                    } else if name.to_string_lossy().starts_with(".tmp") {
                        // In-flight put; not yet an object.
                        continue;
                    } else if let Some(key) = relative_key(&root, &path) {
                        if key.starts_with(&prefix) {
                            keys.push(key);
                        }
                    }
                }
            }
            Ok(keys)
        })
        .await
        .map_err(|e| Error::fatal(format!("list task: {}", e)))??;

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

/// Relative slash-separated key for a path under `root`.
fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel.iter().filter_map(|c| c.to_str()).collect();
    Some(parts.join("/"))
}
