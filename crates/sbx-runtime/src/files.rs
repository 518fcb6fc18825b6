//! Virtual file operations scoped to a sandbox workspace.
//!
//! Path resolution is purely lexical: absolute paths and parent-directory
//! segments are rejected before anything touches the filesystem, so a
//! hostile path can never name a file outside the workspace root.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use sbx_core::error::{Error, Result};

/// Resolve a client-supplied relative path against the workspace root.
pub fn resolve_path(workspace_root: &Path, rel: &str) -> Result<PathBuf> {
    if rel.is_empty() {
        return Err(Error::invalid("Empty path"));
    }
    let path = Path::new(rel);
    if path.is_absolute() {
        return Err(Error::invalid(format!("Absolute path not allowed: {:?}", rel)));
    }
    let mut clean = PathBuf::from(workspace_root);
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                clean.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            _ => {
                return Err(Error::invalid(format!(
                    "Path escapes workspace: {:?}",
                    rel
                )));
            }
        }
    }
    if depth == 0 {
        return Err(Error::invalid(format!("Path names nothing: {:?}", rel)));
    }
    Ok(clean)
}

/// Write a file atomically: temp file in the destination directory, then rename.
pub async fn write_file(workspace_root: &Path, rel: &str, bytes: &[u8]) -> Result<()> {
    let dest = resolve_path(workspace_root, rel)?;
    let parent = dest
        .parent()
        .ok_or_else(|| Error::invalid(format!("Path has no parent: {:?}", rel)))?
        .to_path_buf();
    tokio::fs::create_dir_all(&parent).await?;

    let tmp = tokio::task::spawn_blocking(move || tempfile::NamedTempFile::new_in(parent))
        .await
        .map_err(|e| Error::fatal(format!("tempfile task: {}", e)))??;
    let (file, tmp_path) = tmp
        .keep()
        .map_err(|e| Error::fatal(format!("keep tempfile: {}", e)))?;

    let mut file = tokio::fs::File::from_std(file);
    let result = async {
        tokio::io::AsyncWriteExt::write_all(&mut file, bytes).await?;
        file.sync_all().await?;
        Ok::<(), Error>(())
    }
    .await;
    drop(file);
    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp_path, &dest).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}

pub async fn read_file(workspace_root: &Path, rel: &str) -> Result<Vec<u8>> {
    let path = resolve_path(workspace_root, rel)?;
    tokio::fs::read(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::not_found(format!("No file at {:?}", rel))
        } else {
            e.into()
        }
    })
}

/// One entry in a workspace directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size_bytes: u64,
}

pub async fn list_dir(workspace_root: &Path, rel: &str) -> Result<Vec<DirEntry>> {
    let path = if rel.is_empty() || rel == "." {
        workspace_root.to_path_buf()
    } else {
        resolve_path(workspace_root, rel)?
    };
    let mut reader = tokio::fs::read_dir(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::not_found(format!("No directory at {:?}", rel))
        } else {
            e.into()
        }
    })?;

    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let meta = entry.metadata().await?;
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            size_bytes: if meta.is_dir() { 0 } else { meta.len() },
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Delete a file or directory tree inside the workspace. Idempotent.
pub async fn delete_file(workspace_root: &Path, rel: &str) -> Result<()> {
    let path = resolve_path(workspace_root, rel)?;
    let meta = match tokio::fs::symlink_metadata(&path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        tokio::fs::remove_dir_all(&path).await?;
    } else {
        tokio::fs::remove_file(&path).await?;
    }
    Ok(())
}
