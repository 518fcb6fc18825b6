//! Streaming tar + zstd packing and unpacking.
//!
//! Everything here is synchronous and meant to run under
//! `tokio::task::spawn_blocking`; the engine owns the async surface.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tar::{EntryType, Header, HeaderMode};

use sbx_core::error::{Error, Result};

/// Result of packing a workspace.
#[derive(Debug)]
pub struct PackOutput {
    /// Compressed payload size in bytes.
    pub size_bytes: u64,
    /// SHA-256 of the compressed payload, hex-encoded.
    pub digest: String,
    pub entries: u64,
}

struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Pack `src` into a zstd-compressed USTAR archive at `out`.
///
/// Entries use paths relative to `src`. Regular files, directories, and
/// symlinks resolving inside `src` are archived; anything else (devices,
/// FIFOs, sockets, escaping symlinks) is rejected. Entry order is
/// deterministic (sorted per directory).
pub fn pack_workspace(src: &Path, out: &Path, level: i32) -> Result<PackOutput> {
    let file = File::create(out)?;
    let hashing = HashingWriter {
        inner: file,
        hasher: Sha256::new(),
        bytes: 0,
    };
    let encoder = zstd::Encoder::new(hashing, level)
        .map_err(|e| Error::fatal(format!("zstd encoder: {}", e)))?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut entries = 0u64;
    let mut stack: Vec<PathBuf> = vec![src.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut children: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        children.sort();

        for path in children {
            let rel = path
                .strip_prefix(src)
                .map_err(|_| Error::fatal(format!("Path escaped walk root: {:?}", path)))?
                .to_path_buf();
            let meta = std::fs::symlink_metadata(&path)?;
            let file_type = meta.file_type();

            if file_type.is_dir() {
                let mut header = Header::new_ustar();
                header.set_metadata_in_mode(&meta, HeaderMode::Complete);
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder
                    .append_data(&mut header, &rel, std::io::empty())
                    .map_err(Error::from)?;
                stack.push(path);
            } else if file_type.is_file() {
                let mut header = Header::new_ustar();
                header.set_metadata_in_mode(&meta, HeaderMode::Complete);
                let data = File::open(&path)?;
                builder
                    .append_data(&mut header, &rel, data)
                    .map_err(Error::from)?;
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(&path)?;
                validate_symlink_target(src, &path, &target)?;
                let mut header = Header::new_ustar();
                header.set_metadata_in_mode(&meta, HeaderMode::Complete);
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                builder
                    .append_link(&mut header, &rel, &target)
                    .map_err(Error::from)?;
            } else {
                return Err(Error::invalid(format!(
                    "Unsupported file type in workspace: {:?}",
                    rel
                )));
            }
            entries += 1;
        }
    }

    let encoder = builder.into_inner().map_err(Error::from)?;
    let mut hashing = encoder
        .finish()
        .map_err(|e| Error::fatal(format!("zstd finish: {}", e)))?;
    hashing.flush()?;
    hashing.inner.sync_all()?;

    Ok(PackOutput {
        size_bytes: hashing.bytes,
        digest: hex(&hashing.hasher.finalize()),
        entries,
    })
}

/// Unpack a zstd-compressed tar archive from `src` into `dest`.
///
/// Every entry path is validated to stay within `dest` before anything is
/// written; symlink entries with absolute or escaping targets are rejected.
pub fn unpack_archive(src: &Path, dest: &Path, preserve_mtimes: bool) -> Result<u64> {
    let file = File::open(src)?;
    let decoder =
        zstd::Decoder::new(file).map_err(|e| Error::fatal(format!("zstd decoder: {}", e)))?;
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_mtime(preserve_mtimes);
    archive.set_overwrite(true);

    std::fs::create_dir_all(dest)?;

    let mut count = 0u64;
    for entry in archive.entries().map_err(Error::from)? {
        let mut entry = entry.map_err(Error::from)?;
        let path = entry.path().map_err(Error::from)?.into_owned();
        validate_entry_path(&path)?;

        if entry.header().entry_type() == EntryType::Symlink {
            let target = entry
                .link_name()
                .map_err(Error::from)?
                .ok_or_else(|| Error::invalid(format!("Symlink without target: {:?}", path)))?;
            validate_symlink_target(dest, &dest.join(&path), &target)?;
        }

        if !entry.unpack_in(dest).map_err(Error::from)? {
            return Err(Error::invalid(format!(
                "Archive entry escapes target: {:?}",
                path
            )));
        }
        count += 1;
    }
    Ok(count)
}

/// Reject absolute entry paths and parent-directory segments.
fn validate_entry_path(path: &Path) -> Result<()> {
    if path.is_absolute() {
        return Err(Error::invalid(format!(
            "Absolute path in archive: {:?}",
            path
        )));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(Error::invalid(format!(
                    "Disallowed component in archive path: {:?}",
                    path
                )));
            }
        }
    }
    Ok(())
}

/// A symlink at `link_path` must resolve inside `root`.
fn validate_symlink_target(root: &Path, link_path: &Path, target: &Path) -> Result<()> {
    if target.is_absolute() {
        return Err(Error::invalid(format!(
            "Absolute symlink target {:?} -> {:?}",
            link_path, target
        )));
    }
    // Resolve lexically from the link's directory; the workspace may contain
    // dangling links, so filesystem canonicalization is not an option.
    let base = link_path.parent().unwrap_or(root);
    let mut resolved: Vec<std::ffi::OsString> = base
        .strip_prefix(root)
        .unwrap_or(Path::new(""))
        .components()
        .map(|c| c.as_os_str().to_os_string())
        .collect();
    for component in target.components() {
        match component {
            Component::Normal(p) => resolved.push(p.to_os_string()),
            Component::ParentDir => {
                if resolved.pop().is_none() {
                    return Err(Error::invalid(format!(
                        "Symlink escapes workspace: {:?} -> {:?}",
                        link_path, target
                    )));
                }
            }
            Component::CurDir => {}
            _ => {
                return Err(Error::invalid(format!(
                    "Bad symlink target {:?} -> {:?}",
                    link_path, target
                )));
            }
        }
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(path: &Path, contents: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let src = tempfile::tempdir().unwrap();
        write_file(&src.path().join("a.txt"), b"one");
        write_file(&src.path().join("sub/deep/b.txt"), b"two");
        std::fs::create_dir_all(src.path().join("empty")).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("a.txt", src.path().join("link")).unwrap();

        let archive = tempfile::NamedTempFile::new().unwrap();
        let out = pack_workspace(src.path(), archive.path(), 3).unwrap();
        assert!(out.entries >= 4);
        assert!(out.size_bytes > 0);
        assert_eq!(out.digest.len(), 64);

        let dest = tempfile::tempdir().unwrap();
        let count = unpack_archive(archive.path(), dest.path(), true).unwrap();
        assert_eq!(count, out.entries);

        assert_eq!(std::fs::read(dest.path().join("a.txt")).unwrap(), b"one");
        assert_eq!(
            std::fs::read(dest.path().join("sub/deep/b.txt")).unwrap(),
            b"two"
        );
        assert!(dest.path().join("empty").is_dir());
        #[cfg(unix)]
        {
            let target = std::fs::read_link(dest.path().join("link")).unwrap();
            assert_eq!(target, PathBuf::from("a.txt"));
        }
    }

    #[test]
    fn test_pack_preserves_mtime() {
        let src = tempfile::tempdir().unwrap();
        write_file(&src.path().join("old.txt"), b"x");
        let past = filetime::now_minus_one_hour();
        filetime::set_mtime(&src.path().join("old.txt"), past);

        let archive = tempfile::NamedTempFile::new().unwrap();
        pack_workspace(src.path(), archive.path(), 3).unwrap();

        let dest = tempfile::tempdir().unwrap();
        unpack_archive(archive.path(), dest.path(), true).unwrap();

        let restored = std::fs::metadata(dest.path().join("old.txt"))
            .unwrap()
            .modified()
            .unwrap();
        let original = std::fs::metadata(src.path().join("old.txt"))
            .unwrap()
            .modified()
            .unwrap();
        let drift = restored
            .duration_since(original)
            .unwrap_or_else(|e| e.duration());
        assert!(drift.as_secs() <= 1, "mtime drift: {:?}", drift);
    }

    // Minimal mtime helper; std has no portable set-mtime.
    mod filetime {
        use std::path::Path;
        use std::time::{Duration, SystemTime};

        pub fn now_minus_one_hour() -> SystemTime {
            SystemTime::now() - Duration::from_secs(3600)
        }

        pub fn set_mtime(path: &Path, to: SystemTime) {
            let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
            file.set_times(std::fs::FileTimes::new().set_modified(to))
                .unwrap();
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_pack_rejects_escaping_symlink() {
        let src = tempfile::tempdir().unwrap();
        write_file(&src.path().join("ok.txt"), b"x");
        std::os::unix::fs::symlink("../../etc/passwd", src.path().join("evil")).unwrap();

        let archive = tempfile::NamedTempFile::new().unwrap();
        let err = pack_workspace(src.path(), archive.path(), 3).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_pack_rejects_absolute_symlink() {
        let src = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/etc/passwd", src.path().join("abs")).unwrap();

        let archive = tempfile::NamedTempFile::new().unwrap();
        assert!(pack_workspace(src.path(), archive.path(), 3).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_pack_allows_inside_parent_symlink() {
        let src = tempfile::tempdir().unwrap();
        write_file(&src.path().join("a/target.txt"), b"x");
        std::fs::create_dir_all(src.path().join("b")).unwrap();
        std::os::unix::fs::symlink("../a/target.txt", src.path().join("b/link")).unwrap();

        let archive = tempfile::NamedTempFile::new().unwrap();
        assert!(pack_workspace(src.path(), archive.path(), 3).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_pack_rejects_fifo() {
        let src = tempfile::tempdir().unwrap();
        let fifo = src.path().join("pipe");
        let status = std::process::Command::new("mkfifo")
            .arg(&fifo)
            .status()
            .unwrap();
        assert!(status.success(), "mkfifo failed");

        let archive = tempfile::NamedTempFile::new().unwrap();
        let err = pack_workspace(src.path(), archive.path(), 3).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_unpack_rejects_traversal_entry() {
        // Hand-build an archive containing a `../escape` entry.
        let archive = tempfile::NamedTempFile::new().unwrap();
        {
            let encoder = zstd::Encoder::new(File::create(archive.path()).unwrap(), 3)
                .unwrap()
                .auto_finish();
            let mut builder = tar::Builder::new(encoder);
            let data = b"gotcha";
            let mut header = Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "../escape", &data[..])
                .unwrap();
            builder.finish().unwrap();
        }

        let dest = tempfile::tempdir().unwrap();
        let err = unpack_archive(archive.path(), dest.path(), true).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(!dest.path().parent().unwrap().join("escape").exists());
    }

    #[test]
    fn test_validate_entry_path() {
        assert!(validate_entry_path(Path::new("a/b.txt")).is_ok());
        assert!(validate_entry_path(Path::new("./a")).is_ok());
        assert!(validate_entry_path(Path::new("/abs")).is_err());
        assert!(validate_entry_path(Path::new("a/../b")).is_err());
    }

    #[test]
    fn test_deterministic_output() {
        let src = tempfile::tempdir().unwrap();
        write_file(&src.path().join("b.txt"), b"bee");
        write_file(&src.path().join("a.txt"), b"ay");

        let first = tempfile::NamedTempFile::new().unwrap();
        let second = tempfile::NamedTempFile::new().unwrap();
        let out1 = pack_workspace(src.path(), first.path(), 3).unwrap();
        let out2 = pack_workspace(src.path(), second.path(), 3).unwrap();
        assert_eq!(out1.digest, out2.digest);
    }
}
