// sbx-snapshot: Workspace snapshots as zstd-compressed tar archives on a
// blob store, with per-user retention.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use sbx_core::config::{SnapshotConfig, StorageConfig};
use sbx_core::error::{Error, Result};
use sbx_core::naming;
use sbx_core::observability::Metrics;
use sbx_core::retry::retry;
use sbx_storage::BlobStore;

pub mod archive;

/// Snapshot record: payload address plus sidecar metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub user_id: String,
    /// Sandbox the snapshot was taken from, when known.
    #[serde(default)]
    pub sandbox_id: Option<String>,
    pub created_at: String,
    pub size_bytes: u64,
    pub source_workspace_path: String,
    pub compression: String,
    pub digest: String,
}

/// Snapshot engine over a blob store.
///
/// `create` is all-or-nothing thanks to the store's atomic `put`; `restore`
/// swaps the live workspace atomically or not at all. Callers are expected
/// to have paused workspace writers before calling `create` (the runtime
/// holds the per-sandbox writer gate).
pub struct SnapshotEngine {
    store: Arc<dyn BlobStore>,
    config: SnapshotConfig,
    metrics: Arc<Metrics>,
    retry_attempts: u32,
    retry_base_delay: Duration,
}

impl SnapshotEngine {
    pub fn new(
        store: Arc<dyn BlobStore>,
        config: SnapshotConfig,
        storage: &StorageConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
            retry_attempts: storage.retry_attempts,
            retry_base_delay: Duration::from_millis(storage.retry_base_delay_ms),
        }
    }

    fn payload_key(user_id: &str, snapshot_id: &str) -> String {
        format!("snapshots/{}/{}.tar.zst", user_id, snapshot_id)
    }

    fn meta_key(user_id: &str, snapshot_id: &str) -> String {
        format!("snapshots/{}/{}.json", user_id, snapshot_id)
    }

    fn user_prefix(user_id: &str) -> String {
        format!("snapshots/{}/", user_id)
    }

    /// Archive `source` and store it under the user's snapshot namespace.
    pub async fn create(
        &self,
        user_id: &str,
        sandbox_id: Option<&str>,
        source: &Path,
    ) -> Result<Snapshot> {
        naming::validate_id(user_id, "User")?;
        let snapshot_id = naming::generate_snapshot_id();
        let level = self.config.compression_level;

        let staging = tempfile::NamedTempFile::new()
            .map_err(|e| Error::fatal(format!("snapshot staging file: {}", e)))?;
        let staging_path = staging.path().to_path_buf();

        let pack_src = source.to_path_buf();
        let pack_out = staging_path.clone();
        let packed = tokio::task::spawn_blocking(move || {
            archive::pack_workspace(&pack_src, &pack_out, level)
        })
        .await
        .map_err(|e| Error::fatal(format!("pack task: {}", e)))??;

        let payload = tokio::fs::File::open(&staging_path).await?;
        let key = Self::payload_key(user_id, &snapshot_id);
        self.store.put(&key, Box::new(payload)).await?;

        let snapshot = Snapshot {
            snapshot_id: snapshot_id.clone(),
            user_id: user_id.to_string(),
            sandbox_id: sandbox_id.map(str::to_string),
            created_at: sbx_core::time::utc_now(),
            size_bytes: packed.size_bytes,
            source_workspace_path: source.display().to_string(),
            compression: "zstd".to_string(),
            digest: packed.digest,
        };
        let meta = serde_json::to_vec(&snapshot)?;
        let meta_key = Self::meta_key(user_id, &snapshot_id);
        retry(
            self.retry_attempts,
            self.retry_base_delay,
            "snapshot metadata put",
            || self.store.put_bytes(&meta_key, meta.clone()),
        )
        .await?;

        self.metrics.snapshot_created_total.inc();
        self.metrics
            .snapshot_size_bytes
            .observe(packed.size_bytes as f64);
        info!(
            user = %user_id,
            snapshot = %snapshot_id,
            bytes = packed.size_bytes,
            entries = packed.entries,
            "snapshot created"
        );

        // Retention trims best-effort; the snapshot itself is already durable.
        if let Err(e) = self.enforce_retention(user_id, self.config.retention).await {
            warn!(user = %user_id, error = %e, "retention enforcement failed");
        }

        Ok(snapshot)
    }

    /// Replace `target` with the contents of a snapshot.
    ///
    /// The payload is extracted into a sibling temporary directory first;
    /// the live workspace is only touched once extraction has fully
    /// succeeded, and then only by rename.
    pub async fn restore(&self, user_id: &str, snapshot_id: &str, target: &Path) -> Result<()> {
        naming::validate_id(user_id, "User")?;
        naming::validate_snapshot_id(snapshot_id)?;

        let key = Self::payload_key(user_id, snapshot_id);
        let mut payload = self.store.get(&key).await.map_err(|e| match e {
            Error::NotFound(_) => {
                Error::not_found(format!("Snapshot {} for user {}", snapshot_id, user_id))
            }
            other => other,
        })?;

        let staging = tempfile::NamedTempFile::new()
            .map_err(|e| Error::fatal(format!("restore staging file: {}", e)))?;
        let staging_path = staging.path().to_path_buf();
        {
            let mut out = tokio::fs::File::create(&staging_path).await?;
            tokio::io::copy(&mut payload, &mut out).await?;
            out.sync_all().await?;
        }

        let parent = target
            .parent()
            .ok_or_else(|| Error::invalid(format!("Target has no parent: {:?}", target)))?;
        tokio::fs::create_dir_all(parent).await?;
        let scratch = parent.join(format!(".{}.restore-{}", base_name(target), short_rand()));

        let unpack_src = staging_path.clone();
        let unpack_dest = scratch.clone();
        let preserve = self.config.preserve_mtimes;
        let unpacked = tokio::task::spawn_blocking(move || {
            archive::unpack_archive(&unpack_src, &unpack_dest, preserve)
        })
        .await
        .map_err(|e| Error::fatal(format!("unpack task: {}", e)))?;

        let entries = match unpacked {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&scratch).await;
                return Err(e);
            }
        };

        // Swap: live -> aside, scratch -> live, drop aside.
        let aside = parent.join(format!(".{}.old-{}", base_name(target), short_rand()));
        let had_live = tokio::fs::try_exists(target).await?;
        if had_live {
            tokio::fs::rename(target, &aside).await?;
        }
        if let Err(e) = tokio::fs::rename(&scratch, target).await {
            // Put the live workspace back before surfacing the error.
            if had_live {
                let _ = tokio::fs::rename(&aside, target).await;
            }
            let _ = tokio::fs::remove_dir_all(&scratch).await;
            return Err(e.into());
        }
        if had_live {
            let _ = tokio::fs::remove_dir_all(&aside).await;
        }

        self.metrics.snapshot_restored_total.inc();
        info!(
            user = %user_id,
            snapshot = %snapshot_id,
            entries,
            "snapshot restored"
        );
        Ok(())
    }

    /// All snapshots for a user, newest first.
    pub async fn list(&self, user_id: &str) -> Result<Vec<Snapshot>> {
        naming::validate_id(user_id, "User")?;
        let prefix = Self::user_prefix(user_id);
        let keys = retry(
            self.retry_attempts,
            self.retry_base_delay,
            "snapshot list",
            || self.store.list(&prefix),
        )
        .await?;

        let mut snapshots = Vec::new();
        for key in keys.iter().filter(|k| k.ends_with(".tar.zst")) {
            let snapshot_id = key
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .trim_end_matches(".tar.zst")
                .to_string();
            snapshots.push(self.load_meta(user_id, &snapshot_id).await);
        }

        // Newest first; ids embed the creation timestamp so the id is a
        // stable tiebreaker.
        snapshots.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.snapshot_id.cmp(&a.snapshot_id))
        });
        Ok(snapshots)
    }

    /// Sidecar metadata, or a reconstruction when the sidecar is missing.
    async fn load_meta(&self, user_id: &str, snapshot_id: &str) -> Snapshot {
        let meta_key = Self::meta_key(user_id, snapshot_id);
        if let Ok(bytes) = self.store.get_bytes(&meta_key).await {
            if let Ok(snapshot) = serde_json::from_slice::<Snapshot>(&bytes) {
                return snapshot;
            }
        }
        let created_at = naming::snapshot_created_at(snapshot_id)
            .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_default();
        Snapshot {
            snapshot_id: snapshot_id.to_string(),
            user_id: user_id.to_string(),
            sandbox_id: None,
            created_at,
            size_bytes: 0,
            source_workspace_path: String::new(),
            compression: "zstd".to_string(),
            digest: String::new(),
        }
    }

    /// Delete a snapshot. Missing snapshots are fine; foreign ones are not
    /// reachable because the key namespace is user-scoped.
    pub async fn delete(&self, user_id: &str, snapshot_id: &str) -> Result<()> {
        naming::validate_id(user_id, "User")?;
        naming::validate_snapshot_id(snapshot_id)?;

        let payload_key = Self::payload_key(user_id, snapshot_id);
        let meta_key = Self::meta_key(user_id, snapshot_id);
        retry(
            self.retry_attempts,
            self.retry_base_delay,
            "snapshot delete",
            || self.store.delete(&payload_key),
        )
        .await?;
        retry(
            self.retry_attempts,
            self.retry_base_delay,
            "snapshot meta delete",
            || self.store.delete(&meta_key),
        )
        .await?;
        Ok(())
    }

    /// Trim a user's snapshots to the `keep` most recent.
    pub async fn enforce_retention(&self, user_id: &str, keep: usize) -> Result<()> {
        let snapshots = self.list(user_id).await?;
        for stale in snapshots.iter().skip(keep) {
            info!(
                user = %user_id,
                snapshot = %stale.snapshot_id,
                "retention: deleting snapshot"
            );
            self.delete(user_id, &stale.snapshot_id).await?;
        }
        Ok(())
    }
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workspace".to_string())
}

fn short_rand() -> String {
    let id = uuid::Uuid::new_v4();
    id.as_bytes()[..4]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(
            SnapshotEngine::payload_key("u_a", "snap_2025_06_01_120000_aabb"),
            "snapshots/u_a/snap_2025_06_01_120000_aabb.tar.zst"
        );
        assert_eq!(
            SnapshotEngine::meta_key("u_a", "snap_2025_06_01_120000_aabb"),
            "snapshots/u_a/snap_2025_06_01_120000_aabb.json"
        );
        assert_eq!(SnapshotEngine::user_prefix("u_a"), "snapshots/u_a/");
    }

    #[test]
    fn test_snapshot_meta_roundtrip() {
        let snapshot = Snapshot {
            snapshot_id: "snap_2025_06_01_120000_aabb".to_string(),
            user_id: "u_a".to_string(),
            sandbox_id: Some("sbx-4f2a91aabbcc".to_string()),
            created_at: "2025-06-01T12:00:00Z".to_string(),
            size_bytes: 4096,
            source_workspace_path: "/srv/workspaces/u_a/sbx-4f2a91aabbcc".to_string(),
            compression: "zstd".to_string(),
            digest: "ab".repeat(32),
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: Snapshot = serde_json::from_slice(json.as_bytes()).unwrap();
        assert_eq!(parsed.snapshot_id, snapshot.snapshot_id);
        assert_eq!(parsed.size_bytes, 4096);
        assert_eq!(parsed.sandbox_id.as_deref(), Some("sbx-4f2a91aabbcc"));
    }

    #[test]
    fn test_snapshot_meta_backward_compat() {
        // Sidecars written before sandbox_id existed still parse.
        let json = r#"{
            "snapshot_id": "snap_2025_06_01_120000_aabb",
            "user_id": "u_a",
            "created_at": "2025-06-01T12:00:00Z",
            "size_bytes": 1,
            "source_workspace_path": "/w",
            "compression": "zstd",
            "digest": ""
        }"#;
        let parsed: Snapshot = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.sandbox_id, None);
    }
}
