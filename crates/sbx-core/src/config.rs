use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Which blob-store driver backs snapshot payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Local,
    S3,
}

/// Which isolation driver backs sandboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationBackend {
    /// Probe microvm, then container, then fall back to process.
    Auto,
    Microvm,
    Container,
    Process,
}

/// HTTP server knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8600".to_string(),
        }
    }
}

/// S3-compatible object store settings. Credentials are never logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    #[serde(skip_serializing)]
    pub access_key: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the local driver.
    pub root: PathBuf,
    pub s3: S3Config,
    /// Max attempts for transient backend failures.
    pub retry_attempts: u32,
    /// Backoff after the first failure, doubled per attempt.
    pub retry_base_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            root: PathBuf::from("/var/lib/sandboxd/blobs"),
            s3: S3Config::default(),
            retry_attempts: 5,
            retry_base_delay_ms: 200,
        }
    }
}

/// MicroVM driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MicrovmConfig {
    /// Hypervisor binary; looked up on PATH when not absolute.
    pub binary: String,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    /// Per-VM runtime dirs (control socket, log) live here.
    pub runtime_dir: PathBuf,
    pub default_vcpus: u8,
    pub default_mem_mib: u32,
}

impl Default for MicrovmConfig {
    fn default() -> Self {
        Self {
            binary: "sbx-hypervisor".to_string(),
            kernel_path: PathBuf::from("/var/lib/sandboxd/vmlinux"),
            rootfs_path: PathBuf::from("/var/lib/sandboxd/rootfs.ext4"),
            runtime_dir: PathBuf::from("/run/sandboxd/vms"),
            default_vcpus: 2,
            default_mem_mib: 1024,
        }
    }
}

/// Container driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerConfig {
    /// Container runtime binary (docker-compatible CLI).
    pub runtime_bin: String,
    pub image: String,
    pub hostname_prefix: String,
    /// Where the workspace is bind-mounted inside the guest.
    pub guest_workspace: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime_bin: "docker".to_string(),
            image: "sandboxd/devbox:latest".to_string(),
            hostname_prefix: "sbx".to_string(),
            guest_workspace: "/workspace".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IsolationConfig {
    pub backend: IsolationBackend,
    pub workspaces_root: PathBuf,
    /// Programs the process driver may run. Empty list rejects everything.
    pub process_allowlist: Vec<String>,
    pub microvm: MicrovmConfig,
    pub container: ContainerConfig,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            backend: IsolationBackend::Auto,
            workspaces_root: PathBuf::from("/srv/workspaces"),
            process_allowlist: vec![
                "sh".to_string(),
                "bash".to_string(),
                "echo".to_string(),
                "node".to_string(),
                "python3".to_string(),
            ],
            microvm: MicrovmConfig::default(),
            container: ContainerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotConfig {
    /// How many snapshots to keep per user.
    pub retention: usize,
    /// zstd level, 1-19.
    pub compression_level: i32,
    /// Objects at or above this size go through multipart upload.
    pub multipart_threshold_bytes: u64,
    /// Restore file mtimes bit-for-bit.
    pub preserve_mtimes: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            retention: 5,
            compression_level: 10,
            multipart_threshold_bytes: 16 * 1024 * 1024,
            preserve_mtimes: true,
        }
    }
}

/// Per-sandbox hard caps. Zero disables a cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuotaConfig {
    pub max_exec_per_hour: u32,
    pub max_concurrent_exec: u32,
    pub max_memory_bytes: u64,
    pub max_storage_bytes: u64,
    pub max_egress_bytes: u64,
    pub max_cpu_seconds: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_exec_per_hour: 720,
            max_concurrent_exec: 4,
            max_memory_bytes: 2 * 1024 * 1024 * 1024,
            max_storage_bytes: 10 * 1024 * 1024 * 1024,
            max_egress_bytes: 5 * 1024 * 1024 * 1024,
            max_cpu_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub upstream_timeout_seconds: u64,
    /// Consecutive upstream failures before fallback promotion.
    pub error_budget: u32,
    /// Health-probe attempts against a freshly promoted upstream.
    pub promote_probe_attempts: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_timeout_seconds: 5,
            error_budget: 3,
            promote_probe_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub exec_timeout_seconds: u64,
    /// Keepalive TTL granted to a fresh sandbox.
    pub default_ttl_seconds: u64,
    /// Reaper tick interval.
    pub supervisor_interval_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            exec_timeout_seconds: 30,
            default_ttl_seconds: 1800,
            supervisor_interval_seconds: 30,
        }
    }
}

/// Top-level daemon configuration.
///
/// Loaded from an optional TOML file, then overridden by environment
/// variables. Unknown keys in the file are rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub isolation: IsolationConfig,
    pub snapshot: SnapshotConfig,
    pub quota: QuotaConfig,
    pub proxy: ProxyConfig,
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Load configuration: defaults <- file (if any) <- environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", p.display()))?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply recognized environment variables on top of the current values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("STORAGE_BACKEND") {
            self.storage.backend = match v.as_str() {
                "local" => StorageBackend::Local,
                "s3" => StorageBackend::S3,
                other => bail!("STORAGE_BACKEND must be local|s3, got {:?}", other),
            };
        }
        if let Ok(v) = std::env::var("STORAGE_ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("S3_ENDPOINT") {
            self.storage.s3.endpoint = v;
        }
        if let Ok(v) = std::env::var("S3_BUCKET") {
            self.storage.s3.bucket = v;
        }
        if let Ok(v) = std::env::var("S3_ACCESS_KEY") {
            self.storage.s3.access_key = v;
        }
        if let Ok(v) = std::env::var("S3_SECRET_KEY") {
            self.storage.s3.secret_key = v;
        }
        if let Ok(v) = std::env::var("ISOLATION_BACKEND") {
            self.isolation.backend = match v.as_str() {
                "auto" => IsolationBackend::Auto,
                "microvm" => IsolationBackend::Microvm,
                "container" => IsolationBackend::Container,
                "process" => IsolationBackend::Process,
                other => bail!(
                    "ISOLATION_BACKEND must be auto|microvm|container|process, got {:?}",
                    other
                ),
            };
        }
        if let Ok(v) = std::env::var("WORKSPACES_ROOT") {
            self.isolation.workspaces_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SNAPSHOT_RETENTION") {
            self.snapshot.retention = v
                .parse()
                .with_context(|| format!("SNAPSHOT_RETENTION must be a number, got {:?}", v))?;
        }
        if let Ok(v) = std::env::var("EXEC_TIMEOUT_SECONDS") {
            self.runtime.exec_timeout_seconds = v
                .parse()
                .with_context(|| format!("EXEC_TIMEOUT_SECONDS must be a number, got {:?}", v))?;
        }
        if let Ok(v) = std::env::var("PROXY_UPSTREAM_TIMEOUT_SECONDS") {
            self.proxy.upstream_timeout_seconds = v.parse().with_context(|| {
                format!("PROXY_UPSTREAM_TIMEOUT_SECONDS must be a number, got {:?}", v)
            })?;
        }
        Ok(())
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.snapshot.retention == 0 {
            bail!("snapshot.retention must be at least 1");
        }
        if !(1..=19).contains(&self.snapshot.compression_level) {
            bail!(
                "snapshot.compression_level must be 1-19, got {}",
                self.snapshot.compression_level
            );
        }
        if self.snapshot.multipart_threshold_bytes < 5 * 1024 * 1024 {
            bail!("snapshot.multipart_threshold_bytes must be at least 5 MiB");
        }
        if self.storage.backend == StorageBackend::S3 && self.storage.s3.bucket.is_empty() {
            bail!("S3 storage selected but no bucket configured");
        }
        if self.proxy.error_budget == 0 {
            bail!("proxy.error_budget must be at least 1");
        }
        Ok(())
    }
}
