use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use sbx_core::config::Config;
use sbx_core::error::{Error, Result};
use sbx_core::naming;
use sbx_core::observability::Metrics;
use sbx_isolation::{DriverStream, ExecOutput, IsolationDriver, ResourceCaps};
use sbx_snapshot::{Snapshot, SnapshotEngine};

use crate::files;
use crate::jobs::{JobStatus, JobStatusHandle};
use crate::promote::FallbackProvisioner;
use crate::quota::QuotaBucket;
use crate::sandbox::{
    PreviewTarget, Sandbox, SandboxInner, SandboxStatus, UpstreamDescriptor, validate_transition,
};

/// Options accepted at sandbox creation.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub vcpus: Option<u8>,
    pub mem_mib: Option<u32>,
}

/// Owns every live sandbox and serializes all mutation through per-sandbox
/// locks. Constructed once at service start; handles are passed down, never
/// global.
pub struct SandboxManager {
    config: Config,
    metrics: Arc<Metrics>,
    driver: Arc<dyn IsolationDriver>,
    fallback: Arc<dyn FallbackProvisioner>,
    http: reqwest::Client,
    sandboxes: RwLock<HashMap<String, Arc<Sandbox>>>,
}

impl SandboxManager {
    pub fn new(
        config: Config,
        metrics: Arc<Metrics>,
        driver: Arc<dyn IsolationDriver>,
        fallback: Arc<dyn FallbackProvisioner>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.proxy.upstream_timeout_seconds))
            .timeout(Duration::from_secs(config.proxy.upstream_timeout_seconds))
            .build()
            .map_err(|e| Error::fatal(format!("http client: {}", e)))?;
        Ok(Self {
            config,
            metrics,
            driver,
            fallback,
            http,
            sandboxes: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn IsolationDriver> {
        &self.driver
    }

    /// Create a sandbox: workspace directory, driver provision + start,
    /// quota bucket, keepalive deadline.
    pub async fn create(&self, user_id: &str, options: CreateOptions) -> Result<Arc<Sandbox>> {
        naming::validate_id(user_id, "User")?;
        let sandbox_id = naming::generate_sandbox_id();

        let workspace_root = self
            .config
            .isolation
            .workspaces_root
            .join(user_id)
            .join(&sandbox_id);
        tokio::fs::create_dir_all(&workspace_root).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::Permissions::from_mode(0o700);
            if let Some(user_dir) = workspace_root.parent() {
                tokio::fs::set_permissions(user_dir, mode.clone()).await?;
            }
            tokio::fs::set_permissions(&workspace_root, mode).await?;
        }

        let caps = ResourceCaps {
            vcpus: options
                .vcpus
                .unwrap_or(self.config.isolation.microvm.default_vcpus),
            mem_mib: options
                .mem_mib
                .unwrap_or(self.config.isolation.microvm.default_mem_mib),
        };

        let handle = self
            .driver
            .provision(&sandbox_id, user_id, &workspace_root, &caps)
            .await?;
        if let Err(e) = self.driver.start(&handle).await {
            let _ = self.driver.destroy(&handle, true).await;
            return Err(e);
        }

        validate_transition(SandboxStatus::Creating, SandboxStatus::Running)?;
        let inner = SandboxInner {
            status: SandboxStatus::Running,
            driver: self.driver.clone(),
            handle,
            deadline: Instant::now()
                + Duration::from_secs(self.config.runtime.default_ttl_seconds),
            jobs: Default::default(),
            quota: QuotaBucket::new(self.config.quota.clone()),
        };
        let sandbox = Arc::new(Sandbox::new(
            sandbox_id.clone(),
            user_id.to_string(),
            workspace_root,
            inner,
        ));

        self.sandboxes
            .write()
            .await
            .insert(sandbox_id.clone(), sandbox.clone());
        self.metrics.sandbox_created_total.inc();
        self.metrics.sandbox_active.inc();
        info!(sandbox = %sandbox_id, user = %user_id, driver = %self.driver.kind(), "sandbox created");
        Ok(sandbox)
    }

    /// Owner-checked lookup. A foreign sandbox is indistinguishable from a
    /// missing one.
    pub async fn get(&self, sandbox_id: &str, user_id: &str) -> Result<Arc<Sandbox>> {
        let sandbox = self.lookup(sandbox_id).await?;
        if sandbox.user_id != user_id {
            return Err(Error::not_found(format!("No sandbox {:?}", sandbox_id)));
        }
        Ok(sandbox)
    }

    /// All sandboxes owned by a user.
    pub async fn sandboxes_of(&self, user_id: &str) -> Vec<Arc<Sandbox>> {
        self.sandboxes
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Lookup without an owner check (preview proxy path).
    pub async fn lookup(&self, sandbox_id: &str) -> Result<Arc<Sandbox>> {
        self.sandboxes
            .read()
            .await
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("No sandbox {:?}", sandbox_id)))
    }

    /// Run a command inside the sandbox.
    ///
    /// Holds the write gate (shared) for the duration so snapshot creation
    /// waits out in-flight execs; the sandbox mutex is only held for state
    /// validation and quota admission, never across driver I/O.
    pub async fn exec(
        &self,
        sandbox_id: &str,
        user_id: &str,
        argv: Vec<String>,
        stdin: Option<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput> {
        if argv.is_empty() {
            return Err(Error::invalid("Empty argv"));
        }
        let sandbox = self.get(sandbox_id, user_id).await?;
        let _gate = sandbox.write_gate.read().await;

        let (driver, handle) = {
            let mut inner = sandbox.inner.lock().await;
            if inner.status != SandboxStatus::Running {
                return Err(Error::precondition(format!(
                    "Sandbox is {}, exec requires running",
                    inner.status
                )));
            }
            inner.quota.admit_exec().map_err(|kind| {
                self.metrics.record_quota_violation(kind);
                Error::QuotaExceeded { kind }
            })?;
            (inner.driver.clone(), inner.handle.clone())
        };

        let timeout =
            timeout.unwrap_or(Duration::from_secs(self.config.runtime.exec_timeout_seconds));
        let started = std::time::Instant::now();
        let result = driver.exec(&handle, &argv, stdin, timeout).await;
        let elapsed = started.elapsed();

        {
            let mut inner = sandbox.inner.lock().await;
            inner.quota.release_exec();
            inner.quota.charge_cpu(elapsed.as_secs());
        }
        self.metrics
            .sandbox_exec_total
            .with_label_values(&[sandbox_id, argv[0].as_str()])
            .inc();
        self.metrics
            .sandbox_exec_duration_seconds
            .observe(elapsed.as_secs_f64());
        result
    }

    async fn writable(&self, sandbox_id: &str, user_id: &str) -> Result<Arc<Sandbox>> {
        let sandbox = self.get(sandbox_id, user_id).await?;
        let status = sandbox.inner.lock().await.status;
        if status == SandboxStatus::Destroyed {
            return Err(Error::precondition("Sandbox is destroyed"));
        }
        Ok(sandbox)
    }

    pub async fn write_file(
        &self,
        sandbox_id: &str,
        user_id: &str,
        path: &str,
        bytes: &[u8],
    ) -> Result<()> {
        let sandbox = self.writable(sandbox_id, user_id).await?;
        let _gate = sandbox.write_gate.read().await;
        files::write_file(&sandbox.workspace_root, path, bytes).await?;
        sandbox
            .inner
            .lock()
            .await
            .quota
            .charge_storage(bytes.len() as u64);
        Ok(())
    }

    pub async fn read_file(
        &self,
        sandbox_id: &str,
        user_id: &str,
        path: &str,
    ) -> Result<Vec<u8>> {
        let sandbox = self.writable(sandbox_id, user_id).await?;
        files::read_file(&sandbox.workspace_root, path).await
    }

    pub async fn list_dir(
        &self,
        sandbox_id: &str,
        user_id: &str,
        path: &str,
    ) -> Result<Vec<files::DirEntry>> {
        let sandbox = self.writable(sandbox_id, user_id).await?;
        files::list_dir(&sandbox.workspace_root, path).await
    }

    pub async fn delete_file(&self, sandbox_id: &str, user_id: &str, path: &str) -> Result<()> {
        let sandbox = self.writable(sandbox_id, user_id).await?;
        let _gate = sandbox.write_gate.read().await;
        files::delete_file(&sandbox.workspace_root, path).await
    }

    pub async fn register_preview(
        &self,
        sandbox_id: &str,
        user_id: &str,
        port: u16,
        upstream: UpstreamDescriptor,
        command: Option<Vec<String>>,
    ) -> Result<()> {
        let sandbox = self.writable(sandbox_id, user_id).await?;
        sandbox.register_preview(port, PreviewTarget { upstream, command })
    }

    /// Proxy-side resolution; no owner check because the proxy acts on
    /// behalf of whoever holds the preview URL.
    pub async fn resolve_preview(&self, sandbox_id: &str, port: u16) -> Result<PreviewTarget> {
        let sandbox = self.lookup(sandbox_id).await?;
        sandbox
            .resolve_preview(port)
            .ok_or_else(|| Error::not_found(format!("No preview on port {}", port)))
    }

    pub async fn keepalive(&self, sandbox_id: &str, user_id: &str, ttl: Duration) -> Result<()> {
        let sandbox = self.writable(sandbox_id, user_id).await?;
        let mut inner = sandbox.inner.lock().await;
        inner.deadline = Instant::now() + ttl;
        Ok(())
    }

    pub async fn mount(
        &self,
        sandbox_id: &str,
        user_id: &str,
        host_path: &std::path::Path,
        guest_path: &str,
        read_only: bool,
    ) -> Result<()> {
        let sandbox = self.writable(sandbox_id, user_id).await?;
        let (driver, handle) = {
            let inner = sandbox.inner.lock().await;
            (inner.driver.clone(), inner.handle.clone())
        };
        driver.mount(&handle, host_path, guest_path, read_only).await
    }

    /// Spawn a long-running command and track it as a background job.
    pub async fn start_background(
        &self,
        sandbox_id: &str,
        user_id: &str,
        argv: Vec<String>,
    ) -> Result<String> {
        if argv.is_empty() {
            return Err(Error::invalid("Empty argv"));
        }
        let sandbox = self.get(sandbox_id, user_id).await?;
        let job_id = naming::generate_job_id();

        let mut inner = sandbox.inner.lock().await;
        if inner.status != SandboxStatus::Running {
            return Err(Error::precondition(format!(
                "Sandbox is {}, background jobs require running",
                inner.status
            )));
        }
        let driver = inner.driver.clone();
        let handle = inner.handle.clone();
        let exec_argv = argv.clone();

        // Register first so the status handle exists before the task runs.
        let placeholder = tokio::spawn(async {});
        let status = inner
            .jobs
            .insert(job_id.clone(), argv, placeholder.abort_handle());

        let task_status: JobStatusHandle = status.clone();
        let task = tokio::spawn(async move {
            let result = driver
                .exec(&handle, &exec_argv, None, Duration::from_secs(24 * 3600))
                .await;
            match result {
                Ok(output) => task_status.finish(JobStatus::Exited {
                    exit_code: output.exit_code,
                }),
                Err(Error::TimedOut(_)) => task_status.finish(JobStatus::Killed),
                Err(e) => task_status.finish(JobStatus::Failed {
                    message: e.to_string(),
                }),
            }
        });
        inner.jobs.set_abort(&job_id, task.abort_handle());
        Ok(job_id)
    }

    pub async fn stop_background(
        &self,
        sandbox_id: &str,
        user_id: &str,
        job_id: &str,
    ) -> Result<JobStatus> {
        let sandbox = self.get(sandbox_id, user_id).await?;
        let mut inner = sandbox.inner.lock().await;
        inner.jobs.stop(job_id)
    }

    /// Bidirectional terminal stream into the sandbox.
    pub async fn open_terminal(&self, sandbox_id: &str, user_id: &str) -> Result<DriverStream> {
        let sandbox = self.get(sandbox_id, user_id).await?;
        let (driver, handle) = {
            let inner = sandbox.inner.lock().await;
            if inner.status != SandboxStatus::Running {
                return Err(Error::precondition(format!(
                    "Sandbox is {}, terminal requires running",
                    inner.status
                )));
            }
            (inner.driver.clone(), inner.handle.clone())
        };
        driver.open_stream(&handle).await
    }

    /// Snapshot the workspace. Holds the write gate exclusively so no exec
    /// or file write is admitted mid-archive.
    pub async fn create_snapshot(
        &self,
        sandbox_id: &str,
        user_id: &str,
        engine: &SnapshotEngine,
    ) -> Result<Snapshot> {
        let sandbox = self.writable(sandbox_id, user_id).await?;
        let _freeze = sandbox.write_gate.write().await;
        engine
            .create(user_id, Some(sandbox_id), &sandbox.workspace_root)
            .await
    }

    /// Restore a snapshot into the sandbox workspace, also under the
    /// exclusive gate.
    pub async fn restore_snapshot(
        &self,
        sandbox_id: &str,
        user_id: &str,
        snapshot_id: &str,
        engine: &SnapshotEngine,
    ) -> Result<()> {
        let sandbox = self.writable(sandbox_id, user_id).await?;
        let _freeze = sandbox.write_gate.write().await;
        engine
            .restore(user_id, snapshot_id, &sandbox.workspace_root)
            .await
    }

    /// Tear the sandbox down: stop jobs, destroy the driver handle, drop
    /// preview registrations, remove the workspace. Optionally snapshots
    /// the workspace first.
    pub async fn destroy(
        &self,
        sandbox_id: &str,
        user_id: &str,
        snapshot_first: Option<&SnapshotEngine>,
    ) -> Result<()> {
        let sandbox = self.get(sandbox_id, user_id).await?;
        if let Some(engine) = snapshot_first {
            if let Err(e) = self.create_snapshot(sandbox_id, user_id, engine).await {
                warn!(sandbox = %sandbox_id, error = %e, "pre-destroy snapshot failed");
            }
        }
        self.destroy_sandbox(&sandbox).await
    }

    async fn destroy_sandbox(&self, sandbox: &Arc<Sandbox>) -> Result<()> {
        // Wait out any in-flight exec/file work or snapshot before tearing
        // the workspace down.
        let _freeze = sandbox.write_gate.write().await;
        let (driver, handle) = {
            let mut inner = sandbox.inner.lock().await;
            if inner.status == SandboxStatus::Destroyed {
                return Ok(());
            }
            inner.jobs.stop_all();
            inner.status = SandboxStatus::Destroyed;
            (inner.driver.clone(), inner.handle.clone())
        };
        sandbox.clear_previews();
        driver.destroy(&handle, true).await?;

        if self
            .sandboxes
            .write()
            .await
            .remove(&sandbox.sandbox_id)
            .is_some()
        {
            self.metrics.sandbox_active.dec();
        }
        info!(sandbox = %sandbox.sandbox_id, "sandbox destroyed");
        Ok(())
    }

    /// Promote a preview target to the fallback driver.
    ///
    /// Serialized per sandbox; a caller racing a finished promotion just
    /// gets the already-swapped upstream back. The old driver is stopped
    /// only after the replica answers a health probe.
    pub async fn promote_to_fallback(
        &self,
        sandbox_id: &str,
        port: u16,
    ) -> Result<UpstreamDescriptor> {
        let sandbox = self.lookup(sandbox_id).await?;
        let _promo = sandbox.promotion.lock().await;

        let target = sandbox
            .resolve_preview(port)
            .ok_or_else(|| Error::not_found(format!("No preview on port {}", port)))?;
        if target.upstream.driver_kind == self.fallback.kind() {
            return Ok(target.upstream);
        }

        let replica = self
            .fallback
            .provision_replica(
                &sandbox.sandbox_id,
                &sandbox.user_id,
                &sandbox.workspace_root,
                &target,
            )
            .await?;

        self.probe_upstream(&replica.upstream).await?;

        sandbox.register_preview(
            port,
            PreviewTarget {
                upstream: replica.upstream.clone(),
                command: target.command,
            },
        )?;

        let (old_driver, old_handle) = {
            let mut inner = sandbox.inner.lock().await;
            let old = (inner.driver.clone(), inner.handle.clone());
            inner.driver = replica.driver;
            inner.handle = replica.handle;
            old
        };
        if let Err(e) = old_driver.stop(&old_handle).await {
            warn!(sandbox = %sandbox_id, error = %e, "old driver stop after promotion failed");
        }

        info!(sandbox = %sandbox_id, port, upstream = %replica.upstream.base_url(), "preview promoted to fallback");
        Ok(replica.upstream)
    }

    /// The replica is healthy once it answers any HTTP response.
    async fn probe_upstream(&self, upstream: &UpstreamDescriptor) -> Result<()> {
        let url = format!("{}/", upstream.base_url());
        let attempts = self.config.proxy.promote_probe_attempts.max(1);
        for attempt in 1..=attempts {
            match self.http.get(&url).send().await {
                Ok(_) => return Ok(()),
                Err(e) if attempt == attempts => {
                    return Err(Error::Upstream(format!(
                        "Promoted upstream never became healthy: {}",
                        e
                    )));
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(200)).await,
            }
        }
        unreachable!("probe loop returns on last attempt")
    }

    /// Sandboxes past their keepalive deadline with no running job.
    pub async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let candidates: Vec<Arc<Sandbox>> = {
            let sandboxes = self.sandboxes.read().await;
            sandboxes.values().cloned().collect()
        };

        let mut reaped = 0;
        for sandbox in candidates {
            let expired = {
                let inner = sandbox.inner.lock().await;
                now > inner.deadline && !inner.jobs.any_running()
            };
            if expired {
                info!(sandbox = %sandbox.sandbox_id, "reaping expired sandbox");
                match self.destroy_sandbox(&sandbox).await {
                    Ok(()) => reaped += 1,
                    Err(e) => {
                        warn!(sandbox = %sandbox.sandbox_id, error = %e, "reap failed")
                    }
                }
            }
        }
        reaped
    }

    pub async fn active_count(&self) -> usize {
        self.sandboxes.read().await.len()
    }
}
