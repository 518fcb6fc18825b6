//! Fallback promotion: moving a preview target (and its sandbox) onto the
//! container driver when the current driver's upstream dies.
//!
//! This is the published contract between the preview proxy and the
//! runtime: the proxy only ever calls
//! [`crate::SandboxManager::promote_to_fallback`], which delegates replica
//! provisioning to a [`FallbackProvisioner`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use sbx_core::error::Result;
use sbx_isolation::{DriverHandle, DriverKind, IsolationDriver, ResourceCaps};

use crate::sandbox::{PreviewTarget, UpstreamDescriptor};

/// A freshly provisioned replica ready to take over a preview target.
pub struct PromotedReplica {
    pub driver: Arc<dyn IsolationDriver>,
    pub handle: DriverHandle,
    pub upstream: UpstreamDescriptor,
}

/// Provisions a replacement backend for a failing preview upstream.
#[async_trait]
pub trait FallbackProvisioner: Send + Sync {
    /// Driver kind replicas are provisioned on; targets already on this
    /// kind are considered promoted.
    fn kind(&self) -> DriverKind;

    async fn provision_replica(
        &self,
        sandbox_id: &str,
        user_id: &str,
        workspace_root: &Path,
        target: &PreviewTarget,
    ) -> Result<PromotedReplica>;
}

/// Production provisioner: a container sharing the host network, with the
/// sandbox workspace bind-mounted, re-running the registered preview
/// command. The replica answers on the loopback at the original upstream
/// port.
pub struct ContainerFallback {
    driver: Arc<dyn IsolationDriver>,
    caps: ResourceCaps,
}

impl ContainerFallback {
    pub fn new(driver: Arc<dyn IsolationDriver>, caps: ResourceCaps) -> Self {
        Self { driver, caps }
    }
}

#[async_trait]
impl FallbackProvisioner for ContainerFallback {
    fn kind(&self) -> DriverKind {
        self.driver.kind()
    }

    async fn provision_replica(
        &self,
        sandbox_id: &str,
        user_id: &str,
        workspace_root: &Path,
        target: &PreviewTarget,
    ) -> Result<PromotedReplica> {
        let replica_id = format!("{}-fb", sandbox_id);
        let handle = self
            .driver
            .provision(&replica_id, user_id, workspace_root, &self.caps)
            .await?;
        self.driver.start(&handle).await?;

        // Replay the command that served the preview, if one was registered.
        if let Some(command) = target.command.clone() {
            let driver = self.driver.clone();
            let exec_handle = handle.clone();
            tokio::spawn(async move {
                let result = driver
                    .exec(
                        &exec_handle,
                        &command,
                        None,
                        Duration::from_secs(24 * 3600),
                    )
                    .await;
                if let Err(e) = result {
                    warn!(replica = %exec_handle.id, error = %e, "replica preview command ended");
                }
            });
        }

        info!(sandbox = %sandbox_id, replica = %replica_id, "fallback replica provisioned");
        Ok(PromotedReplica {
            driver: self.driver.clone(),
            handle,
            upstream: UpstreamDescriptor {
                host: "127.0.0.1".to_string(),
                port: target.upstream.port,
                scheme: target.upstream.scheme.clone(),
                driver_kind: self.driver.kind(),
            },
        })
    }
}
