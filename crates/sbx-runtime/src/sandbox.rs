use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use sbx_core::error::{Error, Result};
use sbx_isolation::{DriverHandle, DriverKind, IsolationDriver};

use crate::jobs::JobTable;
use crate::quota::QuotaBucket;

/// Sandbox lifecycle state as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Running,
    Paused,
    Stopped,
    Destroyed,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Validate a sandbox state transition. `Destroyed` is reachable from
/// anywhere; self-transitions keep lifecycle calls idempotent.
pub fn validate_transition(from: SandboxStatus, to: SandboxStatus) -> Result<()> {
    if to == SandboxStatus::Destroyed || (from == to && from != SandboxStatus::Creating) {
        return Ok(());
    }
    let valid = matches!(
        (from, to),
        (SandboxStatus::Creating, SandboxStatus::Running)
            | (SandboxStatus::Running, SandboxStatus::Paused)
            | (SandboxStatus::Paused, SandboxStatus::Running)
            | (SandboxStatus::Running, SandboxStatus::Stopped)
            | (SandboxStatus::Paused, SandboxStatus::Stopped)
    );
    if valid {
        Ok(())
    } else {
        Err(Error::precondition(format!(
            "Invalid sandbox transition: {} -> {}",
            from, to
        )))
    }
}

/// Where preview traffic for a port should be dialed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamDescriptor {
    pub host: String,
    pub port: u16,
    pub scheme: String,
    pub driver_kind: DriverKind,
}

impl UpstreamDescriptor {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// A registered preview target: the upstream plus the optional command
/// that serves it (replayed on fallback promotion).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewTarget {
    pub upstream: UpstreamDescriptor,
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

/// Mutable sandbox state, guarded by the sandbox mutex.
pub struct SandboxInner {
    pub status: SandboxStatus,
    pub driver: Arc<dyn IsolationDriver>,
    pub handle: DriverHandle,
    /// Reap deadline (monotonic).
    pub deadline: Instant,
    pub jobs: JobTable,
    pub quota: QuotaBucket,
}

/// One sandbox: identity, workspace, and supervised runtime state.
///
/// The port registry lives outside the mutex behind an atomic pointer so
/// the preview proxy can resolve upstreams without taking any lock. The
/// write gate freezes exec admission and file writes while a snapshot of
/// the workspace is being taken (snapshot holds the write side).
pub struct Sandbox {
    pub sandbox_id: String,
    pub user_id: String,
    pub workspace_root: PathBuf,
    pub inner: Mutex<SandboxInner>,
    ports: ArcSwap<HashMap<u16, PreviewTarget>>,
    pub write_gate: RwLock<()>,
    /// Serializes fallback promotions for this sandbox.
    pub promotion: Mutex<()>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("sandbox_id", &self.sandbox_id)
            .field("user_id", &self.user_id)
            .field("workspace_root", &self.workspace_root)
            .finish()
    }
}

impl Sandbox {
    pub fn new(
        sandbox_id: String,
        user_id: String,
        workspace_root: PathBuf,
        inner: SandboxInner,
    ) -> Self {
        Self {
            sandbox_id,
            user_id,
            workspace_root,
            inner: Mutex::new(inner),
            ports: ArcSwap::from_pointee(HashMap::new()),
            write_gate: RwLock::new(()),
            promotion: Mutex::new(()),
        }
    }

    /// Install or overwrite the preview target for a port.
    pub fn register_preview(&self, port: u16, target: PreviewTarget) -> Result<()> {
        if port == 0 {
            return Err(Error::invalid("Preview port must be in 1..=65535"));
        }
        self.ports.rcu(|ports| {
            let mut next = HashMap::clone(ports);
            next.insert(port, target.clone());
            next
        });
        Ok(())
    }

    /// Lock-free lookup used by the proxy on every request.
    pub fn resolve_preview(&self, port: u16) -> Option<PreviewTarget> {
        self.ports.load().get(&port).cloned()
    }

    pub fn preview_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.ports.load().keys().copied().collect();
        ports.sort();
        ports
    }

    /// Drop every preview registration (sandbox teardown).
    pub fn clear_previews(&self) {
        self.ports.store(Arc::new(HashMap::new()));
    }
}
