// sbx-isolation: Sandbox lifecycle drivers behind one trait.
//
// Three concrete drivers: microVM (hypervisor + guest agent over a control
// socket), container (docker-compatible CLI), and a process fallback with
// no kernel-level isolation. `auto` probes in that order.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use sbx_core::config::{IsolationBackend, IsolationConfig};
use sbx_core::error::Result;

pub mod container;
pub mod microvm;
pub mod process;
pub mod protocol;
pub mod state;

pub use container::ContainerDriver;
pub use microvm::MicrovmDriver;
pub use process::ProcessDriver;
pub use state::{DriverState, require_running, validate_transition};

/// Which concrete driver backs a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    Microvm,
    Container,
    Process,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Microvm => write!(f, "microvm"),
            Self::Container => write!(f, "container"),
            Self::Process => write!(f, "process"),
        }
    }
}

/// Resource ceiling handed to `provision`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceCaps {
    pub vcpus: u8,
    pub mem_mib: u32,
}

/// Completed command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Opaque reference to a provisioned sandbox inside a driver.
#[derive(Debug, Clone)]
pub struct DriverHandle {
    pub id: String,
    pub kind: DriverKind,
    pub workspace_root: std::path::PathBuf,
}

/// Bidirectional byte stream for interactive terminals.
pub struct DriverStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Sandbox lifecycle driver contract.
///
/// `start`/`pause`/`resume`/`stop` are idempotent. `exec` and
/// `open_stream` are only valid while running. `destroy` leaves the
/// workspace on disk unless removal is explicitly requested.
#[async_trait]
pub trait IsolationDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    async fn provision(
        &self,
        sandbox_id: &str,
        user_id: &str,
        workspace_root: &Path,
        caps: &ResourceCaps,
    ) -> Result<DriverHandle>;

    async fn start(&self, handle: &DriverHandle) -> Result<()>;
    async fn pause(&self, handle: &DriverHandle) -> Result<()>;
    async fn resume(&self, handle: &DriverHandle) -> Result<()>;
    async fn stop(&self, handle: &DriverHandle) -> Result<()>;

    async fn exec(
        &self,
        handle: &DriverHandle,
        argv: &[String],
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ExecOutput>;

    async fn open_stream(&self, handle: &DriverHandle) -> Result<DriverStream>;

    async fn mount(
        &self,
        handle: &DriverHandle,
        host_path: &Path,
        guest_path: &str,
        read_only: bool,
    ) -> Result<()>;

    async fn destroy(&self, handle: &DriverHandle, remove_workspace: bool) -> Result<()>;
}

/// Resolve `auto` to a concrete backend by probing the environment.
///
/// Preference order: microVM (binary + kernel + rootfs present), container
/// (daemon answers `info`), process.
pub async fn detect_backend(config: &IsolationConfig) -> DriverKind {
    match config.backend {
        IsolationBackend::Microvm => DriverKind::Microvm,
        IsolationBackend::Container => DriverKind::Container,
        IsolationBackend::Process => DriverKind::Process,
        IsolationBackend::Auto => {
            if microvm::available(&config.microvm) {
                info!("isolation auto-select: microvm");
                DriverKind::Microvm
            } else if container::available(&config.container).await {
                info!("isolation auto-select: container");
                DriverKind::Container
            } else {
                info!("isolation auto-select: process fallback");
                DriverKind::Process
            }
        }
    }
}

/// Construct the driver for a concrete kind.
pub fn driver_for(kind: DriverKind, config: &IsolationConfig) -> Arc<dyn IsolationDriver> {
    match kind {
        DriverKind::Microvm => Arc::new(MicrovmDriver::new(config.microvm.clone())),
        DriverKind::Container => Arc::new(ContainerDriver::new(config.container.clone())),
        DriverKind::Process => Arc::new(ProcessDriver::new(config.process_allowlist.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_kind_display() {
        assert_eq!(DriverKind::Microvm.to_string(), "microvm");
        assert_eq!(DriverKind::Container.to_string(), "container");
        assert_eq!(DriverKind::Process.to_string(), "process");
    }

    #[test]
    fn test_driver_kind_serde() {
        let json = serde_json::to_string(&DriverKind::Microvm).unwrap();
        assert_eq!(json, r#""microvm""#);
        let parsed: DriverKind = serde_json::from_str(r#""process""#).unwrap();
        assert_eq!(parsed, DriverKind::Process);
    }

    #[tokio::test]
    async fn test_explicit_backend_skips_probing() {
        let mut config = IsolationConfig::default();
        config.backend = IsolationBackend::Process;
        assert_eq!(detect_backend(&config).await, DriverKind::Process);
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_process() {
        let mut config = IsolationConfig::default();
        config.backend = IsolationBackend::Auto;
        // Point the probes at things that cannot exist.
        config.microvm.binary = "/nonexistent/sbx-hypervisor".to_string();
        config.container.runtime_bin = "/nonexistent/docker".to_string();
        assert_eq!(detect_backend(&config).await, DriverKind::Process);
    }

    #[test]
    fn test_driver_for_matches_kind() {
        let config = IsolationConfig::default();
        assert_eq!(
            driver_for(DriverKind::Process, &config).kind(),
            DriverKind::Process
        );
        assert_eq!(
            driver_for(DriverKind::Container, &config).kind(),
            DriverKind::Container
        );
        assert_eq!(
            driver_for(DriverKind::Microvm, &config).kind(),
            DriverKind::Microvm
        );
    }
}
