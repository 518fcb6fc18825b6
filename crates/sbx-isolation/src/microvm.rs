use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use sbx_core::config::MicrovmConfig;
use sbx_core::error::{Error, Result};

use crate::protocol::{self, GuestRequest, GuestResponse};
use crate::state::{DriverState, require_running, validate_transition};
use crate::{DriverHandle, DriverKind, DriverStream, ExecOutput, IsolationDriver, ResourceCaps};

/// Boot arguments: serial console only, no PCI, no PS/2 probing.
const BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off i8042.noaux i8042.nomux quiet";

/// How long to wait for the control socket after spawning the hypervisor.
const SOCKET_WAIT: Duration = Duration::from_secs(10);

/// Grace period on top of the guest-side exec deadline.
const EXEC_GRACE: Duration = Duration::from_secs(2);

/// MicroVM driver.
///
/// Each sandbox gets a lightweight VM: the hypervisor binary is spawned
/// with a per-VM control socket, then configured and driven through the
/// JSON control protocol. The workspace is exported to the guest at
/// provision time.
pub struct MicrovmDriver {
    config: MicrovmConfig,
    sandboxes: Mutex<HashMap<String, VmState>>,
}

struct VmState {
    state: DriverState,
    socket_path: PathBuf,
    runtime_dir: PathBuf,
    child: Option<Child>,
}

/// Whether the hypervisor and its boot artifacts are usable.
pub fn available(config: &MicrovmConfig) -> bool {
    let binary_ok = resolve_binary(&config.binary).is_some();
    binary_ok && config.kernel_path.is_file() && config.rootfs_path.is_file()
}

/// Absolute path to the hypervisor binary, if present and executable.
fn resolve_binary(binary: &str) -> Option<PathBuf> {
    let path = if binary.contains('/') {
        PathBuf::from(binary)
    } else {
        which::which(binary).ok()?
    };
    let meta = std::fs::metadata(&path).ok()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return None;
        }
    }
    meta.is_file().then_some(path)
}

/// One request/response exchange over a VM's control socket.
async fn control_request(
    socket_path: &Path,
    request: &GuestRequest,
    timeout: Duration,
) -> Result<GuestResponse> {
    let exchange = async {
        let mut stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| Error::transient(format!("control socket connect: {}", e)))?;
        protocol::send_request(&mut stream, request).await?;
        protocol::recv_response(&mut stream).await
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| Error::TimedOut(format!("control request exceeded {:?}", timeout)))?
}

impl MicrovmDriver {
    pub fn new(config: MicrovmConfig) -> Self {
        Self {
            config,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    async fn socket_of(&self, id: &str, op: &str) -> Result<PathBuf> {
        let sandboxes = self.sandboxes.lock().await;
        let vm = sandboxes
            .get(id)
            .ok_or_else(|| Error::not_found(format!("No provisioned VM {:?}", id)))?;
        require_running(vm.state, op)?;
        Ok(vm.socket_path.clone())
    }

    async fn lifecycle_request(
        &self,
        id: &str,
        to: DriverState,
        request: GuestRequest,
    ) -> Result<()> {
        let socket_path = {
            let mut sandboxes = self.sandboxes.lock().await;
            let vm = sandboxes
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("No provisioned VM {:?}", id)))?;
            validate_transition(vm.state, to)?;
            if vm.state == to {
                return Ok(());
            }
            vm.socket_path.clone()
        };

        match control_request(&socket_path, &request, Duration::from_secs(10)).await? {
            GuestResponse::Ok => {}
            GuestResponse::Error { message } => return Err(Error::fatal(message)),
            other => {
                return Err(Error::fatal(format!(
                    "Unexpected guest response: {:?}",
                    other
                )));
            }
        }

        let mut sandboxes = self.sandboxes.lock().await;
        if let Some(vm) = sandboxes.get_mut(id) {
            vm.state = to;
        }
        Ok(())
    }
}

#[async_trait]
impl IsolationDriver for MicrovmDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Microvm
    }

    async fn provision(
        &self,
        sandbox_id: &str,
        user_id: &str,
        workspace_root: &Path,
        caps: &ResourceCaps,
    ) -> Result<DriverHandle> {
        let binary = resolve_binary(&self.config.binary).ok_or_else(|| {
            Error::precondition(format!("Hypervisor binary not usable: {:?}", self.config.binary))
        })?;
        tokio::fs::create_dir_all(workspace_root).await?;

        let runtime_dir = self.config.runtime_dir.join(sandbox_id);
        tokio::fs::create_dir_all(&runtime_dir).await?;
        let socket_path = runtime_dir.join("control.sock");
        let _ = tokio::fs::remove_file(&socket_path).await;
        let log_path = runtime_dir.join("vm.log");

        let mut child = Command::new(&binary)
            .arg("--api-sock")
            .arg(&socket_path)
            .arg("--kernel")
            .arg(&self.config.kernel_path)
            .arg("--rootfs")
            .arg(&self.config.rootfs_path)
            .arg("--boot-args")
            .arg(BOOT_ARGS)
            .arg("--workspace")
            .arg(workspace_root)
            .arg("--log-path")
            .arg(&log_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::fatal(format!("hypervisor spawn: {}", e)))?;

        // The control socket appears once the guest agent is up. Reap the
        // hypervisor if boot or configuration fails.
        let booted = async {
            let deadline = tokio::time::Instant::now() + SOCKET_WAIT;
            loop {
                if tokio::fs::try_exists(&socket_path).await.unwrap_or(false) {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(Error::TimedOut(format!(
                        "Control socket did not appear within {:?}",
                        SOCKET_WAIT
                    )));
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }

            let configure = GuestRequest::Configure {
                vcpus: caps.vcpus,
                mem_mib: caps.mem_mib,
                workspace_guest_path: "/workspace".to_string(),
            };
            match control_request(&socket_path, &configure, Duration::from_secs(10)).await? {
                GuestResponse::Ok => Ok(()),
                GuestResponse::Error { message } => Err(Error::fatal(message)),
                other => Err(Error::fatal(format!(
                    "Unexpected guest response: {:?}",
                    other
                ))),
            }
        }
        .await;
        if let Err(e) = booted {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e);
        }

        self.sandboxes.lock().await.insert(
            sandbox_id.to_string(),
            VmState {
                state: DriverState::Provisioned,
                socket_path,
                runtime_dir,
                child: Some(child),
            },
        );
        info!(
            sandbox = %sandbox_id,
            user = %user_id,
            vcpus = caps.vcpus,
            mem_mib = caps.mem_mib,
            "microvm provisioned"
        );
        Ok(DriverHandle {
            id: sandbox_id.to_string(),
            kind: DriverKind::Microvm,
            workspace_root: workspace_root.to_path_buf(),
        })
    }

    async fn start(&self, handle: &DriverHandle) -> Result<()> {
        self.lifecycle_request(&handle.id, DriverState::Running, GuestRequest::Resume)
            .await
    }

    async fn pause(&self, handle: &DriverHandle) -> Result<()> {
        self.lifecycle_request(&handle.id, DriverState::Paused, GuestRequest::Pause)
            .await
    }

    async fn resume(&self, handle: &DriverHandle) -> Result<()> {
        self.lifecycle_request(&handle.id, DriverState::Running, GuestRequest::Resume)
            .await
    }

    async fn stop(&self, handle: &DriverHandle) -> Result<()> {
        self.lifecycle_request(&handle.id, DriverState::Stopped, GuestRequest::Shutdown)
            .await?;

        // Give the guest a moment for an orderly shutdown, then reap.
        let mut sandboxes = self.sandboxes.lock().await;
        if let Some(vm) = sandboxes.get_mut(&handle.id) {
            if let Some(child) = vm.child.as_mut() {
                match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                    Ok(_) => {}
                    Err(_) => {
                        warn!(sandbox = %handle.id, "guest shutdown stalled, killing hypervisor");
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                }
                vm.child = None;
            }
        }
        Ok(())
    }

    async fn exec(
        &self,
        handle: &DriverHandle,
        argv: &[String],
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let socket_path = self.socket_of(&handle.id, "exec").await?;
        if argv.is_empty() {
            return Err(Error::invalid("Empty argv"));
        }

        let request = GuestRequest::Exec {
            argv: argv.to_vec(),
            stdin,
            timeout_ms: timeout.as_millis() as u64,
        };
        match control_request(&socket_path, &request, timeout + EXEC_GRACE).await? {
            GuestResponse::Exec {
                stdout,
                stderr,
                exit_code,
            } => Ok(ExecOutput {
                stdout,
                stderr,
                exit_code,
            }),
            GuestResponse::TimedOut => {
                Err(Error::TimedOut(format!("exec exceeded {:?}", timeout)))
            }
            GuestResponse::Error { message } => Err(Error::fatal(message)),
            other => Err(Error::fatal(format!(
                "Unexpected guest response: {:?}",
                other
            ))),
        }
    }

    async fn open_stream(&self, handle: &DriverHandle) -> Result<DriverStream> {
        let socket_path = self.socket_of(&handle.id, "open_stream").await?;

        let mut stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|e| Error::transient(format!("control socket connect: {}", e)))?;
        protocol::send_request(&mut stream, &GuestRequest::OpenStream).await?;
        match protocol::recv_response(&mut stream).await? {
            GuestResponse::Ok => {}
            GuestResponse::Error { message } => return Err(Error::fatal(message)),
            other => {
                return Err(Error::fatal(format!(
                    "Unexpected guest response: {:?}",
                    other
                )));
            }
        }

        // From here on the socket is a raw byte pipe to the guest terminal.
        let (reader, writer) = stream.into_split();
        Ok(DriverStream {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    async fn mount(
        &self,
        handle: &DriverHandle,
        host_path: &Path,
        guest_path: &str,
        read_only: bool,
    ) -> Result<()> {
        let socket_path = {
            let sandboxes = self.sandboxes.lock().await;
            let vm = sandboxes
                .get(&handle.id)
                .ok_or_else(|| Error::not_found(format!("No provisioned VM {:?}", handle.id)))?;
            if vm.state == DriverState::Destroyed || vm.state == DriverState::Stopped {
                return Err(Error::precondition(format!(
                    "Cannot mount into a {} VM",
                    vm.state
                )));
            }
            vm.socket_path.clone()
        };

        let request = GuestRequest::Mount {
            host_path: host_path.display().to_string(),
            guest_path: guest_path.to_string(),
            read_only,
        };
        match control_request(&socket_path, &request, Duration::from_secs(10)).await? {
            GuestResponse::Ok => Ok(()),
            GuestResponse::Error { message } => Err(Error::fatal(message)),
            other => Err(Error::fatal(format!(
                "Unexpected guest response: {:?}",
                other
            ))),
        }
    }

    async fn destroy(&self, handle: &DriverHandle, remove_workspace: bool) -> Result<()> {
        let vm = self.sandboxes.lock().await.remove(&handle.id);
        if let Some(mut vm) = vm {
            if let Some(child) = vm.child.as_mut() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            if let Err(e) = tokio::fs::remove_dir_all(&vm.runtime_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(sandbox = %handle.id, error = %e, "runtime dir removal failed");
                }
            }
        }
        if remove_workspace {
            match tokio::fs::remove_dir_all(&handle.workspace_root).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(sandbox = %handle.id, "microvm destroyed");
        Ok(())
    }
}
