use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use sbx_core::error::{Error, Result};

use crate::state::{DriverState, require_running, validate_transition};
use crate::{DriverHandle, DriverKind, DriverStream, ExecOutput, IsolationDriver, ResourceCaps};

/// Fallback driver: plain child processes scoped to the workspace directory.
///
/// No kernel-level isolation is claimed. This driver exists so the control
/// plane stays functional where neither the hypervisor nor a container
/// daemon is available, and it refuses to run anything outside the
/// configured allow-list.
pub struct ProcessDriver {
    allowlist: Vec<String>,
    sandboxes: Mutex<HashMap<String, DriverState>>,
}

impl ProcessDriver {
    pub fn new(allowlist: Vec<String>) -> Self {
        Self {
            allowlist,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    fn check_allowed(&self, program: &str) -> Result<()> {
        if self.allowlist.iter().any(|p| p == program) {
            Ok(())
        } else {
            Err(Error::invalid(format!(
                "Program not on the process-driver allow-list: {:?}",
                program
            )))
        }
    }

    async fn transition(&self, id: &str, to: DriverState) -> Result<()> {
        let mut sandboxes = self.sandboxes.lock().await;
        let state = sandboxes
            .get(id)
            .copied()
            .ok_or_else(|| Error::not_found(format!("No provisioned sandbox {:?}", id)))?;
        validate_transition(state, to)?;
        sandboxes.insert(id.to_string(), to);
        Ok(())
    }

    async fn state_of(&self, id: &str) -> Result<DriverState> {
        self.sandboxes
            .lock()
            .await
            .get(id)
            .copied()
            .ok_or_else(|| Error::not_found(format!("No provisioned sandbox {:?}", id)))
    }
}

#[async_trait]
impl IsolationDriver for ProcessDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Process
    }

    async fn provision(
        &self,
        sandbox_id: &str,
        user_id: &str,
        workspace_root: &Path,
        _caps: &ResourceCaps,
    ) -> Result<DriverHandle> {
        tokio::fs::create_dir_all(workspace_root).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(workspace_root, std::fs::Permissions::from_mode(0o700))
                .await?;
        }

        self.sandboxes
            .lock()
            .await
            .insert(sandbox_id.to_string(), DriverState::Provisioned);
        debug!(sandbox = %sandbox_id, user = %user_id, "process sandbox provisioned");
        Ok(DriverHandle {
            id: sandbox_id.to_string(),
            kind: DriverKind::Process,
            workspace_root: workspace_root.to_path_buf(),
        })
    }

    async fn start(&self, handle: &DriverHandle) -> Result<()> {
        self.transition(&handle.id, DriverState::Running).await
    }

    async fn pause(&self, handle: &DriverHandle) -> Result<()> {
        self.transition(&handle.id, DriverState::Paused).await
    }

    async fn resume(&self, handle: &DriverHandle) -> Result<()> {
        self.transition(&handle.id, DriverState::Running).await
    }

    async fn stop(&self, handle: &DriverHandle) -> Result<()> {
        self.transition(&handle.id, DriverState::Stopped).await
    }

    async fn exec(
        &self,
        handle: &DriverHandle,
        argv: &[String],
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        require_running(self.state_of(&handle.id).await?, "exec")?;
        let program = argv
            .first()
            .ok_or_else(|| Error::invalid("Empty argv"))?;
        self.check_allowed(program)?;

        let mut command = Command::new(program);
        command
            .args(&argv[1..])
            .current_dir(&handle.workspace_root)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::invalid(format!("Program not found: {:?}", program))
            } else {
                Error::from(e)
            }
        })?;

        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(&bytes).await?;
                pipe.shutdown().await?;
            }
        }

        // Dropping the in-flight wait on timeout kills the child
        // (kill_on_drop) and lets the runtime reap it.
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::TimedOut(format!("exec exceeded {:?}", timeout)))??;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn open_stream(&self, handle: &DriverHandle) -> Result<DriverStream> {
        require_running(self.state_of(&handle.id).await?, "open_stream")?;
        let shell = ["bash", "sh"]
            .iter()
            .find(|s| self.allowlist.iter().any(|p| p == *s))
            .ok_or_else(|| Error::invalid("No shell on the process-driver allow-list"))?;

        let mut child = Command::new(shell)
            .arg("-i")
            .current_dir(&handle.workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let writer = child
            .stdin
            .take()
            .ok_or_else(|| Error::fatal("Shell stdin unavailable"))?;
        let reader = child
            .stdout
            .take()
            .ok_or_else(|| Error::fatal("Shell stdout unavailable"))?;

        // Reap the shell when it exits; the stream owns no child handle.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        Ok(DriverStream {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    async fn mount(
        &self,
        _handle: &DriverHandle,
        _host_path: &Path,
        _guest_path: &str,
        _read_only: bool,
    ) -> Result<()> {
        Err(Error::invalid(
            "The process driver does not support mounts",
        ))
    }

    async fn destroy(&self, handle: &DriverHandle, remove_workspace: bool) -> Result<()> {
        self.sandboxes.lock().await.remove(&handle.id);
        if remove_workspace {
            match tokio::fs::remove_dir_all(&handle.workspace_root).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(sandbox = %handle.id, error = %e, "workspace removal failed");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> ProcessDriver {
        ProcessDriver::new(vec![
            "echo".to_string(),
            "cat".to_string(),
            "sleep".to_string(),
            "sh".to_string(),
            "false".to_string(),
        ])
    }

    async fn running_handle(driver: &ProcessDriver, dir: &Path) -> DriverHandle {
        let handle = driver
            .provision(
                "sbx-test",
                "u_a",
                &dir.join("ws"),
                &ResourceCaps {
                    vcpus: 1,
                    mem_mib: 128,
                },
            )
            .await
            .unwrap();
        driver.start(&handle).await.unwrap();
        handle
    }

    #[tokio::test]
    async fn test_exec_echo() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver();
        let handle = running_handle(&driver, dir.path()).await;

        let out = driver
            .exec(
                &handle,
                &["echo".to_string(), "hello".to_string()],
                None,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "");
    }

    #[tokio::test]
    async fn test_exec_nonzero_exit_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver();
        let handle = running_handle(&driver, dir.path()).await;

        let out = driver
            .exec(&handle, &["false".to_string()], None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 1);
    }

    #[tokio::test]
    async fn test_exec_pipes_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver();
        let handle = running_handle(&driver, dir.path()).await;

        let out = driver
            .exec(
                &handle,
                &["cat".to_string()],
                Some(b"piped bytes".to_vec()),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, "piped bytes");
    }

    #[tokio::test]
    async fn test_exec_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver();
        let handle = running_handle(&driver, dir.path()).await;
        std::fs::write(handle.workspace_root.join("hello.txt"), b"data").unwrap();

        let out = driver
            .exec(
                &handle,
                &["cat".to_string(), "hello.txt".to_string()],
                None,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout, "data");
    }

    #[tokio::test]
    async fn test_exec_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver();
        let handle = running_handle(&driver, dir.path()).await;

        let started = std::time::Instant::now();
        let err = driver
            .exec(
                &handle,
                &["sleep".to_string(), "30".to_string()],
                None,
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_exec_rejects_programs_off_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver();
        let handle = running_handle(&driver, dir.path()).await;

        let err = driver
            .exec(&handle, &["rm".to_string(), "-rf".to_string()], None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_exec_requires_running_state() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver();
        let handle = driver
            .provision(
                "sbx-test",
                "u_a",
                &dir.path().join("ws"),
                &ResourceCaps {
                    vcpus: 1,
                    mem_mib: 128,
                },
            )
            .await
            .unwrap();

        let err = driver
            .exec(&handle, &["echo".to_string()], None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_pause_blocks_exec_until_resume() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver();
        let handle = running_handle(&driver, dir.path()).await;

        driver.pause(&handle).await.unwrap();
        assert!(
            driver
                .exec(&handle, &["echo".to_string()], None, Duration::from_secs(5))
                .await
                .is_err()
        );

        driver.resume(&handle).await.unwrap();
        assert!(
            driver
                .exec(&handle, &["echo".to_string()], None, Duration::from_secs(5))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_lifecycle_idempotency() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver();
        let handle = running_handle(&driver, dir.path()).await;

        driver.start(&handle).await.unwrap();
        driver.stop(&handle).await.unwrap();
        driver.stop(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_keeps_workspace_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver();
        let handle = running_handle(&driver, dir.path()).await;
        std::fs::write(handle.workspace_root.join("keep.txt"), b"x").unwrap();

        driver.destroy(&handle, false).await.unwrap();
        assert!(handle.workspace_root.join("keep.txt").exists());
    }

    #[tokio::test]
    async fn test_destroy_can_remove_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver();
        let handle = running_handle(&driver, dir.path()).await;

        driver.destroy(&handle, true).await.unwrap();
        assert!(!handle.workspace_root.exists());
    }

    #[tokio::test]
    async fn test_mount_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver();
        let handle = running_handle(&driver, dir.path()).await;

        let err = driver
            .mount(&handle, Path::new("/data"), "/mnt", true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
