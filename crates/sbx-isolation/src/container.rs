use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use sbx_core::config::ContainerConfig;
use sbx_core::error::{Error, Result};

use crate::state::{DriverState, require_running, validate_transition};
use crate::{DriverHandle, DriverKind, DriverStream, ExecOutput, IsolationDriver, ResourceCaps};

/// Container driver speaking to a docker-compatible CLI.
///
/// The workspace is bind-mounted at the configured guest path. Bind mounts
/// are fixed at container creation, so extra mounts must be registered
/// between `provision` and `start`.
pub struct ContainerDriver {
    config: ContainerConfig,
    sandboxes: Mutex<HashMap<String, ContainerState>>,
}

struct ContainerState {
    name: String,
    state: DriverState,
    extra_mounts: Vec<Mount>,
}

#[derive(Debug, Clone)]
struct Mount {
    host_path: PathBuf,
    guest_path: String,
    read_only: bool,
}

/// Probe whether the container daemon is reachable.
pub async fn available(config: &ContainerConfig) -> bool {
    let probe = Command::new(&config.runtime_bin)
        .arg("info")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    matches!(
        tokio::time::timeout(Duration::from_secs(2), probe).await,
        Ok(Ok(status)) if status.success()
    )
}

impl ContainerDriver {
    pub fn new(config: ContainerConfig) -> Self {
        Self {
            config,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    fn container_name(&self, sandbox_id: &str) -> String {
        format!("{}-{}", self.config.hostname_prefix, sandbox_id)
    }

    async fn run_cli(&self, args: &[String]) -> Result<std::process::Output> {
        let output = Command::new(&self.config.runtime_bin)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::transient(format!("container runtime spawn: {}", e)))?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(classify_cli_error(&String::from_utf8_lossy(&output.stderr)))
        }
    }

    async fn with_state<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ContainerState) -> Result<T>,
    ) -> Result<T> {
        let mut sandboxes = self.sandboxes.lock().await;
        let state = sandboxes
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("No provisioned container {:?}", id)))?;
        f(state)
    }
}

/// Map container CLI failures onto the error taxonomy.
fn classify_cli_error(stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    if lower.contains("no such container") {
        Error::not_found(stderr.trim().to_string())
    } else if lower.contains("cannot connect") || lower.contains("connection refused") {
        Error::transient(stderr.trim().to_string())
    } else {
        Error::fatal(stderr.trim().to_string())
    }
}

#[async_trait]
impl IsolationDriver for ContainerDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Container
    }

    async fn provision(
        &self,
        sandbox_id: &str,
        user_id: &str,
        workspace_root: &Path,
        _caps: &ResourceCaps,
    ) -> Result<DriverHandle> {
        tokio::fs::create_dir_all(workspace_root).await?;

        let name = self.container_name(sandbox_id);
        self.sandboxes.lock().await.insert(
            sandbox_id.to_string(),
            ContainerState {
                name: name.clone(),
                state: DriverState::Provisioned,
                extra_mounts: Vec::new(),
            },
        );
        debug!(sandbox = %sandbox_id, user = %user_id, container = %name, "container provisioned");
        Ok(DriverHandle {
            id: sandbox_id.to_string(),
            kind: DriverKind::Container,
            workspace_root: workspace_root.to_path_buf(),
        })
    }

    async fn start(&self, handle: &DriverHandle) -> Result<()> {
        let (name, mounts) = self
            .with_state(&handle.id, |s| {
                validate_transition(s.state, DriverState::Running)?;
                Ok((s.name.clone(), s.extra_mounts.clone()))
            })
            .await?;

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.clone(),
            "--hostname".into(),
            name.clone(),
            "--restart".into(),
            "no".into(),
            "-w".into(),
            self.config.guest_workspace.clone(),
            "-v".into(),
            format!(
                "{}:{}",
                handle.workspace_root.display(),
                self.config.guest_workspace
            ),
        ];
        for mount in &mounts {
            let suffix = if mount.read_only { ":ro" } else { "" };
            args.push("-v".into());
            args.push(format!(
                "{}:{}{}",
                mount.host_path.display(),
                mount.guest_path,
                suffix
            ));
        }
        args.push(self.config.image.clone());
        args.extend(["sleep".into(), "infinity".into()]);

        match self.run_cli(&args).await {
            Ok(_) => {}
            Err(Error::Fatal(msg)) if msg.to_lowercase().contains("already in use") => {
                // Container survives from an earlier start; just run it.
                self.run_cli(&["start".into(), name.clone()]).await?;
            }
            Err(e) => return Err(e),
        }

        self.with_state(&handle.id, |s| {
            s.state = DriverState::Running;
            Ok(())
        })
        .await
    }

    async fn pause(&self, handle: &DriverHandle) -> Result<()> {
        let name = self
            .with_state(&handle.id, |s| {
                validate_transition(s.state, DriverState::Paused)?;
                Ok((s.state != DriverState::Paused).then(|| s.name.clone()))
            })
            .await?;
        if let Some(name) = name {
            self.run_cli(&["pause".into(), name]).await?;
            self.with_state(&handle.id, |s| {
                s.state = DriverState::Paused;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    async fn resume(&self, handle: &DriverHandle) -> Result<()> {
        let name = self
            .with_state(&handle.id, |s| {
                validate_transition(s.state, DriverState::Running)?;
                Ok((s.state != DriverState::Running).then(|| s.name.clone()))
            })
            .await?;
        if let Some(name) = name {
            self.run_cli(&["unpause".into(), name]).await?;
            self.with_state(&handle.id, |s| {
                s.state = DriverState::Running;
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    async fn stop(&self, handle: &DriverHandle) -> Result<()> {
        let name = self
            .with_state(&handle.id, |s| {
                validate_transition(s.state, DriverState::Stopped)?;
                Ok((s.state != DriverState::Stopped).then(|| s.name.clone()))
            })
            .await?;
        if let Some(name) = name {
            self.run_cli(&["stop".into(), "-t".into(), "5".into(), name])
                .await?;
            self.with_state(&handle.id, |s| {
                s.state = DriverState::Stopped;
                Ok(())
            })
            .await?;
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
        let name = self
            .with_state(&handle.id, |s| {
                require_running(s.state, "exec")?;
                Ok(s.name.clone())
            })
            .await?;
        if argv.is_empty() {
            return Err(Error::invalid("Empty argv"));
        }

        let mut command = Command::new(&self.config.runtime_bin);
        command
            .arg("exec")
            .arg("-i")
            .arg("-w")
            .arg(&self.config.guest_workspace)
            .arg(&name)
            .args(argv)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::transient(format!("container exec spawn: {}", e)))?;

        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(&bytes).await?;
                pipe.shutdown().await?;
            }
        }

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
        let name = self
            .with_state(&handle.id, |s| {
                require_running(s.state, "open_stream")?;
                Ok(s.name.clone())
            })
            .await?;

        let mut child = Command::new(&self.config.runtime_bin)
            .arg("exec")
            .arg("-i")
            .arg("-w")
            .arg(&self.config.guest_workspace)
            .arg(&name)
            .arg("sh")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::transient(format!("container stream spawn: {}", e)))?;

        let writer = child
            .stdin
            .take()
            .ok_or_else(|| Error::fatal("Container stdin unavailable"))?;
        let reader = child
            .stdout
            .take()
            .ok_or_else(|| Error::fatal("Container stdout unavailable"))?;
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
        handle: &DriverHandle,
        host_path: &Path,
        guest_path: &str,
        read_only: bool,
    ) -> Result<()> {
        self.with_state(&handle.id, |s| {
            if s.state != DriverState::Provisioned {
                return Err(Error::precondition(
                    "Container mounts must be registered before start",
                ));
            }
            s.extra_mounts.push(Mount {
                host_path: host_path.to_path_buf(),
                guest_path: guest_path.to_string(),
                read_only,
            });
            Ok(())
        })
        .await
    }

    async fn destroy(&self, handle: &DriverHandle, remove_workspace: bool) -> Result<()> {
        let name = {
            let mut sandboxes = self.sandboxes.lock().await;
            sandboxes.remove(&handle.id).map(|s| s.name)
        };
        if let Some(name) = name {
            match self.run_cli(&["rm".into(), "-f".into(), name]).await {
                Ok(_) | Err(Error::NotFound(_)) => {}
                Err(e) => warn!(sandbox = %handle.id, error = %e, "container removal failed"),
            }
        }
        if remove_workspace {
            match tokio::fs::remove_dir_all(&handle.workspace_root).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
