// End-to-end sandbox runtime tests on the process driver.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sbx_core::config::Config;
use sbx_core::error::{Error, QuotaKind};
use sbx_core::observability::Metrics;
use sbx_isolation::{DriverKind, ProcessDriver};
use sbx_runtime::promote::{FallbackProvisioner, PromotedReplica};
use sbx_runtime::sandbox::PreviewTarget;
use sbx_runtime::{CreateOptions, JobStatus, SandboxManager, UpstreamDescriptor};

struct NoFallback;

#[async_trait]
impl FallbackProvisioner for NoFallback {
    fn kind(&self) -> DriverKind {
        DriverKind::Container
    }

    async fn provision_replica(
        &self,
        _sandbox_id: &str,
        _user_id: &str,
        _workspace_root: &Path,
        _target: &PreviewTarget,
    ) -> sbx_core::error::Result<PromotedReplica> {
        Err(Error::fatal("no fallback in this test"))
    }
}

fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.isolation.workspaces_root = root.join("workspaces");
    config.isolation.process_allowlist = vec![
        "echo".to_string(),
        "cat".to_string(),
        "sleep".to_string(),
        "sh".to_string(),
    ];
    config.runtime.exec_timeout_seconds = 10;
    config
}

fn manager_with(config: Config) -> (Arc<SandboxManager>, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::new().unwrap());
    let driver = Arc::new(ProcessDriver::new(
        config.isolation.process_allowlist.clone(),
    ));
    let manager =
        SandboxManager::new(config, metrics.clone(), driver, Arc::new(NoFallback)).unwrap();
    (Arc::new(manager), metrics)
}

#[tokio::test]
async fn test_exec_round_trip() {
    // S1: echo hello with a 5s budget.
    let dir = tempfile::tempdir().unwrap();
    let (manager, _metrics) = manager_with(test_config(dir.path()));

    let sandbox = manager
        .create("u_a", CreateOptions::default())
        .await
        .unwrap();
    let out = manager
        .exec(
            &sandbox.sandbox_id,
            "u_a",
            vec!["echo".to_string(), "hello".to_string()],
            None,
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    assert_eq!(out.exit_code, 0);
    assert_eq!(out.stdout, "hello\n");
}

#[tokio::test]
async fn test_workspace_exists_until_destroy() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _metrics) = manager_with(test_config(dir.path()));

    let sandbox = manager
        .create("u_a", CreateOptions::default())
        .await
        .unwrap();
    let workspace = sandbox.workspace_root.clone();
    assert!(workspace.is_dir());

    manager
        .destroy(&sandbox.sandbox_id, "u_a", None)
        .await
        .unwrap();
    assert!(!workspace.exists());
    assert!(matches!(
        manager.lookup(&sandbox.sandbox_id).await.unwrap_err(),
        Error::NotFound(_)
    ));
}

#[tokio::test]
async fn test_file_roundtrip_and_traversal_rejection() {
    // S4 plus the write/read property for valid paths.
    let dir = tempfile::tempdir().unwrap();
    let (manager, _metrics) = manager_with(test_config(dir.path()));
    let sandbox = manager
        .create("u_a", CreateOptions::default())
        .await
        .unwrap();
    let id = sandbox.sandbox_id.clone();

    manager
        .write_file(&id, "u_a", "src/app.js", b"console.log(1)")
        .await
        .unwrap();
    assert_eq!(
        manager.read_file(&id, "u_a", "src/app.js").await.unwrap(),
        b"console.log(1)"
    );

    let err = manager
        .write_file(&id, "u_a", "../../etc/passwd", b"owned")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    let err = manager
        .read_file(&id, "u_a", "../../etc/passwd")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    // Workspace unchanged by the rejected writes.
    let entries = manager.list_dir(&id, "u_a", "").await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["src"]);
}

#[tokio::test]
async fn test_concurrent_exec_quota_trip() {
    // S5: one unit of concurrency headroom, two overlapping execs.
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.quota.max_concurrent_exec = 1;
    let (manager, metrics) = manager_with(config);

    let sandbox = manager
        .create("u_a", CreateOptions::default())
        .await
        .unwrap();
    let id = sandbox.sandbox_id.clone();

    let slow_manager = manager.clone();
    let slow_id = id.clone();
    let slow = tokio::spawn(async move {
        slow_manager
            .exec(
                &slow_id,
                "u_a",
                vec!["sleep".to_string(), "10".to_string()],
                None,
                Some(Duration::from_secs(30)),
            )
            .await
    });

    // Let the slow exec get admitted.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = manager
        .exec(
            &id,
            "u_a",
            vec!["echo".to_string(), "x".to_string()],
            None,
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::QuotaExceeded {
            kind: QuotaKind::ConcurrentExec
        }
    ));
    assert!(
        metrics
            .render()
            .contains(r#"quota_violations_total{kind="concurrent_exec"} 1"#)
    );

    slow.abort();
    let _ = slow.await;
}

#[tokio::test]
async fn test_exec_timeout_signalled() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _metrics) = manager_with(test_config(dir.path()));
    let sandbox = manager
        .create("u_a", CreateOptions::default())
        .await
        .unwrap();

    let err = manager
        .exec(
            &sandbox.sandbox_id,
            "u_a",
            vec!["sleep".to_string(), "30".to_string()],
            None,
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TimedOut(_)));

    // Concurrency slot was released despite the timeout.
    let out = manager
        .exec(
            &sandbox.sandbox_id,
            "u_a",
            vec!["echo".to_string(), "ok".to_string()],
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(out.stdout, "ok\n");
}

#[tokio::test]
async fn test_sandboxes_are_owner_scoped() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _metrics) = manager_with(test_config(dir.path()));
    let sandbox = manager
        .create("u_a", CreateOptions::default())
        .await
        .unwrap();

    let err = manager
        .exec(
            &sandbox.sandbox_id,
            "u_b",
            vec!["echo".to_string()],
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_background_job_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _metrics) = manager_with(test_config(dir.path()));
    let sandbox = manager
        .create("u_a", CreateOptions::default())
        .await
        .unwrap();
    let id = sandbox.sandbox_id.clone();

    let job_id = manager
        .start_background(&id, "u_a", vec!["sleep".to_string(), "60".to_string()])
        .await
        .unwrap();
    assert!(job_id.starts_with("job-"));

    let status = manager.stop_background(&id, "u_a", &job_id).await.unwrap();
    assert_eq!(status, JobStatus::Killed);

    // Stopping again reports the last observed status.
    let status = manager.stop_background(&id, "u_a", &job_id).await.unwrap();
    assert_eq!(status, JobStatus::Killed);

    let err = manager
        .stop_background(&id, "u_a", "job-nope")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_background_job_records_exit() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _metrics) = manager_with(test_config(dir.path()));
    let sandbox = manager
        .create("u_a", CreateOptions::default())
        .await
        .unwrap();
    let id = sandbox.sandbox_id.clone();

    let job_id = manager
        .start_background(&id, "u_a", vec!["echo".to_string(), "done".to_string()])
        .await
        .unwrap();

    // Give the short-lived job time to finish.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = manager.stop_background(&id, "u_a", &job_id).await.unwrap();
    assert_eq!(status, JobStatus::Exited { exit_code: 0 });
}

#[tokio::test]
async fn test_reaper_honors_deadline_and_running_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.runtime.default_ttl_seconds = 0;
    let (manager, _metrics) = manager_with(config);

    let sandbox = manager
        .create("u_a", CreateOptions::default())
        .await
        .unwrap();
    let id = sandbox.sandbox_id.clone();
    let job_id = manager
        .start_background(&id, "u_a", vec!["sleep".to_string(), "60".to_string()])
        .await
        .unwrap();

    // Past deadline but a job is running: kept alive.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.reap_expired().await, 0);
    assert_eq!(manager.active_count().await, 1);

    manager.stop_background(&id, "u_a", &job_id).await.unwrap();
    assert_eq!(manager.reap_expired().await, 1);
    assert_eq!(manager.active_count().await, 0);
}

#[tokio::test]
async fn test_keepalive_extends_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.runtime.default_ttl_seconds = 0;
    let (manager, _metrics) = manager_with(config);

    let sandbox = manager
        .create("u_a", CreateOptions::default())
        .await
        .unwrap();
    manager
        .keepalive(&sandbox.sandbox_id, "u_a", Duration::from_secs(600))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.reap_expired().await, 0);
    assert_eq!(manager.active_count().await, 1);
}

#[tokio::test]
async fn test_preview_registration_and_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _metrics) = manager_with(test_config(dir.path()));
    let sandbox = manager
        .create("u_a", CreateOptions::default())
        .await
        .unwrap();
    let id = sandbox.sandbox_id.clone();

    let upstream = UpstreamDescriptor {
        host: "127.0.0.1".to_string(),
        port: 3000,
        scheme: "http".to_string(),
        driver_kind: DriverKind::Process,
    };
    manager
        .register_preview(&id, "u_a", 3000, upstream.clone(), None)
        .await
        .unwrap();

    let target = manager.resolve_preview(&id, 3000).await.unwrap();
    assert_eq!(target.upstream, upstream);

    // Overwrite is allowed; the registry stays injective per port.
    let moved = UpstreamDescriptor {
        port: 3001,
        ..upstream.clone()
    };
    manager
        .register_preview(&id, "u_a", 3000, moved.clone(), None)
        .await
        .unwrap();
    assert_eq!(
        manager.resolve_preview(&id, 3000).await.unwrap().upstream,
        moved
    );

    let err = manager.resolve_preview(&id, 4000).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_snapshot_gate_blocks_exec_during_create() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _metrics) = manager_with(test_config(dir.path()));
    let sandbox = manager
        .create("u_a", CreateOptions::default())
        .await
        .unwrap();

    // Simulate an in-progress snapshot by holding the write gate.
    let gate = sandbox.write_gate.write().await;

    let exec_manager = manager.clone();
    let exec_id = sandbox.sandbox_id.clone();
    let blocked = tokio::spawn(async move {
        exec_manager
            .exec(
                &exec_id,
                "u_a",
                vec!["echo".to_string(), "later".to_string()],
                None,
                None,
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!blocked.is_finished(), "exec admitted during snapshot");

    drop(gate);
    let out = blocked.await.unwrap().unwrap();
    assert_eq!(out.stdout, "later\n");
}
