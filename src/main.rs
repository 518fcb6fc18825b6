use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use sbx_core::config::Config;
use sbx_core::observability::logging::{self, LogFormat};
use sbx_core::observability::Metrics;
use sbx_gateway::AppState;
use sbx_isolation::ResourceCaps;
use sbx_runtime::{ContainerFallback, SandboxManager};
use sbx_snapshot::SnapshotEngine;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Control plane for per-user cloud developer sandboxes.
#[derive(Parser)]
#[command(name = "sandboxd", version)]
struct Args {
    /// Path to a TOML config file (environment variables override it).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the config file.
    #[arg(long)]
    listen: Option<String>,

    /// Log output format.
    #[arg(long, default_value = "human")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.log_format);

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }

    let metrics = Arc::new(Metrics::new().context("metrics registry")?);
    let store = sbx_storage::open_store(&config).context("storage backend")?;

    let kind = sbx_isolation::detect_backend(&config.isolation).await;
    let driver = sbx_isolation::driver_for(kind, &config.isolation);
    let fallback_driver =
        sbx_isolation::driver_for(sbx_isolation::DriverKind::Container, &config.isolation);
    let fallback = Arc::new(ContainerFallback::new(
        fallback_driver,
        ResourceCaps {
            vcpus: config.isolation.microvm.default_vcpus,
            mem_mib: config.isolation.microvm.default_mem_mib,
        },
    ));

    let manager = Arc::new(SandboxManager::new(
        config.clone(),
        metrics.clone(),
        driver,
        fallback,
    )?);
    let snapshots = Arc::new(SnapshotEngine::new(
        store.clone(),
        config.snapshot.clone(),
        &config.storage,
        metrics.clone(),
    ));

    tokio::spawn(sbx_runtime::supervisor::run(manager.clone()));

    info!(isolation = %kind, storage = ?config.storage.backend, "sandboxd starting");
    let state = AppState::new(config, manager, snapshots, store, metrics)?;
    sbx_gateway::serve(state).await
}
