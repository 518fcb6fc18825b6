// sbx-gateway: Thin HTTP facades over the runtime, snapshot engine, and
// preview proxy. Handlers unmarshal, call into the core, and map errors;
// no business logic lives here.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{MatchedPath, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{any, delete, get, post, put};
use tower_http::trace::TraceLayer;
use tracing::info;

use sbx_core::config::Config;
use sbx_core::observability::Metrics;
use sbx_runtime::SandboxManager;
use sbx_snapshot::SnapshotEngine;
use sbx_storage::BlobStore;

pub mod error;
pub mod proxy;
pub mod routes;

/// Shared state handed to every handler.
pub struct AppState {
    pub config: Config,
    pub manager: Arc<SandboxManager>,
    pub snapshots: Arc<SnapshotEngine>,
    pub store: Arc<dyn BlobStore>,
    pub metrics: Arc<Metrics>,
    pub proxy: proxy::ProxyState,
}

impl AppState {
    pub fn new(
        config: Config,
        manager: Arc<SandboxManager>,
        snapshots: Arc<SnapshotEngine>,
        store: Arc<dyn BlobStore>,
        metrics: Arc<Metrics>,
    ) -> sbx_core::error::Result<Arc<Self>> {
        let proxy = proxy::ProxyState::new(&config)?;
        Ok(Arc::new(Self {
            config,
            manager,
            snapshots,
            store,
            metrics,
            proxy,
        }))
    }
}

/// Build the full control-plane router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Sandbox lifecycle and per-sandbox operations.
        .route("/sandboxes", post(routes::sandboxes::create))
        .route("/sandboxes/:id/exec", post(routes::sandboxes::exec))
        .route(
            "/sandboxes/:id/files/*path",
            put(routes::sandboxes::put_file)
                .get(routes::sandboxes::get_file)
                .delete(routes::sandboxes::delete_file),
        )
        .route("/sandboxes/:id/dir", get(routes::sandboxes::list_root))
        .route("/sandboxes/:id/dir/*path", get(routes::sandboxes::list_dir))
        .route("/sandboxes/:id/preview", post(routes::sandboxes::register_preview))
        .route("/sandboxes/:id/keepalive", post(routes::sandboxes::keepalive))
        .route("/sandboxes/:id/mount", post(routes::sandboxes::mount))
        .route("/sandboxes/:id/background", post(routes::sandboxes::start_background))
        .route(
            "/sandboxes/:id/background/:job_id",
            delete(routes::sandboxes::stop_background),
        )
        .route("/sandboxes/:id/terminal", get(routes::sandboxes::terminal))
        .route("/sandboxes/:id", delete(routes::sandboxes::destroy))
        // Snapshots.
        .route("/snapshot/create", post(routes::snapshots::create))
        .route("/snapshot/restore", post(routes::snapshots::restore))
        .route("/snapshot/list", get(routes::snapshots::list))
        .route("/snapshot/:snapshot_id", delete(routes::snapshots::delete))
        // Preview proxy.
        .route("/preview/:sandbox_id/:port", any(proxy::handle))
        .route("/preview/:sandbox_id/:port/*path", any(proxy::handle))
        // Health and metrics.
        .route("/health", get(routes::system::health))
        .route("/health/ready", get(routes::system::ready))
        .route("/metrics", get(routes::system::metrics))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            record_http_metrics,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the process exits.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let listen = state.config.server.listen.clone();
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(listen = %listen, "gateway listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// Record `http_requests_total` and latency per matched route pattern.
/// Raw paths would explode label cardinality, so unmatched requests are
/// grouped under "unmatched".
async fn record_http_metrics(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let started = Instant::now();
    let response = next.run(request).await;
    let elapsed = started.elapsed();

    state
        .metrics
        .http_requests_total
        .with_label_values(&[&method, &path, response.status().as_str()])
        .inc();
    state
        .metrics
        .http_request_duration_seconds
        .observe(elapsed.as_secs_f64());
    response
}
