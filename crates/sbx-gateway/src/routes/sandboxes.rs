//! Sandbox lifecycle and per-sandbox operation endpoints.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use sbx_core::error::Error;
use sbx_isolation::DriverStream;
use sbx_runtime::{CreateOptions, UpstreamDescriptor};

use crate::AppState;
use crate::error::{ApiError, ApiResult};
use crate::routes::require_user;

#[derive(Debug, Default, Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub vcpus: Option<u8>,
    #[serde(default)]
    pub mem_mib: Option<u32>,
}

#[derive(Serialize)]
pub struct CreateResponse {
    pub sandbox_id: String,
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<CreateRequest>>,
) -> ApiResult<Json<CreateResponse>> {
    let user = require_user(&headers)?;
    let options = body.map(|Json(b)| b).unwrap_or_default();
    let sandbox = state
        .manager
        .create(
            &user,
            CreateOptions {
                vcpus: options.vcpus,
                mem_mib: options.mem_mib,
            },
        )
        .await?;
    Ok(Json(CreateResponse {
        sandbox_id: sandbox.sandbox_id.clone(),
    }))
}

pub async fn destroy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let user = require_user(&headers)?;
    state.manager.destroy(&id, &user, None).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Serialize)]
pub struct ExecResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Command failures are structured responses, not HTTP errors; only a
/// timeout flips `timed_out` (exit_code is then meaningless).
pub async fn exec(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ExecRequest>,
) -> ApiResult<Json<ExecResponse>> {
    let user = require_user(&headers)?;
    let timeout = request.timeout_seconds.map(Duration::from_secs);
    let stdin = request.stdin.map(String::into_bytes);

    match state
        .manager
        .exec(&id, &user, request.argv, stdin, timeout)
        .await
    {
        Ok(output) => Ok(Json(ExecResponse {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            timed_out: false,
        })),
        Err(Error::TimedOut(_)) => Ok(Json(ExecResponse {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            timed_out: true,
        })),
        Err(e) => Err(e.into()),
    }
}

pub async fn put_file(
    State(state): State<Arc<AppState>>,
    Path((id, path)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let user = require_user(&headers)?;
    state.manager.write_file(&id, &user, &path, &body).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_file(
    State(state): State<Arc<AppState>>,
    Path((id, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Vec<u8>> {
    let user = require_user(&headers)?;
    Ok(state.manager.read_file(&id, &user, &path).await?)
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path((id, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let user = require_user(&headers)?;
    state.manager.delete_file(&id, &user, &path).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_root(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<sbx_runtime::files::DirEntry>>> {
    let user = require_user(&headers)?;
    Ok(Json(state.manager.list_dir(&id, &user, "").await?))
}

pub async fn list_dir(
    State(state): State<Arc<AppState>>,
    Path((id, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<sbx_runtime::files::DirEntry>>> {
    let user = require_user(&headers)?;
    Ok(Json(state.manager.list_dir(&id, &user, &path).await?))
}

#[derive(Debug, Deserialize)]
pub struct PreviewUpstream {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

fn default_scheme() -> String {
    "http".to_string()
}

#[derive(Debug, Deserialize)]
pub struct RegisterPreviewRequest {
    pub port: u16,
    pub upstream: PreviewUpstream,
    /// Command serving the preview; replayed on fallback promotion.
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

pub async fn register_preview(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RegisterPreviewRequest>,
) -> ApiResult<StatusCode> {
    let user = require_user(&headers)?;
    let upstream = UpstreamDescriptor {
        host: request.upstream.host,
        port: request.upstream.port,
        scheme: request.upstream.scheme,
        driver_kind: state.manager.driver().kind(),
    };
    state
        .manager
        .register_preview(&id, &user, request.port, upstream, request.command)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct KeepaliveRequest {
    pub ttl_seconds: u64,
}

pub async fn keepalive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<KeepaliveRequest>,
) -> ApiResult<StatusCode> {
    let user = require_user(&headers)?;
    state
        .manager
        .keepalive(&id, &user, Duration::from_secs(request.ttl_seconds))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct MountRequest {
    pub host_path: PathBuf,
    pub guest_path: String,
    #[serde(default)]
    pub read_only: bool,
}

pub async fn mount(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<MountRequest>,
) -> ApiResult<StatusCode> {
    let user = require_user(&headers)?;
    state
        .manager
        .mount(
            &id,
            &user,
            &request.host_path,
            &request.guest_path,
            request.read_only,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct BackgroundRequest {
    pub argv: Vec<String>,
}

#[derive(Serialize)]
pub struct BackgroundResponse {
    pub job_id: String,
}

pub async fn start_background(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<BackgroundRequest>,
) -> ApiResult<Json<BackgroundResponse>> {
    let user = require_user(&headers)?;
    let job_id = state
        .manager
        .start_background(&id, &user, request.argv)
        .await?;
    Ok(Json(BackgroundResponse { job_id }))
}

pub async fn stop_background(
    State(state): State<Arc<AppState>>,
    Path((id, job_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Json<sbx_runtime::JobStatus>> {
    let user = require_user(&headers)?;
    let status = state.manager.stop_background(&id, &user, &job_id).await?;
    Ok(Json(status))
}

/// Interactive terminal: WebSocket bridged onto the driver's byte stream.
pub async fn terminal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let user = require_user(&headers)?;
    let stream = state.manager.open_terminal(&id, &user).await?;
    Ok(upgrade.on_upgrade(move |socket| bridge_terminal(socket, stream, id)))
}

async fn bridge_terminal(socket: WebSocket, stream: DriverStream, sandbox_id: String) {
    let (mut ws_tx, mut ws_rx) = {
        use futures_util::StreamExt;
        socket.split()
    };
    let DriverStream {
        mut reader,
        mut writer,
    } = stream;

    let to_client = async {
        use futures_util::SinkExt;
        let mut buf = vec![0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if ws_tx.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    let to_sandbox = async {
        use futures_util::StreamExt;
        while let Some(Ok(message)) = ws_rx.next().await {
            let bytes = match message {
                Message::Binary(b) => b,
                Message::Text(t) => t.into_bytes(),
                Message::Close(_) => break,
                _ => continue,
            };
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = to_client => {}
        _ = to_sandbox => {}
    }
    debug!(sandbox = %sandbox_id, "terminal session closed");
}
