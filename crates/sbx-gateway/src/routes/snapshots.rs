//! Snapshot endpoints: thin dispatch over the snapshot engine, with
//! workspace freezing coordinated through the sandbox runtime.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;

use sbx_core::error::Error;
use sbx_snapshot::Snapshot;

use crate::AppState;
use crate::error::ApiResult;
use crate::routes::require_user;

#[derive(Debug, Default, Deserialize)]
pub struct CreateSnapshotRequest {
    #[serde(default)]
    pub sandbox_id: Option<String>,
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Option<Json<CreateSnapshotRequest>>,
) -> ApiResult<Json<Snapshot>> {
    let user = require_user(&headers)?;
    let request = body.map(|Json(b)| b).unwrap_or_default();

    // Without an explicit sandbox the user's single sandbox is implied.
    let sandbox_id = match request.sandbox_id {
        Some(id) => id,
        None => {
            let owned = state.manager.sandboxes_of(&user).await;
            match owned.as_slice() {
                [only] => only.sandbox_id.clone(),
                [] => return Err(Error::not_found("No sandbox to snapshot").into()),
                _ => {
                    return Err(Error::invalid(
                        "sandbox_id required when owning multiple sandboxes",
                    )
                    .into());
                }
            }
        }
    };

    let snapshot = state
        .manager
        .create_snapshot(&sandbox_id, &user, &state.snapshots)
        .await?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
pub struct RestoreSnapshotRequest {
    pub snapshot_id: String,
    pub sandbox_id: String,
}

pub async fn restore(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RestoreSnapshotRequest>,
) -> ApiResult<StatusCode> {
    let user = require_user(&headers)?;
    state
        .manager
        .restore_snapshot(
            &request.sandbox_id,
            &user,
            &request.snapshot_id,
            &state.snapshots,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Snapshot>>> {
    let user = require_user(&headers)?;
    Ok(Json(state.snapshots.list(&user).await?))
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path(snapshot_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let user = require_user(&headers)?;
    state.snapshots.delete(&user, &snapshot_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
