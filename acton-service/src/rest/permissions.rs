//! `POST /api/projects/:id/permissions`.

use std::sync::atomic::Ordering;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::config::CollabConfig;
use crate::error::{Error, Result};
use crate::role::Role;
use crate::state::AppState;
use crate::websocket::RoomId;

#[derive(Debug, Deserialize)]
pub struct SetPermissionRequest {
    #[serde(rename = "userId")]
    user_id: String,
    role: Role,
}

#[derive(Debug, Serialize)]
pub struct SetPermissionResponse {
    ok: bool,
    #[serde(rename = "userId")]
    user_id: String,
    role: Role,
}

/// Requires the caller's effective role in this project to be `admin`; 403
/// otherwise. 400 on a malformed body or room id, 401 without a valid
/// bearer token, 503 while the server is shutting down.
pub async fn set_permission(
    State(state): State<AppState<CollabConfig>>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SetPermissionRequest>,
) -> Result<Json<SetPermissionResponse>> {
    let collab = state.collab();
    if collab.shutting_down.load(Ordering::SeqCst) {
        return Err(Error::ServiceUnavailable("server is shutting down".into()));
    }
    let identity = super::bearer_identity(&headers, collab)?;
    let room_id = RoomId::parse(&project_id)
        .map_err(|_| Error::BadRequest("invalid project id".into()))?;

    let room = collab.registry.get_or_create(room_id).await?;
    let caller_role = room
        .effective_role(identity.user_id.clone(), identity.role)
        .await;
    room.set_permission(caller_role, body.user_id.clone(), body.role)
        .await?;

    Ok(Json(SetPermissionResponse {
        ok: true,
        user_id: body.user_id,
        role: body.role,
    }))
}
