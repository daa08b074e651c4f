//! `POST /api/projects/:id/suggestions/:sid/approve`.

use std::sync::atomic::Ordering;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use crate::config::CollabConfig;
use crate::error::{Error, Result};
use crate::state::AppState;
use crate::websocket::RoomId;

#[derive(Debug, Serialize)]
pub struct ApproveSuggestionResponse {
    ok: bool,
    #[serde(rename = "suggestionId")]
    suggestion_id: String,
}

/// Requires the caller's effective role in this project to be `admin`; 403
/// otherwise, 404 if the suggestion id doesn't exist in the doc. 400 on an
/// invalid room id, 401 without a valid bearer token, 503 while the server
/// is shutting down.
pub async fn approve_suggestion(
    State(state): State<AppState<CollabConfig>>,
    Path((project_id, suggestion_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<ApproveSuggestionResponse>> {
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
    room.approve_suggestion(caller_role, suggestion_id.clone(), identity.user_id)
        .await?;

    Ok(Json(ApproveSuggestionResponse {
        ok: true,
        suggestion_id,
    }))
}
