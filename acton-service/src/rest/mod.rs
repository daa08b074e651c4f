//! REST surface: the two HTTP endpoints that sit alongside
//! the WebSocket connection — changing a project's per-user permissions and
//! approving a pending suggestion. Both require a bearer token and resolve
//! the caller's effective role the same way the WebSocket path does
//! (`perms[userId] ?? tokenRole`), so an admin demoted in one room stays an
//! admin in another.

pub mod permissions;
pub mod suggestions;

use axum::http::{header::AUTHORIZATION, HeaderMap};

use crate::auth::login::Identity;
use crate::error::Error;
use crate::state::CollabHandles;

/// Extract and verify the bearer token from `Authorization: Bearer <token>`.
fn bearer_identity(headers: &HeaderMap, collab: &CollabHandles) -> Result<Identity, Error> {
    let raw = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Unauthorized("missing bearer token".into()))?;
    let token = raw
        .strip_prefix("Bearer ")
        .ok_or_else(|| Error::Unauthorized("malformed authorization header".into()))?;
    collab
        .verifier
        .verify(token)
        .ok_or_else(|| Error::Unauthorized("invalid or expired token".into()))
}
