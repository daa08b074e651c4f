//! Health check handlers.
//!
//! Trimmed from the teacher's multi-backend readiness aggregator (database/
//! redis/nats/turso/surrealdb/grpc pool checks) down to what this service
//! actually has: a liveness probe with no dependencies, and a readiness
//! probe that reports the one external dependency this service has — the
//! document store, via the Persistence Gateway's own `ensure_connection`
//! availability contract (§4.2), which already degrades to "unavailable"
//! rather than erroring when `MONGODB_URI` is unset.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

use crate::config::CollabConfig;
use crate::state::AppState;

/// Liveness probe response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
}

/// Readiness probe response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    /// Overall readiness status
    pub ready: bool,

    /// Document store status: `"connected"`, `"unavailable"`, or
    /// `"disabled"` (no `MONGODB_URI` configured — ephemeral mode).
    pub store: &'static str,
}

/// `GET /api/health` — always `200 {status:"ok"}` while the process is
/// running. Used by orchestrators to decide whether to restart the pod;
/// it never touches the document store or the Room Registry.
pub async fn health(State(_state): State<AppState<CollabConfig>>) -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok".into() }))
}

/// `GET /api/ready` — `200` once the document store (if configured) is
/// reachable, or immediately if the service is running in ephemeral,
/// store-disabled mode. Not part of the core protocol surface (§6.3); an
/// operational convenience for orchestrators that gate traffic on
/// readiness separately from liveness.
pub async fn readiness(State(state): State<AppState<CollabConfig>>) -> impl IntoResponse {
    let collab = state.collab();
    let store = if collab.persistence.is_configured() {
        if collab.persistence.ensure_connection().await {
            "connected"
        } else {
            "unavailable"
        }
    } else {
        "disabled"
    };

    let ready = store != "unavailable";
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(ReadinessResponse { ready, store }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response() {
        let response = HealthResponse { status: "ok".into() };
        assert_eq!(response.status, "ok");
    }

    #[test]
    fn test_readiness_response() {
        let response = ReadinessResponse { ready: true, store: "disabled" };
        assert!(response.ready);
        assert_eq!(response.store, "disabled");
    }
}
