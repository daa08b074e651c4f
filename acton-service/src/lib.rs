//! # acton-service
//!
//! A real-time collaboration server framework: named rooms backed by CRDT
//! documents, role-gated mutation, presence/awareness, and debounced
//! persistence to an external document store.
//!
//! ## Features
//!
//! - **Rooms**: lazily created, exclusively owned, torn down after a final
//!   persist flush once empty.
//! - **CRDT sync**: a binary WebSocket protocol multiplexing document deltas,
//!   presence updates, and JSON chat/ping messages.
//! - **Role-based authorization**: `viewer < editor < admin`, with per-room
//!   permission overrides layered on top of the token's role.
//! - **Debounced persistence**: a coalescing scheduler that flushes room state
//!   to MongoDB without stalling the hot path.
//! - **Graceful shutdown**: drains every live room before closing sockets.
//!
//! See the `collab-server` binary crate for how a full application wires
//! `Config<CollabConfig>`, `AppState`, and [`router`] together, including the
//! shutdown sequence that drains every live room before the listener stops
//! accepting connections.

pub mod config;
pub mod error;
pub mod ids;
pub mod middleware;
pub mod health;
pub mod responses;
pub mod server;
pub mod state;
pub mod observability;

pub mod role;
pub mod crdt;
pub mod persistence;
pub mod websocket;
pub mod auth;
pub mod rest;

/// Builds the application's Axum router: health, auth, REST permission/
/// suggestion endpoints, and the collaboration WebSocket endpoint.
pub fn router(state: state::AppState<config::CollabConfig>) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/api/health", get(health::health))
        .route("/api/ready", get(health::readiness))
        .route("/api/auth/login", post(auth::login::login))
        .route(
            "/api/projects/{id}/permissions",
            post(rest::permissions::set_permission),
        )
        .route(
            "/api/projects/{id}/suggestions/{sid}/approve",
            post(rest::suggestions::approve_suggestion),
        )
        .route("/", get(websocket::ws_handler))
        .with_state(state)
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::health::health;
    pub use crate::ids::{MakeTypedRequestId, RequestId, RequestIdError};
    pub use crate::middleware::{
        request_id_layer, request_id_propagation_layer, sensitive_headers_layer,
        RequestTrackingConfig, PROPAGATE_HEADERS, SENSITIVE_HEADERS,
    };
    pub use crate::role::Role;
    pub use crate::server::Server;
    pub use crate::state::AppState;
    pub use crate::responses::{
        Accepted, Conflict, Created, FieldError, NoContent, Success, ValidationError,
    };

    pub use crate::observability::init_tracing;

    pub use crate::websocket::{ConnectionId, RoomHandle, RoomId, RoomRegistryHandle};

    pub use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{delete, get, patch, post, put},
        Extension, Router,
    };

    pub use serde::{Deserialize, Serialize};

    pub use tracing::{debug, error, info, instrument, trace, warn, Level, Span};

    pub use tokio;

    pub use async_trait::async_trait;

    pub use thiserror::Error;
    pub use anyhow::{self, Context as AnyhowContext};

    pub use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};

    pub use uuid::Uuid;

    pub use futures::{future, stream, Future, Stream, StreamExt, TryFutureExt, TryStreamExt};

    pub use http::{Method, Uri};
}
