//! Binary entry point for the collaboration server: wires `Config`,
//! `AppState`, and the collaboration engine's handles together, then serves
//! the router built by `acton_service::router` with the graceful shutdown
//! sequence spec'd for this service (drain every live room, close every
//! socket with 1012, then stop accepting connections).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use acton_service::auth::login::{TokenVerifier, UserDirectory};
use acton_service::config::{CollabConfig, Config};
use acton_service::observability::init_tracing;
use acton_service::persistence::PersistenceGateway;
use acton_service::server::Server;
use acton_service::state::{AppState, CollabHandles};
use acton_service::websocket::RoomRegistryHandle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::<CollabConfig>::load()?;
    init_tracing(&config)?;

    if config.custom.is_production() && config.custom.jwt_secret.is_empty() {
        anyhow::bail!("JWT_SECRET is required when NODE_ENV=production");
    }

    let persistence = Arc::new(PersistenceGateway::new(config.custom.mongodb_uri.clone()));
    let registry = RoomRegistryHandle::new(persistence.clone());
    let verifier = TokenVerifier::new(Arc::from(config.custom.jwt_secret.as_str()));
    let users = Arc::new(UserDirectory::new());
    let shutting_down = Arc::new(AtomicBool::new(false));
    let allowed_origins = Arc::new(config.custom.allowed_origins());

    let collab = CollabHandles {
        registry: registry.clone(),
        persistence,
        verifier,
        users,
        shutting_down: shutting_down.clone(),
        allowed_origins,
    };

    let server = Server::new(config.clone());
    let state = AppState::new(config).with_collab(collab);
    let app = acton_service::router(state);

    // The room-draining shutdown sequence (spec §5) needs a custom future
    // in place of the framework's default signal-and-return behavior, so
    // this binary uses `serve_with_shutdown` rather than `Server::serve` —
    // it still goes through the same middleware stack (CORS, compression,
    // tracing, panic recovery) every other acton-service application gets.
    server
        .serve_with_shutdown(app, shutdown_sequence(shutting_down, registry))
        .await?;

    Ok(())
}

/// Waits for SIGINT/SIGTERM, then runs the spec §5 shutdown sequence: flip
/// `shutting_down` (closes new sockets with 1008/1012 and turns REST 503),
/// drain every live room's persist scheduler, then close every socket that
/// survived the drain with 1012. Only once this future resolves does
/// `axum::serve` stop accepting new connections.
async fn shutdown_sequence(shutting_down: Arc<AtomicBool>, registry: RoomRegistryHandle) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("received SIGTERM, starting graceful shutdown"),
    }

    shutting_down.store(true, Ordering::SeqCst);
    registry.drain_all().await;
    registry.close_all_sockets().await;
}
