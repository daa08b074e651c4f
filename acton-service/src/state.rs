//! Application state management

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use crate::config::Config;

/// Handles to the collaboration engine's runtime pieces (Room Registry,
/// Persistence Gateway, token secret, shutdown flag). Kept as a single
/// optional field on `AppState` rather than widening `AppState<T>`'s type
/// parameters further.
#[derive(Clone)]
pub struct CollabHandles {
    pub registry: crate::websocket::RoomRegistryHandle,
    pub persistence: Arc<crate::persistence::PersistenceGateway>,
    pub verifier: crate::auth::login::TokenVerifier,
    pub users: Arc<crate::auth::login::UserDirectory>,
    pub shutting_down: Arc<std::sync::atomic::AtomicBool>,
    pub allowed_origins: Arc<Vec<String>>,
}

/// Application state shared across handlers
///
/// Generic parameter `T` matches the custom config type in `Config<T>`.
/// Use `AppState<()>` (the default) for no custom config; this service uses
/// `AppState<crate::config::CollabConfig>`.
#[derive(Clone)]
pub struct AppState<T = ()>
where
    T: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static,
{
    config: Arc<Config<T>>,

    /// Collaboration engine handles (Room Registry, Persistence Gateway,
    /// token secret, shutdown flag). `None` until `with_collab` is called.
    collab: Option<CollabHandles>,
}

impl<T> Default for AppState<T>
where
    T: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            config: Arc::new(Config::<T>::default()),
            collab: None,
        }
    }
}

impl<T> AppState<T>
where
    T: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static,
{
    /// Create a new AppState with the given configuration
    pub fn new(config: Config<T>) -> Self {
        Self {
            config: Arc::new(config),
            collab: None,
        }
    }

    /// Attach the collaboration engine handles. Called once by `collab-server`
    /// after constructing the Room Registry and Persistence Gateway.
    pub fn with_collab(mut self, collab: CollabHandles) -> Self {
        self.collab = Some(collab);
        self
    }

    /// Get the collaboration engine handles.
    ///
    /// Panics if called before `with_collab` — every handler that reaches
    /// this is mounted on a router built by `collab-server`, which always
    /// attaches them before serving.
    pub fn collab(&self) -> &CollabHandles {
        self.collab
            .as_ref()
            .expect("AppState::collab accessed before with_collab was called")
    }

    /// Create a new builder for AppState
    pub fn builder() -> AppStateBuilder<T> {
        AppStateBuilder::new()
    }

    /// Get the configuration
    pub fn config(&self) -> &Config<T> {
        &self.config
    }
}

/// Builder for AppState
pub struct AppStateBuilder<T = ()>
where
    T: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static,
{
    config: Option<Config<T>>,
    enable_tracing: bool,
}

impl<T> AppStateBuilder<T>
where
    T: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static,
{
    /// Create a new builder with sensible defaults
    ///
    /// By default:
    /// - Config will be loaded from `Config::default()` if not provided
    /// - Tracing will be auto-initialized if not already set up
    pub fn new() -> Self {
        Self {
            config: None,
            enable_tracing: true,
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: Config<T>) -> Self {
        self.config = Some(config);
        self
    }

    /// Enable automatic tracing initialization (default: enabled)
    pub fn with_tracing(mut self) -> Self {
        self.enable_tracing = true;
        self
    }

    /// Disable automatic tracing initialization
    ///
    /// Use this if you want to set up tracing manually or if your application
    /// already has tracing configured before calling `build()`.
    pub fn without_tracing(mut self) -> Self {
        self.enable_tracing = false;
        self
    }

    /// Initialize tracing with sensible defaults
    ///
    /// This is called automatically during `build()` unless disabled with `without_tracing()`.
    /// It's safe to call multiple times - subsequent calls are no-ops.
    fn init_tracing() {
        use std::sync::Once;
        static INIT: Once = Once::new();

        INIT.call_once(|| {
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::INFO)
                .with_target(false)
                .init();
            tracing::debug!("Tracing initialized with default configuration");
        });
    }

    /// Build the AppState
    ///
    /// Uses provided config or loads `Config::default()` if not set, and
    /// initializes tracing with sensible defaults unless disabled.
    pub async fn build(self) -> crate::error::Result<AppState<T>> {
        if self.enable_tracing {
            Self::init_tracing();
        }

        let config = self.config.unwrap_or_default();

        Ok(AppState {
            config: Arc::new(config),
            collab: None,
        })
    }
}

impl<T> Default for AppStateBuilder<T>
where
    T: Serialize + DeserializeOwned + Clone + Default + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_builder() {
        let config = Config::<()>::default();
        let builder = AppStateBuilder::new()
            .config(config)
            .without_tracing(); // Disable tracing in tests to avoid global subscriber conflicts

        // This should succeed even without connection pools
        let state = builder.build().await.unwrap();
        assert_eq!(state.config().service.name, "acton-service");
    }

    #[tokio::test]
    async fn test_state_builder_defaults() {
        // Test that config defaults work
        let state = AppStateBuilder::<()>::new()
            .without_tracing() // Disable tracing in tests
            .build()
            .await
            .unwrap();

        assert_eq!(state.config().service.name, "acton-service");
    }
}
