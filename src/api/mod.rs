//! HTTP server for the Murmur gateway
//!
//! Serves the WebSocket endpoint, health and introspection routes, and the
//! browser client's static files.

mod health;
mod sessions;
mod websocket;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::backends::Backends;
use crate::session::{SessionRegistry, SessionSettings};

pub use health::{CapabilitiesResponse, CheckResult, HealthResponse};

/// How long shutdown waits for sessions to close
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared state for API handlers
#[derive(Debug)]
pub struct ApiState {
    /// Live sessions
    pub sessions: Arc<SessionRegistry>,

    /// Capabilities handed to every new session
    pub backends: Backends,

    pub settings: SessionSettings,
}

impl ApiState {
    #[must_use]
    pub fn new(backends: Backends, settings: SessionSettings) -> Self {
        Self {
            sessions: Arc::new(SessionRegistry::new()),
            backends,
            settings,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
    static_dir: Option<PathBuf>,
}

impl ApiServer {
    #[must_use]
    pub const fn new(state: Arc<ApiState>, port: u16, static_dir: Option<PathBuf>) -> Self {
        Self {
            state,
            port,
            static_dir,
        }
    }

    /// Build the router with all routes
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .merge(websocket::router(self.state.clone()))
            .merge(health::router(self.state.clone()))
            .nest("/api/sessions", sessions::router(self.state.clone()));

        // Serve static files if the directory exists
        if let Some(static_dir) = self.static_dir.as_ref().filter(|dir| dir.is_dir()) {
            let index_file = static_dir.join("index.html");
            let serve_dir =
                ServeDir::new(static_dir).not_found_service(ServeFile::new(&index_file));

            router = router.fallback_service(serve_dir);
            tracing::info!(path = %static_dir.display(), "serving static files");
        } else if let Some(static_dir) = &self.static_dir {
            tracing::warn!(path = %static_dir.display(), "static directory not found, web client disabled");
        }

        // CORS layer for cross-origin requests from frontend
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
    }

    /// Run the server until `shutdown` fires
    ///
    /// On shutdown every session is closed, waiting at most ten seconds.
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind {addr}: {e}")))?;

        tracing::info!(port = self.port, "server listening");

        let state = Arc::clone(&self.state);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                tracing::info!("shutting down server");
                close_sessions(&state.sessions).await;
            })
            .await
            .map_err(|e| crate::Error::Config(format!("server error: {e}")))?;

        tracing::info!("server exited");
        Ok(())
    }
}

/// Close every live session, giving up after the grace period
async fn close_sessions(sessions: &SessionRegistry) {
    match tokio::time::timeout(SHUTDOWN_GRACE, sessions.close_all()).await {
        Ok(closed) => tracing::info!(closed, "sessions closed"),
        Err(_) => tracing::warn!(
            remaining = sessions.len(),
            "sessions did not close within the grace period"
        ),
    }
}
