//! Web server module.

mod handlers;

pub use handlers::*;

use crate::db::Store;
use crate::status::ResultCache;

use axum::{
    http::{HeaderValue, Method},
    routing::get,
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub status: Arc<ResultCache>,
}

/// Web server for the status API.
pub struct Server {
    port: u16,
    allowed_origins: Vec<String>,
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        port: u16,
        allowed_origins: Vec<String>,
        store: Arc<Store>,
        status: Arc<ResultCache>,
    ) -> Self {
        Self {
            port,
            allowed_origins,
            state: AppState { store, status },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        Router::new()
            .route("/", get(handlers::handle_index))
            .route("/api/server-status", get(handlers::handle_server_status))
            .route("/api/server-recent-status", get(handlers::handle_recent_status))
            .layer(cors_layer(&self.allowed_origins))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

/// Exact-match origin allow-list. Wildcards and unparseable origins are skipped.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) if o != "*" => Some(v),
            _ => {
                tracing::warn!("Ignoring CORS origin {:?}", o);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET])
}
