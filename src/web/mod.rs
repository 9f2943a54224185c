//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::history::RetentionReader;
use crate::probe::ProbeRegistry;
use crate::scheduler::HealthCheckScheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub registry: Arc<ProbeRegistry>,
    pub scheduler: Arc<HealthCheckScheduler>,
    pub reader: Arc<RetentionReader>,
}

/// Web server for HealthTrail.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = routes(self.state.clone());

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

/// Build the router with all routes.
pub fn routes(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route(
            "/api/configurations",
            get(handlers::handle_get_configurations).post(handlers::handle_create_configuration),
        )
        .route(
            "/api/configurations/{id}",
            put(handlers::handle_update_configuration).delete(handlers::handle_delete_configuration),
        )
        .route(
            "/api/systems/{system_id}/checks/{configuration_id}",
            put(handlers::handle_put_system_check).delete(handlers::handle_delete_system_check),
        )
        .route(
            "/api/systems/{system_id}/checks/{configuration_id}/retention",
            put(handlers::handle_put_retention),
        )
        .route(
            "/api/systems/{system_id}/checks/{configuration_id}/runs",
            get(handlers::handle_get_runs),
        )
        .route("/api/systems/{system_id}/health", get(handlers::handle_get_system_health))
        .route(
            "/api/systems/{system_id}/maintenances",
            post(handlers::handle_create_maintenance),
        )
        .route("/api/history", get(handlers::handle_get_history))
        .route("/api/availability", get(handlers::handle_get_availability))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .with_state(state)
}
