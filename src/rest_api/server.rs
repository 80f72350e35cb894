//! Axum HTTP server for the REST API

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, put},
    Router,
};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::ControllerState;
use crate::relation::RelationEvent;
use crate::{Error, Result};

use super::handlers;

/// State shared by every handler
#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<ControllerState>,
    /// Feeds the controller loop; relation changes never touch the store directly
    pub events: mpsc::Sender<RelationEvent>,
}

impl ApiState {
    pub fn new(controller: Arc<ControllerState>, events: mpsc::Sender<RelationEvent>) -> Self {
        Self { controller, events }
    }
}

pub fn router(state: ApiState) -> Router {
    let router = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/status", get(handlers::status))
        .route("/api/v1/services", get(handlers::list_services))
        .route(
            "/api/v1/relations/{service}",
            put(handlers::put_relation).delete(handlers::delete_relation),
        );

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(handlers::metrics));

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Run the REST API server until the listener fails
pub async fn run_server(state: ApiState, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("REST API server listening on {}", addr);

    axum::serve(listener, router(state))
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}
