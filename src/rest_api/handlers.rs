//! HTTP handlers for the REST API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::{error, info, instrument, warn};

use crate::controller::StatusSnapshot;
use crate::relation::{describe_errors, RelationEvent};

use super::dto::{
    AcceptedResponse, ErrorResponse, HealthResponse, RelationRequest, ServiceListResponse,
    ServiceSummary,
};
use super::server::ApiState;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Health check endpoint
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Prometheus text exposition
#[cfg(feature = "metrics")]
pub async fn metrics() -> Result<String, ApiError> {
    crate::controller::metrics::encode_registry().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("metrics_failed", &e.to_string())),
        )
    })
}

/// Current status level, message and conditions
#[instrument(skip(state))]
pub async fn status(State(state): State<ApiState>) -> Json<StatusSnapshot> {
    Json(state.controller.status.snapshot())
}

/// Every related service with the phase from the last pass
#[instrument(skip(state))]
pub async fn list_services(State(state): State<ApiState>) -> Json<ServiceListResponse> {
    let snapshot = state.controller.status.snapshot();
    let reconciler = state.controller.reconciler.lock().await;
    let applied = reconciler.applied();

    let items: Vec<ServiceSummary> = reconciler
        .relations()
        .all()
        .iter()
        .map(|req| ServiceSummary {
            name: req.service_name.clone(),
            hostnames: req.hostnames.clone(),
            backend_addresses: req.backend_addresses.clone(),
            load_balancing: req.load_balancing,
            auth_enabled: req.auth_enabled(),
            phase: snapshot
                .last_outcome
                .as_ref()
                .and_then(|o| o.services.get(&req.service_name).copied()),
            applied: applied.last_config_hash.contains_key(&req.service_name),
        })
        .collect();

    let total = items.len();
    Json(ServiceListResponse { items, total })
}

/// Create or replace the relation of one service
#[instrument(skip(state, body), fields(service = %service))]
pub async fn put_relation(
    State(state): State<ApiState>,
    Path(service): Path<String>,
    Json(body): Json<RelationRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let requirement = body.into_requirement(&service);
    if let Err(errors) = requirement.validate() {
        warn!("Rejected relation for {}: {}", service, describe_errors(&errors));
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::invalid(&errors)),
        ));
    }

    send(&state, RelationEvent::Upsert(requirement)).await?;
    info!("Accepted relation update for {}", service);
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            service,
            action: "upsert".to_string(),
        }),
    ))
}

/// Remove the relation of one service
#[instrument(skip(state), fields(service = %service))]
pub async fn delete_relation(
    State(state): State<ApiState>,
    Path(service): Path<String>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    send(&state, RelationEvent::Remove(service.clone())).await?;
    info!("Accepted relation removal for {}", service);
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            service,
            action: "remove".to_string(),
        }),
    ))
}

async fn send(state: &ApiState, event: RelationEvent) -> Result<(), ApiError> {
    state.events.send(event).await.map_err(|e| {
        error!("Controller is not accepting events: {}", e);
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new(
                "controller_unavailable",
                "The controller loop has stopped",
            )),
        )
    })
}
