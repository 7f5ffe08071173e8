//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde_json::{Value, json};

use crate::registry::SwarmError;
use crate::service::{HealthSnapshot, ServiceError, SwarmService};

fn error_status(error: &ServiceError) -> StatusCode {
    match error {
        ServiceError::UnknownOperation(_) => StatusCode::NOT_FOUND,
        ServiceError::InvalidArguments { .. } => StatusCode::BAD_REQUEST,
        ServiceError::Swarm(SwarmError::EmptyPool | SwarmError::Unavailable) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ServiceError::Swarm(SwarmError::UnknownDevice(_)) => StatusCode::NOT_FOUND,
        ServiceError::Swarm(SwarmError::Remote(_)) => StatusCode::BAD_GATEWAY,
    }
}

async fn health_check(State(service): State<Arc<SwarmService>>) -> Json<HealthSnapshot> {
    Json(service.health())
}

async fn invoke_operation(
    State(service): State<Arc<SwarmService>>,
    Path(name): Path<String>,
    body: Option<Json<Value>>,
) -> impl IntoResponse {
    let args = body.map(|Json(v)| v).unwrap_or_else(|| json!({}));

    match service.invoke(&name, args).await {
        Ok(result) => (StatusCode::OK, Json(result)),
        Err(e) => {
            let status = error_status(&e);
            if status.is_server_error() {
                tracing::warn!(operation = %name, error = %e, "Operation failed");
            } else {
                tracing::debug!(operation = %name, error = %e, "Operation rejected");
            }
            (
                status,
                Json(json!({
                    "error": e.to_string(),
                    "kind": e.kind(),
                })),
            )
        }
    }
}

async fn shutdown(State(service): State<Arc<SwarmService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(json!({})))
}

pub fn routes(service: Arc<SwarmService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/shutdown", post(shutdown))
        .route("/operations/{name}", post(invoke_operation))
        .with_state(service)
}
