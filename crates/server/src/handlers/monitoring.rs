//! Monitoring endpoint handlers.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::{Value, json};

/// GET /api/monitoring/stats - aggregate upload counters.
#[tracing::instrument(skip(state))]
pub async fn monitoring_stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let stats = state
        .registry
        .stats()
        .await
        .map_err(|e| ApiError::Internal(format!("stats query failed: {e}")))?;

    Ok(Json(json!({
        "totalUploads": stats.total_sessions,
        "activeUploads": stats.active_sessions,
        "failedUploads": stats.failed_sessions,
        "totalSize": stats.total_bytes,
        "averageSpeed": stats.average_speed_bps,
    })))
}

/// GET /api/monitoring/health - liveness probe covering both backends.
///
/// Intentionally unauthenticated for load balancers and orchestration
/// probes.
#[tracing::instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.health_check().await;
    let registry = state.registry.health_check().await;

    match (store, registry) {
        (Ok(()), Ok(())) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        (store, registry) => {
            if let Err(e) = &store {
                tracing::error!(error = %e, "Store health check failed");
            }
            if let Err(e) = &registry {
                tracing::error!(error = %e, "Registry health check failed");
            }
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unavailable",
                    "store": store.is_ok(),
                    "registry": registry.is_ok(),
                })),
            )
        }
    }
}
