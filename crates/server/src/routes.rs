//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::ratelimit::{RateScope, rate_limit_middleware};
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{delete, get, post};
use tower_http::trace::TraceLayer;

/// Multipart framing overhead allowed on top of the chunk size.
const CHUNK_BODY_OVERHEAD: usize = 64 * 1024;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let rate_limit = state.rate_limit.clone();

    // Control plane: init, complete, status, delete. General bucket.
    let control_routes = Router::new()
        .route("/api/upload/init", post(handlers::init_upload))
        .route(
            "/api/upload/complete/{upload_id}",
            post(handlers::complete_upload),
        )
        .route(
            "/api/upload/status/{upload_id}",
            get(handlers::upload_status),
        )
        .route("/api/upload/{upload_id}", delete(handlers::delete_upload))
        .layer(middleware::from_fn_with_state(
            (rate_limit.clone(), RateScope::General),
            rate_limit_middleware,
        ));

    // Ingest path: its own (much larger) bucket, and a body limit sized to
    // one chunk plus multipart framing.
    let chunk_body_limit = state.config.upload.chunk_size as usize + CHUNK_BODY_OVERHEAD;
    let chunk_routes = Router::new()
        .route("/api/upload/chunk/{upload_id}", post(handlers::upload_chunk))
        .layer(DefaultBodyLimit::max(chunk_body_limit))
        .layer(middleware::from_fn_with_state(
            (rate_limit.clone(), RateScope::Upload),
            rate_limit_middleware,
        ));

    let monitoring_routes = Router::new()
        .route("/api/monitoring/stats", get(handlers::monitoring_stats))
        // Health is intentionally unauthenticated for load balancers/probes.
        .route("/api/monitoring/health", get(handlers::health_check))
        .layer(middleware::from_fn_with_state(
            (rate_limit, RateScope::Monitoring),
            rate_limit_middleware,
        ));

    let mut router = Router::new()
        .merge(control_routes)
        .merge(chunk_routes)
        .merge(monitoring_routes);

    // Conditionally add the Prometheus endpoint based on config.
    // SECURITY: when enabled, this endpoint MUST be network-restricted to
    // authorized scraper IPs. See crate::metrics module documentation.
    if state.config.server.metrics_enabled {
        router = router.merge(Router::new().route("/metrics", get(metrics_handler)));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
