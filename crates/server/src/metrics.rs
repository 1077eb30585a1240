//! Prometheus metrics for the gantry server.
//!
//! # Security Note
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! It exposes aggregate system usage only (session counts, byte totals), but
//! MUST still be network-restricted to authorized scraper IPs at the
//! infrastructure level. Do NOT expose `/metrics` on public networks.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Session lifecycle metrics
pub static SESSIONS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gantry_sessions_created_total",
        "Total number of upload sessions created",
    )
    .expect("metric creation failed")
});

pub static SESSIONS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gantry_sessions_completed_total",
        "Total number of upload sessions assembled and completed",
    )
    .expect("metric creation failed")
});

pub static SESSIONS_ABORTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gantry_sessions_aborted_total",
        "Total number of upload sessions aborted by clients",
    )
    .expect("metric creation failed")
});

pub static SESSIONS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gantry_sessions_failed_total",
        "Total number of upload sessions moved to the failed state",
    )
    .expect("metric creation failed")
});

pub static SESSIONS_REAPED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gantry_sessions_reaped_total",
        "Total number of stale sessions aborted by the reaper",
    )
    .expect("metric creation failed")
});

// Chunk metrics
pub static CHUNKS_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gantry_chunks_received_total",
        "Total number of chunks durably persisted",
    )
    .expect("metric creation failed")
});

pub static CHUNKS_DUPLICATE: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gantry_chunks_duplicate_total",
        "Total number of duplicate chunk acknowledgements",
    )
    .expect("metric creation failed")
});

pub static BYTES_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gantry_bytes_received_total",
        "Total bytes durably persisted (distinct chunks only)",
    )
    .expect("metric creation failed")
});

// Timing metrics
pub static CHUNK_WRITE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "gantry_chunk_write_duration_seconds",
            "Time taken to persist a single chunk",
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
    )
    .expect("metric creation failed")
});

pub static ASSEMBLE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "gantry_assemble_duration_seconds",
            "Time taken to assemble a completed upload",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("metric creation failed")
});

// Error metrics
pub static UPLOAD_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "gantry_upload_errors_total",
            "Total upload errors by error kind",
        ),
        &["error_kind"],
    )
    .expect("metric creation failed")
});

// Current state gauges
pub static ACTIVE_SESSIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "gantry_active_sessions",
        "Current number of non-terminal upload sessions",
    )
    .expect("metric creation failed")
});

pub static SCHEDULER_QUEUE_REJECTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gantry_scheduler_queue_rejections_total",
        "Total admissions rejected because a session queue was full",
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// This function is idempotent - subsequent calls after the first are no-ops.
/// This allows safe use in integration tests or when embedding multiple routers.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(SESSIONS_CREATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SESSIONS_COMPLETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SESSIONS_ABORTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SESSIONS_FAILED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SESSIONS_REAPED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_RECEIVED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_DUPLICATE.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_RECEIVED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNK_WRITE_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ASSEMBLE_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_ERRORS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ACTIVE_SESSIONS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SCHEDULER_QUEUE_REJECTIONS.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Helper to record upload errors by kind.
pub fn record_upload_error(error_kind: &str) {
    UPLOAD_ERRORS.with_label_values(&[error_kind]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_registration_is_idempotent() {
        register_metrics();
        register_metrics();
    }
}
