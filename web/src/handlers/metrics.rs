//! Prometheus scrape endpoint.

use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use tasksync_runtime::metrics::MetricsRecorder;

/// Content type of the Prometheus text exposition format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Render metrics for `GET /metrics`.
///
/// Without an installed recorder (another recorder owns the process) the
/// endpoint answers 503.
#[must_use]
pub fn render(recorder: Option<&MetricsRecorder>) -> Response {
    match recorder {
        Some(recorder) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            recorder.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}
