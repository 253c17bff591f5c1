//! Health check endpoints.
//!
//! These endpoints are used by load balancers and monitoring systems
//! to verify service health.

use axum::{Json, http::StatusCode};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::time::Instant;
use tasksync_runtime::{HealthReport, HealthStatus};

/// Liveness body.
#[derive(Debug, Clone, Serialize)]
pub struct Liveness {
    /// Always `"healthy"` while the process serves requests.
    pub status: &'static str,
    /// Server time, ISO-8601.
    pub timestamp: String,
    /// Seconds since the service started.
    pub uptime: f64,
}

/// Simple health check (liveness). Does not check dependencies.
///
/// # Endpoint
///
/// ```text
/// GET /api/health
/// ```
///
/// # Response
///
/// ```json
/// {"status": "healthy", "timestamp": "2024-05-01T10:00:00.000Z", "uptime": 12.5}
/// ```
#[must_use]
pub fn liveness(started: Instant, now: DateTime<Utc>) -> Json<Liveness> {
    Json(Liveness {
        status: "healthy",
        timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        uptime: started.elapsed().as_secs_f64(),
    })
}

/// Readiness response built from component checks.
///
/// # Status Codes
///
/// - 200 OK: Healthy or Degraded
/// - 503 Service Unavailable: Unhealthy
#[must_use]
pub fn readiness(report: HealthReport) -> (StatusCode, Json<HealthReport>) {
    let status = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status, Json(report))
}
