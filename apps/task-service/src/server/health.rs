//! Health check endpoints.

use super::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use std::future::Future;
use std::pin::Pin;
use tasksync_runtime::consumer::{Consumer, MessageHandler};
use tasksync_runtime::{EventPublisher, HealthCheck, HealthReport};
use tasksync_web::handlers::health::{Liveness, liveness, readiness};

/// A component contributing to the readiness report.
pub trait ComponentHealth: Send + Sync {
    /// Current health of the component.
    fn check(&self) -> Pin<Box<dyn Future<Output = HealthCheck> + Send + '_>>;
}

impl ComponentHealth for EventPublisher {
    fn check(&self) -> Pin<Box<dyn Future<Output = HealthCheck> + Send + '_>> {
        Box::pin(self.health())
    }
}

impl<H: MessageHandler> ComponentHealth for Consumer<H> {
    fn check(&self) -> Pin<Box<dyn Future<Output = HealthCheck> + Send + '_>> {
        let check = self.health();
        Box::pin(async move { check })
    }
}

/// Liveness check.
///
/// # Endpoint
///
/// ```text
/// GET /api/health
/// ```
pub async fn health_check(State(state): State<AppState>) -> Json<Liveness> {
    liveness(state.started, state.clock.now())
}

/// Readiness check over the publisher and any in-process consumers.
///
/// # Endpoint
///
/// ```text
/// GET /api/ready
/// ```
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let mut checks = Vec::with_capacity(state.components.len());
    for component in state.components.as_slice() {
        checks.push(component.check().await);
    }
    readiness(HealthReport::new(checks))
}
