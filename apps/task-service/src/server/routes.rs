//! Router configuration for the task service.
//!
//! Builds the complete Axum router with all endpoints.

use super::health::{health_check, readiness_check};
use super::state::AppState;
use crate::api::{checkout, stats, tasks};
use axum::{
    Router,
    extract::State,
    response::Response,
    routing::{get, post},
};

/// Build the complete Axum router.
///
/// Configures:
/// - Health and readiness checks
/// - Task sync endpoints
/// - Checkout
/// - Statistics
/// - Prometheus metrics (`/metrics`, outside `/api`)
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        // Task sync
        .route("/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route(
            "/tasks/:id",
            get(tasks::get_task)
                .put(tasks::update_task)
                .delete(tasks::delete_task),
        )
        // Checkout pipeline
        .route("/checkout", post(checkout::checkout))
        .route("/stats", get(stats::get_stats));

    let router = Router::new()
        .nest("/api", api_routes)
        .route("/metrics", get(metrics));

    tasksync_web::with_common_layers(router).with_state(state)
}

async fn metrics(State(state): State<AppState>) -> Response {
    tasksync_web::handlers::metrics::render(state.metrics.as_ref())
}
