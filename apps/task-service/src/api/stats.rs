//! Store statistics endpoint.

use crate::server::state::AppState;
use axum::{Json, extract::State};
use serde::Serialize;
use tasksync_core::StoreStats;
use tasksync_web::AppError;

/// Statistics response.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Always `true`
    pub success: bool,
    /// Totals over every task
    pub stats: StoreStats,
}

/// Task totals: all, completed, pending, and the newest modification time.
///
/// # Endpoint
///
/// ```text
/// GET /api/stats
/// ```
///
/// # Errors
///
/// Returns 500 if the store fails.
pub async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, AppError> {
    let stats = state.store.stats().await?;
    Ok(Json(StatsResponse {
        success: true,
        stats,
    }))
}
