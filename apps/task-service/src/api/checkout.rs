//! Checkout API endpoint.
//!
//! - POST /api/checkout - Complete a user's pending tasks and announce it
//!
//! The response is 202: the tasks are completed when it is sent, but the
//! notification and analytics consumers act on the event later.

use crate::server::state::AppState;
use axum::{Json, extract::State, http::StatusCode};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tasksync_core::event::EventId;
use tasksync_web::{AppError, JsonBody};

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to check out.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    /// User checking out
    #[serde(default)]
    pub user_id: String,
}

/// Response after a checkout.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    /// Always `true`
    pub success: bool,
    /// What happened
    pub message: &'static str,
    /// Tasks completed by this checkout
    pub completed_count: u64,
    /// Completed tasks per priority
    pub summary: BTreeMap<String, u64>,
    /// Capture time of the event, ISO-8601
    pub timestamp: String,
    /// Id of the published event
    pub event_id: EventId,
    /// Whether the broker accepted the event
    pub published: bool,
}

// ============================================================================
// Handlers
// ============================================================================

/// Complete every pending task of a user and publish a checkout event.
///
/// Tasks without an owner are shared and picked up by every checkout. The
/// event is published even when nothing was pending; when the broker is
/// unreachable the completions still stand and `published` is `false`.
///
/// # Example
///
/// ```bash
/// curl -X POST http://localhost:3000/api/checkout \
///   -H "Content-Type: application/json" \
///   -d '{"userId": "u1"}'
/// ```
///
/// # Errors
///
/// - 400 if `userId` is blank
/// - 500 if the store fails
pub async fn checkout(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutResponse>), AppError> {
    let user_id = request.user_id.trim();
    if user_id.is_empty() {
        return Err(AppError::validation("userId is required"));
    }

    let receipt = state.checkout.checkout(user_id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CheckoutResponse {
            success: true,
            message: "Checkout accepted, notifications are processed asynchronously",
            completed_count: receipt.completed_count(),
            summary: receipt.event.summary,
            timestamp: receipt
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            event_id: receipt.event_id,
            published: receipt.published,
        }),
    ))
}
