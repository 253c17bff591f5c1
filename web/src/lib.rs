//! Axum integration for tasksync services.
//!
//! The core crates know nothing about HTTP; this crate is the shell around
//! them:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Axum shell                 │  ← JSON in/out, status codes
//! │  - JsonBody / CorrelationId extractors  │  ← CORS, request tracing
//! │  - AppError envelope                    │  ← /metrics, health
//! ├─────────────────────────────────────────┤
//! │   RecordStore / CheckoutService         │
//! │  - versioned writes, conflicts          │
//! │  - bulk completion + event publish      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Request Flow
//!
//! 1. **HTTP Request** arrives at an Axum handler inside a correlation span
//! 2. **Extract** the JSON body ([`JsonBody`]) and path/query parameters
//! 3. **Call** the store or checkout service
//! 4. **Map** `StoreError` to [`AppError`] with `?`; conflicts carry the
//!    server record
//! 5. **Return** the JSON response
//!
//! # Example
//!
//! ```ignore
//! use tasksync_web::{AppError, JsonBody, with_common_layers};
//! use axum::{Router, routing::put, Json};
//!
//! async fn update_task(
//!     State(state): State<AppState>,
//!     Path(id): Path<String>,
//!     JsonBody(request): JsonBody<UpdateRequest>,
//! ) -> Result<Json<TaskResponse>, AppError> {
//!     let task = state.store.update(&id.into(), request.changes, request.version).await?;
//!     Ok(Json(TaskResponse::new(task)))
//! }
//!
//! let app = with_common_layers(Router::new().route("/api/tasks/:id", put(update_task)))
//!     .with_state(app_state);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

// Re-export key types for convenience
pub use error::AppError;
pub use extractors::{CorrelationId, JsonBody};
pub use middleware::{CORRELATION_ID_HEADER, track_correlation};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;

/// Wrap `router` in the layers every tasksync service uses: permissive CORS,
/// `tower-http` request tracing and correlation IDs (outermost).
pub fn with_common_layers<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_correlation))
}
