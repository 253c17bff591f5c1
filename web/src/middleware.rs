//! Correlation IDs for every request.
//!
//! [`track_correlation`] runs as an [`axum::middleware::from_fn`] layer:
//! it adopts the caller's `X-Correlation-ID` when that is a UUID, mints one
//! otherwise, makes it available to handlers through the
//! [`CorrelationId`](crate::CorrelationId) extractor and writes it back on
//! the response. The rest of the request runs inside an `http_request` span
//! carrying the id, so store and publisher logs can be tied to a call.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/api/tasks", get(list_tasks))
//!     .layer(axum::middleware::from_fn(track_correlation));
//! ```

use crate::extractors::CorrelationId;
use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument;

/// Header carrying the correlation ID, in both directions.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Tag the request with a correlation ID and echo it on the response.
pub async fn track_correlation(mut request: Request, next: Next) -> Response {
    let id = CorrelationId::from_headers(request.headers()).unwrap_or_else(CorrelationId::new);
    request.extensions_mut().insert(id);

    let span = tracing::info_span!(
        "http_request",
        correlation_id = %id.0,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&id.0.to_string()) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}
