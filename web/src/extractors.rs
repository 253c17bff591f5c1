//! Custom Axum extractors.
//!
//! - [`CorrelationId`]: the id assigned by the correlation middleware
//! - [`JsonBody`]: JSON body whose rejections render as [`AppError`]

use crate::error::AppError;
use crate::middleware::CORRELATION_ID_HEADER;
use axum::{
    Json, async_trait,
    extract::{FromRequest, FromRequestParts, Request, rejection::JsonRejection},
    http::{HeaderMap, request::Parts},
};
use uuid::Uuid;

/// Correlation ID for request tracing.
///
/// Handlers receive the id the middleware assigned; without the middleware
/// the `X-Correlation-ID` header is parsed directly, falling back to a fresh
/// id.
///
/// ```ignore
/// async fn checkout(CorrelationId(id): CorrelationId) -> String {
///     format!("checkout {id}")
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    /// A fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The id in `X-Correlation-ID`, if present and a valid UUID.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        headers
            .get(CORRELATION_ID_HEADER)?
            .to_str()
            .ok()
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
            .map(Self)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CorrelationId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<Self>()
            .copied()
            .or_else(|| Self::from_headers(&parts.headers))
            .unwrap_or_default())
    }
}

/// JSON request body.
///
/// Like [`Json`], but a missing content type, malformed JSON or a wrongly
/// shaped body becomes a 400 [`AppError`] with the usual error envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(AppError::bad_request(rejection.body_text())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::middleware::track_correlation;
    use axum::{Router, body::Body, http::StatusCode, routing::post};
    use serde::Deserialize;
    use tower::ServiceExt;

    #[derive(Deserialize)]
    struct Named {
        name: String,
    }

    fn app() -> Router {
        Router::new()
            .route(
                "/echo",
                post(|JsonBody(body): JsonBody<Named>| async move { body.name }),
            )
            .route(
                "/id",
                post(|CorrelationId(id): CorrelationId| async move { id.to_string() }),
            )
            .layer(axum::middleware::from_fn(track_correlation))
    }

    async fn send(request: Request) -> (StatusCode, String, Option<String>) {
        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let header = response
            .headers()
            .get(CORRELATION_ID_HEADER)
            .map(|value| value.to_str().unwrap().to_string());
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap(), header)
    }

    #[tokio::test]
    async fn valid_json_is_extracted() {
        let request = Request::builder()
            .method("POST")
            .uri("/echo")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name":"ada"}"#))
            .unwrap();

        let (status, body, _) = send(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ada");
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request_envelope() {
        let request = Request::builder()
            .method("POST")
            .uri("/echo")
            .header("content-type", "application/json")
            .body(Body::from("{"))
            .unwrap();

        let (status, body, _) = send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn correlation_id_matches_response_header() {
        let request = Request::builder()
            .method("POST")
            .uri("/id")
            .body(Body::empty())
            .unwrap();

        let (_, body, header) = send(request).await;
        assert_eq!(Some(body), header);
    }
}
