//! The error envelope every tasksync endpoint answers with.
//!
//! [`AppError`] carries an HTTP status, a machine-readable code and a message,
//! plus an optional server record for conflicts. Every error renders as
//!
//! ```json
//! {"success": false, "error": "CONFLICT", "message": "...", "serverRecord": {...}}
//! ```
//!
//! where `serverRecord` only appears on conflicts.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::fmt;
use tasksync_core::{RecordFields, StoreError};

/// A failed request, ready to render.
///
/// Store errors convert with `?`:
///
/// ```ignore
/// async fn get_task(Path(id): Path<String>) -> Result<Json<TaskRecord>, AppError> {
///     Ok(Json(store.read(&id.into()).await?))
/// }
/// ```
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    /// Shown to the client
    message: String,
    /// Stable code clients can branch on, e.g. `CONFLICT`
    code: &'static str,
    server_record: Option<serde_json::Value>,
    /// Logged, never sent
    source: Option<anyhow::Error>,
}

impl AppError {
    /// An error with an explicit status and code.
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>, code: &'static str) -> Self {
        Self {
            status,
            message: message.into(),
            code,
            server_record: None,
            source: None,
        }
    }

    /// Attach the error that caused this one.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// 400 for a request that could not be parsed.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, "BAD_REQUEST")
    }

    /// 400 for a payload that parsed but is not acceptable.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, "VALIDATION_ERROR")
    }

    /// 404 naming what was looked up.
    #[must_use]
    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            format!("{resource} {id} does not exist"),
            "NOT_FOUND",
        )
    }

    /// 409 carrying the record as the server has it.
    #[must_use]
    pub fn conflict(message: impl Into<String>, server_record: &impl Serialize) -> Self {
        let mut error = Self::new(StatusCode::CONFLICT, message, "CONFLICT");
        error.server_record = serde_json::to_value(server_record).ok();
        error
    }

    /// 500; attach the cause with [`AppError::with_source`].
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message,
            "INTERNAL_SERVER_ERROR",
        )
    }

    /// 503 for a missing dependency.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message, "SERVICE_UNAVAILABLE")
    }

    /// HTTP status of this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }

    /// Server record attached to a conflict.
    #[must_use]
    pub const fn server_record(&self) -> Option<&serde_json::Value> {
        self.server_record.as_ref()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Wire shape of [`AppError`].
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    success: bool,
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_record: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                status = self.status.as_u16(),
                code = self.code,
                message = %self.message,
                cause = ?self.source,
                "Request failed"
            );
        }

        let body = ErrorResponse {
            success: false,
            error: self.code,
            message: self.message,
            server_record: self.server_record,
        };

        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(cause: anyhow::Error) -> Self {
        Self::internal("Something went wrong on our side").with_source(cause)
    }
}

impl<F: RecordFields> From<StoreError<F>> for AppError {
    fn from(err: StoreError<F>) -> Self {
        match err {
            StoreError::NotFound(id) => Self::not_found("Record", id),
            StoreError::Conflict { server } => Self::conflict(
                format!(
                    "Version conflict: record {} is at version {}",
                    server.id, server.version
                ),
                &*server,
            ),
            StoreError::Validation(error) => Self::validation(error.to_string()),
            StoreError::Storage(message) => {
                anyhow::anyhow!(message).into()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// Collects formatted log output.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn logged_while_rendering(error: AppError) -> String {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || drop(error.into_response()));
        let bytes = buffer.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    async fn body_json(error: AppError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn display_prefixes_the_code() {
        let err = AppError::not_found("Task", "t-7");
        assert_eq!(err.to_string(), "[NOT_FOUND] Task t-7 does not exist");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn validation_is_a_bad_request() {
        let err = AppError::validation("title must not be blank");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn conflict_body_carries_server_record() {
        let err = AppError::conflict("stale", &serde_json::json!({"id": "t1", "version": 2}));
        let (status, body) = body_json(err).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "CONFLICT");
        assert_eq!(body["message"], "stale");
        assert_eq!(body["serverRecord"]["version"], 2);
    }

    #[test]
    fn conflicts_render_without_logging() {
        let err = AppError::conflict("stale", &serde_json::json!({"id": "t1", "version": 2}));
        assert_eq!(logged_while_rendering(err), "");
    }

    #[test]
    fn server_errors_are_logged_with_their_cause() {
        let err = AppError::internal("boom").with_source(anyhow::anyhow!("disk full"));
        let logs = logged_while_rendering(err);
        assert!(logs.contains("Request failed"));
        assert!(logs.contains("disk full"));
    }

    #[tokio::test]
    async fn other_errors_omit_server_record() {
        let (status, body) = body_json(AppError::internal("boom")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.get("serverRecord").is_none());
    }
}
