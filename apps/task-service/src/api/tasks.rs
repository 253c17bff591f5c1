//! Task sync API endpoints.
//!
//! Provides versioned CRUD over tasks:
//! - GET /api/tasks?modifiedSince=<ms> - Incremental sync
//! - GET /api/tasks/:id - Get one task
//! - POST /api/tasks - Create a task
//! - PUT /api/tasks/:id - Update, refused with 409 when `version` is stale
//! - DELETE /api/tasks/:id?version=<n> - Delete, same version policy

use crate::server::state::AppState;
use crate::task::{Task, TaskChanges, TaskRecord};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tasksync_core::{NewRecord, RecordId, StoreError, SyncCursor, Version};
use tasksync_runtime::metrics::StoreMetrics;
use tasksync_web::{AppError, JsonBody};

// ============================================================================
// Request/Response Types
// ============================================================================

/// Query parameters for listing tasks.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksQuery {
    /// Only tasks modified strictly after this time (epoch millis)
    pub modified_since: Option<i64>,
}

/// Response for listing tasks.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksResponse {
    /// Always `true`
    pub success: bool,
    /// Matching tasks, newest modification first
    pub tasks: Vec<TaskRecord>,
    /// Newest `updatedAt` over every task, 0 when empty
    pub last_sync: i64,
    /// Server time (epoch millis)
    pub server_time: i64,
}

/// Single task response.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    /// Always `true`
    pub success: bool,
    /// What happened, on writes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
    /// The task as stored
    pub task: TaskRecord,
}

/// Request to create a task.
#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    /// Client generated id; the server generates one when absent
    pub id: Option<String>,
    /// Task fields
    #[serde(flatten)]
    pub task: Task,
}

/// Request to update a task.
///
/// Bookkeeping fields a client echoes back (`id`, `createdAt`, `updatedAt`)
/// are ignored.
#[derive(Debug, Deserialize)]
pub struct UpdateTaskRequest {
    /// Version the client last saw; omit for last-writer-wins
    pub version: Option<Version>,
    /// Fields to change
    #[serde(flatten)]
    pub changes: TaskChanges,
}

/// Query parameters for deleting a task.
#[derive(Debug, Deserialize)]
pub struct DeleteTaskQuery {
    /// Version the client last saw; omit for an unconditional delete
    pub version: Option<u64>,
}

/// Response after deleting a task.
#[derive(Debug, Serialize)]
pub struct DeleteTaskResponse {
    /// Always `true`
    pub success: bool,
    /// What happened
    pub message: &'static str,
}

// ============================================================================
// Handlers
// ============================================================================

/// List tasks, optionally only those modified since a sync cursor.
///
/// # Example
///
/// ```bash
/// curl "http://localhost:3000/api/tasks?modifiedSince=1700000000000"
/// ```
///
/// # Errors
///
/// Returns 500 if the store fails.
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<ListTasksResponse>, AppError> {
    let cursor = query.modified_since.map(SyncCursor::from_millis);
    let tasks = state.store.list(cursor).await?;
    let last_sync = state.store.last_sync().await?;

    Ok(Json(ListTasksResponse {
        success: true,
        tasks,
        last_sync,
        server_time: state.clock.now().timestamp_millis(),
    }))
}

/// Get one task.
///
/// # Errors
///
/// Returns 404 if the task does not exist.
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, AppError> {
    let task = state.store.read(&RecordId::from(id)).await?;
    Ok(Json(TaskResponse {
        success: true,
        message: None,
        task,
    }))
}

/// Create a task at version 1.
///
/// # Example
///
/// ```bash
/// curl -X POST http://localhost:3000/api/tasks \
///   -H "Content-Type: application/json" \
///   -d '{"title": "Buy milk", "priority": "high", "userId": "u1"}'
/// ```
///
/// # Errors
///
/// - 400 if the title is blank or the body is not a task
/// - 409 if the client supplied id is already taken
pub async fn create_task(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskResponse>), AppError> {
    let new = match request.id.filter(|id| !id.trim().is_empty()) {
        Some(id) => NewRecord::with_id(id, request.task),
        None => NewRecord::new(request.task),
    };

    let task = state
        .store
        .create(new)
        .await
        .inspect_err(|error| record_conflict("create", error))?;
    StoreMetrics::record_mutation("create");

    Ok((
        StatusCode::CREATED,
        Json(TaskResponse {
            success: true,
            message: Some("Task created"),
            task,
        }),
    ))
}

/// Update a task.
///
/// With `version` in the body the update only applies if the server is still
/// at that version; otherwise the response is 409 with the server's copy.
///
/// # Example
///
/// ```bash
/// curl -X PUT http://localhost:3000/api/tasks/<id> \
///   -H "Content-Type: application/json" \
///   -d '{"version": 2, "completed": true}'
/// ```
///
/// # Errors
///
/// - 404 if the task does not exist
/// - 409 with `serverRecord` if `version` is stale
/// - 400 if the result would have a blank title
pub async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    JsonBody(request): JsonBody<UpdateTaskRequest>,
) -> Result<Json<TaskResponse>, AppError> {
    let task = state
        .store
        .update(&RecordId::from(id), request.changes, request.version)
        .await
        .inspect_err(|error| record_conflict("update", error))?;
    StoreMetrics::record_mutation("update");

    Ok(Json(TaskResponse {
        success: true,
        message: Some("Task updated"),
        task,
    }))
}

/// Delete a task.
///
/// # Errors
///
/// - 404 if the task does not exist
/// - 409 with `serverRecord` if `version` is stale
pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteTaskQuery>,
) -> Result<Json<DeleteTaskResponse>, AppError> {
    state
        .store
        .delete(&RecordId::from(id), query.version.map(Version::new))
        .await
        .inspect_err(|error| record_conflict("delete", error))?;
    StoreMetrics::record_mutation("delete");

    Ok(Json(DeleteTaskResponse {
        success: true,
        message: "Task deleted",
    }))
}

fn record_conflict(operation: &'static str, error: &StoreError<Task>) {
    if matches!(error, StoreError::Conflict { .. }) {
        StoreMetrics::record_conflict(operation);
    }
}
