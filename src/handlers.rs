use crate::app_state::AppState;
use crate::error::{MutationError, QueryError};
use crate::models::{
    Comment, CreateCommentRequest, CreateIssueRequest, HealthStatus, Issue, IssueFilter, IssueStats,
    NotificationRecord, Page, QueryEnvelope, RateLimitCheckRequest, RateLimitRecordRequest,
    UpdateStatusRequest,
};
use crate::query::Loaded;
use crate::rate_limiter::{RateLimitAction, RateLimitResult};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Mutation(#[from] MutationError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Mutation(e) => {
                StatusCode::from_u16(e.remote().status()).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

fn query_status(e: &QueryError) -> StatusCode {
    match e.remote() {
        Some(remote) => StatusCode::from_u16(remote.status()).unwrap_or(StatusCode::BAD_GATEWAY),
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// Wraps a read in the `{ data, is_loading, error }` envelope.
fn envelope<T>(result: Result<Loaded<T>, QueryError>) -> (StatusCode, Json<QueryEnvelope<T>>) {
    match result {
        Ok(loaded) => (
            StatusCode::OK,
            Json(QueryEnvelope {
                data: Some(loaded.data),
                is_loading: false,
                error: None,
                stale: loaded.stale,
            }),
        ),
        Err(e) => (
            query_status(&e),
            Json(QueryEnvelope {
                data: None,
                is_loading: false,
                error: Some(e.to_string()),
                stale: false,
            }),
        ),
    }
}

fn require(value: &str, field: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{field} is required")));
    }
    Ok(())
}

fn parse_action(raw: &str) -> Result<RateLimitAction, ApiError> {
    raw.parse().map_err(ApiError::BadRequest)
}

// GET `/issues`
pub async fn list_issues(
    State(state): State<AppState>,
    Query(filter): Query<IssueFilter>,
) -> (StatusCode, Json<QueryEnvelope<Page<Issue>>>) {
    envelope(state.issues.list(&filter).await)
}

// GET `/issues/stats`
pub async fn issue_stats(State(state): State<AppState>) -> (StatusCode, Json<QueryEnvelope<IssueStats>>) {
    envelope(state.issues.stats().await)
}

// GET `/issues/{id}`
pub async fn get_issue(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<QueryEnvelope<Issue>>) {
    envelope(state.issues.detail(&id).await)
}

// POST `/issues`
pub async fn create_issue(
    State(state): State<AppState>,
    Json(payload): Json<CreateIssueRequest>,
) -> Result<(StatusCode, Json<Issue>), ApiError> {
    require(&payload.title, "title")?;
    require(&payload.category, "category")?;
    require(&payload.reporter_id, "reporter_id")?;

    let issue = state.issues.create(payload).await?;
    info!("Issue {} created by {}", issue.id, issue.reporter_id);
    Ok((StatusCode::CREATED, Json(issue)))
}

// PATCH `/issues/{id}/status`
pub async fn update_issue_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Issue>, ApiError> {
    let issue = state.issues.update_status(&id, payload.status).await?;
    info!("Issue {} moved to {}", id, issue.status.as_str());
    Ok(Json(issue))
}

// GET `/issues/{id}/comments`
pub async fn list_comments(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<QueryEnvelope<Vec<Comment>>>) {
    envelope(state.issues.comments(&id).await)
}

// POST `/issues/{id}/comments`
pub async fn add_comment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateCommentRequest>,
) -> Result<(StatusCode, Json<Comment>), ApiError> {
    require(&payload.user_id, "user_id")?;
    require(&payload.body, "body")?;
    let comment = state.issues.add_comment(&id, payload).await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

// GET `/users/{user_id}/notifications`
pub async fn list_notifications(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> (StatusCode, Json<QueryEnvelope<Vec<NotificationRecord>>>) {
    envelope(state.notifications.list(&user_id).await)
}

// GET `/users/{user_id}/notifications/unread-count`
pub async fn unread_count(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> (StatusCode, Json<QueryEnvelope<u64>>) {
    envelope(state.notifications.unread_count(&user_id).await)
}

// POST `/users/{user_id}/notifications/{id}/read`
pub async fn mark_notification_read(
    State(state): State<AppState>,
    Path((user_id, id)): Path<(String, String)>,
) -> Result<Json<NotificationRecord>, ApiError> {
    Ok(Json(state.notifications.mark_read(&user_id, &id).await?))
}

// POST `/users/{user_id}/notifications/read-all`
pub async fn mark_all_notifications_read(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let updated = state.notifications.mark_all_read(&user_id).await?;
    Ok(Json(json!({ "status": "ok", "updated": updated })))
}

// DELETE `/users/{user_id}/notifications/{id}`
pub async fn delete_notification(
    State(state): State<AppState>,
    Path((user_id, id)): Path<(String, String)>,
) -> Result<Json<NotificationRecord>, ApiError> {
    Ok(Json(state.notifications.delete(&user_id, &id).await?))
}

// POST `/rate-limit/check`
pub async fn check_rate_limit(
    State(state): State<AppState>,
    Json(payload): Json<RateLimitCheckRequest>,
) -> Result<Json<RateLimitResult>, ApiError> {
    let action = parse_action(&payload.action)?;
    require(&payload.identifier, "identifier")?;
    Ok(Json(state.rate_limiter.check(action, &payload.identifier).await))
}

// POST `/rate-limit/record`
pub async fn record_attempt(
    State(state): State<AppState>,
    Json(payload): Json<RateLimitRecordRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let action = parse_action(&payload.action)?;
    require(&payload.identifier, "identifier")?;
    state
        .rate_limiter
        .record(action, &payload.identifier, payload.success)
        .await;
    Ok(Json(json!({ "status": "ok" })))
}

// GET `/health`
pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthStatus>, StatusCode> {
    match state.backend.db().acquire().await {
        Ok(_) => Ok(Json(HealthStatus {
            status: "healthy".to_string(),
            timestamp: state.clock.now_ms(),
        })),
        Err(e) => {
            error!("Health check failed: DB acquire error: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
