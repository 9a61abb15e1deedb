//! # API Endpoint Handlers

use super::{
    AppState,
    types::{
        ChangesResponse, ErrorResponse, ExportResponse, HealthResponse, SubscribeRequest,
        SubscribeResponse,
    },
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use bassline_core::{CommandResponse, ErrorCode, GroupId, encode_template};
use serde_json::Value;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn not_found(msg: impl Into<String>) -> ApiError {
    (StatusCode::NOT_FOUND, Json(ErrorResponse::new(msg)))
}

/// HTTP status for a command response.
pub fn status_for(response: &CommandResponse) -> StatusCode {
    match response.error.as_ref().map(|e| e.code) {
        None => StatusCode::OK,
        Some(ErrorCode::UnknownCommand | ErrorCode::InvalidInput) => StatusCode::BAD_REQUEST,
        Some(ErrorCode::NotFound) => StatusCode::NOT_FOUND,
        Some(ErrorCode::Conflict) => StatusCode::CONFLICT,
        Some(ErrorCode::NotImplementedForRemote) => StatusCode::NOT_IMPLEMENTED,
        Some(ErrorCode::Unsupported) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(ErrorCode::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// =============================================================================
// HEALTH & STATUS
// =============================================================================

pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

pub async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let kernel = state.kernel.lock().await;
    Json(kernel.status())
}

// =============================================================================
// COMMAND HANDLER
// =============================================================================

/// Execute one request envelope. Failures come back as envelopes too.
pub async fn command_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let response = {
        let mut kernel = state.kernel.lock().await;
        let response = kernel.execute_json(body);
        let runtime = kernel.runtime();
        state
            .subscriptions
            .retain_groups(|group_id| runtime.group(group_id).is_some());
        response
    };
    if let Some(error) = &response.error {
        tracing::debug!(code = ?error.code, message = %error.message, "command rejected");
    }
    (status_for(&response), Json(response))
}

// =============================================================================
// SUBSCRIPTION HANDLERS
// =============================================================================

pub async fn subscribe_handler(
    State(state): State<AppState>,
    Json(request): Json<SubscribeRequest>,
) -> Result<Json<SubscribeResponse>, ApiError> {
    if state
        .kernel
        .lock()
        .await
        .runtime()
        .group(request.group_id)
        .is_none()
    {
        return Err(not_found(format!("group not found: {}", request.group_id)));
    }
    let subscription_id = state.subscriptions.subscribe(request.group_id);
    Ok(Json(SubscribeResponse {
        subscription_id,
        group_id: request.group_id,
    }))
}

pub async fn changes_handler(
    State(state): State<AppState>,
    Path(subscription_id): Path<u64>,
) -> Result<Json<ChangesResponse>, ApiError> {
    if let Some(group_id) = state.subscriptions.group_of(subscription_id) {
        if state.kernel.lock().await.runtime().group(group_id).is_none() {
            state.subscriptions.unsubscribe(subscription_id);
            return Err(not_found(format!("group not found: {}", group_id)));
        }
    }
    let drained = state
        .subscriptions
        .drain(subscription_id)
        .ok_or_else(|| not_found(format!("subscription not found: {}", subscription_id)))?;
    Ok(Json(ChangesResponse {
        subscription_id,
        changes: drained.changes,
        dropped: drained.dropped,
    }))
}

pub async fn unsubscribe_handler(
    State(state): State<AppState>,
    Path(subscription_id): Path<u64>,
) -> StatusCode {
    if state.subscriptions.unsubscribe(subscription_id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

// =============================================================================
// EXPORT HANDLER
// =============================================================================

/// Export a group as JSON and binary template.
pub async fn export_handler(
    State(state): State<AppState>,
    Path(group_id): Path<u64>,
) -> impl IntoResponse {
    let group_id = GroupId(group_id);
    let kernel = state.kernel.lock().await;
    let Some(group) = kernel.runtime().group(group_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ExportResponse::error(format!(
                "group not found: {}",
                group_id
            ))),
        );
    };
    let template = group.to_template();
    drop(kernel);

    match encode_template(&template) {
        Ok(data) => (
            StatusCode::OK,
            Json(ExportResponse::success(group_id, template, &data)),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ExportResponse::error(format!("Export failed: {}", e))),
        ),
    }
}
